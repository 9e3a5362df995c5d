//! Source fingerprints for recompilation detection.
//!
//! A fingerprint is the SHA-256 digest of a unit's source text. The unit
//! cache compares fingerprints to decide whether a cached artifact can be
//! reused without invoking the backend.

use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of a unit's source text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a source text.
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell fingerprints apart in logs
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_source_same_fingerprint() {
        assert_eq!(Fingerprint::of("let x = 1;"), Fingerprint::of("let x = 1;"));
    }

    #[test]
    fn test_one_character_change_differs() {
        assert_ne!(Fingerprint::of("let x = 1;"), Fingerprint::of("let x = 2;"));
    }

    #[test]
    fn test_display_is_hex() {
        let fp = Fingerprint::of("");
        let text = fp.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
