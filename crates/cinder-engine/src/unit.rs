//! Compiled units.

use crate::backend::Artifact;
use crate::fingerprint::Fingerprint;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// The immutable result of one successful unit compilation.
///
/// Units are owned by the unit cache behind `Arc`; the export index holds
/// only symbol-to-name back-references. Replacing a unit (changed source)
/// inserts a fresh `CompiledUnit` — existing dependents keep the version
/// they were compiled against.
#[derive(Debug)]
pub struct CompiledUnit {
    /// Unique unit name.
    pub name: String,
    /// Fingerprint of the source text this artifact was compiled from.
    pub fingerprint: Fingerprint,
    /// Compiled form, structural shapes plus opaque executable payload.
    pub artifact: Artifact,
    /// Import statements as written in the source, pre-resolution.
    pub raw_imports: Vec<String>,
    /// Units actually imported, after sanitization. Never contains this
    /// unit itself, nor any unit whose transitive dependencies reach back
    /// to it.
    pub dependencies: Vec<Arc<CompiledUnit>>,
    /// Symbols this unit makes addressable to other units.
    pub exported_symbols: Vec<String>,
}

impl CompiledUnit {
    /// Enclosing namespace, if any. Units without one export nothing.
    pub fn namespace(&self) -> Option<&str> {
        self.artifact.namespace.as_deref()
    }

    /// Whether `name` is reachable through this unit's dependency chain.
    ///
    /// Walks `dependencies` depth-first with a visited guard, so shared
    /// diamonds are traversed once each.
    pub fn depends_transitively_on(&self, name: &str) -> bool {
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<&Arc<CompiledUnit>> = self.dependencies.iter().collect();

        while let Some(unit) = stack.pop() {
            if unit.name == name {
                return true;
            }
            if visited.insert(unit.name.as_str()) {
                stack.extend(unit.dependencies.iter());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClassShape;

    fn unit(name: &str, deps: Vec<Arc<CompiledUnit>>) -> Arc<CompiledUnit> {
        Arc::new(CompiledUnit {
            name: name.to_string(),
            fingerprint: Fingerprint::of(name),
            artifact: Artifact::new(
                Some(name.to_string()),
                vec![ClassShape::entry(Vec::new())],
                Vec::new(),
            ),
            raw_imports: Vec::new(),
            dependencies: deps,
            exported_symbols: Vec::new(),
        })
    }

    #[test]
    fn test_direct_dependency() {
        let b = unit("b", Vec::new());
        let a = unit("a", vec![b]);
        assert!(a.depends_transitively_on("b"));
        assert!(!a.depends_transitively_on("c"));
    }

    #[test]
    fn test_transitive_chain() {
        let c = unit("c", Vec::new());
        let b = unit("b", vec![Arc::clone(&c)]);
        let a = unit("a", vec![b]);
        assert!(a.depends_transitively_on("c"));
        assert!(!c.depends_transitively_on("a"));
    }

    #[test]
    fn test_diamond_visits_once() {
        let d = unit("d", Vec::new());
        let b = unit("b", vec![Arc::clone(&d)]);
        let c = unit("c", vec![d]);
        let a = unit("a", vec![b, c]);
        assert!(a.depends_transitively_on("d"));
    }

    #[test]
    fn test_self_is_not_a_dependency() {
        let a = unit("a", Vec::new());
        assert!(!a.depends_transitively_on("a"));
    }
}
