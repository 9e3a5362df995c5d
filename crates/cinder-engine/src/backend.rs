//! Compiler backend contract and the compiled artifact model.
//!
//! The backend is a black box to the engine: it takes source text plus the
//! artifacts of already-compiled units and produces an [`Artifact`], or a
//! diagnostic failure. The only failure mode the engine inspects is the
//! unorderable-import (cycle) diagnostic, matched by substring against
//! [`CYCLE_DIAGNOSTIC`].

use std::sync::Arc;
use thiserror::Error;

/// Diagnostic substring a backend emits when it cannot establish a valid
/// ordering among the supplied imports. Part of the backend contract: the
/// engine retries such failures once with [`CompileOptions::compat`].
pub const CYCLE_DIAGNOSTIC: &str = "cannot order imports";

/// Options passed through to the backend on every compile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Permissive import ordering: the backend should accept an import set
    /// it would otherwise reject as unorderable, at the cost of weaker
    /// cross-unit checking.
    pub compat_imports: bool,
}

impl CompileOptions {
    /// Compatibility configuration used for the cycle-triggered retry.
    pub fn compat() -> Self {
        Self {
            compat_imports: true,
        }
    }
}

/// Diagnostic failure returned by a backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Full diagnostic text, surfaced verbatim to callers.
    pub message: String,
}

impl BackendError {
    /// Create a diagnostic failure from its message text.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Whether this diagnostic is the unorderable-import signal.
    pub fn is_cycle(&self) -> bool {
        self.message.contains(CYCLE_DIAGNOSTIC)
    }
}

/// Kind of a generated class shape within an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// The unit's main executable entry class.
    Entry,
    /// A singleton-like grouping construct nested in the entry class; its
    /// members are addressable as if they were entry-class members.
    Grouping,
    /// A named type defined inside the unit.
    Type,
}

/// Kind of a generated member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A method.
    Method,
    /// A field.
    Field,
}

/// One generated member of a class shape.
#[derive(Debug, Clone)]
pub struct MemberShape {
    /// Member name as generated.
    pub name: String,
    /// Method or field.
    pub kind: MemberKind,
    /// Externally visible (public) member.
    pub visible: bool,
    /// Compiler-generated member with no source counterpart.
    pub synthetic: bool,
}

impl MemberShape {
    /// A public, non-synthetic method.
    pub fn method(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Method,
            visible: true,
            synthetic: false,
        }
    }

    /// A public, non-synthetic field.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Field,
            visible: true,
            synthetic: false,
        }
    }

    /// Mark this member as compiler-generated.
    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    /// Mark this member as not externally visible.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// One generated class in an artifact's structural output.
#[derive(Debug, Clone)]
pub struct ClassShape {
    /// Name relative to the unit: empty for the entry class, a dotted path
    /// for multiply-nested types.
    pub name: String,
    /// Role of this shape within the unit.
    pub kind: ShapeKind,
    /// Generated members.
    pub members: Vec<MemberShape>,
}

impl ClassShape {
    /// The unit's entry class.
    pub fn entry(members: Vec<MemberShape>) -> Self {
        Self {
            name: String::new(),
            kind: ShapeKind::Entry,
            members,
        }
    }

    /// A grouping construct nested in the entry class.
    pub fn grouping(name: impl Into<String>, members: Vec<MemberShape>) -> Self {
        Self {
            name: name.into(),
            kind: ShapeKind::Grouping,
            members,
        }
    }

    /// A named nested type.
    pub fn nested_type(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ShapeKind::Type,
            members: Vec::new(),
        }
    }
}

/// The compiled form of one unit.
///
/// `shapes` is the structural output the export scanner walks; `bytes` is
/// the opaque executable payload consumed by the loader collaborator. The
/// engine never interprets `bytes` itself.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Enclosing namespace under which the unit's members are addressable.
    /// `None` means the unit exports nothing.
    pub namespace: Option<String>,
    /// Generated class shapes, entry class included.
    pub shapes: Vec<ClassShape>,
    /// Opaque executable payload.
    pub bytes: Arc<[u8]>,
}

impl Artifact {
    /// Build an artifact from its parts.
    pub fn new(namespace: Option<String>, shapes: Vec<ClassShape>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            namespace,
            shapes,
            bytes: bytes.into(),
        }
    }
}

/// Black-box compiler invoked by the engine.
///
/// Implementations must be thread-safe: independent units may compile
/// concurrently. Long-running backends should honour caller-side
/// cancellation; the engine imposes no internal timeout.
pub trait CompilerBackend: Send + Sync {
    /// Compile one unit's source with the given imported artifacts in scope.
    fn compile(
        &self,
        source: &str,
        imports: &[&Artifact],
        options: &CompileOptions,
    ) -> Result<Artifact, BackendError>;
}
