//! Cinder Script Engine Core
//!
//! A hot-reloadable script compilation and dependency-resolution engine:
//! - **Unit cache**: content-addressed compilation cache (`cache`, `fingerprint`)
//! - **Export index**: symbol providers discovered by artifact introspection (`exports`)
//! - **Batch orchestrator**: sweep-based resolution under partial information (`batch`)
//! - **Execution**: per-unit class loading and owner-scoped side-effect lifecycle (`exec`)
//!
//! The engine never loads a unit before its dependencies are known to be
//! satisfiable, and it never deadlocks on ambiguous or cyclic imports:
//! a stalled batch releases unresolved names as non-script references and
//! lets the backend's own diagnostics speak.
//!
//! # Example
//!
//! ```rust,ignore
//! use cinder_engine::{CompileRequest, HandlerTable, ScriptEngine};
//! use std::sync::Arc;
//!
//! let engine = ScriptEngine::new(backend, loader, Arc::new(HandlerTable::new()));
//!
//! let results = engine.compile_batch(vec![
//!     CompileRequest::new("greeter", source_a).with_imports(["import util.format;"]),
//!     CompileRequest::new("util", source_b),
//! ]);
//!
//! let unit = results["greeter"].as_ref().unwrap();
//! let handle = engine.execute(unit, Some(&"greeter".into()))?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Compiler backend contract and the compiled artifact model.
pub mod backend;

/// Batch compilation with interleaved dependency discovery.
pub mod batch;

/// Unit cache keyed by name and source fingerprint.
pub mod cache;

/// The engine facade owning every cache.
pub mod engine;

/// Execution, class loading, and owner-scoped handler lifecycle.
pub mod exec;

/// Export discovery and the shared export index.
pub mod exports;

/// Source fingerprints.
pub mod fingerprint;

/// Compiled units.
pub mod unit;

pub use backend::{
    Artifact, BackendError, ClassShape, CompileOptions, CompilerBackend, MemberKind, MemberShape,
    ShapeKind, CYCLE_DIAGNOSTIC,
};
pub use batch::CompileRequest;
pub use cache::UnitCache;
pub use engine::{CompileFailure, CompileResult, ScriptEngine};
pub use exec::{
    ExecError, ExecutionEngine, ExecutionHandle, HandlerRegistry, HandlerTable, Instance,
    InstantiateError, LoadError, LoadedClass, OwnerScope, UnitLoader,
};
pub use exports::{scan_exports, ExportIndex, ENTRY_POINT_METHOD};
pub use fingerprint::Fingerprint;
pub use unit::CompiledUnit;
