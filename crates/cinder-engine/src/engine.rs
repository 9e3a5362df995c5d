//! The script engine facade.
//!
//! One `ScriptEngine` value owns the unit cache, the export index, and the
//! loaded-class cache — there is no process-wide state. Hosts construct it
//! once with their backend, loader, and handler registry, and share it by
//! reference; every method takes `&self`.

use crate::backend::{Artifact, BackendError, CompileOptions, CompilerBackend};
use crate::cache::UnitCache;
use crate::exec::{ExecError, ExecutionEngine, ExecutionHandle, HandlerRegistry, OwnerScope, UnitLoader};
use crate::exports::{scan_exports, ExportIndex};
use crate::fingerprint::Fingerprint;
use crate::unit::CompiledUnit;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A failed compilation attempt.
///
/// Carries the backend diagnostics verbatim plus the names of the imported
/// units that were in context. A failure never disturbs a previously cached
/// unit under the same name.
#[derive(Debug, Clone, Error)]
#[error("compilation of '{name}' failed: {diagnostics}")]
pub struct CompileFailure {
    /// Unit whose compilation failed.
    pub name: String,
    /// Full diagnostic text.
    pub diagnostics: String,
    /// Names of the imported units that were in context.
    pub imports: Vec<String>,
    /// Whether the permissive import-ordering retry was attempted.
    pub compat_retried: bool,
}

/// Per-unit outcome of a compilation attempt.
pub type CompileResult = Result<Arc<CompiledUnit>, CompileFailure>;

/// The hot-reloadable script engine core.
pub struct ScriptEngine {
    backend: Arc<dyn CompilerBackend>,
    units: UnitCache,
    exports: ExportIndex,
    exec: ExecutionEngine,
    compile_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ScriptEngine {
    /// Create an engine over the given collaborators.
    pub fn new(
        backend: Arc<dyn CompilerBackend>,
        loader: Arc<dyn UnitLoader>,
        handlers: Arc<dyn HandlerRegistry>,
    ) -> Self {
        Self {
            backend,
            units: UnitCache::new(),
            exports: ExportIndex::new(),
            exec: ExecutionEngine::new(loader, handlers),
            compile_locks: DashMap::new(),
        }
    }

    /// Compile one unit.
    ///
    /// When `force` is false and the cached unit for `name` has the same
    /// source fingerprint, the cached unit is returned without invoking the
    /// backend; its exports are re-registered first, since the export index
    /// may have been cleared independently on a reload pass.
    ///
    /// `imports` is sanitized before compilation: the unit's own name and
    /// any candidate whose transitive dependency chain reaches back to it
    /// are dropped, and providers are deduplicated by name (first wins).
    pub fn compile(
        &self,
        name: &str,
        source: &str,
        imports: &[Arc<CompiledUnit>],
        force: bool,
    ) -> CompileResult {
        self.compile_raw(name, source, &[], imports, force)
    }

    /// [`compile`](Self::compile) with the raw import statements recorded
    /// on the resulting unit. The batch orchestrator passes the statements
    /// from the originating request.
    pub(crate) fn compile_raw(
        &self,
        name: &str,
        source: &str,
        raw_imports: &[String],
        imports: &[Arc<CompiledUnit>],
        force: bool,
    ) -> CompileResult {
        let lock = self.name_lock(name);
        let _guard = lock.lock();

        let fingerprint = Fingerprint::of(source);
        if !force {
            if let Some(cached) = self.units.fresh(name, &fingerprint) {
                debug!(unit = name, "source unchanged; reusing cached artifact");
                self.exports.register_unit(&cached);
                return Ok(cached);
            }
        }

        let dependencies = self.sanitize_imports(name, imports);
        let imported_names: Vec<String> =
            dependencies.iter().map(|unit| unit.name.clone()).collect();
        let artifacts: Vec<&Artifact> =
            dependencies.iter().map(|unit| &unit.artifact).collect();

        let artifact =
            match self
                .backend
                .compile(source, &artifacts, &CompileOptions::default())
            {
                Ok(artifact) => artifact,
                Err(error) if error.is_cycle() => {
                    warn!(
                        unit = name,
                        "backend could not order imports; retrying with compatibility options"
                    );
                    match self.backend.compile(source, &artifacts, &CompileOptions::compat()) {
                        Ok(artifact) => artifact,
                        Err(retry_error) => {
                            return Err(self.cycle_failure(name, retry_error, imported_names))
                        }
                    }
                }
                Err(error) => {
                    return Err(CompileFailure {
                        name: name.to_string(),
                        diagnostics: error.message,
                        imports: imported_names,
                        compat_retried: false,
                    })
                }
            };

        let exported_symbols = scan_exports(name, &artifact);
        let unit = Arc::new(CompiledUnit {
            name: name.to_string(),
            fingerprint,
            artifact,
            raw_imports: raw_imports.to_vec(),
            dependencies,
            exported_symbols,
        });

        self.exports.register_unit(&unit);
        self.units.insert(Arc::clone(&unit));
        debug!(unit = name, exports = unit.exported_symbols.len(), "compiled");
        Ok(unit)
    }

    fn cycle_failure(
        &self,
        name: &str,
        error: BackendError,
        imported_names: Vec<String>,
    ) -> CompileFailure {
        let diagnostics = format!(
            "{}\nimports in context: [{}]\ncompatibility import ordering was attempted",
            error.message,
            imported_names.join(", "),
        );
        CompileFailure {
            name: name.to_string(),
            diagnostics,
            imports: imported_names,
            compat_retried: true,
        }
    }

    /// Drop imports a unit must not depend on: itself, any candidate whose
    /// transitive dependency chain already reaches back to it, and duplicate
    /// providers (first occurrence wins).
    fn sanitize_imports(
        &self,
        target: &str,
        imports: &[Arc<CompiledUnit>],
    ) -> Vec<Arc<CompiledUnit>> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut kept = Vec::with_capacity(imports.len());

        for unit in imports {
            if unit.name == target {
                debug!(unit = target, "dropping self-import");
                continue;
            }
            if !seen.insert(&unit.name) {
                continue;
            }
            if unit.depends_transitively_on(target) {
                debug!(
                    unit = target,
                    import = %unit.name,
                    "dropping import that depends back on the target"
                );
                continue;
            }
            kept.push(Arc::clone(unit));
        }
        kept
    }

    /// Construct a fresh instance of `unit`, retracting the owner's previous
    /// handlers first when an owner scope is given.
    pub fn execute(
        &self,
        unit: &Arc<CompiledUnit>,
        owner: Option<&OwnerScope>,
    ) -> Result<ExecutionHandle, ExecError> {
        self.exec.execute(unit, owner)
    }

    /// Purge cache entries for every unit outside `valid_names`.
    ///
    /// The compiled unit and its loaded class form are removed together
    /// under the unit's compile lock, so no caller observes one without the
    /// other. Export entries are left alone — they are only cleared
    /// wholesale by [`reset`](Self::reset) — and resolution skips providers
    /// that are no longer cached.
    pub fn update_cache(&self, valid_names: &FxHashSet<String>) {
        for name in self.units.names() {
            if valid_names.contains(&name) {
                continue;
            }
            let lock = self.name_lock(&name);
            let _guard = lock.lock();
            debug!(unit = %name, "purging unit outside the valid set");
            self.units.remove(&name);
            self.exec.purge_loaded(&name);
        }
        self.compile_locks
            .retain(|name, _| valid_names.contains(name));
    }

    /// Wholesale reset of every cache, ahead of a batch recompilation.
    pub fn reset(&self) {
        info!("resetting compilation, export, and loaded-class caches");
        self.units.clear();
        self.exec.clear_loaded();
        self.exports.clear();
        self.compile_locks.clear();
    }

    /// The cached unit for `name`, if any.
    pub fn unit(&self, name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(name)
    }

    /// Number of cached units.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Whether a loaded class form is cached for `name`.
    pub fn has_loaded_class(&self, name: &str) -> bool {
        self.exec.has_loaded(name)
    }

    /// Resolve `symbol` to the most recent still-cached provider unit.
    pub fn resolve_provider(&self, symbol: &str) -> Option<Arc<CompiledUnit>> {
        self.exports.resolve(symbol, &self.units)
    }

    /// Provider unit names registered for `symbol`, in registration order.
    pub fn export_providers(&self, symbol: &str) -> Vec<String> {
        self.exports.providers(symbol)
    }

    /// Whether `namespace` is known to come from script compilation.
    pub fn is_script_namespace(&self, namespace: &str) -> bool {
        self.exports.is_script_namespace(namespace)
    }

    pub(crate) fn exports(&self) -> &ExportIndex {
        &self.exports
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.compile_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("units", &self.units.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}
