//! Execution of compiled units with owner-scoped side-effect lifecycle.
//!
//! Executing a unit means turning its artifact into a loadable class form
//! (expensive, cached per unit version) and constructing a fresh instance
//! through the zero-argument path. When an owner scope is supplied, every
//! handler previously attributed to that owner is retracted first, and
//! construction runs inside the owner's attribution scope so that
//! constructor-time registrations attribute to it.

use crate::fingerprint::Fingerprint;
use crate::unit::CompiledUnit;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Identity under which side-effect registrations performed during a unit's
/// execution are attributed, enabling targeted retraction on re-run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerScope(String);

impl OwnerScope {
    /// Create an owner scope from its tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The owner tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerScope {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for OwnerScope {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Owner-scoped handler storage, owned by the host.
///
/// The engine never stores handlers itself; it only retracts them by owner
/// before a re-run and brackets instantiation in an attribution scope.
/// `push_owner`/`pop_owner` set the attribution target for registrations
/// performed on the current thread — the scoping form of "run this block as
/// the given owner".
pub trait HandlerRegistry: Send + Sync {
    /// Remove every handler attributed to `owner`.
    fn clear_by_owner(&self, owner: &OwnerScope);

    /// Make `owner` the attribution target for subsequent registrations on
    /// this thread.
    fn push_owner(&self, owner: &OwnerScope);

    /// Restore the previous attribution target on this thread.
    fn pop_owner(&self);
}

/// RAII attribution scope over a [`HandlerRegistry`].
struct OwnerAttribution<'a> {
    registry: &'a dyn HandlerRegistry,
}

impl<'a> OwnerAttribution<'a> {
    fn enter(registry: &'a dyn HandlerRegistry, owner: &OwnerScope) -> Self {
        registry.push_owner(owner);
        Self { registry }
    }
}

impl Drop for OwnerAttribution<'_> {
    fn drop(&mut self) {
        self.registry.pop_owner();
    }
}

thread_local! {
    /// Attribution stack for [`HandlerTable`]. Per-thread: registrations
    /// attribute to whichever owner the constructing thread entered.
    static CURRENT_OWNER: RefCell<Vec<OwnerScope>> = const { RefCell::new(Vec::new()) };
}

/// A registered event callback.
type Callback = Arc<dyn Fn() + Send + Sync>;

struct OwnedHandler {
    owner: Option<OwnerScope>,
    callback: Callback,
}

/// Stock [`HandlerRegistry`]: an event-handler table whose registrations
/// attribute to the current owner scope.
///
/// Hosts with their own side-effect storage implement [`HandlerRegistry`]
/// directly; this table covers the common case and is what the runtime
/// interception facility builds on.
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<String, Vec<OwnedHandler>>,
}

impl HandlerTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `event`, attributed to the current owner
    /// scope (or unowned if none is active).
    pub fn register(&self, event: &str, callback: impl Fn() + Send + Sync + 'static) {
        let owner = CURRENT_OWNER.with(|stack| stack.borrow().last().cloned());
        trace!(event, owner = owner.as_ref().map(OwnerScope::as_str), "registering handler");
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(OwnedHandler {
                owner,
                callback: Arc::new(callback),
            });
    }

    /// Invoke every handler registered for `event`; returns how many ran.
    pub fn dispatch(&self, event: &str) -> usize {
        let callbacks: Vec<Callback> = match self.handlers.get(event) {
            Some(entry) => entry.iter().map(|h| Arc::clone(&h.callback)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, |entry| entry.len())
    }

    /// Number of handlers attributed to `owner` across all events.
    pub fn owner_handler_count(&self, owner: &OwnerScope) -> usize {
        self.handlers
            .iter()
            .map(|entry| {
                entry
                    .iter()
                    .filter(|h| h.owner.as_ref() == Some(owner))
                    .count()
            })
            .sum()
    }
}

impl HandlerRegistry for HandlerTable {
    fn clear_by_owner(&self, owner: &OwnerScope) {
        debug!(owner = %owner, "retracting handlers");
        for mut entry in self.handlers.iter_mut() {
            entry.value_mut().retain(|h| h.owner.as_ref() != Some(owner));
        }
    }

    fn push_owner(&self, owner: &OwnerScope) {
        CURRENT_OWNER.with(|stack| stack.borrow_mut().push(owner.clone()));
    }

    fn pop_owner(&self) {
        CURRENT_OWNER.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Failure to turn an artifact into a loadable class form.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoadError {
    /// Diagnostic text from the loader.
    pub message: String,
}

impl LoadError {
    /// Create a load failure from its message text.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure during zero-argument construction.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InstantiateError {
    /// Diagnostic text from the constructor.
    pub message: String,
}

impl InstantiateError {
    /// Create an instantiation failure from its message text.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A fresh script instance. Its concrete type belongs to the loader.
pub type Instance = Box<dyn Any + Send>;

/// The loadable class form of a unit, produced once per unit version.
pub trait LoadedClass: Send + Sync {
    /// Construct a fresh instance through the zero-argument path.
    fn instantiate(&self) -> Result<Instance, InstantiateError>;
}

/// Turns artifacts into loadable class forms. Loading is the expensive step
/// the engine caches; implementations need not cache themselves.
pub trait UnitLoader: Send + Sync {
    /// Load the instantiable class form of `unit`'s artifact.
    fn load(&self, unit: &CompiledUnit) -> Result<Arc<dyn LoadedClass>, LoadError>;
}

/// Errors surfaced by [`ExecutionEngine::execute`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The artifact could not be turned into a loadable class form.
    #[error("failed to load class form of '{unit}': {source}")]
    Load {
        /// Unit whose load failed.
        unit: String,
        /// Underlying loader diagnostic.
        #[source]
        source: LoadError,
    },

    /// Zero-argument construction failed or panicked.
    #[error("failed to instantiate '{unit}': {source}")]
    Instantiate {
        /// Unit whose construction failed.
        unit: String,
        /// Underlying constructor diagnostic.
        #[source]
        source: InstantiateError,
    },
}

/// Handle to one executed instance.
pub struct ExecutionHandle {
    unit: Arc<CompiledUnit>,
    owner: Option<OwnerScope>,
    instance: Instance,
}

impl ExecutionHandle {
    /// The unit this instance was constructed from.
    pub fn unit(&self) -> &Arc<CompiledUnit> {
        &self.unit
    }

    /// The owner scope the execution ran under, if any.
    pub fn owner(&self) -> Option<&OwnerScope> {
        self.owner.as_ref()
    }

    /// The constructed instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Consume the handle, yielding the instance.
    pub fn into_instance(self) -> Instance {
        self.instance
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("unit", &self.unit.name)
            .field("owner", &self.owner)
            .finish()
    }
}

struct LoadedEntry {
    fingerprint: Fingerprint,
    class: Arc<dyn LoadedClass>,
}

/// Instantiates compiled units, caching their loaded class forms.
pub struct ExecutionEngine {
    loader: Arc<dyn UnitLoader>,
    handlers: Arc<dyn HandlerRegistry>,
    loaded: DashMap<String, LoadedEntry>,
    owner_locks: DashMap<OwnerScope, Arc<Mutex<()>>>,
}

impl ExecutionEngine {
    /// Create an execution engine over the given collaborators.
    pub fn new(loader: Arc<dyn UnitLoader>, handlers: Arc<dyn HandlerRegistry>) -> Self {
        Self {
            loader,
            handlers,
            loaded: DashMap::new(),
            owner_locks: DashMap::new(),
        }
    }

    /// The handler registry executions attribute to.
    pub fn handlers(&self) -> &Arc<dyn HandlerRegistry> {
        &self.handlers
    }

    /// Construct a fresh instance of `unit`.
    ///
    /// With an owner scope, the retraction of that owner's handlers and the
    /// subsequent instantiation form one critical section per owner: a
    /// concurrent execution for the same owner never observes a
    /// half-retracted handler set.
    pub fn execute(
        &self,
        unit: &Arc<CompiledUnit>,
        owner: Option<&OwnerScope>,
    ) -> Result<ExecutionHandle, ExecError> {
        let owner_lock = owner.map(|o| self.owner_lock(o));
        let _owner_guard = owner_lock.as_ref().map(|lock| lock.lock());

        if let Some(owner) = owner {
            self.handlers.clear_by_owner(owner);
        }

        let class = self.load_class(unit)?;

        let outcome = {
            let _attribution = owner.map(|o| OwnerAttribution::enter(self.handlers.as_ref(), o));
            panic::catch_unwind(AssertUnwindSafe(|| class.instantiate()))
        };

        let instance = match outcome {
            Ok(Ok(instance)) => instance,
            Ok(Err(source)) => {
                return Err(ExecError::Instantiate {
                    unit: unit.name.clone(),
                    source,
                })
            }
            Err(payload) => {
                return Err(ExecError::Instantiate {
                    unit: unit.name.clone(),
                    source: InstantiateError::new(panic_message(payload)),
                })
            }
        };

        Ok(ExecutionHandle {
            unit: Arc::clone(unit),
            owner: owner.cloned(),
            instance,
        })
    }

    /// Loaded class form for `unit`, reusing the cached form while the unit
    /// is unreplaced. A failed load is never cached.
    fn load_class(&self, unit: &Arc<CompiledUnit>) -> Result<Arc<dyn LoadedClass>, ExecError> {
        if let Some(entry) = self.loaded.get(&unit.name) {
            if entry.fingerprint == unit.fingerprint {
                trace!(unit = %unit.name, "reusing loaded class form");
                return Ok(Arc::clone(&entry.class));
            }
        }

        debug!(unit = %unit.name, "loading class form");
        let class = self.loader.load(unit).map_err(|source| ExecError::Load {
            unit: unit.name.clone(),
            source,
        })?;
        self.loaded.insert(
            unit.name.clone(),
            LoadedEntry {
                fingerprint: unit.fingerprint,
                class: Arc::clone(&class),
            },
        );
        Ok(class)
    }

    fn owner_lock(&self, owner: &OwnerScope) -> Arc<Mutex<()>> {
        self.owner_locks
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a loaded class form is cached for `name`.
    pub fn has_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Drop the loaded class form cached for `name`, if any.
    pub(crate) fn purge_loaded(&self, name: &str) {
        self.loaded.remove(name);
    }

    /// Drop every cached loaded class form.
    pub(crate) fn clear_loaded(&self) {
        self.loaded.clear();
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "constructor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Artifact, ClassShape};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit(name: &str, source: &str) -> Arc<CompiledUnit> {
        Arc::new(CompiledUnit {
            name: name.to_string(),
            fingerprint: Fingerprint::of(source),
            artifact: Artifact::new(
                Some(name.to_string()),
                vec![ClassShape::entry(Vec::new())],
                Vec::new(),
            ),
            raw_imports: Vec::new(),
            dependencies: Vec::new(),
            exported_symbols: Vec::new(),
        })
    }

    /// Loader that counts loads and lets tests inject failures.
    struct CountingLoader {
        loads: AtomicUsize,
        fail: AtomicUsize,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail: AtomicUsize::new(0),
            }
        }
    }

    struct NopClass;

    impl LoadedClass for NopClass {
        fn instantiate(&self) -> Result<Instance, InstantiateError> {
            Ok(Box::new(()))
        }
    }

    impl UnitLoader for CountingLoader {
        fn load(&self, _unit: &CompiledUnit) -> Result<Arc<dyn LoadedClass>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) > 0 {
                self.fail.fetch_sub(1, Ordering::SeqCst);
                return Err(LoadError::new("bad artifact"));
            }
            Ok(Arc::new(NopClass))
        }
    }

    fn engine_with(loader: Arc<CountingLoader>) -> (ExecutionEngine, Arc<HandlerTable>) {
        let table = Arc::new(HandlerTable::new());
        let engine = ExecutionEngine::new(loader, Arc::<HandlerTable>::clone(&table));
        (engine, table)
    }

    #[test]
    fn test_load_happens_once_per_unit_version() {
        let loader = Arc::new(CountingLoader::new());
        let (engine, _) = engine_with(Arc::clone(&loader));
        let a = unit("a", "v1");

        engine.execute(&a, None).unwrap();
        engine.execute(&a, None).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        // A replaced unit reloads.
        let a2 = unit("a", "v2");
        engine.execute(&a2, None).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let loader = Arc::new(CountingLoader::new());
        loader.fail.store(1, Ordering::SeqCst);
        let (engine, _) = engine_with(Arc::clone(&loader));
        let a = unit("a", "v1");

        let err = engine.execute(&a, None).unwrap_err();
        assert!(matches!(err, ExecError::Load { .. }));
        assert!(!engine.has_loaded("a"));

        // The next execute retries the load and succeeds.
        engine.execute(&a, None).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_owner_retraction_before_instantiation() {
        struct RegisteringClass {
            table: Arc<HandlerTable>,
        }
        impl LoadedClass for RegisteringClass {
            fn instantiate(&self) -> Result<Instance, InstantiateError> {
                self.table.register("tick", || {});
                Ok(Box::new(()))
            }
        }
        struct RegisteringLoader {
            table: Arc<HandlerTable>,
        }
        impl UnitLoader for RegisteringLoader {
            fn load(&self, _unit: &CompiledUnit) -> Result<Arc<dyn LoadedClass>, LoadError> {
                Ok(Arc::new(RegisteringClass {
                    table: Arc::clone(&self.table),
                }))
            }
        }

        let table = Arc::new(HandlerTable::new());
        let engine = ExecutionEngine::new(
            Arc::new(RegisteringLoader {
                table: Arc::clone(&table),
            }),
            Arc::<HandlerTable>::clone(&table),
        );

        let a = unit("a", "v1");
        let alice = OwnerScope::new("alice");
        let bob = OwnerScope::new("bob");

        engine.execute(&a, Some(&alice)).unwrap();
        engine.execute(&a, Some(&bob)).unwrap();
        assert_eq!(table.owner_handler_count(&alice), 1);
        assert_eq!(table.owner_handler_count(&bob), 1);

        // Re-running alice retracts exactly alice's handler.
        engine.execute(&a, Some(&alice)).unwrap();
        assert_eq!(table.owner_handler_count(&alice), 1);
        assert_eq!(table.owner_handler_count(&bob), 1);
        assert_eq!(table.handler_count("tick"), 2);
    }

    #[test]
    fn test_instantiation_panic_is_contained() {
        struct PanickingClass;
        impl LoadedClass for PanickingClass {
            fn instantiate(&self) -> Result<Instance, InstantiateError> {
                panic!("constructor exploded");
            }
        }
        struct PanickingLoader;
        impl UnitLoader for PanickingLoader {
            fn load(&self, _unit: &CompiledUnit) -> Result<Arc<dyn LoadedClass>, LoadError> {
                Ok(Arc::new(PanickingClass))
            }
        }

        let engine = ExecutionEngine::new(Arc::new(PanickingLoader), Arc::new(HandlerTable::new()));
        let a = unit("a", "v1");

        let err = engine.execute(&a, Some(&OwnerScope::new("alice"))).unwrap_err();
        match err {
            ExecError::Instantiate { source, .. } => {
                assert!(source.message.contains("constructor exploded"));
            }
            other => panic!("expected instantiation failure, got {other:?}"),
        }

        // The attribution scope unwound cleanly; a later register is unowned.
        let table = HandlerTable::new();
        table.register("tick", || {});
        assert_eq!(table.owner_handler_count(&OwnerScope::new("alice")), 0);
    }

    #[test]
    fn test_handler_table_dispatch() {
        let table = HandlerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        table.register("tick", move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(table.dispatch("tick"), 1);
        assert_eq!(table.dispatch("other"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
