//! Export discovery and the shared export index.
//!
//! Exports are discovered from an artifact's structural output — its
//! generated class shapes — never by executing the unit, so the index
//! reflects exactly what downstream compilation will see.

use crate::backend::{Artifact, MemberKind, ShapeKind};
use crate::cache::UnitCache;
use crate::unit::CompiledUnit;
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Name of the designated entry-point method on a unit's entry class. It is
/// invoked by the host, not imported, and is therefore never exported.
pub const ENTRY_POINT_METHOD: &str = "run";

/// Matches names of compiler-generated anonymous constructs: a segment that
/// is purely numeric, or ends in `$<digits>`.
static GENERATED_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\d+|.*\$\d+)$").expect("valid regex"));

fn is_generated_name(name: &str) -> bool {
    name.split('.')
        .any(|segment| segment.is_empty() || GENERATED_SEGMENT.is_match(segment))
}

/// Determine the symbols `artifact` would expose to other units.
///
/// A unit with no enclosing namespace exports nothing: its members are not
/// addressable by name from elsewhere. Otherwise:
///
/// - entry-class and grouping members that are visible and non-synthetic
///   export as `namespace.member`, except the entry class's designated
///   entry-point method;
/// - named nested types export as `namespace.relativeName`, with anonymous
///   (generated-name) constructs excluded.
pub fn scan_exports(unit_name: &str, artifact: &Artifact) -> Vec<String> {
    let Some(namespace) = artifact.namespace.as_deref() else {
        debug!(unit = unit_name, "no enclosing namespace; unit exports nothing");
        return Vec::new();
    };

    let mut symbols: Vec<String> = Vec::new();
    let mut push = |symbol: String| {
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    };

    for shape in &artifact.shapes {
        match shape.kind {
            ShapeKind::Entry | ShapeKind::Grouping => {
                for member in &shape.members {
                    if !member.visible || member.synthetic {
                        continue;
                    }
                    if shape.kind == ShapeKind::Entry
                        && member.kind == MemberKind::Method
                        && member.name == ENTRY_POINT_METHOD
                    {
                        continue;
                    }
                    push(format!("{namespace}.{}", member.name));
                }
            }
            ShapeKind::Type => {
                if shape.name.is_empty() || is_generated_name(&shape.name) {
                    continue;
                }
                push(format!("{namespace}.{}", shape.name));
            }
        }
    }

    symbols
}

/// Reverse mapping from exported symbol name to the units providing it,
/// plus the grown set of namespaces known to come from script compilation.
///
/// Providers are appended in registration order; lookups walk from the most
/// recent provider backwards. Entries are never cleared individually — only
/// wholesale via [`ExportIndex::clear`] during a full cache reset.
#[derive(Debug, Default)]
pub struct ExportIndex {
    providers: DashMap<String, Vec<String>>,
    namespaces: DashSet<String>,
}

impl ExportIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every exported symbol of `unit` and record its namespace as
    /// a script namespace. Idempotent: re-registering the same unit leaves
    /// the index unchanged.
    pub fn register_unit(&self, unit: &CompiledUnit) {
        if let Some(namespace) = unit.namespace() {
            self.namespaces.insert(namespace.to_string());
        }
        for symbol in &unit.exported_symbols {
            let mut providers = self.providers.entry(symbol.clone()).or_default();
            if !providers.iter().any(|name| name == &unit.name) {
                providers.push(unit.name.clone());
            }
        }
    }

    /// Resolve `symbol` to the most recently registered provider that is
    /// still present in `cache`. Stale provider entries (purged units) are
    /// skipped, not removed.
    pub fn resolve(&self, symbol: &str, cache: &UnitCache) -> Option<Arc<CompiledUnit>> {
        let providers = self.providers.get(symbol)?;
        providers.iter().rev().find_map(|name| cache.get(name))
    }

    /// Names of the units currently registered as providers of `symbol`,
    /// in registration order.
    pub fn providers(&self, symbol: &str) -> Vec<String> {
        self.providers
            .get(symbol)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Whether `namespace` was produced by at least one script compilation.
    pub fn is_script_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    /// Whether `symbol` falls under any known script namespace.
    pub fn is_script_symbol(&self, symbol: &str) -> bool {
        self.namespaces.iter().any(|namespace| {
            symbol == namespace.key().as_str()
                || symbol
                    .strip_prefix(namespace.key().as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Number of symbols with at least one provider.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no symbol has a provider.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Wholesale reset of providers and known namespaces.
    pub fn clear(&self) {
        self.providers.clear();
        self.namespaces.clear();
    }
}
