//! Batch compilation with interleaved dependency discovery.
//!
//! The full dependency graph is not knowable before compilation: imports
//! arrive as raw statements, not validated declarations. The orchestrator
//! therefore sweeps the pending set, compiling every request whose candidate
//! imports currently resolve against the export index, until a sweep makes
//! no progress — at which point remaining unresolved names are released as
//! non-script references so the batch always terminates.

use crate::engine::{CompileResult, ScriptEngine};
use crate::unit::CompiledUnit;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A pending unit to compile. Consumed by
/// [`ScriptEngine::compile_batch`] and discarded once resolved to a result.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Unit name.
    pub name: String,
    /// Source text.
    pub source: String,
    /// Display label for diagnostics.
    pub source_name: String,
    /// Import statements as written in the source.
    pub raw_imports: Vec<String>,
}

impl CompileRequest {
    /// Create a request with no imports; the source name defaults to the
    /// unit name.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_name: name.clone(),
            name,
            source: source.into(),
            raw_imports: Vec::new(),
        }
    }

    /// Attach raw import statements.
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw_imports = imports.into_iter().map(Into::into).collect();
        self
    }

    /// Override the diagnostic display label.
    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = source_name.into();
        self
    }
}

/// Matches one import statement and captures the imported symbol path. The
/// `import` keyword and trailing semicolon are optional so callers may pass
/// either full statements or bare dotted names.
static IMPORT_STMT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:import\s+)?(?:static\s+)?([A-Za-z_][A-Za-z0-9_$]*(?:\.[A-Za-z0-9_$]+)*)\s*;?\s*$")
        .expect("valid regex")
});

/// Extract the imported symbol path from a raw import statement. Statements
/// that do not parse (wildcards, malformed text) yield `None` and pass
/// through to the backend untouched.
pub(crate) fn import_symbol(statement: &str) -> Option<String> {
    let captures = IMPORT_STMT.captures(statement)?;
    let symbol = &captures[1];
    // A bare keyword is a malformed statement, not a symbol.
    if symbol == "import" || symbol == "static" {
        return None;
    }
    Some(symbol.to_string())
}

impl ScriptEngine {
    /// Compile an arbitrary, possibly inter-dependent collection of
    /// requests, returning a per-unit result map.
    ///
    /// Each sweep compiles every request whose candidate imports resolve;
    /// success and failure both count as resolved. A zero-progress sweep
    /// flips forced release: the next sweep treats unresolved names as
    /// non-script references and compiles everything left, so the loop
    /// terminates on any finite request set. A request is never dropped —
    /// at worst it compiles without an unresolvable dependency and the
    /// backend's own diagnostic is surfaced verbatim.
    pub fn compile_batch(
        &self,
        requests: Vec<CompileRequest>,
    ) -> FxHashMap<String, CompileResult> {
        // Request names count as prospective namespaces so that
        // intra-batch dependencies bind on first submission.
        let batch_names: FxHashSet<String> =
            requests.iter().map(|request| request.name.clone()).collect();

        let mut results: FxHashMap<String, CompileResult> = FxHashMap::default();
        let mut pending = requests;
        let mut force_release = false;
        let mut sweep = 0usize;

        while !pending.is_empty() {
            sweep += 1;
            let mut progressed = false;
            let mut still_pending = Vec::with_capacity(pending.len());

            for request in pending {
                let candidates = self.candidate_symbols(&request, &batch_names);

                let mut providers: Vec<Arc<CompiledUnit>> = Vec::new();
                let mut unresolved: Vec<&str> = Vec::new();
                for symbol in &candidates {
                    match self.resolve_provider(symbol) {
                        Some(unit) => providers.push(unit),
                        None => unresolved.push(symbol),
                    }
                }

                if !unresolved.is_empty() && !force_release {
                    still_pending.push(request);
                    continue;
                }

                if !unresolved.is_empty() {
                    debug!(
                        unit = %request.name,
                        source = %request.source_name,
                        ?unresolved,
                        "releasing unresolved imports as non-script references"
                    );
                }

                let outcome = self.compile_raw(
                    &request.name,
                    &request.source,
                    &request.raw_imports,
                    &providers,
                    false,
                );
                if let Err(failure) = &outcome {
                    debug!(
                        unit = %request.name,
                        source = %request.source_name,
                        diagnostics = %failure.diagnostics,
                        "batch member failed to compile"
                    );
                }
                results.insert(request.name, outcome);
                progressed = true;
            }

            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            if !progressed {
                warn!(
                    sweep,
                    remaining = pending.len(),
                    "no request made progress; treating remaining unresolved imports as non-script"
                );
                force_release = true;
            }
        }

        info!(units = results.len(), sweeps = sweep, "batch compilation finished");
        results
    }

    /// Filter a request's raw imports down to candidate script
    /// dependencies: names under a namespace produced by script
    /// compilation, or under the name of a unit in the current batch.
    /// Everything else is a non-script (environment) import and passes
    /// through untouched.
    fn candidate_symbols(
        &self,
        request: &CompileRequest,
        batch_names: &FxHashSet<String>,
    ) -> Vec<String> {
        let mut candidates = Vec::new();
        for statement in &request.raw_imports {
            let Some(symbol) = import_symbol(statement) else {
                continue;
            };
            if !self.is_script_candidate(&symbol, batch_names) {
                continue;
            }
            if !candidates.contains(&symbol) {
                candidates.push(symbol);
            }
        }
        candidates
    }

    fn is_script_candidate(&self, symbol: &str, batch_names: &FxHashSet<String>) -> bool {
        if self.exports().is_script_symbol(symbol) {
            return true;
        }
        batch_names.iter().any(|name| {
            symbol == name
                || symbol
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}
