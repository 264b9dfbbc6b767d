//! Import auditor — load-time gating of module registration
//!
//! Intercepting every dynamic load after startup is not generally
//! possible, so the import policy is enforced where it can be: at load
//! time, when a module's callables are registered into the dispatch
//! [`Registry`]. Registration under a module outside
//! `allowable_imports` is refused. A standalone [`audit_imports`] pass
//! reports every unlisted module in a declared load set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, Violation};
use crate::value::Value;
use crate::Contract;

/// A host callable reachable from guarded bodies through the dispatch
/// table
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// The dispatch registry: named callables, grouped by owning module.
///
/// Built once at load time, then shared read-only behind an `Arc` for
/// the life of the process.
pub struct Registry {
    allowable_imports: BTreeSet<String>,
    entries: BTreeMap<String, HostFn>,
    modules: BTreeSet<String>,
}

impl Registry {
    /// An empty registry gated by the contract's `allowable_imports`
    pub fn new(contract: &Contract) -> Self {
        Registry {
            allowable_imports: contract.allowable_imports().clone(),
            entries: BTreeMap::new(),
            modules: BTreeSet::new(),
        }
    }

    /// Register a callable under its owning module. Refused with an
    /// import violation when the module is not allowlisted.
    pub fn register(
        &mut self,
        module: &str,
        name: &str,
        host_fn: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Result<()> {
        if !self.allowable_imports.contains(module) {
            return Err(Violation::Import {
                module: module.to_string(),
            });
        }
        debug!(module, name, "callable registered");
        self.modules.insert(module.to_string());
        self.entries.insert(name.to_string(), Arc::new(host_fn));
        Ok(())
    }

    /// Look up a registered callable by name
    pub fn resolve(&self, name: &str) -> Option<HostFn> {
        self.entries.get(name).cloned()
    }

    /// Modules that registered at least one callable
    pub fn modules(&self) -> &BTreeSet<String> {
        &self.modules
    }
}

/// Audit a declared set of loaded modules against the contract.
///
/// Best-effort, load-time check: reports every module outside
/// `allowable_imports`, one violation per offender.
pub fn audit_imports(
    contract: &Contract,
    loaded: &[String],
) -> std::result::Result<(), Vec<Violation>> {
    let violations: Vec<Violation> = loaded
        .iter()
        .filter(|module| !contract.allowable_imports().contains(*module))
        .map(|module| Violation::Import {
            module: module.clone(),
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
