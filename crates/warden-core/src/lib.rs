//! Warden Core - runtime contract enforcement for guarded functions
//!
//! Warden intercepts a function invocation, validates its arguments,
//! observed call graph, and return value against a declarative policy,
//! and isolates execution so a wall-clock deadline can be enforced even
//! against non-cooperative code.
//!
//! # Architecture
//!
//! ```text
//! Contract Document → Validator → Contract ─┐
//!                                           ↓
//! caller → Guarded::call → param check → caller check
//!                                           ↓
//!                             Isolator (worker + Tracer + dispatch table)
//!                                           ↓
//!                             return check → Outcome (or Violation)
//! ```
//!
//! # Guarantees
//!
//! - **Fail fast**: the body never starts when a parameter or caller
//!   check fails; a disallowed call never executes
//! - **Bounded**: a deadline is enforced by forced termination, not
//!   cooperation
//! - **Scoped**: each invocation installs and tears down its own tracer,
//!   on every exit path
//! - **Immutable policy**: a validated [`Contract`] is shared read-only
//!   for the life of the process

pub mod audit;
pub mod error;
pub mod isolator;
pub mod predicate;
pub mod schema;
pub mod tracer;
pub mod value;
pub mod wrapper;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub use audit::{audit_imports, HostFn, Registry};
pub use error::{Result, Violation};
pub use isolator::Isolator;
pub use predicate::{Predicate, PredicateRef, Rule};
pub use schema::{fingerprint, from_document, validate_document};
pub use tracer::{CallEvent, CallScope, Tracer};
pub use value::Value;
pub use wrapper::{Caller, Enforcer, Guarded, Outcome};

/// Document sentinel for a top-level (module-scope) caller
pub const TOP_LEVEL_CALLER: &str = "<module>";

/// Version of the core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Contract Model ────────────────────────────────────────

/// Top-level declarative policy.
///
/// Authored once (via [`ContractBuilder`] or compiled from a JSON
/// document by [`schema::from_document`]), validated once, then shared
/// read-only across all invocations of all guarded functions.
#[derive(Clone)]
pub struct Contract {
    raise_on_contract_exception: bool,
    functions: Vec<String>,
    specs: BTreeMap<String, FunctionSpec>,
    allowable_imports: BTreeSet<String>,
    global_allowed_calls: BTreeSet<String>,
}

impl Contract {
    /// Start building a contract programmatically
    pub fn builder() -> ContractBuilder {
        ContractBuilder::new()
    }

    /// Error policy: true = violations surface as `Err`, false =
    /// violations are folded into a non-raising [`Outcome`]
    pub fn raise_on_violation(&self) -> bool {
        self.raise_on_contract_exception
    }

    /// Declared guarded function names, in declaration order
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// The spec bound to a declared function
    pub fn spec(&self, function: &str) -> Option<&FunctionSpec> {
        self.specs.get(function)
    }

    /// Modules the guarded program may load
    pub fn allowable_imports(&self) -> &BTreeSet<String> {
        &self.allowable_imports
    }

    /// Callees every guarded function may reach
    pub fn global_allowed_calls(&self) -> &BTreeSet<String> {
        &self.global_allowed_calls
    }
}

impl std::fmt::Debug for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contract")
            .field(
                "raise_on_contract_exception",
                &self.raise_on_contract_exception,
            )
            .field("functions", &self.functions)
            .field("allowable_imports", &self.allowable_imports)
            .field("global_allowed_calls", &self.global_allowed_calls)
            .finish()
    }
}

/// Per-function policy: parameter and return predicates, call and caller
/// allowlists, and an optional wall-clock deadline.
#[derive(Clone)]
pub struct FunctionSpec {
    params: Vec<(String, PredicateRef)>,
    returns: PredicateRef,
    allowable_calls: BTreeSet<String>,
    allowed_callers: BTreeSet<String>,
    max_runtime_seconds: Option<f64>,
}

impl FunctionSpec {
    /// A spec with no params, an always-true return predicate, empty
    /// allowlists, and no deadline
    pub fn new() -> Self {
        FunctionSpec {
            params: Vec::new(),
            returns: Arc::new(|_: &Value| true),
            allowable_calls: BTreeSet::new(),
            allowed_callers: BTreeSet::new(),
            max_runtime_seconds: None,
        }
    }

    /// Declare a parameter with its predicate. Declaration order is the
    /// positional binding order.
    pub fn param(mut self, name: &str, predicate: impl Predicate + 'static) -> Self {
        self.params.push((name.to_string(), Arc::new(predicate)));
        self
    }

    /// Set the return-value predicate
    pub fn returns(mut self, predicate: impl Predicate + 'static) -> Self {
        self.returns = Arc::new(predicate);
        self
    }

    /// Allow the body to call a named callable
    pub fn allow_call(mut self, name: &str) -> Self {
        self.allowable_calls.insert(name.to_string());
        self
    }

    /// Allow a caller identity (use [`TOP_LEVEL_CALLER`] for module
    /// scope). An empty set admits every caller.
    pub fn allow_caller(mut self, name: &str) -> Self {
        self.allowed_callers.insert(name.to_string());
        self
    }

    /// Set the wall-clock deadline in seconds. Absent = unbounded.
    pub fn max_runtime(mut self, seconds: f64) -> Self {
        self.max_runtime_seconds = Some(seconds);
        self
    }

    /// Declared parameters in positional order
    pub fn params(&self) -> &[(String, PredicateRef)] {
        &self.params
    }

    /// The return-value predicate
    pub fn return_predicate(&self) -> &PredicateRef {
        &self.returns
    }

    /// Callees this function may reach (before the global union)
    pub fn allowable_calls(&self) -> &BTreeSet<String> {
        &self.allowable_calls
    }

    /// Caller identities admitted by the caller check
    pub fn allowed_callers(&self) -> &BTreeSet<String> {
        &self.allowed_callers
    }

    /// Wall-clock deadline, if any
    pub fn max_runtime_seconds(&self) -> Option<f64> {
        self.max_runtime_seconds
    }

    /// Effective allowlist: this function's `allowable_calls` unioned
    /// with the contract's `global_allowed_calls`
    pub fn effective_allowlist(&self, contract: &Contract) -> BTreeSet<String> {
        self.allowable_calls
            .union(&contract.global_allowed_calls)
            .cloned()
            .collect()
    }
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params: Vec<&str> = self.params.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("FunctionSpec")
            .field("params", &params)
            .field("allowable_calls", &self.allowable_calls)
            .field("allowed_callers", &self.allowed_callers)
            .field("max_runtime_seconds", &self.max_runtime_seconds)
            .finish()
    }
}

// ── Contract Builder ──────────────────────────────────────

/// Builds a [`Contract`] from native-closure predicates.
///
/// The JSON-document path ([`schema::from_document`]) goes through the
/// validator; this path enforces the same invariants at `build`.
pub struct ContractBuilder {
    raise_on_contract_exception: bool,
    functions: Vec<String>,
    specs: BTreeMap<String, FunctionSpec>,
    allowable_imports: BTreeSet<String>,
    global_allowed_calls: BTreeSet<String>,
}

impl ContractBuilder {
    fn new() -> Self {
        ContractBuilder {
            raise_on_contract_exception: true,
            functions: Vec::new(),
            specs: BTreeMap::new(),
            allowable_imports: BTreeSet::new(),
            global_allowed_calls: BTreeSet::new(),
        }
    }

    /// Set the error policy (default: true)
    pub fn raise_on_violation(mut self, raise: bool) -> Self {
        self.raise_on_contract_exception = raise;
        self
    }

    /// Declare a guarded function and bind its spec
    pub fn function(mut self, name: &str, spec: FunctionSpec) -> Self {
        self.functions.push(name.to_string());
        self.specs.insert(name.to_string(), spec);
        self
    }

    /// Allow a module in the import audit
    pub fn allow_import(mut self, module: &str) -> Self {
        self.allowable_imports.insert(module.to_string());
        self
    }

    /// Allow a callee for every guarded function
    pub fn global_allowed_call(mut self, name: &str) -> Self {
        self.global_allowed_calls.insert(name.to_string());
        self
    }

    /// Finish the contract. Fails when a declared function has no spec,
    /// a name is declared twice, or a deadline is not a positive number
    /// representable as a `Duration`.
    pub fn build(self) -> Result<Contract> {
        let mut seen = BTreeSet::new();
        for name in &self.functions {
            if !seen.insert(name.as_str()) {
                return Err(Violation::Schema {
                    field: format!("functions[{}]", name),
                    expected: "unique function name".to_string(),
                });
            }
            if !self.specs.contains_key(name) {
                return Err(Violation::Schema {
                    field: name.clone(),
                    expected: "function spec".to_string(),
                });
            }
        }
        for (name, spec) in &self.specs {
            if let Some(seconds) = spec.max_runtime_seconds {
                if seconds <= 0.0 || Duration::try_from_secs_f64(seconds).is_err() {
                    return Err(Violation::Schema {
                        field: format!("{}.max_runtime_seconds", name),
                        expected: "positive number".to_string(),
                    });
                }
            }
        }
        Ok(Contract {
            raise_on_contract_exception: self.raise_on_contract_exception,
            functions: self.functions,
            specs: self.specs,
            allowable_imports: self.allowable_imports,
            global_allowed_calls: self.global_allowed_calls,
        })
    }
}
