//! Call-graph tracer — vets every dispatched call in real time
//!
//! Live call-stack introspection is replaced with an explicit
//! interception layer: calls from the guarded body to tracked callables
//! pass through a dispatch table ([`CallScope`]) the isolator controls,
//! so allowlist checks happen at the dispatch boundary.
//!
//! A [`Tracer`] lives for exactly one invocation. It is created before
//! the body starts and dropped with the scope on every exit path,
//! including forced termination. Nested guarded calls each get their own
//! tracer, so scopes never interfere (reentrant-safe by ownership).

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::audit::Registry;
use crate::error::{Result, Violation};
use crate::value::Value;
use crate::wrapper::{Caller, Guarded, Outcome};

/// One observed call: (callee name, caller name). Ephemeral — produced
/// and consumed within one invocation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub callee: String,
    pub caller: String,
}

/// Per-invocation call vetting state.
///
/// The first violation latches: once latched, every further dispatch is
/// refused and any value the body still produces is discarded by the
/// wrapper. Forced termination latches the timeout violation the same
/// way, which is what revokes the scope.
pub struct Tracer {
    function: String,
    allowed: BTreeSet<String>,
    violation: Mutex<Option<Violation>>,
    events: Mutex<Vec<CallEvent>>,
}

impl Tracer {
    /// Create a tracer for one invocation of `function` with its
    /// effective allowlist
    pub fn new(function: String, allowed: BTreeSet<String>) -> Self {
        Tracer {
            function,
            allowed,
            violation: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    /// The guarded function this tracer is attached to
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Vet one outgoing call. The disallowed call never executes: the
    /// violation is latched and returned before any dispatch happens.
    pub fn vet(&self, callee: &str) -> Result<()> {
        let mut latched = lock(&self.violation);
        if let Some(violation) = latched.as_ref() {
            return Err(violation.clone());
        }
        if !self.allowed.contains(callee) {
            let violation = Violation::CallNotAllowed {
                function: self.function.clone(),
                callee: callee.to_string(),
            };
            warn!(function = %self.function, callee, "call outside effective allowlist");
            *latched = Some(violation.clone());
            return Err(violation);
        }
        drop(latched);

        debug!(function = %self.function, callee, "call vetted");
        lock(&self.events).push(CallEvent {
            callee: callee.to_string(),
            caller: self.function.clone(),
        });
        Ok(())
    }

    /// Revoke the scope (forced termination). Every later dispatch is
    /// refused with the given violation. The first latched violation
    /// wins; a later revoke never overwrites it.
    pub fn revoke(&self, violation: Violation) {
        let mut latched = lock(&self.violation);
        if latched.is_none() {
            *latched = Some(violation);
        }
    }

    /// The latched violation, if any
    pub fn violation(&self) -> Option<Violation> {
        lock(&self.violation).clone()
    }

    /// Calls observed so far in this invocation
    pub fn events(&self) -> Vec<CallEvent> {
        lock(&self.events).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Dispatch Scope ────────────────────────────────────────

/// The dispatch table handed to a guarded body for one invocation.
///
/// All calls the body makes to tracked callables go through here, so
/// the tracer sees every call before it executes.
#[derive(Clone)]
pub struct CallScope {
    tracer: Arc<Tracer>,
    registry: Arc<Registry>,
}

impl CallScope {
    pub(crate) fn new(tracer: Arc<Tracer>, registry: Arc<Registry>) -> Self {
        CallScope { tracer, registry }
    }

    /// Name of the guarded function this scope belongs to
    pub fn function(&self) -> &str {
        self.tracer.function()
    }

    /// Dispatch a call to a registered host callable. Vets the callee
    /// first; a disallowed callee never executes.
    pub fn call(&self, callee: &str, args: &[Value]) -> Result<Value> {
        self.tracer.vet(callee)?;
        let host_fn = self.registry.resolve(callee).ok_or_else(|| Violation::Body {
            message: format!("no callable named `{}` registered", callee),
        })?;
        host_fn(args)
    }

    /// Dispatch a nested call to another guarded function. The callee is
    /// vetted against this scope's allowlist, then the target enforces
    /// its own contract under its own tracer, with this function as the
    /// caller identity.
    pub fn invoke(&self, target: &Guarded, args: &[Value]) -> Result<Outcome> {
        self.tracer.vet(target.name())?;
        target.call_from(Caller::Function(self.tracer.function().to_string()), args)
    }

    /// Calls observed so far in this invocation
    pub fn events(&self) -> Vec<CallEvent> {
        self.tracer.events()
    }
}
