//! Enforcement wrapper — the guarded callable
//!
//! [`Enforcer::guard`] binds a body to its [`FunctionSpec`] and yields a
//! [`Guarded`] callable. Per call, in order: parameter check, caller
//! check, isolated execution with a fresh tracer, return check, then
//! packaging into an [`Outcome`].
//!
//! Error policy: with `raise_on_contract_exception = true` any violation
//! surfaces as `Err(Violation)`; with `false` the call returns
//! `Ok(Outcome)` with `ok = false` and a violation-kind-specific message
//! in `exception`. Successful calls always yield `ok = true`.
//!
//! Side effects committed by the body before a post-execution violation
//! (return check, timeout) are never rolled back. Documented
//! non-atomicity, not a defect.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::audit::Registry;
use crate::error::{Result, Violation};
use crate::isolator::Isolator;
use crate::tracer::{CallScope, Tracer};
use crate::value::Value;
use crate::{Contract, FunctionSpec, TOP_LEVEL_CALLER};

// ── Caller Identity ───────────────────────────────────────

/// The immediate caller of a guarded function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Top-level / module-scope caller (document sentinel `<module>`)
    TopLevel,
    /// An enclosing function, by name
    Function(String),
}

impl Caller {
    /// The identity string matched against `allowed_callers`
    pub fn identity(&self) -> &str {
        match self {
            Caller::TopLevel => TOP_LEVEL_CALLER,
            Caller::Function(name) => name,
        }
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identity())
    }
}

// ── Result Envelope ───────────────────────────────────────

/// Non-raising outcome of one guarded invocation.
///
/// Inspect [`Outcome::ok`] before trusting [`Outcome::returns`].
/// Created fresh per invocation; ownership transfers to the caller.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    returns: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
}

impl Outcome {
    fn success(value: Value) -> Self {
        Outcome {
            ok: true,
            returns: Some(value),
            exception: None,
        }
    }

    fn failure(violation: &Violation) -> Self {
        Outcome {
            ok: false,
            returns: None,
            exception: Some(format!("[{}] {}", violation.kind(), violation)),
        }
    }

    /// True when the call completed without any violation
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// The produced value, present iff `ok`
    pub fn returns(&self) -> Option<&Value> {
        self.returns.as_ref()
    }

    /// The violation description, present iff not `ok`
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }
}

// ── Enforcer ──────────────────────────────────────────────

/// Process-wide enforcement context: one immutable contract, one
/// dispatch registry, one shared worker pool.
pub struct Enforcer {
    contract: Arc<Contract>,
    registry: Arc<Registry>,
    isolator: Arc<Isolator>,
}

impl Enforcer {
    /// Take ownership of a validated contract and a loaded registry.
    /// Both become immutable and shared from here on.
    pub fn new(contract: Contract, registry: Registry) -> Self {
        Enforcer {
            contract: Arc::new(contract),
            registry: Arc::new(registry),
            isolator: Arc::new(Isolator::new()),
        }
    }

    /// The contract this enforcer applies
    pub fn contract(&self) -> &Arc<Contract> {
        &self.contract
    }

    /// Produce a guarded callable for a declared function. Guarding an
    /// undeclared name is a schema violation.
    pub fn guard(
        &self,
        name: &str,
        body: impl Fn(&CallScope, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Result<Guarded> {
        let spec = self.contract.spec(name).cloned().ok_or_else(|| {
            Violation::Schema {
                field: name.to_string(),
                expected: "function declared in contract".to_string(),
            }
        })?;
        debug!(function = name, "function guarded");
        Ok(Guarded {
            name: name.to_string(),
            spec,
            contract: self.contract.clone(),
            registry: self.registry.clone(),
            isolator: self.isolator.clone(),
            body: Arc::new(body),
        })
    }
}

// ── Guarded Callable ──────────────────────────────────────

type Body = dyn Fn(&CallScope, &[Value]) -> Result<Value> + Send + Sync;

/// A function wrapped with enforcement behavior. Same signature as the
/// unwrapped body, except the return value arrives inside an
/// [`Outcome`] in non-raising mode.
pub struct Guarded {
    name: String,
    spec: FunctionSpec,
    contract: Arc<Contract>,
    registry: Arc<Registry>,
    isolator: Arc<Isolator>,
    body: Arc<Body>,
}

impl std::fmt::Debug for Guarded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guarded")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish()
    }
}

impl Guarded {
    /// The declared function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke from top level (module scope)
    pub fn call(&self, args: &[Value]) -> Result<Outcome> {
        self.call_from(Caller::TopLevel, args)
    }

    /// Invoke with an explicit caller identity
    pub fn call_from(&self, caller: Caller, args: &[Value]) -> Result<Outcome> {
        match self.enforce(&caller, args) {
            Ok(value) => Ok(Outcome::success(value)),
            Err(violation) => {
                warn!(
                    function = %self.name,
                    kind = violation.kind(),
                    %violation,
                    "contract violation"
                );
                if self.contract.raise_on_violation() {
                    Err(violation)
                } else {
                    Ok(Outcome::failure(&violation))
                }
            }
        }
    }

    /// Pre-checks, isolated execution, post-checks. Ordering per
    /// invocation: parameters, then caller, then execution, then return.
    fn enforce(&self, caller: &Caller, args: &[Value]) -> Result<Value> {
        self.check_params(args)?;
        self.check_caller(caller)?;

        let tracer = Arc::new(Tracer::new(
            self.name.clone(),
            self.spec.effective_allowlist(&self.contract),
        ));
        let scope = CallScope::new(tracer.clone(), self.registry.clone());
        let body = self.body.clone();
        let bound: Vec<Value> = args.to_vec();
        // validated at build, but never panic here: an unrepresentable
        // deadline degrades to unbounded
        let deadline = self
            .spec
            .max_runtime_seconds()
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());

        let produced = self
            .isolator
            .run(&tracer, deadline, Box::new(move || body(&scope, &bound)));

        // a latched tracer violation wins over whatever the body
        // returned: output produced around a disallowed call is
        // discarded, never surfaced
        if let Some(violation) = tracer.violation() {
            return Err(violation);
        }

        let value = produced?;
        if !self.spec.return_predicate().eval(&value) {
            return Err(Violation::Return {
                function: self.name.clone(),
            });
        }
        Ok(value)
    }

    /// Bind arguments positionally to declared params and evaluate each
    /// predicate. Fails before the body observes anything.
    fn check_params(&self, args: &[Value]) -> Result<()> {
        let params = self.spec.params();
        if args.len() != params.len() {
            // name the first unbound param, or the position of the
            // first surplus argument
            let param = params
                .get(args.len())
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| format!("#{}", params.len()));
            return Err(Violation::Parameter { param });
        }
        for ((name, predicate), value) in params.iter().zip(args) {
            if !predicate.eval(value) {
                return Err(Violation::Parameter {
                    param: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_caller(&self, caller: &Caller) -> Result<()> {
        let allowed = self.spec.allowed_callers();
        if allowed.is_empty() || allowed.contains(caller.identity()) {
            Ok(())
        } else {
            Err(Violation::Caller {
                caller: caller.identity().to_string(),
                function: self.name.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Rule;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn enforcer(raise: bool) -> Enforcer {
        let contract = Contract::builder()
            .raise_on_violation(raise)
            .function(
                "calculate",
                FunctionSpec::new()
                    .param("expression", Rule::parse("is string and is not empty").unwrap())
                    .returns(Rule::parse("is number").unwrap())
                    .allow_call("eval")
                    .allow_caller(TOP_LEVEL_CALLER),
            )
            .allow_import("math")
            .global_allowed_call("log")
            .build()
            .unwrap();
        let mut registry = Registry::new(&contract);
        registry
            .register("math", "eval", |args| {
                // toy evaluator: parses "a+b"
                let expr = args[0].as_str().unwrap_or("");
                let mut parts = expr.splitn(2, '+');
                let a: i64 = parts.next().unwrap_or("0").trim().parse().unwrap_or(0);
                let b: i64 = parts.next().unwrap_or("0").trim().parse().unwrap_or(0);
                Ok(Value::Integer(a + b))
            })
            .unwrap();
        registry.register("math", "log", |_| Ok(Value::Null)).unwrap();
        Enforcer::new(contract, registry)
    }

    fn calculate(enforcer: &Enforcer) -> Guarded {
        enforcer
            .guard("calculate", |scope, args| scope.call("eval", args))
            .unwrap()
    }

    #[test]
    fn test_conforming_call_succeeds_in_both_modes() {
        for raise in [true, false] {
            let enforcer = enforcer(raise);
            let guarded = calculate(&enforcer);
            let outcome = guarded.call(&[Value::from("2+3")]).unwrap();
            assert!(outcome.ok());
            assert_eq!(outcome.returns(), Some(&Value::Integer(5)));
            assert_eq!(outcome.exception(), None);
        }
    }

    #[test]
    fn test_param_violation_raising_mode() {
        let enforcer = enforcer(true);
        let guarded = calculate(&enforcer);
        let err = guarded.call(&[Value::Integer(7)]).unwrap_err();
        assert_eq!(
            err,
            Violation::Parameter {
                param: "expression".to_string()
            }
        );
    }

    #[test]
    fn test_param_violation_envelope_mode() {
        let enforcer = enforcer(false);
        let guarded = calculate(&enforcer);
        let outcome = guarded.call(&[Value::from("")]).unwrap();
        assert!(!outcome.ok());
        assert_eq!(outcome.returns(), None);
        assert!(outcome.exception().unwrap().starts_with("[parameter]"));
    }

    #[test]
    fn test_failed_param_check_never_runs_body() {
        let enforcer = enforcer(false);
        let touched = Arc::new(AtomicBool::new(false));
        let flag = touched.clone();
        let guarded = enforcer
            .guard("calculate", move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Integer(0))
            })
            .unwrap();
        let outcome = guarded.call(&[Value::Integer(1)]).unwrap();
        assert!(!outcome.ok());
        assert!(!touched.load(Ordering::SeqCst), "body must not start");
    }

    #[test]
    fn test_arity_mismatch_is_parameter_violation() {
        let enforcer = enforcer(true);
        let guarded = calculate(&enforcer);
        let err = guarded.call(&[]).unwrap_err();
        assert_eq!(
            err,
            Violation::Parameter {
                param: "expression".to_string()
            }
        );
        let err = guarded
            .call(&[Value::from("1+1"), Value::from("extra")])
            .unwrap_err();
        assert!(matches!(err, Violation::Parameter { .. }));
    }

    #[test]
    fn test_caller_violation_despite_valid_params_and_return() {
        let enforcer = enforcer(true);
        let guarded = calculate(&enforcer);
        let err = guarded
            .call_from(Caller::Function("intruder".to_string()), &[Value::from("1+1")])
            .unwrap_err();
        assert_eq!(
            err,
            Violation::Caller {
                caller: "intruder".to_string(),
                function: "calculate".to_string()
            }
        );
    }

    #[test]
    fn test_empty_allowed_callers_admits_everyone() {
        let contract = Contract::builder()
            .function("open", FunctionSpec::new())
            .build()
            .unwrap();
        let registry = Registry::new(&contract);
        let enforcer = Enforcer::new(contract, registry);
        let guarded = enforcer.guard("open", |_, _| Ok(Value::Null)).unwrap();
        assert!(guarded
            .call_from(Caller::Function("anyone".to_string()), &[])
            .unwrap()
            .ok());
    }

    #[test]
    fn test_return_violation_and_side_effects_not_rolled_back() {
        let enforcer = enforcer(true);
        let touched = Arc::new(AtomicBool::new(false));
        let flag = touched.clone();
        let guarded = enforcer
            .guard("calculate", move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::from("not a number"))
            })
            .unwrap();
        let err = guarded.call(&[Value::from("1+1")]).unwrap_err();
        assert_eq!(
            err,
            Violation::Return {
                function: "calculate".to_string()
            }
        );
        assert!(touched.load(Ordering::SeqCst), "body fully ran");
    }

    #[test]
    fn test_disallowed_call_fails_fast() {
        let enforcer = enforcer(true);
        let guarded = enforcer
            .guard("calculate", |scope, args| {
                scope.call("eval", args)?;
                scope.call("exec", args) // not allowlisted
            })
            .unwrap();
        let err = guarded.call(&[Value::from("1+1")]).unwrap_err();
        assert_eq!(
            err,
            Violation::CallNotAllowed {
                function: "calculate".to_string(),
                callee: "exec".to_string()
            }
        );
    }

    #[test]
    fn test_output_after_disallowed_call_is_discarded() {
        let enforcer = enforcer(true);
        let guarded = enforcer
            .guard("calculate", |scope, args| {
                // swallow the refusal and fabricate a conforming value
                let _ = scope.call("exec", args);
                Ok(Value::Integer(99))
            })
            .unwrap();
        let err = guarded.call(&[Value::from("1+1")]).unwrap_err();
        assert!(matches!(err, Violation::CallNotAllowed { .. }));
    }

    #[test]
    fn test_global_allowed_calls_are_in_effect() {
        let enforcer = enforcer(true);
        let guarded = enforcer
            .guard("calculate", |scope, args| {
                scope.call("log", &[])?; // global allowlist
                scope.call("eval", args)
            })
            .unwrap();
        assert!(guarded.call(&[Value::from("1+1")]).unwrap().ok());
    }

    #[test]
    fn test_timeout_forces_termination() {
        let contract = Contract::builder()
            .raise_on_violation(false)
            .function(
                "slow",
                FunctionSpec::new().max_runtime(0.1),
            )
            .build()
            .unwrap();
        let registry = Registry::new(&contract);
        let enforcer = Enforcer::new(contract, registry);
        let progressed = Arc::new(AtomicUsize::new(0));
        let counter = progressed.clone();
        let guarded = enforcer
            .guard("slow", move |scope, _| {
                std::thread::sleep(Duration::from_secs(10));
                // revoked scope: this dispatch must fail, so the stuck
                // body makes no observable progress after expiry
                scope.call("anything", &[])?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .unwrap();

        let start = Instant::now();
        let outcome = guarded.call(&[]).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!outcome.ok());
        assert!(outcome.exception().unwrap().starts_with("[timeout]"));
        assert_eq!(progressed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_body_error_follows_policy_switch() {
        // raising mode: surfaced as the function's own error
        let enforcer_raising = enforcer(true);
        let guarded = enforcer_raising
            .guard("calculate", |_, _| {
                Err(Violation::Body {
                    message: "division by zero".to_string(),
                })
            })
            .unwrap();
        let err = guarded.call(&[Value::from("1+1")]).unwrap_err();
        assert!(matches!(err, Violation::Body { .. }));

        // non-raising mode: folded into the envelope, kind preserved
        let enforcer_enveloping = enforcer(false);
        let guarded = enforcer_enveloping
            .guard("calculate", |_, _| {
                Err(Violation::Body {
                    message: "division by zero".to_string(),
                })
            })
            .unwrap();
        let outcome = guarded.call(&[Value::from("1+1")]).unwrap();
        assert!(!outcome.ok());
        assert!(outcome.exception().unwrap().starts_with("[body]"));
    }

    #[test]
    fn test_nested_guarded_calls_are_reentrant() {
        let contract = Contract::builder()
            .function(
                "outer",
                FunctionSpec::new()
                    .returns(Rule::parse("is boolean").unwrap())
                    .allow_call("inner"),
            )
            .function(
                "inner",
                FunctionSpec::new()
                    .returns(Rule::parse("is boolean").unwrap())
                    .allow_caller("outer"),
            )
            .build()
            .unwrap();
        let registry = Registry::new(&contract);
        let enforcer = Enforcer::new(contract, registry);

        let inner = Arc::new(enforcer.guard("inner", |_, _| Ok(Value::Boolean(true))).unwrap());

        // inner refuses a top-level caller
        let err = inner.call(&[]).unwrap_err();
        assert!(matches!(err, Violation::Caller { .. }));

        // but admits "outer" propagated through nested dispatch
        let inner_for_outer = inner.clone();
        let outer = enforcer
            .guard("outer", move |scope, _| {
                let outcome = scope.invoke(&inner_for_outer, &[])?;
                Ok(outcome.returns().cloned().unwrap_or(Value::Null))
            })
            .unwrap();
        let outcome = outer.call(&[]).unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome.returns(), Some(&Value::Boolean(true)));
    }

    #[test]
    fn test_nested_callee_outside_allowlist_refused() {
        let contract = Contract::builder()
            .function("outer", FunctionSpec::new())
            .function("inner", FunctionSpec::new())
            .build()
            .unwrap();
        let registry = Registry::new(&contract);
        let enforcer = Enforcer::new(contract, registry);
        let inner = Arc::new(enforcer.guard("inner", |_, _| Ok(Value::Null)).unwrap());
        let inner_for_outer = inner.clone();
        let outer = enforcer
            .guard("outer", move |scope, _| {
                scope.invoke(&inner_for_outer, &[])?;
                Ok(Value::Null)
            })
            .unwrap();
        let err = outer.call(&[]).unwrap_err();
        assert_eq!(
            err,
            Violation::CallNotAllowed {
                function: "outer".to_string(),
                callee: "inner".to_string()
            }
        );
    }

    #[test]
    fn test_guarding_undeclared_function_is_schema_violation() {
        let enforcer = enforcer(true);
        let err = enforcer.guard("phantom", |_, _| Ok(Value::Null)).unwrap_err();
        assert!(matches!(err, Violation::Schema { .. }));
    }

    #[test]
    fn test_guarded_debug_names_function() {
        let enforcer = enforcer(true);
        let guarded = calculate(&enforcer);
        let rendered = format!("{:?}", guarded);
        assert!(rendered.contains("calculate"));
    }

    #[test]
    fn test_envelope_serializes_cleanly() {
        let outcome = Outcome::success(Value::Integer(5));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true, "returns": 5}));

        let outcome = Outcome::failure(&Violation::Parameter {
            param: "expression".to_string(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["ok"], serde_json::json!(false));
        assert!(json.get("returns").is_none());
    }

    #[test]
    fn test_concurrent_invocations_are_independent() {
        let enforcer = Arc::new(enforcer(false));
        let guarded = Arc::new(calculate(&enforcer));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guarded = guarded.clone();
                std::thread::spawn(move || {
                    let expr = format!("{}+{}", i, i);
                    let outcome = guarded.call(&[Value::from(expr)]).unwrap();
                    assert!(outcome.ok());
                    assert_eq!(outcome.returns(), Some(&Value::Integer(2 * i)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
