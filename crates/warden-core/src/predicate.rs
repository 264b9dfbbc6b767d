//! Predicates — pure boolean checks over one value
//!
//! Parameter and return policies are [`Predicate`]s: a single
//! `eval(value) -> bool` capability with no side effects. Authors supply
//! either native closures (any `Fn(&Value) -> bool`) or [`Rule`]s — a
//! small compiled expression form so contract documents written as JSON
//! can still carry predicates.

use std::sync::Arc;

use crate::error::{Result, Violation};
use crate::value::Value;

/// A pure boolean evaluator over one value.
///
/// Implementations must be side-effect free: a predicate may be evaluated
/// any number of times, in any order, inside the isolation boundary.
pub trait Predicate: Send + Sync {
    /// Evaluate the predicate against a single value
    fn eval(&self, value: &Value) -> bool;
}

/// Shared, immutable predicate handle
pub type PredicateRef = Arc<dyn Predicate>;

impl<F> Predicate for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn eval(&self, value: &Value) -> bool {
        self(value)
    }
}

// ── Compiled Rules ────────────────────────────────────────

/// A predicate compiled from a rule expression string.
///
/// Rules are conjunctions of clauses joined by ` and `:
///
/// - `any` — always true
/// - `is null` / `is boolean` / `is integer` / `is float` / `is string` /
///   `is array` / `is object` — type check
/// - `is number` — integer or float
/// - `is not empty` — truthiness check
/// - `>= n`, `<= n`, `> n`, `< n`, `== n` — numeric comparison against
///   the value itself (non-numeric values fail)
///
/// Examples: `"is string and is not empty"`, `"is number and >= 0"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    source: String,
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Any,
    IsType(&'static str),
    IsNumber,
    NotEmpty,
    Compare(CompareOp, f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
}

impl Rule {
    /// Compile a rule expression. Fails with a schema violation naming
    /// the expression when any clause is not recognized.
    pub fn parse(expr: &str) -> Result<Rule> {
        let mut clauses = Vec::new();
        for raw in expr.split(" and ") {
            clauses.push(Self::parse_clause(raw.trim(), expr)?);
        }
        Ok(Rule {
            source: expr.to_string(),
            clauses,
        })
    }

    /// The expression this rule was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    fn parse_clause(clause: &str, expr: &str) -> Result<Clause> {
        match clause {
            "any" => return Ok(Clause::Any),
            "is null" => return Ok(Clause::IsType("null")),
            "is boolean" => return Ok(Clause::IsType("boolean")),
            "is integer" => return Ok(Clause::IsType("integer")),
            "is float" => return Ok(Clause::IsType("float")),
            "is string" => return Ok(Clause::IsType("string")),
            "is array" => return Ok(Clause::IsType("array")),
            "is object" => return Ok(Clause::IsType("object")),
            "is number" => return Ok(Clause::IsNumber),
            "is not empty" => return Ok(Clause::NotEmpty),
            _ => {}
        }

        for (token, op) in [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("==", CompareOp::Eq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ] {
            if let Some(rest) = clause.strip_prefix(token) {
                if let Ok(num) = rest.trim().parse::<f64>() {
                    return Ok(Clause::Compare(op, num));
                }
            }
        }

        Err(Violation::Schema {
            field: expr.to_string(),
            expected: "predicate rule".to_string(),
        })
    }
}

impl Predicate for Rule {
    fn eval(&self, value: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Any => true,
            Clause::IsType(name) => value.type_name() == *name,
            Clause::IsNumber => value.as_f64().is_some(),
            Clause::NotEmpty => value.is_truthy(),
            Clause::Compare(op, rhs) => match value.as_f64() {
                Some(lhs) => match op {
                    CompareOp::Ge => lhs >= *rhs,
                    CompareOp::Le => lhs <= *rhs,
                    CompareOp::Gt => lhs > *rhs,
                    CompareOp::Lt => lhs < *rhs,
                    CompareOp::Eq => lhs == *rhs,
                },
                None => false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_predicate() {
        let p = |v: &Value| matches!(v, Value::Integer(i) if *i > 10);
        assert!(p.eval(&Value::Integer(11)));
        assert!(!p.eval(&Value::Integer(10)));
        assert!(!p.eval(&Value::from("11")));
    }

    #[test]
    fn test_rule_type_checks() {
        let rule = Rule::parse("is string").unwrap();
        assert!(rule.eval(&Value::from("hello")));
        assert!(!rule.eval(&Value::Integer(1)));

        let rule = Rule::parse("is number").unwrap();
        assert!(rule.eval(&Value::Integer(1)));
        assert!(rule.eval(&Value::Float(1.5)));
        assert!(!rule.eval(&Value::from("1")));
    }

    #[test]
    fn test_rule_conjunction() {
        let rule = Rule::parse("is number and >= 0 and < 100").unwrap();
        assert!(rule.eval(&Value::Integer(0)));
        assert!(rule.eval(&Value::Float(99.9)));
        assert!(!rule.eval(&Value::Integer(-1)));
        assert!(!rule.eval(&Value::Integer(100)));
    }

    #[test]
    fn test_rule_not_empty() {
        let rule = Rule::parse("is string and is not empty").unwrap();
        assert!(rule.eval(&Value::from("x")));
        assert!(!rule.eval(&Value::from("")));
    }

    #[test]
    fn test_rule_any() {
        let rule = Rule::parse("any").unwrap();
        assert!(rule.eval(&Value::Null));
        assert!(rule.eval(&Value::from("whatever")));
    }

    #[test]
    fn test_unknown_clause_is_schema_violation() {
        let err = Rule::parse("is prime").unwrap_err();
        assert!(matches!(err, Violation::Schema { .. }));
    }

    #[test]
    fn test_comparison_on_non_numeric_fails() {
        let rule = Rule::parse(">= 0").unwrap();
        assert!(!rule.eval(&Value::from("3")));
        assert!(!rule.eval(&Value::Null));
    }
}
