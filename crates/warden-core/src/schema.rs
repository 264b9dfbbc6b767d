//! Contract document validator — checks a raw policy document before use
//!
//! Validation is a pure function over a `serde_json::Value`, callable
//! standalone outside any invocation. It checks fields in deterministic
//! order and fails fast at the first violation: an invalid contract
//! provides zero enforcement guarantee, so a schema violation is always
//! surfaced, independent of `raise_on_contract_exception`.
//!
//! Document shape:
//!
//! ```json
//! {
//!   "raise_on_contract_exception": true,
//!   "functions": ["calculate"],
//!   "calculate": {
//!     "params": { "expression": "is string and is not empty" },
//!     "returns": "is number",
//!     "allowable_calls": ["eval"],
//!     "allowed_callers": ["<module>"],
//!     "max_runtime_seconds": 2.0
//!   },
//!   "allowable_imports": ["math"],
//!   "global_allowed_calls": ["log"]
//! }
//! ```

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Result, Violation};
use crate::predicate::Rule;
use crate::{Contract, FunctionSpec};

// ── Validation ────────────────────────────────────────────

/// Validate a raw contract document.
///
/// Checks top-level keys first (`raise_on_contract_exception`,
/// `functions`, `allowable_imports`, `global_allowed_calls`), then each
/// declared function's spec in listed order (`params`, `returns`,
/// `allowable_calls`, `allowed_callers`, `max_runtime_seconds`).
/// Idempotent: the document is never mutated.
pub fn validate_document(doc: &serde_json::Value) -> Result<()> {
    let root = doc.as_object().ok_or_else(|| schema("contract", "object"))?;

    expect_bool(root, "raise_on_contract_exception")?;
    let functions = expect_string_array(root, "functions")?;
    expect_string_array(root, "allowable_imports")?;
    expect_string_array(root, "global_allowed_calls")?;

    for function in &functions {
        validate_function_spec(root, function)?;
    }

    Ok(())
}

fn validate_function_spec(
    root: &serde_json::Map<String, serde_json::Value>,
    function: &str,
) -> Result<()> {
    let spec = root
        .get(function)
        .and_then(|v| v.as_object())
        .ok_or_else(|| schema(function, "function spec object"))?;

    let params = spec
        .get("params")
        .and_then(|v| v.as_object())
        .ok_or_else(|| schema(&format!("{}.params", function), "object"))?;
    for (param, rule) in params {
        let field = format!("{}.params.{}", function, param);
        let expr = rule.as_str().ok_or_else(|| schema(&field, "predicate rule"))?;
        Rule::parse(expr).map_err(|_| schema(&field, "predicate rule"))?;
    }

    let returns_field = format!("{}.returns", function);
    let returns = spec
        .get("returns")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema(&returns_field, "predicate rule"))?;
    Rule::parse(returns).map_err(|_| schema(&returns_field, "predicate rule"))?;

    expect_string_array_at(spec, "allowable_calls", function)?;
    expect_string_array_at(spec, "allowed_callers", function)?;

    if let Some(runtime) = spec.get("max_runtime_seconds") {
        let field = format!("{}.max_runtime_seconds", function);
        let seconds = runtime
            .as_f64()
            .ok_or_else(|| schema(&field, "positive number"))?;
        // must also be representable as a Duration: rejects NaN,
        // infinities, and overflowing magnitudes
        if seconds <= 0.0 || Duration::try_from_secs_f64(seconds).is_err() {
            return Err(schema(&field, "positive number"));
        }
    }

    Ok(())
}

fn schema(field: &str, expected: &str) -> Violation {
    Violation::Schema {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

fn expect_bool(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<bool> {
    map.get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| schema(key, "bool"))
}

fn string_array(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    field: &str,
) -> Result<Vec<String>> {
    let items = map
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| schema(field, "sequence of names"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| schema(field, "sequence of names"))
        })
        .collect()
}

fn expect_string_array(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Vec<String>> {
    string_array(map, key, key)
}

fn expect_string_array_at(
    spec: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    function: &str,
) -> Result<Vec<String>> {
    string_array(spec, key, &format!("{}.{}", function, key))
}

// ── Compilation ───────────────────────────────────────────

/// Validate a document and compile it into an immutable [`Contract`].
///
/// Predicates in the document are [`Rule`] expressions. Parameters bind
/// positionally in lexicographic name order (JSON objects carry no
/// author order).
pub fn from_document(doc: &serde_json::Value) -> Result<Contract> {
    validate_document(doc)?;

    // Shape is known good past this point.
    let root = doc.as_object().ok_or_else(|| schema("contract", "object"))?;
    let mut builder = Contract::builder().raise_on_violation(
        expect_bool(root, "raise_on_contract_exception")?,
    );

    for module in expect_string_array(root, "allowable_imports")? {
        builder = builder.allow_import(&module);
    }
    for callee in expect_string_array(root, "global_allowed_calls")? {
        builder = builder.global_allowed_call(&callee);
    }

    for function in expect_string_array(root, "functions")? {
        let spec_doc = root
            .get(&function)
            .and_then(|v| v.as_object())
            .ok_or_else(|| schema(&function, "function spec object"))?;

        let mut spec = FunctionSpec::new();
        if let Some(params) = spec_doc.get("params").and_then(|v| v.as_object()) {
            for (param, rule) in params {
                let expr = rule
                    .as_str()
                    .ok_or_else(|| schema(&format!("{}.params.{}", function, param), "predicate rule"))?;
                spec = spec.param(param, Rule::parse(expr)?);
            }
        }
        if let Some(returns) = spec_doc.get("returns").and_then(|v| v.as_str()) {
            spec = spec.returns(Rule::parse(returns)?);
        }
        for callee in expect_string_array_at(spec_doc, "allowable_calls", &function)? {
            spec = spec.allow_call(&callee);
        }
        for caller in expect_string_array_at(spec_doc, "allowed_callers", &function)? {
            spec = spec.allow_caller(&caller);
        }
        if let Some(seconds) = spec_doc.get("max_runtime_seconds").and_then(|v| v.as_f64()) {
            spec = spec.max_runtime(seconds);
        }

        builder = builder.function(&function, spec);
    }

    builder.build()
}

// ── Fingerprint ───────────────────────────────────────────

/// SHA-256 fingerprint of the canonical serialization of a document.
///
/// `serde_json` maps iterate in sorted key order, so the serialization
/// is canonical and the fingerprint is stable across round-trips.
pub fn fingerprint(doc: &serde_json::Value) -> String {
    let canonical = doc.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
