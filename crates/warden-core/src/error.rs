//! Violation taxonomy for the enforcement engine
//!
//! All fallible operations return `Result<T, Violation>`.
//! Each variant is one distinguishable violation kind and carries the
//! offending field or name.

use thiserror::Error;

/// A contract violation or enforcement failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Violation {
    /// Contract document shape violation. Always surfaced at validation
    /// time, independent of the contract's error policy.
    #[error("field `{field}` missing or not of expected type `{expected}`")]
    Schema { field: String, expected: String },

    /// An argument failed its parameter predicate, or could not be bound.
    #[error("parameter `{param}` out of contract specification")]
    Parameter { param: String },

    /// The produced value failed the `returns` predicate.
    #[error("return value of `{function}` does not match contract")]
    Return { function: String },

    /// The immediate caller is not in `allowed_callers`.
    #[error("caller `{caller}` not allowed to call `{function}`")]
    Caller { caller: String, function: String },

    /// The body dispatched a call outside its effective allowlist.
    #[error("function `{function}` trying to call `{callee}` which is not allowed by the contract")]
    CallNotAllowed { function: String, callee: String },

    /// A module outside `allowable_imports` was registered or loaded.
    #[error("module `{module}` imported but not allowed by the contract")]
    Import { module: String },

    /// The body exceeded `max_runtime_seconds` and was forcibly terminated.
    #[error("function `{function}` terminated due to time constraint violation ({limit_seconds}s)")]
    Timeout { function: String, limit_seconds: f64 },

    /// The body failed for reasons unrelated to the contract (its own
    /// error or a panic). Bypasses return-value validation.
    #[error("guarded function failed: {message}")]
    Body { message: String },
}

impl Violation {
    /// Short stable tag for the violation kind. Used in envelope messages
    /// and log fields so kinds stay distinguishable in non-raising mode.
    pub fn kind(&self) -> &'static str {
        match self {
            Violation::Schema { .. } => "schema",
            Violation::Parameter { .. } => "parameter",
            Violation::Return { .. } => "return",
            Violation::Caller { .. } => "caller",
            Violation::CallNotAllowed { .. } => "call-not-allowed",
            Violation::Import { .. } => "import",
            Violation::Timeout { .. } => "timeout",
            Violation::Body { .. } => "body",
        }
    }
}

/// Result type alias for enforcement operations
pub type Result<T> = std::result::Result<T, Violation>;
