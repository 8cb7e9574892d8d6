//! Best-effort script sandbox for backend-issued `run_js` commands.
//!
//! Validation is a textual deny-list scan, exactly as strong (and as
//! weak) as the policy says. Actual evaluation happens behind the
//! [`ScriptEngine`] seam the host provides; the link layer never
//! interprets script text itself.

use serde_json::Value;
use thiserror::Error;
use vxui_wire::{ClientCommand, SandboxPolicy};

#[derive(Debug, Error, PartialEq)]
pub enum SandboxError {
    #[error("Forbidden pattern found: {0}")]
    Forbidden(String),
    #[error("script execution failed: {0}")]
    Execution(String),
    #[error("Result exceeds maximum size ({len} > {max})")]
    ResultTooLarge { len: usize, max: usize },
}

/// Host-provided evaluation capability. Implementations decide which
/// bindings the script sees; the policy's `allowed_apis` and `allow_eval`
/// fields are their contract, including the advisory `timeout_ms`.
pub trait ScriptEngine: Send + Sync {
    fn eval(&self, script: &str, policy: &SandboxPolicy) -> Result<Value, SandboxError>;
}

/// Default engine: refuses everything. Sessions built without a real
/// engine still answer `run_js`, always with an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEngine;

impl ScriptEngine for NoEngine {
    fn eval(&self, _script: &str, _policy: &SandboxPolicy) -> Result<Value, SandboxError> {
        Err(SandboxError::Execution("no script engine installed".into()))
    }
}

/// Scan the script against the policy's deny list. A disabled policy is
/// an explicit allow-everything state, not a bug.
pub fn validate(policy: &SandboxPolicy, script: &str) -> Result<(), SandboxError> {
    if !policy.enabled {
        return Ok(());
    }
    let lowered = script.to_lowercase();
    for pattern in &policy.forbidden_patterns {
        if lowered.contains(&pattern.to_lowercase()) {
            return Err(SandboxError::Forbidden(pattern.clone()));
        }
    }
    Ok(())
}

/// Coerce an engine value to the string the wire carries.
pub fn normalize(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string(&value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

/// Outcome of one `run_js` request: exactly one of `result`/`error` is
/// meaningful.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptOutcome {
    pub result: String,
    pub error: Option<String>,
}

impl ScriptOutcome {
    pub fn into_command(self, js_id: u64) -> ClientCommand {
        ClientCommand::JsResult {
            js_id,
            result: self.result,
            error: self.error,
        }
    }
}

/// Validate, evaluate, and normalize one script. Never panics; every
/// fault funnels into the outcome's error text.
pub fn execute(engine: &dyn ScriptEngine, policy: &SandboxPolicy, script: &str) -> ScriptOutcome {
    if let Err(err) = validate(policy, script) {
        return ScriptOutcome {
            result: String::new(),
            error: Some(err.to_string()),
        };
    }
    let value = match engine.eval(script, policy) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(target = "link", "script execution error: {err}");
            return ScriptOutcome {
                result: String::new(),
                error: Some(err.to_string()),
            };
        }
    };
    let result = normalize(value);
    if policy.enabled && result.len() > policy.max_result_size {
        let err = SandboxError::ResultTooLarge {
            len: result.len(),
            max: policy.max_result_size,
        };
        // The oversized payload itself is never transmitted.
        return ScriptOutcome {
            result: String::new(),
            error: Some(err.to_string()),
        };
    }
    ScriptOutcome {
        result,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Evaluates `<int>+<int>` and nothing else.
    struct CalcEngine;

    impl ScriptEngine for CalcEngine {
        fn eval(&self, script: &str, _policy: &SandboxPolicy) -> Result<Value, SandboxError> {
            let (a, b) = script
                .split_once('+')
                .ok_or_else(|| SandboxError::Execution("unsupported script".into()))?;
            let a: i64 = a.trim().parse().map_err(|_| SandboxError::Execution("bad lhs".into()))?;
            let b: i64 = b.trim().parse().map_err(|_| SandboxError::Execution("bad rhs".into()))?;
            Ok(json!(a + b))
        }
    }

    struct FixedEngine(Value);

    impl ScriptEngine for FixedEngine {
        fn eval(&self, _script: &str, _policy: &SandboxPolicy) -> Result<Value, SandboxError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn forbidden_pattern_rejects_before_execution() {
        let policy = SandboxPolicy {
            forbidden_patterns: vec!["eval(".into()],
            ..SandboxPolicy::default()
        };
        let outcome = execute(&CalcEngine, &policy, "eval(1)");
        assert_eq!(outcome.result, "");
        assert!(outcome.error.as_deref().unwrap().contains("eval("));
    }

    #[test]
    fn pattern_scan_is_case_insensitive() {
        let policy = SandboxPolicy {
            forbidden_patterns: vec!["Function(".into()],
            ..SandboxPolicy::default()
        };
        assert!(validate(&policy, "new fUnCtIoN('x')").is_err());
    }

    #[test]
    fn disabled_policy_is_passthrough_valid() {
        let policy = SandboxPolicy {
            enabled: false,
            forbidden_patterns: vec!["eval(".into()],
            ..SandboxPolicy::default()
        };
        assert!(validate(&policy, "eval(1)").is_ok());
    }

    #[test]
    fn simple_arithmetic_yields_string_result() {
        let outcome = execute(&CalcEngine, &SandboxPolicy::default(), "1+1");
        assert_eq!(outcome.result, "2");
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn normalization_covers_null_objects_and_scalars() {
        assert_eq!(normalize(Value::Null), "");
        assert_eq!(normalize(json!("text")), "text");
        assert_eq!(normalize(json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(normalize(json!(true)), "true");
    }

    #[test]
    fn oversized_result_is_replaced_by_an_error() {
        let policy = SandboxPolicy {
            max_result_size: 10,
            ..SandboxPolicy::default()
        };
        let engine = FixedEngine(json!("12345678901"));
        let outcome = execute(&engine, &policy, "whatever");
        assert_eq!(outcome.result, "");
        assert!(outcome.error.as_deref().unwrap().contains("maximum size"));
    }

    #[test]
    fn engine_errors_are_captured_not_raised() {
        let outcome = execute(&NoEngine, &SandboxPolicy::default(), "1+1");
        assert!(outcome.error.as_deref().unwrap().contains("no script engine"));
    }
}
