//! Pre-execution validation for tool call arguments.
//!
//! Catches malformed arguments BEFORE the tool touches the filesystem or
//! spawns a process, giving the model a clear message to self-correct.

use crate::registry::{ParamType, spec_for};
use nanocode_core::ToolName;
use serde_json::{Map, Number, Value};

pub const MAX_BASH_TIMEOUT_SECS: i64 = 600;

/// Validate and normalize arguments for `tool`.
///
/// Aliases are rewritten to canonical parameter names, numeric and boolean
/// strings are coerced, and unknown keys are dropped. The error message is
/// written for the model, not for a human operator.
pub fn validate_tool_args(tool: ToolName, args: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    let spec = spec_for(tool);
    let mut normalized = Map::new();

    for (key, value) in args {
        let Some(param) = spec.param(key) else {
            continue;
        };
        if normalized.contains_key(param.name) {
            return Err(format!(
                "{}: given more than once (also as '{key}')",
                param.name
            ));
        }
        let value = coerce(param.name, param.kind, param.allow_empty, value)?;
        normalized.insert(param.name.to_string(), value);
    }

    for param in spec.params.iter().filter(|p| p.required) {
        if !normalized.contains_key(param.name) {
            let hint = if param.aliases.is_empty() {
                String::new()
            } else {
                format!(" (or '{}')", param.aliases.join("', '"))
            };
            return Err(format!("'{}'{hint} is required for {tool}", param.name));
        }
    }

    if tool == ToolName::Bash {
        validate_timeout(&normalized)?;
    }
    Ok(normalized)
}

fn coerce(field: &str, kind: ParamType, allow_empty: bool, value: &Value) -> Result<Value, String> {
    match (kind, value) {
        (ParamType::String, Value::String(s)) if s.is_empty() && !allow_empty => {
            Err(format!("{field}: must not be empty"))
        }
        (ParamType::String, Value::String(_)) => Ok(value.clone()),
        (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParamType::Integer, Value::Number(n)) => integer_from_number(field, n),
        (ParamType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| format!("{field}: expected integer, got {}", preview(value))),
        (ParamType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (ParamType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("{field}: expected boolean, got {}", preview(value))),
        },
        (kind, _) => Err(format!(
            "{field}: expected {}, got {}",
            kind.json_type(),
            preview(value)
        )),
    }
}

fn integer_from_number(field: &str, n: &Number) -> Result<Value, String> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Number(i.into()));
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::Number((f as i64).into())),
        _ => Err(format!("{field}: expected integer, got {n}")),
    }
}

fn validate_timeout(args: &Map<String, Value>) -> Result<(), String> {
    let Some(timeout) = args.get("timeout").and_then(Value::as_i64) else {
        return Ok(());
    };
    if timeout <= 0 {
        return Err("timeout must be a positive number of seconds".to_string());
    }
    if timeout > MAX_BASH_TIMEOUT_SECS {
        return Err(format!(
            "timeout cannot exceed {MAX_BASH_TIMEOUT_SECS} seconds, break the task into smaller steps"
        ));
    }
    Ok(())
}

fn preview(value: &Value) -> String {
    value.to_string().chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn read_requires_path() {
        let err = validate_tool_args(ToolName::Read, &args(json!({}))).unwrap_err();
        assert!(err.contains("'path'"), "{err}");
        assert!(err.contains("file_path"), "{err}");
    }

    #[test]
    fn aliases_are_normalized() {
        let out = validate_tool_args(
            ToolName::Edit,
            &args(json!({"file_path": "a.txt", "old": "x", "new": ""})),
        )
        .expect("valid");
        assert_eq!(out["path"], "a.txt");
        assert_eq!(out["old_string"], "x");
        assert_eq!(out["new_string"], "");
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let err = validate_tool_args(
            ToolName::Read,
            &args(json!({"path": "a", "file_path": "b"})),
        )
        .unwrap_err();
        assert!(err.contains("more than once"), "{err}");
    }

    #[test]
    fn empty_old_string_is_rejected() {
        let err = validate_tool_args(
            ToolName::Edit,
            &args(json!({"path": "a", "old_string": "", "new_string": "b"})),
        )
        .unwrap_err();
        assert!(err.contains("old_string"), "{err}");
    }

    #[test]
    fn write_allows_empty_content_but_not_missing() {
        assert!(validate_tool_args(ToolName::Write, &args(json!({"path": "a", "content": ""}))).is_ok());
        let err = validate_tool_args(ToolName::Write, &args(json!({"path": "a"}))).unwrap_err();
        assert!(err.contains("content"), "{err}");
    }

    #[test]
    fn integer_strings_are_coerced() {
        let out = validate_tool_args(
            ToolName::Read,
            &args(json!({"path": "a", "offset": "10", "limit": 5.0})),
        )
        .expect("valid");
        assert_eq!(out["offset"], 10);
        assert_eq!(out["limit"], 5);
    }

    #[test]
    fn wrong_types_are_reported() {
        let err = validate_tool_args(
            ToolName::Read,
            &args(json!({"path": "a", "limit": "lots"})),
        )
        .unwrap_err();
        assert!(err.contains("limit: expected integer"), "{err}");

        let err = validate_tool_args(ToolName::Glob, &args(json!({"pattern": ["*.rs"]}))).unwrap_err();
        assert!(err.contains("pattern: expected string"), "{err}");
    }

    #[test]
    fn bash_timeout_bounds() {
        assert!(validate_tool_args(ToolName::Bash, &args(json!({"cmd": "ls", "timeout": 600}))).is_ok());
        let err = validate_tool_args(ToolName::Bash, &args(json!({"command": "ls", "timeout": 0}))).unwrap_err();
        assert!(err.contains("positive"), "{err}");
        let err = validate_tool_args(ToolName::Bash, &args(json!({"command": "ls", "timeout": 601}))).unwrap_err();
        assert!(err.contains("600"), "{err}");
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let out = validate_tool_args(
            ToolName::Grep,
            &args(json!({"pattern": "fn", "recursive": true})),
        )
        .expect("valid");
        assert!(out.get("recursive").is_none());
    }
}
