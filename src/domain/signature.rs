//! Signature construction and argument validation (C2, spec.md §4.2).
//!
//! Every string-valued argument is rejected if it contains a glob
//! metacharacter or a C0 control byte, *before* any tool-aware validation
//! runs — this is what lets policy patterns safely glob-match against
//! `tool(v1, v2)` without a crafted argument value smuggling in a pattern
//! special character (spec.md §8 "Signature injection resistance").

use serde_json::{Map, Value};
use thiserror::Error;

use super::tool::ToolLookup;

const FORBIDDEN_CHARS: &[char] = &['*', '?', '[', ']', '(', ')', ','];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("argument '{0}' contains forbidden characters")]
    ForbiddenChars(String),
    #[error("missing required argument: {0}")]
    MissingRequired(String),
    #[error("invalid value for {0}: {1:?}")]
    InvalidValue(String, String),
}

fn has_forbidden_chars(value: &str) -> bool {
    value
        .chars()
        .any(|c| FORBIDDEN_CHARS.contains(&c) || (c as u32) <= 0x1f)
}

/// Stringify a JSON scalar the way a signature part or a fallback-signature
/// argument is rendered. Objects/arrays use their compact JSON form.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reject forbidden characters in every string-valued arg, then — if a
/// registry knows the tool — check required args and per-arg validators.
pub fn validate_args(
    args: &Map<String, Value>,
    tool_name: &str,
    registry: Option<&dyn ToolLookup>,
) -> Result<(), ValidationError> {
    for (key, value) in args {
        if let Value::String(s) = value {
            if has_forbidden_chars(s) {
                return Err(ValidationError::ForbiddenChars(key.clone()));
            }
        }
    }

    if let Some(registry) = registry {
        if registry.get_tool(tool_name).is_some() {
            for required in registry.required_args(tool_name) {
                if !args.contains_key(&required) {
                    return Err(ValidationError::MissingRequired(required));
                }
            }
            let validators = registry.arg_validators(tool_name);
            for (key, value) in args {
                if let Value::String(s) = value {
                    if let Some(pattern) = validators.get(key.as_str()) {
                        if !pattern.is_match(s) {
                            return Err(ValidationError::InvalidValue(key.clone(), s.clone()));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Build the canonical signature string for `(tool_name, args)`, running the
/// full validation pass first (spec.md §4.2: "always begins with the
/// validator pass").
pub fn build_signature(
    tool_name: &str,
    args: &Map<String, Value>,
    registry: Option<&dyn ToolLookup>,
) -> Result<String, ValidationError> {
    validate_args(args, tool_name, registry)?;

    if let Some(registry) = registry {
        if let Some(parts) = registry.signature_parts(tool_name, args) {
            return Ok(render(tool_name, &parts));
        }
    }

    // Fallback: tool unknown to the registry (or no registry at all) —
    // sorted keys keep the signature deterministic.
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys.into_iter().map(|k| stringify(&args[k])).collect();
    Ok(render(tool_name, &parts))
}

fn render(tool_name: &str, parts: &[String]) -> String {
    if parts.is_empty() {
        tool_name.to_string()
    } else {
        format!("{}({})", tool_name, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn rejects_glob_metacharacters() {
        let args = map(&[("entity_id", json!("sensor.*"))]);
        let err = validate_args(&args, "ha_get_state", None).unwrap_err();
        assert_eq!(err, ValidationError::ForbiddenChars("entity_id".into()));
    }

    #[test]
    fn rejects_control_bytes() {
        let args = map(&[("entity_id", json!("sensor.temp\u{0007}"))]);
        assert!(validate_args(&args, "ha_get_state", None).is_err());
    }

    #[test]
    fn non_string_values_skip_forbidden_char_check() {
        let args = map(&[("count", json!(42))]);
        assert!(validate_args(&args, "anything", None).is_ok());
    }

    #[test]
    fn fallback_signature_sorts_keys() {
        let args = map(&[("b", json!("2")), ("a", json!("1"))]);
        let sig = build_signature("tool", &args, None).unwrap();
        assert_eq!(sig, "tool(1, 2)");
    }

    #[test]
    fn fallback_signature_empty_args_is_bare_name() {
        let args = Map::new();
        let sig = build_signature("ha_ping", &args, None).unwrap();
        assert_eq!(sig, "ha_ping");
    }

    #[test]
    fn signature_determinism() {
        let args = map(&[("a", json!("x")), ("b", json!("y"))]);
        let s1 = build_signature("t", &args, None).unwrap();
        let s2 = build_signature("t", &args, None).unwrap();
        assert_eq!(s1, s2);
    }
}
