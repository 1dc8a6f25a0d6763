//! Output references and template substitution.
//!
//! `$taskId` or `$taskId.dot.path` as a *whole string* resolves to the
//! referenced task's output (by dot path); `${...}` embedded in a larger
//! string substitutes the stringified value. References are validated at
//! plan-compile time; resolution is a pure function over the outputs map.

use std::collections::HashMap;

use serde_json::Value;

use tmg_wire::{GatewayError, GatewayResult};

/// A parsed output reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub task_id: String,
    pub path: Vec<String>,
}

impl OutputRef {
    /// Parse a whole-string reference: `$taskId` or `$taskId.a.b.0`.
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('$')?;
        if body.is_empty() || body.starts_with('{') {
            return None;
        }
        let mut segments = body.split('.');
        let task_id = segments.next()?.to_string();
        if task_id.is_empty() || !is_identifier(&task_id) {
            return None;
        }
        let mut path = Vec::new();
        for segment in segments {
            if segment.is_empty() || !is_identifier(segment) {
                return None;
            }
            path.push(segment.to_string());
        }
        Some(Self { task_id, path })
    }

    /// Resolve against an outputs map. Missing tasks or paths are
    /// validation errors.
    pub fn resolve(&self, outputs: &HashMap<String, Value>) -> GatewayResult<Value> {
        let root = outputs.get(&self.task_id).ok_or_else(|| {
            GatewayError::validation(format!("reference to unresolved task '{}'", self.task_id))
        })?;
        let mut current = root;
        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            }
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "path '.{}' not found in output of '{}'",
                    segment, self.task_id
                ))
            })?;
        }
        Ok(current.clone())
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Collect every reference appearing in an argument tree (whole-string refs
/// and `${...}` templates).
pub fn collect_refs(value: &Value, out: &mut Vec<OutputRef>) {
    match value {
        Value::String(s) => {
            if let Some(reference) = OutputRef::parse(s) {
                out.push(reference);
            } else {
                collect_template_refs(s, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, out);
            }
        }
        _ => {}
    }
}

fn collect_template_refs(s: &str, out: &mut Vec<OutputRef>) {
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            return;
        };
        let inner = &rest[start + 2..start + end];
        if let Some(reference) = OutputRef::parse(&format!("${}", inner)) {
            out.push(reference);
        }
        rest = &rest[start + end + 1..];
    }
}

/// Substitute every reference in an argument tree with resolved outputs.
pub fn resolve_arguments(
    value: &Value,
    outputs: &HashMap<String, Value>,
) -> GatewayResult<Value> {
    Ok(match value {
        Value::String(s) => {
            if let Some(reference) = OutputRef::parse(s) {
                reference.resolve(outputs)?
            } else if s.contains("${") {
                Value::String(expand_template(s, outputs)?)
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_arguments(item, outputs))
                .collect::<GatewayResult<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_arguments(item, outputs)?);
            }
            Value::Object(resolved)
        }
        _ => value.clone(),
    })
}

fn expand_template(s: &str, outputs: &HashMap<String, Value>) -> GatewayResult<String> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            // Unterminated template; keep the raw text.
            result.push_str(&rest[start..]);
            return Ok(result);
        };
        let inner = &rest[start + 2..start + end];
        match OutputRef::parse(&format!("${}", inner)) {
            Some(reference) => {
                let value = reference.resolve(outputs)?;
                match value {
                    Value::String(text) => result.push_str(&text),
                    other => result.push_str(&other.to_string()),
                }
            }
            None => {
                return Err(GatewayError::validation(format!(
                    "malformed template reference '${{{}}}'",
                    inner
                )));
            }
        }
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Evaluate a guard expression: a reference, optionally compared to a JSON
/// literal with `==` or `!=`. A bare reference is truthy unless it
/// resolves to `null`, `false`, `0` or `""`.
pub fn evaluate_guard(guard: &str, outputs: &HashMap<String, Value>) -> GatewayResult<bool> {
    let (expression, negate) = match guard.split_once("!=") {
        Some((left, right)) => ((left.trim(), Some(right.trim())), true),
        None => match guard.split_once("==") {
            Some((left, right)) => ((left.trim(), Some(right.trim())), false),
            None => ((guard.trim(), None), false),
        },
    };
    let (left, right) = expression;
    let reference = OutputRef::parse(left)
        .ok_or_else(|| GatewayError::validation(format!("malformed guard '{}'", guard)))?;
    let value = reference.resolve(outputs)?;

    match right {
        None => Ok(truthy(&value)),
        Some(literal) => {
            let expected: Value = serde_json::from_str(literal)
                .unwrap_or_else(|_| Value::String(literal.trim_matches('\'').to_string()));
            Ok((value == expected) != negate)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("t1", json!("A"));
        map.insert("t2", json!({"user": {"name": "ada"}, "items": [10, 20]}));
        map.insert("ok", json!(true));
        map.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn whole_string_reference_resolves_to_raw_value() {
        let resolved = resolve_arguments(&json!("$t2.items.1"), &outputs()).unwrap();
        assert_eq!(resolved, json!(20));
    }

    #[test]
    fn nested_trees_are_walked() {
        let args = json!({"a": ["$t1", {"b": "$t2.user.name"}]});
        let resolved = resolve_arguments(&args, &outputs()).unwrap();
        assert_eq!(resolved, json!({"a": ["A", {"b": "ada"}]}));
    }

    #[test]
    fn template_substitution_stringifies() {
        let args = json!("sum: ${t1} + ${t2.items.0}");
        let resolved = resolve_arguments(&args, &outputs()).unwrap();
        assert_eq!(resolved, json!("sum: A + 10"));
    }

    #[test]
    fn missing_path_is_a_validation_error() {
        let err = resolve_arguments(&json!("$t2.missing"), &outputs()).unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::Validation);
    }

    #[test]
    fn missing_task_is_a_validation_error() {
        let err = resolve_arguments(&json!("$ghost"), &outputs()).unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::Validation);
    }

    #[test]
    fn non_reference_strings_pass_through() {
        let value = json!("$ {not a ref} and plain");
        assert_eq!(resolve_arguments(&value, &outputs()).unwrap(), value);
        let dollars = json!("cost: $5.99");
        // "$5.99" has an identifier-ish head ("5") so it parses as a ref to
        // task "5" only if the whole string matches; "cost: $5.99" does not.
        assert_eq!(resolve_arguments(&dollars, &outputs()).unwrap(), dollars);
    }

    #[test]
    fn collect_refs_finds_whole_and_template_refs() {
        let args = json!({"x": "$t1", "y": "prefix ${t2.user.name} suffix"});
        let mut refs = Vec::new();
        collect_refs(&args, &mut refs);
        let ids: Vec<&str> = refs.iter().map(|r| r.task_id.as_str()).collect();
        assert!(ids.contains(&"t1"));
        assert!(ids.contains(&"t2"));
    }

    #[test]
    fn guard_truthiness() {
        assert!(evaluate_guard("$ok", &outputs()).unwrap());
        assert!(evaluate_guard("$t1", &outputs()).unwrap());
        let mut out = outputs();
        out.insert("empty".to_string(), json!(""));
        assert!(!evaluate_guard("$empty", &out).unwrap());
    }

    #[test]
    fn guard_comparisons() {
        assert!(evaluate_guard("$t2.user.name == \"ada\"", &outputs()).unwrap());
        assert!(evaluate_guard("$t2.user.name != \"bob\"", &outputs()).unwrap());
        assert!(!evaluate_guard("$ok == false", &outputs()).unwrap());
    }

    #[test]
    fn malformed_guard_is_rejected() {
        assert!(evaluate_guard("not a ref", &outputs()).is_err());
    }
}
