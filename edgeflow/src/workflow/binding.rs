//! `${...}` placeholder resolution for task parameters.
//!
//! Two reference forms exist:
//!
//! - `${params.name}` reads a workflow invocation parameter and is bound when
//!   the plan is built.
//! - `${task.dotted.path}` reads a dependency's recorded output and is bound
//!   just before the task starts.
//!
//! A placeholder spanning the whole string keeps the JSON type of the value
//! it references. Embedded placeholders are interpolated as text.
//!
//! `$${` writes a literal `${`. Parameter values are escaped this way when
//! they are bound, so text supplied by the caller is never read as a
//! placeholder by the second pass.

use crate::errors::ValidationError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const PARAMS_ROOT: &str = "params";

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `${params.a.b}`
    Param(Vec<String>),
    /// `${task.a.b}`; an empty path means the whole output.
    Task {
        /// Referenced task id.
        task: String,
        /// Path into its output.
        path: Vec<String>,
    },
}

impl Reference {
    /// Parses the text between `${` and `}`.
    ///
    /// # Errors
    ///
    /// Returns an error for empty expressions or empty path segments.
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let expr = expr.trim();
        let segments: Vec<&str> = expr.split('.').collect();
        if expr.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(ValidationError::new(format!(
                "Malformed placeholder '${{{expr}}}'"
            )));
        }

        let mut parts = segments.into_iter().map(str::to_string);
        let root = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.collect();

        if root == PARAMS_ROOT {
            if path.is_empty() {
                return Err(ValidationError::new(
                    "Placeholder '${params}' must name a parameter",
                ));
            }
            Ok(Self::Param(path))
        } else {
            Ok(Self::Task { task: root, path })
        }
    }
}

/// Outputs of finished tasks, keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct TaskOutputs {
    outputs: HashMap<String, Arc<Value>>,
}

impl TaskOutputs {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful task's output.
    pub fn insert(&mut self, task_id: impl Into<String>, output: Value) {
        self.outputs.insert(task_id.into(), Arc::new(output));
    }

    /// Returns a task's output.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&Value> {
        self.outputs.get(task_id).map(AsRef::as_ref)
    }

    /// Number of recorded outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Follows a dotted path. Numeric segments index arrays.
#[must_use]
pub fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Binds `${params.*}` placeholders, leaving task references in place.
///
/// # Errors
///
/// Returns an error if a parameter is missing or a placeholder is malformed.
pub fn bind_params(value: &Value, params: &Value) -> Result<Value, ValidationError> {
    substitute(value, Escapes::Keep, &mut |reference| match reference {
        Reference::Param(path) => lookup(params, path).map(|v| Some(escape(v))).ok_or_else(|| {
            ValidationError::new(format!(
                "Missing workflow parameter '{}'",
                path.join(".")
            ))
        }),
        Reference::Task { .. } => Ok(None),
    })
}

/// Binds `${task.*}` placeholders from recorded outputs.
///
/// # Errors
///
/// Returns an error if the referenced task has no output (it failed or was
/// skipped) or the path does not exist in it.
pub fn bind_outputs(value: &Value, outputs: &TaskOutputs) -> Result<Value, ValidationError> {
    substitute(value, Escapes::Resolve, &mut |reference| match reference {
        Reference::Task { task, path } => {
            let output = outputs.get(task).ok_or_else(|| {
                ValidationError::new(format!(
                    "Task '{task}' has no output to bind (it failed or was skipped)"
                ))
            })?;
            lookup(output, path).cloned().map(Some).ok_or_else(|| {
                ValidationError::new(format!(
                    "Output of task '{task}' has no value at '{}'",
                    path.join(".")
                ))
            })
        }
        Reference::Param(path) => Err(ValidationError::new(format!(
            "Unbound workflow parameter '{}'",
            path.join(".")
        ))),
    })
}

/// Binds placeholders in a single string.
///
/// # Errors
///
/// See [`bind_outputs`].
pub fn bind_str(text: &str, outputs: &TaskOutputs) -> Result<String, ValidationError> {
    match bind_outputs(&Value::String(text.to_string()), outputs)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

/// Task ids referenced anywhere inside `value`, first-seen order.
///
/// # Errors
///
/// Returns an error if a placeholder is malformed.
pub fn task_references(value: &Value) -> Result<Vec<String>, ValidationError> {
    let mut found: Vec<String> = Vec::new();
    substitute(value, Escapes::Keep, &mut |reference| {
        if let Reference::Task { task, .. } = reference {
            if !found.contains(task) {
                found.push(task.clone());
            }
        }
        Ok(None)
    })?;
    Ok(found)
}

/// Escapes every `${` inside string values.
fn escape(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.replace("${", "$${")),
        Value::Array(items) => Value::Array(items.iter().map(escape).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), escape(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// What a pass does with `$${`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Escapes {
    /// Leave it for a later pass.
    Keep,
    /// Turn it into a literal `${`.
    Resolve,
}

enum Piece<'a> {
    Text(&'a str),
    Escaped,
    Expr(&'a str),
}

fn split_placeholders(text: &str) -> Result<Vec<Piece<'_>>, ValidationError> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        if rest[..start].ends_with('$') {
            if start > 1 {
                pieces.push(Piece::Text(&rest[..start - 1]));
            }
            pieces.push(Piece::Escaped);
            rest = &rest[start + 2..];
            continue;
        }
        if start > 0 {
            pieces.push(Piece::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ValidationError::new(format!(
                "Unterminated placeholder in '{text}'"
            )));
        };
        pieces.push(Piece::Expr(&after[..end]));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

/// Walks `value`, replacing every placeholder the resolver returns a value
/// for. `Ok(None)` keeps the placeholder text.
fn substitute<F>(value: &Value, escapes: Escapes, resolve: &mut F) -> Result<Value, ValidationError>
where
    F: FnMut(&Reference) -> Result<Option<Value>, ValidationError>,
{
    match value {
        Value::String(text) => substitute_str(text, escapes, resolve),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, escapes, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, escapes, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<F>(text: &str, escapes: Escapes, resolve: &mut F) -> Result<Value, ValidationError>
where
    F: FnMut(&Reference) -> Result<Option<Value>, ValidationError>,
{
    let pieces = split_placeholders(text)?;

    if let [Piece::Expr(expr)] = pieces.as_slice() {
        let reference = Reference::parse(expr)?;
        return Ok(resolve(&reference)?.unwrap_or_else(|| Value::String(text.to_string())));
    }

    let mut out = String::with_capacity(text.len());
    for piece in pieces {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Escaped if escapes == Escapes::Keep => out.push_str("$${"),
            Piece::Escaped => out.push_str("${"),
            Piece::Expr(expr) => match resolve(&Reference::parse(expr)?)? {
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    out.push_str("${");
                    out.push_str(expr);
                    out.push('}');
                }
            },
        }
    }
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            Reference::parse("params.zone").unwrap(),
            Reference::Param(vec!["zone".to_string()])
        );
        assert_eq!(
            Reference::parse(" a.items.0.id ").unwrap(),
            Reference::Task {
                task: "a".to_string(),
                path: vec!["items".to_string(), "0".to_string(), "id".to_string()],
            }
        );
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("a..b").is_err());
        assert!(Reference::parse("params").is_err());
    }

    #[test]
    fn test_bind_params_keeps_types_and_task_refs() {
        let template = json!({
            "zone": "${params.zone}",
            "ttl": "${params.ttl}",
            "label": "zone ${params.zone} (ttl ${params.ttl})",
            "contract": "${a.contractId}",
        });
        let bound = bind_params(&template, &json!({"zone": "example.com", "ttl": 300})).unwrap();

        assert_eq!(
            bound,
            json!({
                "zone": "example.com",
                "ttl": 300,
                "label": "zone example.com (ttl 300)",
                "contract": "${a.contractId}",
            })
        );
    }

    #[test]
    fn test_bind_params_missing() {
        let err = bind_params(&json!({"zone": "${params.zone}"}), &json!({})).unwrap_err();
        assert!(err.message.contains("Missing workflow parameter 'zone'"));
    }

    #[test]
    fn test_bind_outputs_with_array_index() {
        let mut outputs = TaskOutputs::new();
        outputs.insert("a", json!({"items": [{"id": "ctr_1"}, {"id": "ctr_2"}], "count": 2}));

        let bound = bind_outputs(
            &json!({"contract": "${a.items.1.id}", "count": "${a.count}", "all": "${a}"}),
            &outputs,
        )
        .unwrap();

        assert_eq!(bound["contract"], "ctr_2");
        assert_eq!(bound["count"], 2);
        assert_eq!(bound["all"]["count"], 2);
    }

    #[test]
    fn test_bind_outputs_missing_task_or_path() {
        let outputs = TaskOutputs::new();
        let err = bind_outputs(&json!("${a.id}"), &outputs).unwrap_err();
        assert!(err.message.contains("failed or was skipped"));

        let mut outputs = TaskOutputs::new();
        outputs.insert("a", json!({"id": 1}));
        let err = bind_outputs(&json!("${a.name}"), &outputs).unwrap_err();
        assert!(err.message.contains("no value at 'name'"));
    }

    #[test]
    fn test_bind_str() {
        let mut outputs = TaskOutputs::new();
        outputs.insert("zone", json!({"name": "example.com"}));
        assert_eq!(bind_str("${zone.name}", &outputs).unwrap(), "example.com");
        assert_eq!(bind_str("static", &outputs).unwrap(), "static");
    }

    #[test]
    fn test_task_references() {
        let refs = task_references(&json!({
            "x": "${b.id}",
            "y": ["${a.id}", "${b.name}", "${params.p}"],
        }))
        .unwrap();
        assert_eq!(refs, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_parameter_values_are_opaque() {
        let template = json!({
            "rdata": "${params.txt}",
            "note": "owner ${params.owner}",
            "records": "${params.records}",
        });
        let params = json!({
            "txt": "v=spf1 ${x}",
            "owner": "${a.secret}",
            "records": [{"value": "${b.id}"}],
        });

        let bound = bind_params(&template, &params).unwrap();
        assert_eq!(task_references(&bound).unwrap(), Vec::<String>::new());

        let mut outputs = TaskOutputs::new();
        outputs.insert("a", json!({"secret": "hunter2"}));
        let dispatched = bind_outputs(&bound, &outputs).unwrap();
        assert_eq!(
            dispatched,
            json!({
                "rdata": "v=spf1 ${x}",
                "note": "owner ${a.secret}",
                "records": [{"value": "${b.id}"}],
            })
        );
    }

    #[test]
    fn test_escaped_placeholder_is_literal() {
        let outputs = TaskOutputs::new();
        assert_eq!(bind_str("cost $${a.id} and $5", &outputs).unwrap(), "cost ${a.id} and $5");
        assert_eq!(bind_str("$${", &outputs).unwrap(), "${");

        let kept = bind_params(&json!("a$${b}"), &json!({})).unwrap();
        assert_eq!(kept, json!("a$${b}"));
        assert_eq!(bind_str("a$$${b", &outputs).unwrap(), "a$${b");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = task_references(&json!("${a.id")).unwrap_err();
        assert!(err.message.contains("Unterminated"));
    }
}
