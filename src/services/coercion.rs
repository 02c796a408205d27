//! Turns free-text completions into validated structured values.
//!
//! Completions routinely wrap JSON in prose or code fences, use typographic
//! quotes, or break strings across lines. Coercion normalises that noise, parses
//! the first balanced object and validates it against an [`ExpectedShape`].
//! Failure is an ordinary return value.

use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound on object start positions tried by [`coerce_any_object`].
pub(crate) const MAX_RETRY_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum CoercionFailure {
    #[error("completion is empty")]
    Empty,
    #[error("completion contains no balanced JSON object")]
    NoObject,
    #[error("completion JSON is malformed: {0}")]
    Malformed(String),
    #[error("completion does not match {shape}: {reason}")]
    Shape { shape: &'static str, reason: String },
}

/// Structural contract a parsed object has to satisfy.
pub(crate) trait ExpectedShape {
    type Output;

    fn name(&self) -> &'static str;

    /// Checks required fields, primitive types and ranges.
    fn validate(&self, object: &Map<String, Value>) -> Result<Self::Output, String>;
}

pub(crate) fn coerce<S: ExpectedShape>(raw: &str, shape: &S) -> Result<S::Output, CoercionFailure> {
    let cleaned = normalize(raw);
    if cleaned.is_empty() {
        return Err(CoercionFailure::Empty);
    }

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&cleaned) {
        return check(&object, shape);
    }

    let candidate = first_balanced_object(&cleaned).ok_or(CoercionFailure::NoObject)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => check(&object, shape),
        Ok(_) => Err(CoercionFailure::NoObject),
        Err(err) => Err(CoercionFailure::Malformed(err.to_string())),
    }
}

/// Retry path: tries each `{` of the raw text (bounded) and keeps the first
/// object that satisfies the shape.
pub(crate) fn coerce_any_object<S: ExpectedShape>(
    raw: &str,
    shape: &S,
) -> Result<S::Output, CoercionFailure> {
    let mut last_failure = CoercionFailure::NoObject;

    for (start, _) in raw.match_indices('{').take(MAX_RETRY_CANDIDATES) {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(object))) => match check(&object, shape) {
                Ok(output) => return Ok(output),
                Err(failure) => last_failure = failure,
            },
            Some(Err(err)) => last_failure = CoercionFailure::Malformed(err.to_string()),
            _ => {}
        }
    }

    Err(last_failure)
}

fn check<S: ExpectedShape>(
    object: &Map<String, Value>,
    shape: &S,
) -> Result<S::Output, CoercionFailure> {
    shape.validate(object).map_err(|reason| CoercionFailure::Shape { shape: shape.name(), reason })
}

/// Replaces control characters with spaces, straightens typographic double
/// quotes and collapses whitespace runs.
pub(crate) fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for ch in raw.chars() {
        let ch = match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            ch if ch.is_control() => ' ',
            ch => ch,
        };
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }

    out
}

/// Returns the first brace-balanced `{...}` slice, honouring string literals.
/// Scans once from the first `{`.
pub(crate) fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// First present field among `names` (primary name first, then aliases).
pub(crate) fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name))
}

/// A field that must be a JSON number. Numeric strings are rejected.
pub(crate) fn number_field(object: &Map<String, Value>, names: &[&str]) -> Result<f64, String> {
    match field(object, names) {
        Some(Value::Number(number)) => {
            number.as_f64().filter(|value| value.is_finite()).ok_or_else(|| {
                format!("`{}` is not a finite number", names[0])
            })
        }
        Some(other) => Err(format!("`{}` must be a number, got {}", names[0], type_name(other))),
        None => Err(format!("missing `{}`", names[0])),
    }
}

pub(crate) fn optional_string(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    field(object, names).and_then(Value::as_str).map(|value| value.trim().to_string())
}

pub(crate) fn string_list(object: &Map<String, Value>, names: &[&str]) -> Vec<String> {
    match field(object, names) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        _ => Vec::new(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
