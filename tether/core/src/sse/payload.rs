//! JSON payload decoding for streamed chat completions.
//!
//! Primary shape: `{ "choices": [ { "delta": { "content", "tool_calls" }, "finish_reason" } ] }`.
//! Fallback shape: `{ "content": "..." }`. A top-level `error` field is a
//! terminal failure for the stream.

use serde::Deserialize;
use serde_json::Value;

use crate::error::TetherError;

/// Decoded content of one event's `data`
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Incremental content (any part may be absent)
    Delta {
        /// Text to append
        content: Option<String>,
        /// Raw tool-call fragments, passed through untouched
        tool_calls: Vec<Value>,
        /// Why generation stopped, on the last chunk
        finish_reason: Option<String>,
    },
    /// The server reported an error inside the stream
    Error(String),
}

impl Payload {
    /// Text content carried by this payload, if any
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Delta {
                content: Some(text),
                ..
            } => Some(text),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
}

/// Decode one event's `data` field
///
/// # Errors
///
/// Returns [`TetherError::Parse`] when the data is not JSON or has an
/// unexpected structure. The caller drops that event and continues.
pub fn decode_payload(data: &str) -> Result<Payload, TetherError> {
    let value: Value = serde_json::from_str(data)?;
    let Value::Object(map) = &value else {
        return Err(TetherError::Parse(format!(
            "expected JSON object, got {}",
            type_name(&value)
        )));
    };

    if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
        return Ok(Payload::Error(error_message(error)));
    }

    if map.contains_key("choices") {
        let chunk: ChatChunk = serde_json::from_value(value)?;
        let mut content: Option<String> = None;
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content {
                    content.get_or_insert_with(String::new).push_str(&text);
                }
                tool_calls.extend(delta.tool_calls.unwrap_or_default());
            }
            if choice.finish_reason.is_some() {
                finish_reason = choice.finish_reason;
            }
        }
        return Ok(Payload::Delta {
            content,
            tool_calls,
            finish_reason,
        });
    }

    match map.get("content") {
        Some(Value::String(text)) => Ok(Payload::Delta {
            content: Some(text.clone()),
            tool_calls: Vec::new(),
            finish_reason: None,
        }),
        Some(other) => Err(TetherError::Parse(format!(
            "content must be a string, got {}",
            type_name(other)
        ))),
        None => Ok(Payload::Delta {
            content: None,
            tool_calls: Vec::new(),
            finish_reason: None,
        }),
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
