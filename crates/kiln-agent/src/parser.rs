//! Extraction of tool-call envelopes from raw model output.
//!
//! The model proposes calls as
//! `<tool_call>{"tool": "fs.write", "arguments": {...}}</tool_call>` and
//! signals completion with `<terminate/>`.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::errors::ProtocolError;

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

static TERMINATE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<terminate\s*/?>").expect("terminate tag regex is valid"));

/// One proposed invocation, alive only while its turn is processed.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    /// Position within the response, starting at 0.
    pub index: usize,
    pub turn: u32,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedResponse {
    pub calls: Vec<ToolCall>,
    pub terminate: bool,
}

impl ParsedResponse {
    /// Neither calls nor a termination signal.
    pub fn is_noop(&self) -> bool {
        self.calls.is_empty() && !self.terminate
    }
}

/// Parses every envelope in `text`, in order of appearance. A single
/// malformed envelope fails the whole response.
pub fn parse_response(text: &str, turn: u32) -> Result<ParsedResponse, ProtocolError> {
    let mut calls = Vec::new();
    let mut terminate = false;
    let mut remaining = text;

    while let Some(start) = remaining.find(TOOL_CALL_OPEN) {
        // Only prose between envelopes can terminate; payloads cannot.
        terminate |= TERMINATE_TAG.is_match(&remaining[..start]);
        let index = calls.len();
        let after_open = &remaining[start + TOOL_CALL_OPEN.len()..];
        let Some(close) = after_open.find(TOOL_CALL_CLOSE) else {
            return Err(ProtocolError::UnterminatedEnvelope { index });
        };
        let payload = strip_code_fence(after_open[..close].trim());
        calls.push(parse_envelope(payload, index, turn)?);
        remaining = &after_open[close + TOOL_CALL_CLOSE.len()..];
    }
    terminate |= TERMINATE_TAG.is_match(remaining);

    Ok(ParsedResponse { calls, terminate })
}

fn parse_envelope(payload: &str, index: usize, turn: u32) -> Result<ToolCall, ProtocolError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| ProtocolError::MalformedPayload {
            index,
            reason: err.to_string(),
        })?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::MalformedPayload {
            index,
            reason: "payload must be a JSON object".to_string(),
        });
    };

    let name = object
        .remove("tool")
        .or_else(|| object.remove("name"))
        .and_then(|name| name.as_str().map(str::trim).map(str::to_string))
        .filter(|name| !name.is_empty())
        .ok_or(ProtocolError::MissingToolName { index })?;

    let arguments = match object.remove("arguments") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(arguments @ Value::Object(_)) => arguments,
        Some(_) => return Err(ProtocolError::InvalidArguments { index }),
    };

    Ok(ToolCall {
        index,
        turn,
        name,
        arguments,
    })
}

// Models sometimes wrap the payload in a ```json fence.
fn strip_code_fence(payload: &str) -> &str {
    let Some(rest) = payload.strip_prefix("```") else {
        return payload;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
