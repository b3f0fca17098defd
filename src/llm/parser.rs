//! Multi-dialect tool-call parsing (§4.6): native `tool_calls`, fenced code
//! blocks, a function-call text form, and free-form JSON scattered in
//! content. Each dialect is tried in order; the first that yields at
//! least one call wins.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::state::types::ToolCall;
use crate::util::extract_json_object;

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|tool_call|tool_code)?\s*\n?(.*?)```").unwrap());

static FUNCTION_CALL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\(([^()]*)\)\s*$").unwrap());

/// Parsed result of one assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// `content` is the assistant message text; `native_tool_calls` is
/// whatever the wire protocol's own `tool_calls` field carried, already
/// deserialized (dialect (a) — tried first since it needs no parsing).
pub fn parse_response(content: &str, native_tool_calls: &[ToolCall]) -> ParsedResponse {
    if !native_tool_calls.is_empty() {
        return ParsedResponse { content: content.to_string(), tool_calls: native_tool_calls.to_vec() };
    }

    if let Some(calls) = parse_fenced_blocks(content) {
        if !calls.is_empty() {
            return ParsedResponse { content: content.to_string(), tool_calls: calls };
        }
    }

    if let Some(calls) = parse_function_call_form(content) {
        if !calls.is_empty() {
            return ParsedResponse { content: content.to_string(), tool_calls: calls };
        }
    }

    if let Some(call) = parse_free_form_json(content) {
        return ParsedResponse { content: content.to_string(), tool_calls: vec![call] };
    }

    ParsedResponse { content: content.to_string(), tool_calls: Vec::new() }
}

fn tool_call_from_value(value: Value) -> Option<ToolCall> {
    let name = value.get("name").or_else(|| value.get("tool")).and_then(Value::as_str).unwrap_or("").to_string();
    let arguments = value.get("arguments").or_else(|| value.get("args")).cloned().unwrap_or(Value::Object(Default::default()));
    Some(ToolCall { call_id: Uuid::new_v4().to_string(), name, arguments })
}

fn parse_fenced_blocks(content: &str) -> Option<Vec<ToolCall>> {
    let mut calls = Vec::new();
    for capture in FENCED_BLOCK_REGEX.captures_iter(content) {
        let body = capture.get(1)?.as_str().trim();
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(call) = tool_call_from_value(value) {
                calls.push(call);
            }
        }
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// `name(key=value, key2="quoted value", ...)` text form.
fn parse_function_call_form(content: &str) -> Option<Vec<ToolCall>> {
    let mut calls = Vec::new();
    for capture in FUNCTION_CALL_REGEX.captures_iter(content) {
        let name = capture.get(1)?.as_str().to_string();
        let args_str = capture.get(2)?.as_str();
        let mut arguments = serde_json::Map::new();
        for pair in split_arguments(args_str) {
            if let Some((key, value)) = pair.split_once('=') {
                let key = key.trim().to_string();
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                arguments.insert(key, Value::String(value.to_string()));
            }
        }
        calls.push(ToolCall { call_id: Uuid::new_v4().to_string(), name, arguments: Value::Object(arguments) });
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn split_arguments(args: &str) -> Vec<&str> {
    if args.trim().is_empty() {
        Vec::new()
    } else {
        args.split(',').map(str::trim).collect()
    }
}

fn parse_free_form_json(content: &str) -> Option<ToolCall> {
    let json_str = extract_json_object(content)?;
    let value: Value = serde_json::from_str(&json_str).ok()?;
    tool_call_from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_tool_calls_take_priority() {
        let native = vec![ToolCall { call_id: "1".into(), name: "read_file".into(), arguments: serde_json::json!({}) }];
        let parsed = parse_response("ignored ```json {\"name\":\"write_file\"}```", &native);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "read_file");
    }

    #[test]
    fn parses_fenced_json_block() {
        let content = "Here's my call:\n```json\n{\"name\": \"read_file\", \"arguments\": {\"path\": \"a.rs\"}}\n```";
        let parsed = parse_response(content, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "read_file");
        assert_eq!(parsed.tool_calls[0].arguments["path"], "a.rs");
    }

    #[test]
    fn parses_function_call_text_form() {
        let content = "read_file(path=\"a.rs\")";
        let parsed = parse_response(content, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "read_file");
        assert_eq!(parsed.tool_calls[0].arguments["path"], "a.rs");
    }

    #[test]
    fn parses_free_form_json_anywhere_in_content() {
        let content = "I'll report this issue: {\"issue_type\": \"bug\", \"description\": \"off by one\"}";
        let parsed = parse_response(content, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "");
        assert_eq!(parsed.tool_calls[0].arguments["issue_type"], "bug");
    }

    #[test]
    fn no_tool_call_present_yields_empty_list() {
        let parsed = parse_response("APPROVED, nothing more to do.", &[]);
        assert!(parsed.tool_calls.is_empty());
    }

    #[test]
    fn blank_name_is_carried_through_not_rejected() {
        let content = "{\"arguments\": {\"filepath\": \"a.py\", \"notes\": \"looks fine\"}}";
        let parsed = parse_response(content, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "");
    }
}
