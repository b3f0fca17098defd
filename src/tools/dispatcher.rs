//! ToolDispatcher (C4, §4.3): parse → validate → normalize → execute → record.
//!
//! The dispatcher is the only path through which files and processes are
//! mutated; phases never touch the filesystem directly.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;

use crate::errors::{ArgumentError, DispatchError, PathEscapeError};
use crate::state::types::{ToolCall, ToolResult};
use crate::util::normalize_contained_path;

use super::registry::{HandlerContext, ToolRegistry};

const DEFAULT_DEADLINE_MS: u64 = 120_000;

pub struct ToolDispatcher<'a> {
    registry: &'a mut ToolRegistry,
    project_dir: &'a Path,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(registry: &'a mut ToolRegistry, project_dir: &'a Path) -> Self {
        Self { registry, project_dir }
    }

    /// Dispatch a single call. Never returns `Err`: every failure mode
    /// becomes a `ToolResult { success: false, .. }` so the conversation
    /// can carry the model's mistake back to it (§4.3 step 7).
    pub fn dispatch(&mut self, phase: &str, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let outcome = self.try_dispatch(phase, call);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (success, output, error) = match outcome {
            Ok(output) => (true, Some(output), None),
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.call_id, error = %err, "tool dispatch failed");
                (false, None, Some(err.to_string()))
            }
        };

        self.registry.record_usage(&call.name, phase, success, elapsed_ms, chrono::Utc::now());

        ToolResult { call_id: call.call_id.clone(), success, output, error, elapsed_ms }
    }

    fn try_dispatch(&mut self, phase: &str, call: &ToolCall) -> Result<Value, DispatchError> {
        let schema = self.registry.resolve(&call.name)?.clone();

        let arguments = parse_arguments(&call.arguments, &call.name)?;
        validate_required_fields(&schema.name, &arguments)?;

        // Path containment applies to every tool with path arguments, not
        // just GUARDED ones (B4 names no safety-class scope): read_file and
        // list_files must reject `../outside` just as write_file does.
        let mut normalized_arguments = arguments.clone();
        for key in &schema.path_arguments {
            if let Some(raw) = arguments.get(key).and_then(Value::as_str) {
                let normalized = normalize_contained_path(self.project_dir, raw)
                    .map_err(|normalized| PathEscapeError { raw: raw.to_string(), normalized })?;
                normalized_arguments[key] = Value::String(normalized.to_string_lossy().to_string());
            }
        }

        let deadline_ms = DEFAULT_DEADLINE_MS;
        let ctx = HandlerContext { project_dir: self.project_dir, phase, deadline_ms };

        let deadline = Duration::from_millis(deadline_ms);
        let started = Instant::now();
        let result = (schema.handler)(&ctx, &normalized_arguments);
        if started.elapsed() > deadline {
            return Err(DispatchError::DeadlineExceeded { tool: schema.name.clone(), deadline_ms });
        }

        result.map_err(|source| DispatchError::HandlerFailed { tool: schema.name.clone(), source })
    }
}

/// Arguments may arrive as a native JSON object or as a JSON-encoded
/// string (§4.3 step 2).
fn parse_arguments(raw: &Value, tool: &str) -> Result<Value, DispatchError> {
    match raw {
        Value::Object(_) => Ok(raw.clone()),
        Value::String(s) => serde_json::from_str(s).map_err(|e| {
            ArgumentError { tool: tool.to_string(), detail: format!("arguments string is not valid JSON: {e}") }.into()
        }),
        Value::Null => Ok(Value::Object(serde_json::Map::new())),
        other => Err(ArgumentError {
            tool: tool.to_string(),
            detail: format!("arguments must be an object or JSON string, got {other}"),
        }
        .into()),
    }
}

/// Minimal schema validation: every handler documents its required keys
/// via a naming convention checked here rather than a full JSON-schema
/// engine, since the catalog's handlers are concrete Rust functions.
fn validate_required_fields(tool: &str, arguments: &Value) -> Result<(), DispatchError> {
    let required: &[&str] = match tool {
        "read_file" => &["path"],
        "write_file" => &["path", "content"],
        "str_replace" => &["path", "old_str", "new_str"],
        "report_issue" => &["description"],
        "approve_code" => &["filepath"],
        "create_task" => &["description"],
        "ask_user" => &["reason"],
        _ => &[],
    };
    for key in required {
        if arguments.get(key).is_none() {
            return Err(ArgumentError {
                tool: tool.to_string(),
                detail: format!("missing required field '{key}'"),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall { call_id: "c1".to_string(), name: name.to_string(), arguments }
    }

    #[test]
    fn dispatch_unknown_tool_is_not_fatal() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch("coding", &call("frobnicate", json!({})));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("available"));
    }

    #[test]
    fn dispatch_denied_tool_fails_as_unknown() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch("coding", &call("delete_file", json!({"path": "a.txt"})));
        assert!(!result.success);
    }

    #[test]
    fn dispatch_rejects_path_escape_b4() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch(
            "coding",
            &call("write_file", json!({"path": "../outside", "content": "x"})),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("escapes"));
    }

    #[test]
    fn dispatch_missing_argument_returns_argument_error() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch("coding", &call("write_file", json!({"path": "a.txt"})));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("content"));
    }

    #[test]
    fn dispatch_accepts_json_encoded_string_arguments() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch(
            "coding",
            &call("write_file", Value::String(r#"{"path": "a.txt", "content": "hi"}"#.to_string())),
        );
        assert!(result.success);
    }

    #[test]
    fn dispatch_write_then_read_succeeds() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let write_result = dispatcher.dispatch("coding", &call("write_file", json!({"path": "a.txt", "content": "hi"})));
        assert!(write_result.success);
        let read_result = dispatcher.dispatch("coding", &call("read_file", json!({"path": "a.txt"})));
        assert!(read_result.success);
        assert_eq!(read_result.output.unwrap()["content"], "hi");
    }

    #[test]
    fn dispatch_rejects_path_escape_on_safe_tool_b4() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
        let result = dispatcher.dispatch("coding", &call("read_file", json!({"path": "../outside"})));
        assert!(!result.success, "read_file is SAFE but still carries a path argument");
        assert!(result.error.unwrap().contains("escapes"));
    }

    #[test]
    fn dispatch_records_usage_counters() {
        let dir = tempdir().unwrap();
        let mut registry = ToolRegistry::default();
        {
            let mut dispatcher = ToolDispatcher::new(&mut registry, dir.path());
            dispatcher.dispatch("coding", &call("write_file", json!({"path": "a.txt", "content": "hi"})));
        }
        assert_eq!(registry.usage_for("write_file").calls, 1);
    }
}
