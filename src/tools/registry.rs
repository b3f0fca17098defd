//! Tool catalog: schemas, handlers, safety classes, usage counters (C3, §4.3).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyClass {
    Safe,
    Guarded,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCategory {
    ToolsCoding,
    ToolsAnalysis,
}

/// Context handed to a tool handler: the project root (for path
/// containment) and the phase name (for usage attribution).
pub struct HandlerContext<'a> {
    pub project_dir: &'a std::path::Path,
    pub phase: &'a str,
    pub deadline_ms: u64,
}

pub type HandlerFn = Arc<dyn Fn(&HandlerContext, &Value) -> Result<Value, anyhow::Error> + Send + Sync>;

#[derive(Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub safety_class: SafetyClass,
    /// Names of arguments the schema treats as filesystem paths; these are
    /// normalized and containment-checked before the handler sees them.
    pub path_arguments: Vec<String>,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for ToolSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSchema")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("safety_class", &self.safety_class)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_elapsed_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub by_phase: BTreeMap<String, u64>,
}

impl ToolUsage {
    pub fn record(&mut self, phase: &str, success: bool, elapsed_ms: u64, now: DateTime<Utc>) {
        let prev_total = self.avg_elapsed_ms * self.calls as f64;
        self.calls += 1;
        self.avg_elapsed_ms = (prev_total + elapsed_ms as f64) / self.calls as f64;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_used_at = Some(now);
        *self.by_phase.entry(phase.to_string()).or_insert(0) += 1;
    }
}

/// Catalog of tool schemas and their persistent usage counters.
pub struct ToolRegistry {
    schemas: BTreeMap<String, ToolSchema>,
    usage: BTreeMap<String, ToolUsage>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut registry = Self { schemas: BTreeMap::new(), usage: BTreeMap::new() };
        super::handlers::register_builtins(&mut registry);
        registry
    }
}

impl ToolRegistry {
    pub fn new_empty() -> Self {
        Self { schemas: BTreeMap::new(), usage: BTreeMap::new() }
    }

    /// Register or override a tool. A phase configuration may call this
    /// to add tools or replace a built-in's schema/handler.
    pub fn register(&mut self, schema: ToolSchema) {
        self.usage.entry(schema.name.clone()).or_default();
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Mark a tool `DENIED` by name, e.g. from the `[security] deny_tools`
    /// config list. A no-op if the registry has no such tool.
    pub fn deny(&mut self, name: &str) {
        if let Some(schema) = self.schemas.get_mut(name) {
            schema.safety_class = SafetyClass::Denied;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn tools_for(&self, categories: &[ToolCategory]) -> Vec<&ToolSchema> {
        self.schemas
            .values()
            .filter(|s| categories.contains(&s.category) && s.safety_class != SafetyClass::Denied)
            .collect()
    }

    pub fn usage_for(&self, name: &str) -> ToolUsage {
        self.usage.get(name).cloned().unwrap_or_default()
    }

    pub fn all_usage(&self) -> &BTreeMap<String, ToolUsage> {
        &self.usage
    }

    pub fn record_usage(&mut self, name: &str, phase: &str, success: bool, elapsed_ms: u64, now: DateTime<Utc>) {
        self.usage.entry(name.to_string()).or_default().record(phase, success, elapsed_ms, now);
    }

    /// Resolve a call: absent or denied names surface as `UnknownToolError`
    /// so the dispatcher can return the recoverable list of names.
    pub fn resolve(&self, name: &str) -> Result<&ToolSchema, DispatchError> {
        match self.schemas.get(name) {
            Some(schema) if schema.safety_class != SafetyClass::Denied => Ok(schema),
            _ => Err(crate::errors::UnknownToolError {
                name: name.to_string(),
                available: self
                    .schemas
                    .values()
                    .filter(|s| s.safety_class != SafetyClass::Denied)
                    .map(|s| s.name.clone())
                    .collect(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtin_catalog() {
        let registry = ToolRegistry::default();
        assert!(registry.get("read_file").is_some());
        assert!(registry.get("write_file").is_some());
        assert!(registry.get("delete_file").is_some());
    }

    #[test]
    fn delete_file_is_denied_by_default() {
        let registry = ToolRegistry::default();
        assert_eq!(registry.get("delete_file").unwrap().safety_class, SafetyClass::Denied);
        assert!(registry.resolve("delete_file").is_err());
    }

    #[test]
    fn denied_tool_is_excluded_from_tools_for() {
        let registry = ToolRegistry::default();
        let coding_tools = registry.tools_for(&[ToolCategory::ToolsCoding]);
        assert!(!coding_tools.iter().any(|t| t.name == "delete_file"));
    }

    #[test]
    fn resolve_unknown_tool_lists_available_names() {
        let registry = ToolRegistry::default();
        let err = registry.resolve("frobnicate").unwrap_err();
        match err {
            DispatchError::UnknownTool(inner) => assert!(!inner.available.is_empty()),
            _ => panic!("expected UnknownTool"),
        }
    }

    #[test]
    fn deny_removes_a_tool_from_availability() {
        let mut registry = ToolRegistry::default();
        assert!(registry.resolve("read_file").is_ok());
        registry.deny("read_file");
        assert!(registry.resolve("read_file").is_err());
    }

    #[test]
    fn usage_tracks_average_elapsed_and_by_phase() {
        let mut registry = ToolRegistry::new_empty();
        registry.record_usage("read_file", "coding", true, 100, Utc::now());
        registry.record_usage("read_file", "coding", true, 200, Utc::now());
        let usage = registry.usage_for("read_file");
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.successes, 2);
        assert_eq!(usage.avg_elapsed_ms, 150.0);
        assert_eq!(usage.by_phase["coding"], 2);
    }
}
