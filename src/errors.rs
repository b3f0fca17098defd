//! Typed error hierarchy for the pipeline coordinator.
//!
//! Mirrors the taxonomy the coordinator is built around:
//! - `FatalStateError` — unrecoverable state store failure; aborts the run.
//! - `TransportError` — LLM transport failure after retries; the phase
//!   returns `FAILURE`, the coordinator keeps going.
//! - `ArgumentError` — tool schema validation failure; surfaced back to the
//!   model as a `ToolResult` so it can self-correct.
//! - `PathEscapeError` — a tool argument resolved outside the project root.
//! - `UnknownToolError` — a tool name the registry has never heard of.
//! - `AskUserRequired` — the model or the loop detector escalated to a human.
//!
//! `LoopDetected` is not an exception type; see [`crate::patterns::LoopVerdict`].

use std::path::PathBuf;
use thiserror::Error;

/// Unrecoverable state-store failure. Propagates out of the coordinator.
#[derive(Debug, Error)]
pub enum FatalStateError {
    #[error("failed to read state file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file at {path} and all backups failed to parse: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not acquire project lock at {path}: {reason}")]
    LockUnavailable { path: PathBuf, reason: String },
}

/// LLM transport failure after the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no server advertises model role {role:?}")]
    NoModelForRole { role: String },

    #[error("request to {server} failed after {attempts} attempts: {source}")]
    RequestFailed {
        server: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("server {server} returned an unparseable response: {message}")]
    BadResponse { server: String, message: String },

    #[error("request to {server} timed out after {elapsed_ms}ms")]
    Timeout { server: String, elapsed_ms: u64 },
}

/// A tool call's `arguments` failed schema validation.
#[derive(Debug, Error)]
#[error("argument error in tool '{tool}': {detail}")]
pub struct ArgumentError {
    pub tool: String,
    pub detail: String,
}

/// A path-like tool argument escaped the project root.
#[derive(Debug, Error)]
#[error("path '{raw}' escapes project root (normalized to {normalized})")]
pub struct PathEscapeError {
    pub raw: String,
    pub normalized: PathBuf,
}

/// A tool call named something the registry has no handler for.
#[derive(Debug, Error)]
#[error("unknown tool '{name}'; available: {}", available.join(", "))]
pub struct UnknownToolError {
    pub name: String,
    pub available: Vec<String>,
}

/// The model or the loop detector escalated and needs a human decision.
#[derive(Debug, Error)]
#[error("phase {phase} requires user input: {reason}")]
pub struct AskUserRequired {
    pub phase: String,
    pub reason: String,
    pub task_id: Option<String>,
}

/// Errors raised while dispatching a single tool call. Never propagates past
/// the dispatcher boundary; it is always converted into a `ToolResult`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),

    #[error(transparent)]
    UnknownTool(#[from] UnknownToolError),

    #[error("tool '{tool}' exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded { tool: String, deadline_ms: u64 },

    #[error("tool '{tool}' handler failed: {source}")]
    HandlerFailed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Startup configuration failure. Fatal: `main` reports it and exits
/// before the coordinator ever acquires the project lock.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file at {path}: {source}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("missing required section [{section}]")]
    MissingSection { section: String },

    #[error("missing required key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("invalid value for '{key}' in section [{section}]: {detail}")]
    InvalidValue { section: String, key: String, detail: String },
}

/// Top-level error surfaced by a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseExecutionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    AskUser(#[from] AskUserRequired),

    #[error(transparent)]
    State(#[from] FatalStateError),

    #[error("context source '{source_name}' could not be resolved")]
    ContextUnavailable { source_name: String },
}
