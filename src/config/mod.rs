//! Startup configuration (§6): an INI file with `APP_<SECTION>_<KEY>`
//! environment overrides, loaded once before the coordinator starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::errors::ConfigError;
use crate::llm::ModelCandidate;

const CONFIG_FILE_NAME: &str = "pipeline.ini";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub endpoints: Vec<String>,
    pub deny_tools: Vec<String>,
    pub stagnation_threshold: u32,
    pub context_tokens: usize,
    pub tool_deadline_secs: u64,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub model_assignments: HashMap<String, Vec<ModelCandidate>>,
}

fn env_key(section: &str, key: &str) -> String {
    format!("APP_{}_{}", section.to_uppercase(), key.to_uppercase())
}

/// A required key: checked first against its `APP_<SECTION>_<KEY>`
/// override, then against the INI file.
fn require(ini: &Ini, section: &str, key: &str) -> Result<String, ConfigError> {
    if let Ok(value) = std::env::var(env_key(section, key)) {
        return Ok(value);
    }
    ini.section(Some(section))
        .ok_or_else(|| ConfigError::MissingSection { section: section.to_string() })?
        .get(key)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingKey { section: section.to_string(), key: key.to_string() })
}

fn optional(ini: &Ini, section: &str, key: &str, default: &str) -> String {
    if let Ok(value) = std::env::var(env_key(section, key)) {
        return value;
    }
    ini.section(Some(section)).and_then(|s| s.get(key)).unwrap_or(default).to_string()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_required<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str) -> Result<T, ConfigError> {
    let raw = require(ini, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        detail: format!("'{raw}' is not a valid number"),
    })
}

/// Load and validate `pipeline.ini` from `project_dir`. A `.env` file in
/// the same directory, if present, is loaded first so its values are
/// visible to the `APP_<SECTION>_<KEY>` override lookups below.
pub fn load(project_dir: &Path) -> Result<RunConfig, ConfigError> {
    let _ = dotenvy::from_path(project_dir.join(".env"));

    let config_path = project_dir.join(CONFIG_FILE_NAME);
    let ini = Ini::load_from_file(&config_path)
        .map_err(|source| ConfigError::LoadFailed { path: config_path.clone(), source })?;

    let endpoints = parse_list(&require(&ini, "server", "endpoints")?);
    if endpoints.is_empty() {
        return Err(ConfigError::InvalidValue {
            section: "server".to_string(),
            key: "endpoints".to_string(),
            detail: "at least one endpoint is required".to_string(),
        });
    }

    let deny_tools = parse_list(&optional(&ini, "security", "deny_tools", ""));

    let state_dir = project_dir.join(require(&ini, "paths", "state_dir")?);
    let ipc_dir = project_dir.join(require(&ini, "paths", "ipc_dir")?);

    let stagnation_threshold: u32 = parse_required(&ini, "limits", "stagnation_threshold")?;
    let context_tokens: usize = parse_required(&ini, "limits", "context_tokens")?;
    let tool_deadline_secs: u64 = parse_required(&ini, "limits", "tool_deadline_secs")?;

    let log_level = require(&ini, "logging", "level")?;
    let log_dir = project_dir.join(require(&ini, "logging", "dir")?);

    let mut model_assignments = HashMap::new();
    let roles: Vec<String> = ini
        .section(Some("model_assignments"))
        .ok_or_else(|| ConfigError::MissingSection { section: "model_assignments".to_string() })?
        .iter()
        .map(|(role, _)| role.to_string())
        .collect();
    if roles.is_empty() {
        return Err(ConfigError::MissingKey {
            section: "model_assignments".to_string(),
            key: "<any role>".to_string(),
        });
    }
    for role in roles {
        let raw = require(&ini, "model_assignments", &role)?;
        let candidates: Vec<ModelCandidate> = raw.split(',').filter_map(|c| ModelCandidate::parse(c.trim())).collect();
        if candidates.is_empty() {
            return Err(ConfigError::InvalidValue {
                section: "model_assignments".to_string(),
                key: role.clone(),
                detail: "expected one or more 'model@server' candidates".to_string(),
            });
        }
        model_assignments.insert(role, candidates);
    }

    Ok(RunConfig {
        project_dir: project_dir.to_path_buf(),
        state_dir,
        ipc_dir,
        endpoints,
        deny_tools,
        stagnation_threshold,
        context_tokens,
        tool_deadline_secs,
        log_level,
        log_dir,
        model_assignments,
    })
}
