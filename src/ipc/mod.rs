//! IPC documents (C2): the section-scoped markdown channel between phases.

pub mod document;
pub mod objectives;

pub use document::IpcDocument;

use std::path::{Path, PathBuf};

use crate::errors::FatalStateError;

/// Strategic, project-wide documents that are never overwritten in full,
/// only section-updated, and are template-initialized if absent.
pub const STRATEGIC_DOCUMENTS: &[&str] = &[
    "MASTER_PLAN.md",
    "ARCHITECTURE.md",
    "PRIMARY_OBJECTIVES.md",
    "SECONDARY_OBJECTIVES.md",
    "TERTIARY_OBJECTIVES.md",
];

fn template_for(name: &str) -> &'static str {
    match name {
        "MASTER_PLAN.md" => "# Master Plan\n",
        "ARCHITECTURE.md" => "# Architecture\n",
        "PRIMARY_OBJECTIVES.md" => "# Primary Objectives\n",
        "SECONDARY_OBJECTIVES.md" => "# Secondary Objectives\n",
        "TERTIARY_OBJECTIVES.md" => "# Tertiary Objectives\n",
        _ => "",
    }
}

/// Load a strategic document from `project_dir`, initializing it from its
/// template if it doesn't exist yet.
pub fn load_strategic(project_dir: &Path, name: &str) -> Result<IpcDocument, FatalStateError> {
    document::load_or_init(&project_dir.join(name), template_for(name))
}

pub fn save_strategic(project_dir: &Path, name: &str, doc: &IpcDocument) -> Result<(), FatalStateError> {
    document::save(&project_dir.join(name), doc)
}

/// `ipc/<PHASE>_READ.md` / `ipc/<PHASE>_WRITE.md` paths for one phase.
pub fn read_doc_path(project_dir: &Path, phase: &str) -> PathBuf {
    project_dir.join("ipc").join(format!("{}_READ.md", phase.to_uppercase()))
}

pub fn write_doc_path(project_dir: &Path, phase: &str) -> PathBuf {
    project_dir.join("ipc").join(format!("{}_WRITE.md", phase.to_uppercase()))
}
