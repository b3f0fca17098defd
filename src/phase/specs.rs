//! The declarative `PhaseSpec` record and the closed 14-phase set (§4.2,
//! §4.2a).

use crate::phase::context::{ContextFilter, ContextSource};
use crate::state::types::{FileStatus, TaskStatus};
use crate::tools::ToolCategory;

/// What a phase does with its tool-dispatch results once the turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultHandler {
    /// `create_task` results become new `TaskState` entries.
    TaskCreator,
    /// `write_file`/`str_replace` results update `FileState`.
    FileWriter,
    /// Writes a summary of this turn to the phase's IPC WRITE document.
    IpcSender,
    /// `report_issue`/`approve_code` results drive QA task transitions.
    QaOutcome,
    /// Task errors observed this turn move the owning task to NeedsFixes.
    DebuggingOutcome,
}

#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub context_sources: Vec<ContextSource>,
    pub context_filter: ContextFilter,
    pub prompt_template: &'static str,
    pub tool_categories: Vec<ToolCategory>,
    pub result_handlers: Vec<ResultHandler>,
    pub learning_categories: Vec<&'static str>,
    pub model_role: &'static str,
    pub max_iterations_without_progress: u32,
}

fn filter_live_tasks() -> ContextFilter {
    ContextFilter {
        task_status: Some(vec![
            TaskStatus::New,
            TaskStatus::InProgress,
            TaskStatus::QaPending,
            TaskStatus::NeedsFixes,
            TaskStatus::QaFailed,
        ]),
        file_status: None,
    }
}

/// The closed set of 14 phases (§4.2a). Order is the fallback rotation
/// order's superset; the coordinator's fixed fallback list (§4.1 step 5)
/// is a separate, shorter sequence.
pub fn all_phase_specs() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec {
            name: "planning",
            context_sources: vec![ContextSource::Architecture, ContextSource::Ipc("PRIMARY_OBJECTIVES".to_string()), ContextSource::StateTasks],
            context_filter: filter_live_tasks(),
            prompt_template: "planning",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::TaskCreator, ResultHandler::IpcSender],
            learning_categories: vec!["task_creation"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "coding",
            context_sources: vec![ContextSource::Architecture, ContextSource::StateTasks, ContextSource::StateFiles],
            context_filter: filter_live_tasks(),
            prompt_template: "coding",
            tool_categories: vec![ToolCategory::ToolsCoding, ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::FileWriter, ResultHandler::IpcSender],
            learning_categories: vec!["implementation"],
            model_role: "coding",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "qa",
            context_sources: vec![ContextSource::StateTasks, ContextSource::StateFiles],
            context_filter: ContextFilter { task_status: Some(vec![TaskStatus::QaPending]), file_status: None },
            prompt_template: "qa",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::QaOutcome, ResultHandler::IpcSender],
            learning_categories: vec!["quality"],
            model_role: "qa",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "debugging",
            context_sources: vec![ContextSource::StateTasks, ContextSource::StateFiles],
            context_filter: ContextFilter { task_status: Some(vec![TaskStatus::NeedsFixes, TaskStatus::QaFailed]), file_status: None },
            prompt_template: "debugging",
            tool_categories: vec![ToolCategory::ToolsCoding, ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::DebuggingOutcome, ResultHandler::FileWriter, ResultHandler::IpcSender],
            learning_categories: vec!["debugging"],
            model_role: "debugging",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "investigation",
            context_sources: vec![ContextSource::Architecture, ContextSource::StateFiles, ContextSource::Analysis("dependencies".to_string())],
            context_filter: ContextFilter::default(),
            prompt_template: "investigation",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["analysis"],
            model_role: "investigation",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "refactoring",
            context_sources: vec![
                ContextSource::Analysis("duplicates".to_string()),
                ContextSource::Analysis("dead_code".to_string()),
                ContextSource::Analysis("conflicts".to_string()),
                ContextSource::Analysis("complexity".to_string()),
                ContextSource::Analysis("architecture_drift".to_string()),
            ],
            context_filter: ContextFilter::default(),
            prompt_template: "refactoring",
            tool_categories: vec![ToolCategory::ToolsCoding, ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::TaskCreator, ResultHandler::FileWriter, ResultHandler::IpcSender],
            learning_categories: vec!["refactoring"],
            model_role: "refactoring",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "documentation",
            context_sources: vec![ContextSource::Architecture, ContextSource::StateFiles],
            context_filter: ContextFilter { file_status: Some(vec![FileStatus::Verified]), task_status: None },
            prompt_template: "documentation",
            tool_categories: vec![ToolCategory::ToolsCoding, ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::FileWriter, ResultHandler::IpcSender],
            learning_categories: vec!["documentation"],
            model_role: "documentation",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "project_planning",
            context_sources: vec![
                ContextSource::Ipc("PRIMARY_OBJECTIVES".to_string()),
                ContextSource::Ipc("SECONDARY_OBJECTIVES".to_string()),
                ContextSource::Ipc("TERTIARY_OBJECTIVES".to_string()),
            ],
            context_filter: ContextFilter::default(),
            prompt_template: "project_planning",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["objective_management"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "prompt_design",
            context_sources: vec![ContextSource::Architecture],
            context_filter: ContextFilter::default(),
            prompt_template: "prompt_design",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["prompt_engineering"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "prompt_improvement",
            context_sources: vec![ContextSource::Analysis("prompt_effectiveness".to_string())],
            context_filter: ContextFilter::default(),
            prompt_template: "prompt_improvement",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["prompt_engineering"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "role_design",
            context_sources: vec![ContextSource::Architecture],
            context_filter: ContextFilter::default(),
            prompt_template: "role_design",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["role_design"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "role_improvement",
            context_sources: vec![ContextSource::Analysis("role_effectiveness".to_string())],
            context_filter: ContextFilter::default(),
            prompt_template: "role_improvement",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["role_design"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "tool_design",
            context_sources: vec![ContextSource::Architecture],
            context_filter: ContextFilter::default(),
            prompt_template: "tool_design",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["tooling"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
        PhaseSpec {
            name: "tool_evaluation",
            context_sources: vec![ContextSource::Analysis("tool_usage".to_string())],
            context_filter: ContextFilter::default(),
            prompt_template: "tool_evaluation",
            tool_categories: vec![ToolCategory::ToolsAnalysis],
            result_handlers: vec![ResultHandler::IpcSender],
            learning_categories: vec!["tooling"],
            model_role: "planning",
            max_iterations_without_progress: 3,
        },
    ]
}

pub fn spec_by_name(name: &str) -> Option<PhaseSpec> {
    all_phase_specs().into_iter().find(|s| s.name == name)
}
