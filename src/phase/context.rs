//! Context gathering (§4.2 step 1): one resolver per `ContextSource`
//! variant, each truncating to fit a remaining token budget.

use crate::ipc::IpcDocument;
use crate::state::types::{FileStatus, PipelineState, TaskStatus};

const TRUNCATION_MARKER: &str = "\n… (truncated)";

/// Mirrors the `context_sources` grammar in a `PhaseSpec`:
/// `architecture`, `ipc.<doc>`, `state.tasks`, `state.files`,
/// `analysis.<kind>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    Architecture,
    Ipc(String),
    StateTasks,
    StateFiles,
    Analysis(String),
}

/// Filters applied when reading `state.tasks` / `state.files` sources.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub task_status: Option<Vec<TaskStatus>>,
    pub file_status: Option<Vec<FileStatus>>,
}

/// Approximate 4 characters per token, matching the heuristic used for
/// conversation pruning.
fn tokens_for(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn truncate_to_budget(text: &str, budget_tokens: usize) -> (String, usize) {
    let budget_chars = budget_tokens.saturating_mul(4);
    if text.len() <= budget_chars {
        (text.to_string(), tokens_for(text))
    } else {
        let mut truncated = text.chars().take(budget_chars).collect::<String>();
        truncated.push_str(TRUNCATION_MARKER);
        (truncated.clone(), tokens_for(&truncated))
    }
}

/// Resolve one context source against the current state, returning
/// already-truncated text and how many tokens it consumed so the caller
/// can stop pulling sources once the budget is exhausted.
pub fn resolve(
    source: &ContextSource,
    state: &PipelineState,
    architecture_doc: Option<&IpcDocument>,
    ipc_docs: &std::collections::HashMap<String, IpcDocument>,
    filter: &ContextFilter,
    remaining_budget: usize,
) -> (String, usize) {
    if remaining_budget == 0 {
        return (String::new(), 0);
    }

    let raw = match source {
        ContextSource::Architecture => architecture_doc.map(|d| d.render()).unwrap_or_default(),
        ContextSource::Ipc(name) => ipc_docs.get(name).map(|d| d.render()).unwrap_or_default(),
        ContextSource::StateTasks => render_tasks(state, filter),
        ContextSource::StateFiles => render_files(state, filter),
        ContextSource::Analysis(kind) => format!("(no analysis results available for '{kind}')"),
    };

    truncate_to_budget(&raw, remaining_budget)
}

fn render_tasks(state: &PipelineState, filter: &ContextFilter) -> String {
    let mut out = String::new();
    for task in state.tasks.values() {
        if let Some(statuses) = &filter.task_status {
            if !statuses.contains(&task.status) {
                continue;
            }
        }
        out.push_str(&format!(
            "- {} [{:?}] {} (attempts={}, errors={})\n",
            task.id,
            task.status,
            task.description,
            task.attempts,
            task.errors.len()
        ));
        for error in &task.errors {
            out.push_str(&format!("    error[{}]: {}\n", error.kind, error.message));
        }
    }
    out
}

fn render_files(state: &PipelineState, filter: &ContextFilter) -> String {
    let mut out = String::new();
    for file in state.files.values() {
        if let Some(statuses) = &filter.file_status {
            if !statuses.contains(&file.status) {
                continue;
            }
        }
        out.push_str(&format!("- {} [{:?}]\n", file.path, file.status));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{TaskError, TaskState};
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn truncate_to_budget_leaves_short_text_untouched() {
        let (text, tokens) = truncate_to_budget("short text", 100);
        assert_eq!(text, "short text");
        assert!(tokens > 0);
    }

    #[test]
    fn truncate_to_budget_marks_long_text() {
        let long = "x".repeat(10_000);
        let (text, _) = truncate_to_budget(&long, 10);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert!(text.len() < long.len());
    }

    #[test]
    fn resolve_state_tasks_filters_by_status() {
        let mut state = PipelineState::default();
        let mut t1 = TaskState::new("T1", "fix bug");
        t1.status = TaskStatus::NeedsFixes;
        let mut t2 = TaskState::new("T2", "add feature");
        t2.status = TaskStatus::Completed;
        state.tasks.insert("T1".to_string(), t1);
        state.tasks.insert("T2".to_string(), t2);

        let filter = ContextFilter { task_status: Some(vec![TaskStatus::NeedsFixes]), file_status: None };
        let (text, _) = resolve(&ContextSource::StateTasks, &state, None, &HashMap::new(), &filter, 10_000);
        assert!(text.contains("T1"));
        assert!(!text.contains("T2"));
    }

    #[test]
    fn resolve_state_tasks_includes_accumulated_errors_b3() {
        let mut state = PipelineState::default();
        let mut task = TaskState::new("T1", "fix bug");
        task.attempts = 0; // reset, but errors must still show (B3)
        task.record_error(
            TaskError { phase: "debugging".into(), kind: "compile_error".into(), message: "E0382".into(), file: None, line: None, timestamp: Utc::now(), file_snapshot: None },
            Utc::now(),
        );
        state.tasks.insert("T1".to_string(), task);

        let (text, _) = resolve(&ContextSource::StateTasks, &state, None, &HashMap::new(), &ContextFilter::default(), 10_000);
        assert!(text.contains("E0382"));
    }

    #[test]
    fn resolve_returns_empty_when_budget_exhausted() {
        let state = PipelineState::default();
        let (text, tokens) = resolve(&ContextSource::StateTasks, &state, None, &HashMap::new(), &ContextFilter::default(), 0);
        assert!(text.is_empty());
        assert_eq!(tokens, 0);
    }
}
