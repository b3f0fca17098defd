//! Value types making up `PipelineState` (§3).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered so `derive(PartialOrd, Ord)` gives CRITICAL the lowest ordinal
/// (sorts first when tasks are ranked by priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    New,
    InProgress,
    QaPending,
    NeedsFixes,
    QaFailed,
    Completed,
    Skipped,
    Failed,
}

impl TaskStatus {
    /// Whether a task in this status is still considered live work, i.e.
    /// eligible to be picked up by a future phase selection.
    pub fn is_live(self) -> bool {
        !matches!(self, TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub phase: String,
    pub kind: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub timestamp: DateTime<Utc>,
    /// Full-file content snapshot at the time of failure, used to seed the
    /// next retry's context. Large; never round-tripped through logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_snapshot: Option<String>,
}

/// A unit of planned work (§3 `TaskState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub description: String,
    pub files: BTreeSet<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub errors: Vec<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            files: BTreeSet::new(),
            status: TaskStatus::New,
            priority: Priority::default(),
            attempts: 0,
            errors: Vec::new(),
            objective_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, bumping `updated_at`. Never truncates `errors` —
    /// reactivating a task (e.g. NeedsFixes -> InProgress) keeps its full
    /// failure history so debugging always has the prior context (B3).
    pub fn transition(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn record_error(&mut self, error: TaskError, now: DateTime<Utc>) {
        self.errors.push(error);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
    Unknown,
    Created,
    Modified,
    Verified,
    Broken,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by_phase: Option<String>,
    #[serde(default)]
    pub tasks: BTreeSet<String>,
}

impl FileState {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: FileStatus::Unknown,
            hash: None,
            last_modified_by_phase: None,
            tasks: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PhaseResult {
    Success,
    NoOp,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<PhaseResult>,
    #[serde(default)]
    pub no_update_count: u32,
}

impl PhaseState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: 0,
            last_run: None,
            last_result: None,
            no_update_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveLevel {
    Primary,
    Secondary,
    Tertiary,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DimensionalProfile {
    pub temporal: f64,
    pub functional: f64,
    pub data: f64,
    pub state: f64,
    pub error: f64,
    pub context: f64,
    pub integration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: Priority,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dimensional_profile: DimensionalProfile,
    /// Authoritative link: the single place a task's membership in an
    /// objective is recorded. A task's `objective_id` must point back here.
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub text: String,
    pub done: bool,
}

/// One recognized repeating behavior (§3 `ExecutionPattern`, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ToolSequence,
    Failure,
    Success,
    PhaseTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPattern {
    pub kind: PatternKind,
    pub signature: String,
    pub occurrences: u32,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    /// May be empty; coercing a blank name to a concrete tool is a
    /// phase-level concern (qa's `report_issue`/`approve_code` rule).
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// An objective level's ordered objective list, keyed by `ObjectiveLevel`.
pub type ObjectiveSet = BTreeMap<ObjectiveLevel, Vec<ObjectiveRecord>>;

/// Aggregate root persisted by the `StateStore` (§3 `PipelineState`).
///
/// `tasks`/`files` are plain string-keyed maps per §4.4: "no sentinel
/// wrappers" for enum-keyed collections, so the on-disk form is a trivial
/// `serde_json::Map` that any tool can read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskState>,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub objectives: ObjectiveSet,
    /// Opaque to the StateStore; owned and interpreted by `PatternStore`.
    #[serde(default)]
    pub patterns: Vec<ExecutionPattern>,
    #[serde(default)]
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            files: BTreeMap::new(),
            phases: BTreeMap::new(),
            objectives: BTreeMap::new(),
            patterns: Vec::new(),
            iteration: 0,
            started_at: Utc::now(),
        }
    }
}

impl PipelineState {
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&TaskState> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    pub fn phase_mut(&mut self, name: &str) -> &mut PhaseState {
        self.phases
            .entry(name.to_string())
            .or_insert_with(|| PhaseState::new(name))
    }

    /// I1: every task's files have a matching `FileState` entry. Called
    /// after mutation in debug assertions and by the store's tests.
    pub fn check_file_coverage(&self) -> Result<(), String> {
        for task in self.tasks.values() {
            for path in &task.files {
                if !self.files.contains_key(path) {
                    return Err(format!(
                        "task {} references file {} with no FileState entry",
                        task.id, path
                    ));
                }
            }
        }
        Ok(())
    }

    /// I2: every task with an `objective_id` appears exactly once in that
    /// objective's `tasks` list.
    pub fn check_objective_linkage(&self) -> Result<(), String> {
        for task in self.tasks.values() {
            let Some(objective_id) = &task.objective_id else {
                continue;
            };
            let found = self
                .objectives
                .values()
                .flatten()
                .find(|o| &o.id == objective_id);
            match found {
                None => {
                    return Err(format!(
                        "task {} references unknown objective {}",
                        task.id, objective_id
                    ));
                }
                Some(objective) => {
                    let count = objective.tasks.iter().filter(|id| *id == &task.id).count();
                    if count != 1 {
                        return Err(format!(
                            "task {} appears {} times in objective {}'s task list (expected 1)",
                            task.id, count, objective_id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_puts_critical_first() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn task_status_live_excludes_terminal_states() {
        assert!(TaskStatus::New.is_live());
        assert!(TaskStatus::NeedsFixes.is_live());
        assert!(!TaskStatus::Completed.is_live());
        assert!(!TaskStatus::Skipped.is_live());
        assert!(!TaskStatus::Failed.is_live());
    }

    #[test]
    fn transition_preserves_errors() {
        let mut task = TaskState::new("T1", "fix the thing");
        task.record_error(
            TaskError {
                phase: "debugging".into(),
                kind: "compile_error".into(),
                message: "E0382".into(),
                file: Some("a.rs".into()),
                line: Some(10),
                timestamp: Utc::now(),
                file_snapshot: None,
            },
            Utc::now(),
        );
        task.transition(TaskStatus::InProgress, Utc::now());
        assert_eq!(task.errors.len(), 1);
        task.attempts = 0; // simulate a reset counter
        assert_eq!(task.errors.len(), 1, "errors must survive attempts reset (B3)");
    }

    #[test]
    fn check_file_coverage_flags_missing_file_state() {
        let mut state = PipelineState::default();
        let mut task = TaskState::new("T1", "edit a.rs");
        task.files.insert("a.rs".to_string());
        state.tasks.insert("T1".to_string(), task);
        assert!(state.check_file_coverage().is_err());

        state.files.insert("a.rs".to_string(), FileState::new("a.rs"));
        assert!(state.check_file_coverage().is_ok());
    }

    #[test]
    fn check_objective_linkage_requires_exactly_one_entry() {
        let mut state = PipelineState::default();
        let mut task = TaskState::new("T1", "do it");
        task.objective_id = Some("primary_001".to_string());
        state.tasks.insert("T1".to_string(), task);

        let objective = ObjectiveRecord {
            id: "primary_001".to_string(),
            title: "Build CLI tool".to_string(),
            description: String::new(),
            status: "active".to_string(),
            priority: Priority::High,
            success_criteria: Vec::new(),
            dependencies: Vec::new(),
            dimensional_profile: DimensionalProfile::default(),
            tasks: Vec::new(),
        };
        state
            .objectives
            .entry(ObjectiveLevel::Primary)
            .or_default()
            .push(objective);
        assert!(state.check_objective_linkage().is_err(), "task missing from objective's list");

        state.objectives.get_mut(&ObjectiveLevel::Primary).unwrap()[0]
            .tasks
            .push("T1".to_string());
        assert!(state.check_objective_linkage().is_ok());
    }

    #[test]
    fn tasks_by_status_filters_correctly() {
        let mut state = PipelineState::default();
        let mut t1 = TaskState::new("T1", "a");
        t1.status = TaskStatus::QaPending;
        let mut t2 = TaskState::new("T2", "b");
        t2.status = TaskStatus::New;
        state.tasks.insert("T1".to_string(), t1);
        state.tasks.insert("T2".to_string(), t2);
        assert_eq!(state.tasks_by_status(TaskStatus::QaPending).len(), 1);
    }

    #[test]
    fn pipeline_state_round_trips_through_json() {
        let mut state = PipelineState::default();
        state.tasks.insert("T1".to_string(), TaskState::new("T1", "desc"));
        let json = serde_json::to_string(&state).unwrap();
        let restored: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tasks.len(), 1);
        assert_eq!(restored.tasks["T1"].description, "desc");
    }
}
