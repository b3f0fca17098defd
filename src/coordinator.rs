//! Coordinator (C10, §4.1): runs the pipeline loop, decides the next
//! phase by the ordered rules, and persists state after every iteration.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::errors::{FatalStateError, PhaseExecutionError};
use crate::ipc::{self, IpcDocument};
use crate::llm::{ConversationThread, LlmClient};
use crate::patterns::{LoopDetector, LoopKind, PatternStore};
use crate::phase::{self, spec_by_name, PhaseOutcome};
use crate::signal::{self, ProjectLock};
use crate::state::types::{ObjectiveLevel, PhaseResult, TaskStatus};
use crate::state::StateStore;
use crate::tools::ToolRegistry;

/// The three objective-level files (§6): authoritative on disk, synced
/// into `PipelineState.objectives` at the start of every iteration and
/// written back after, so a task linked in-memory (`apply_task_creator`)
/// shows up under its objective's `### Tasks` list the same iteration (S1).
const OBJECTIVE_DOCS: &[(ObjectiveLevel, &str)] = &[
    (ObjectiveLevel::Primary, "PRIMARY_OBJECTIVES"),
    (ObjectiveLevel::Secondary, "SECONDARY_OBJECTIVES"),
    (ObjectiveLevel::Tertiary, "TERTIARY_OBJECTIVES"),
];

/// Fixed fallback rotation for a stagnation-forced transition (§4.1 step 5).
const FALLBACK_ROTATION: &[&str] = &["planning", "coding", "qa", "debugging", "refactoring", "project_planning"];

/// Consecutive NO_OP iterations with no pending work before the run
/// terminates as quiescent (§4.1 step 8; the spec names no fixed N).
const QUIESCENCE_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    Quiescent,
    DocumentationComplete,
    Cancelled,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub iterations: u64,
    pub terminal_reason: TerminalReason,
}

#[derive(Debug)]
pub struct StepOutcome {
    pub phase: String,
    pub result: PhaseResult,
}

/// Owns every process-wide collaborator (§9: "singleton-style,
/// bounded by the Coordinator") and the project lock for its lifetime.
pub struct Coordinator {
    project_dir: PathBuf,
    config: RunConfig,
    store: StateStore,
    registry: ToolRegistry,
    patterns: PatternStore,
    llm: LlmClient,
    threads: HashMap<String, ConversationThread>,
    detectors: HashMap<String, LoopDetector>,
    /// Per-phase (last semantic-state hash, consecutive repeat count), used
    /// by `check_state_cycle` to raise `LoopKind::StateCycle` (§4.7) when a
    /// phase's turn leaves tasks/files/objectives exactly as they were.
    state_hashes: HashMap<String, (u64, u32)>,
    _lock: ProjectLock,
}

impl Coordinator {
    /// Acquire the project lock, load state, and build every collaborator.
    /// Fails fatally if the lock is held or state is unrecoverable.
    pub fn new(config: RunConfig) -> Result<Self, FatalStateError> {
        let lock = signal::try_acquire(&config.state_dir)?;
        let store = StateStore::load(&config.state_dir)?;

        let mut registry = ToolRegistry::default();
        for name in &config.deny_tools {
            registry.deny(name);
        }

        let patterns = PatternStore::from_patterns(store.state().patterns.clone());
        let llm = LlmClient::new(config.model_assignments.clone());

        Ok(Self {
            project_dir: config.project_dir.clone(),
            config,
            store,
            registry,
            patterns,
            llm,
            threads: HashMap::new(),
            detectors: HashMap::new(),
            state_hashes: HashMap::new(),
            _lock: lock,
        })
    }

    /// Run to quiescence, documentation completion, or cancellation.
    pub async fn run(&mut self) -> Result<RunOutcome, FatalStateError> {
        self.llm.discover(&self.config.endpoints).await;

        let mut consecutive_noop = 0u32;
        loop {
            if signal::shutdown_requested() {
                signal::kill_all_process_groups().await;
                self.persist()?;
                return Ok(RunOutcome {
                    exit_code: 130,
                    iterations: self.store.state().iteration,
                    terminal_reason: TerminalReason::Cancelled,
                });
            }

            let step = self.step().await?;
            info!(phase = %step.phase, result = ?step.result, "phase iteration complete");

            if step.phase == "documentation" && step.result != PhaseResult::Failure && self.objectives_exhausted() {
                self.persist()?;
                return Ok(RunOutcome {
                    exit_code: 0,
                    iterations: self.store.state().iteration,
                    terminal_reason: TerminalReason::DocumentationComplete,
                });
            }

            if step.result == PhaseResult::NoOp && !self.has_pending_work() {
                consecutive_noop += 1;
            } else {
                consecutive_noop = 0;
            }

            if consecutive_noop >= QUIESCENCE_ITERATIONS {
                self.persist()?;
                return Ok(RunOutcome {
                    exit_code: 0,
                    iterations: self.store.state().iteration,
                    terminal_reason: TerminalReason::Quiescent,
                });
            }
        }
    }

    /// Cooperative cancellation: `run()`'s loop polls `signal::shutdown_requested()`
    /// at the top of every iteration and finishes the in-flight phase before
    /// returning, so there is nothing additional to flip here.
    pub fn cancel(&self) {}

    /// Single iteration, exposed for testing (§4.1 `step()`): select a
    /// phase, execute it, persist state, return its name and result.
    pub async fn step(&mut self) -> Result<StepOutcome, FatalStateError> {
        let now = Utc::now();
        self.store.state_mut().iteration += 1;

        let (phase_name, forced) = self.decide_phase();
        if forced {
            self.store.reset_no_update_count(phase_name);
        }
        let spec = spec_by_name(phase_name).expect("decide_phase always names a closed-set phase");

        let architecture_doc = ipc::load_strategic(&self.project_dir, "ARCHITECTURE.md")?;
        let mut ipc_docs = HashMap::new();
        for (level, doc_name) in OBJECTIVE_DOCS {
            let doc = ipc::load_strategic(&self.project_dir, &format!("{doc_name}.md"))?;
            let parsed = ipc::objectives::parse_objectives(&doc.render())?;
            self.store.state_mut().objectives.insert(*level, parsed);
            ipc_docs.insert(doc_name.to_string(), doc);
        }

        let default_model = self.llm.model_for(spec.model_role).map(|r| r.model).unwrap_or_else(|_| "unknown".to_string());
        let context_tokens = self.config.context_tokens;
        let model_role = spec.model_role.to_string();
        let thread = self
            .threads
            .entry(phase_name.to_string())
            .or_insert_with(|| ConversationThread::new(default_model, model_role, context_tokens));
        let detector = self.detectors.entry(phase_name.to_string()).or_default();

        let outcome = phase::execute(
            &spec,
            &self.project_dir,
            self.store.state_mut(),
            thread,
            detector,
            &mut self.patterns,
            &mut self.registry,
            &self.llm,
            Some(&architecture_doc),
            &ipc_docs,
            self.config.context_tokens,
            Duration::from_secs(self.config.tool_deadline_secs),
            now,
        )
        .await;

        let result = self.record_outcome(phase_name, outcome, now)?;
        self.check_state_cycle(phase_name);

        self.store.state_mut().patterns = self.patterns.patterns().to_vec();
        self.sync_objectives_to_disk(&ipc_docs)?;
        self.persist()?;

        Ok(StepOutcome { phase: phase_name.to_string(), result })
    }

    /// Write `PipelineState.objectives` back to the three objective files,
    /// preserving each file's front matter. Called once per iteration so a
    /// task linked to an objective during this step's phase execution is
    /// reflected on disk before the next iteration re-reads it.
    fn sync_objectives_to_disk(&self, ipc_docs: &HashMap<String, IpcDocument>) -> Result<(), FatalStateError> {
        for (level, doc_name) in OBJECTIVE_DOCS {
            let front_matter = ipc_docs.get(*doc_name).map(|d| d.front_matter.clone()).unwrap_or_default();
            let objectives = self.store.state().objectives.get(level).cloned().unwrap_or_default();
            let rendered = ipc::objectives::render_objectives(&objectives);
            let body = if rendered.is_empty() {
                front_matter
            } else {
                format!("{}\n\n{}", front_matter.trim_end(), rendered)
            };
            let doc = IpcDocument::parse(&body);
            ipc::save_strategic(&self.project_dir, &format!("{doc_name}.md"), &doc)?;
        }
        Ok(())
    }

    /// Apply the outcome of one phase execution to `PhaseState` and
    /// `no_update_count`. A `FatalStateError` is the only variant that
    /// propagates; every other phase-level failure is logged and counted.
    fn record_outcome(
        &mut self,
        phase_name: &str,
        outcome: Result<PhaseOutcome, PhaseExecutionError>,
        now: DateTime<Utc>,
    ) -> Result<PhaseResult, FatalStateError> {
        let result = match outcome {
            Ok(PhaseOutcome { result, state_changed, .. }) => {
                if state_changed {
                    self.store.reset_no_update_count(phase_name);
                } else {
                    self.store.increment_no_update_count(phase_name);
                }
                result
            }
            Err(PhaseExecutionError::State(fatal)) => return Err(fatal),
            Err(err) => {
                warn!(phase = phase_name, error = %err, "phase execution failed");
                self.store.increment_no_update_count(phase_name);
                PhaseResult::Failure
            }
        };

        let phase_state = self.store.state_mut().phase_mut(phase_name);
        phase_state.iterations += 1;
        phase_state.last_run = Some(now);
        phase_state.last_result = Some(result);

        Ok(result)
    }

    fn persist(&mut self) -> Result<(), FatalStateError> {
        self.store.save()
    }

    /// §4.7's `state_cycle`: a turn that leaves tasks/files/objectives
    /// byte-for-byte identical to the prior turn's, twice in a row,  means
    /// the phase is spinning without making progress the way `no_update_count`
    /// alone (which only tracks whether `apply_result_handlers` flipped
    /// anything) can't distinguish from "legitimately nothing to do yet".
    fn check_state_cycle(&mut self, phase_name: &str) {
        let hash = self.hash_semantic_state();
        let (repeat_count, should_raise) = {
            let entry = self.state_hashes.entry(phase_name.to_string()).or_insert((hash, 0));
            if entry.0 == hash && entry.1 > 0 {
                entry.1 += 1;
            } else {
                entry.0 = hash;
                entry.1 = 1;
            }
            (entry.1, entry.1 >= 2)
        };

        if should_raise {
            if let Some(detector) = self.detectors.get_mut(phase_name) {
                let verdict = detector.raise(
                    LoopKind::StateCycle,
                    format!("state unchanged across {repeat_count} consecutive iterations of {phase_name}"),
                );
                if verdict.must_intervene {
                    warn!(phase = phase_name, repeat_count, "state cycle detected; loop detector escalated");
                }
            }
        }
    }

    /// Hashes the parts of `PipelineState` a phase turn actually mutates
    /// (tasks, files, objectives) — excluding `iteration`/`started_at`,
    /// which change every step regardless of whether the phase did anything.
    fn hash_semantic_state(&self) -> u64 {
        let state = self.store.state();
        let mut hasher = DefaultHasher::new();
        format!("{:?}|{:?}|{:?}", state.tasks, state.files, state.objectives).hash(&mut hasher);
        hasher.finish()
    }

    /// The phase the ordered rules (§4.1 step 4) select, ignoring
    /// stagnation. Falls back to `planning` for a task mix the closed
    /// rule set doesn't cover (e.g. only SKIPPED/FAILED tasks remain).
    fn natural_phase(&self) -> &'static str {
        let state = self.store.state();

        if state.tasks.values().any(|t| matches!(t.status, TaskStatus::NeedsFixes | TaskStatus::QaFailed)) {
            return "debugging";
        }
        if state.tasks.values().any(|t| t.status == TaskStatus::QaPending) {
            return "qa";
        }
        if state.tasks.values().any(|t| matches!(t.status, TaskStatus::New | TaskStatus::InProgress)) {
            return "coding";
        }
        if state.tasks.is_empty() {
            return "planning";
        }
        if state.tasks.values().all(|t| t.status == TaskStatus::Completed) && !self.objectives_exhausted() {
            return "project_planning";
        }
        if self.objectives_exhausted() {
            return "documentation";
        }
        "planning"
    }

    /// Apply the stagnation forced transition (§4.1 step 5) on top of the
    /// natural selection. Returns `(phase, forced)`; when forced, the
    /// caller resets the forced phase's own counter before running it.
    fn decide_phase(&self) -> (&'static str, bool) {
        let natural = self.natural_phase();
        let no_update = self.store.state().phases.get(natural).map(|p| p.no_update_count).unwrap_or(0);
        if no_update >= self.config.stagnation_threshold {
            let forced = FALLBACK_ROTATION.iter().copied().find(|&p| p != natural).unwrap_or(natural);
            (forced, true)
        } else {
            (natural, false)
        }
    }

    /// All objectives across all three levels report status "completed".
    /// An empty objective set is not exhausted: objectives simply haven't
    /// been created yet (that's `planning`'s job, not `documentation`'s).
    fn objectives_exhausted(&self) -> bool {
        let objectives = &self.store.state().objectives;
        if objectives.values().all(|level| level.is_empty()) {
            return false;
        }
        objectives.values().flatten().all(|o| o.status.eq_ignore_ascii_case("completed"))
    }

    fn has_pending_work(&self) -> bool {
        let state = self.store.state();
        state.tasks.values().any(|t| t.status.is_live()) || !self.objectives_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{DimensionalProfile, ObjectiveLevel, ObjectiveRecord, Priority, TaskState};
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> RunConfig {
        RunConfig {
            project_dir: dir.to_path_buf(),
            state_dir: dir.join("state"),
            ipc_dir: dir.join("ipc"),
            endpoints: vec!["http://localhost:8080".to_string()],
            deny_tools: Vec::new(),
            stagnation_threshold: 3,
            context_tokens: 8000,
            tool_deadline_secs: 120,
            log_level: "info".to_string(),
            log_dir: dir.join("state/logs"),
            model_assignments: StdHashMap::new(),
        }
    }

    fn objective(id: &str, status: &str) -> ObjectiveRecord {
        ObjectiveRecord {
            id: id.to_string(),
            title: "Build CLI tool".to_string(),
            description: String::new(),
            status: status.to_string(),
            priority: Priority::High,
            success_criteria: Vec::new(),
            dependencies: Vec::new(),
            dimensional_profile: DimensionalProfile::default(),
            tasks: Vec::new(),
        }
    }

    #[test]
    fn decide_phase_picks_debugging_for_needs_fixes_rule_a() {
        let dir = tempdir().unwrap();
        let coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut coordinator = coordinator;
        let mut task = TaskState::new("T1", "fix it");
        task.status = TaskStatus::NeedsFixes;
        coordinator.store.put_task(task);
        assert_eq!(coordinator.decide_phase(), ("debugging", false));
    }

    #[test]
    fn decide_phase_picks_qa_over_coding_rule_b() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut qa_task = TaskState::new("T1", "qa me");
        qa_task.status = TaskStatus::QaPending;
        coordinator.store.put_task(qa_task);
        let mut new_task = TaskState::new("T2", "code me");
        new_task.status = TaskStatus::New;
        coordinator.store.put_task(new_task);
        assert_eq!(coordinator.decide_phase(), ("qa", false));
    }

    #[test]
    fn decide_phase_picks_planning_when_no_tasks_rule_d() {
        let dir = tempdir().unwrap();
        let coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        assert_eq!(coordinator.decide_phase(), ("planning", false));
    }

    #[test]
    fn decide_phase_picks_project_planning_when_all_completed_and_objectives_open_rule_e() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut task = TaskState::new("T1", "done");
        task.status = TaskStatus::Completed;
        coordinator.store.put_task(task);
        coordinator
            .store
            .state_mut()
            .objectives
            .entry(ObjectiveLevel::Primary)
            .or_default()
            .push(objective("primary_001", "active"));
        assert_eq!(coordinator.decide_phase(), ("project_planning", false));
    }

    #[test]
    fn decide_phase_picks_documentation_once_all_objectives_satisfied_rule_f() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut task = TaskState::new("T1", "done");
        task.status = TaskStatus::Completed;
        coordinator.store.put_task(task);
        coordinator
            .store
            .state_mut()
            .objectives
            .entry(ObjectiveLevel::Primary)
            .or_default()
            .push(objective("primary_001", "completed"));
        assert_eq!(coordinator.decide_phase(), ("documentation", false));
    }

    #[test]
    fn decide_phase_forces_rotation_on_stagnation_s5() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        coordinator.store.increment_no_update_count("planning");
        coordinator.store.increment_no_update_count("planning");
        coordinator.store.increment_no_update_count("planning");
        let (phase, forced) = coordinator.decide_phase();
        assert!(forced);
        assert_ne!(phase, "planning");
        assert!(FALLBACK_ROTATION.contains(&phase));
    }

    #[test]
    fn objectives_exhausted_is_false_when_none_exist() {
        let dir = tempdir().unwrap();
        let coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        assert!(!coordinator.objectives_exhausted());
    }

    #[test]
    fn objectives_exhausted_requires_every_objective_completed() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        coordinator
            .store
            .state_mut()
            .objectives
            .entry(ObjectiveLevel::Primary)
            .or_default()
            .push(objective("primary_001", "active"));
        assert!(!coordinator.objectives_exhausted());
        coordinator.store.state_mut().objectives.get_mut(&ObjectiveLevel::Primary).unwrap()[0].status = "completed".to_string();
        assert!(coordinator.objectives_exhausted());
    }

    #[test]
    fn has_pending_work_true_with_live_task() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        coordinator.store.put_task(TaskState::new("T1", "x"));
        assert!(coordinator.has_pending_work());
    }

    #[test]
    fn has_pending_work_false_once_everything_is_terminal_and_exhausted() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut task = TaskState::new("T1", "done");
        task.status = TaskStatus::Completed;
        coordinator.store.put_task(task);
        coordinator
            .store
            .state_mut()
            .objectives
            .entry(ObjectiveLevel::Primary)
            .or_default()
            .push(objective("primary_001", "completed"));
        assert!(!coordinator.has_pending_work());
    }

    #[test]
    fn sync_objectives_to_disk_writes_task_linkage_to_file_s1() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        let mut primary = objective("primary_001", "active");
        primary.tasks.push("T1".to_string());
        coordinator.store.state_mut().objectives.entry(ObjectiveLevel::Primary).or_default().push(primary);

        coordinator.sync_objectives_to_disk(&StdHashMap::new()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("PRIMARY_OBJECTIVES.md")).unwrap();
        let reloaded = crate::ipc::objectives::parse_objectives(&raw).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].id, "primary_001");
        assert_eq!(reloaded[0].tasks, vec!["T1".to_string()]);
    }

    #[test]
    fn check_state_cycle_raises_after_two_unchanged_iterations() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        coordinator.detectors.entry("debugging".to_string()).or_default();

        coordinator.check_state_cycle("debugging");
        assert_eq!(coordinator.state_hashes["debugging"].1, 1);
        coordinator.check_state_cycle("debugging");
        assert_eq!(coordinator.state_hashes["debugging"].1, 2);
    }

    #[test]
    fn check_state_cycle_resets_count_when_state_changes() {
        let dir = tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
        coordinator.detectors.entry("debugging".to_string()).or_default();

        coordinator.check_state_cycle("debugging");
        coordinator.store.put_task(TaskState::new("T1", "x"));
        coordinator.check_state_cycle("debugging");
        assert_eq!(coordinator.state_hashes["debugging"].1, 1);
    }

    #[test]
    fn new_acquires_lock_and_a_second_coordinator_fails() {
        let dir = tempdir().unwrap();
        let _first = Coordinator::new(test_config(dir.path())).unwrap();
        let second = Coordinator::new(test_config(dir.path()));
        assert!(second.is_err());
    }
}
