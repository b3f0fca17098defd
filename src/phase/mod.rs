//! Phase execution substrate (C9, §4.2): the eight-step algorithm shared
//! by all 14 phase configurations. `PhaseSpec` supplies the per-phase
//! data (context sources, prompt template, tool categories, result
//! handlers); this module supplies the loop every phase runs through.

pub mod context;
pub mod specs;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{AskUserRequired, PhaseExecutionError};
use crate::ipc::{self, IpcDocument};
use crate::llm::{ChatMessage, ConversationThread, LlmClient, Message, Role};
use crate::patterns::{signature_similarity, ActionLogEntry, LoopDetector, LoopKind, PatternStore};
use crate::state::types::{
    FileState, FileStatus, PatternKind, PhaseResult, PipelineState, TaskError, TaskState, TaskStatus, ToolCall, ToolResult,
};
use crate::tools::{ToolDispatcher, ToolRegistry};

pub use context::{ContextFilter, ContextSource};
pub use specs::{all_phase_specs, spec_by_name, PhaseSpec, ResultHandler};

/// What one `execute` call produced, for the coordinator's `no_update_count`
/// bookkeeping and phase-state recording.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub result: PhaseResult,
    pub state_changed: bool,
    pub tool_call_count: usize,
}

/// Run one phase turn against its spec: gather context, call the model,
/// dispatch its tool calls, apply result handlers, record a pattern.
///
/// Returns `Err(PhaseExecutionError::AskUser(..))` when the loop detector
/// escalates mid-turn (step 6); any state mutations already applied from
/// calls dispatched before the escalation are kept.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    spec: &PhaseSpec,
    project_dir: &Path,
    state: &mut PipelineState,
    thread: &mut ConversationThread,
    loop_detector: &mut LoopDetector,
    patterns: &mut PatternStore,
    registry: &mut ToolRegistry,
    llm: &LlmClient,
    architecture_doc: Option<&IpcDocument>,
    ipc_docs: &std::collections::HashMap<String, IpcDocument>,
    context_budget: usize,
    tool_deadline: Duration,
    now: DateTime<Utc>,
) -> Result<PhaseOutcome, PhaseExecutionError> {
    // Step 1: gather context, stopping once the budget is exhausted.
    let mut remaining = context_budget;
    let mut sections = Vec::new();
    for source in &spec.context_sources {
        if remaining == 0 {
            break;
        }
        let (text, used) = context::resolve(source, state, architecture_doc, ipc_docs, &spec.context_filter, remaining);
        remaining = remaining.saturating_sub(used);
        if !text.trim().is_empty() {
            sections.push(format!("### {}\n{}", source_label(source), text));
        }
    }

    let recommendations = patterns.recommendations_for(spec.name);
    if !recommendations.is_empty() {
        let rendered = recommendations
            .iter()
            .map(|p| format!("- [{:?}] {} (confidence {:.2})", p.kind, p.signature, p.confidence))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("### Suggested approaches (advisory)\n{rendered}"));
    }

    // Step 2: build the user message for this turn.
    let user_message = format!("Phase: {}\n\n{}", spec.prompt_template, sections.join("\n\n"));
    thread.push(Message::new(Role::User, user_message));
    thread.prune(now);

    // Step 3: select tools available to this phase.
    let tools: Vec<_> = registry.tools_for(&spec.tool_categories).into_iter().cloned().collect();

    // Step 4: call the model.
    let resolved = llm.model_for(spec.model_role)?;
    let chat_messages: Vec<ChatMessage> = thread
        .messages()
        .iter()
        .map(|m| ChatMessage { role: role_str(m.role), content: m.content.clone() })
        .collect();
    let response = llm.chat(&resolved, &chat_messages, &tools, tool_deadline).await?;
    thread.push(Message::new(Role::Assistant, response.content.clone()));

    // Step 5 + 6: dispatch tool calls in order, loop-checking after each.
    let mut dispatcher = ToolDispatcher::new(registry, project_dir);
    let mut results: Vec<(ToolCall, ToolResult)> = Vec::new();
    let mut escalation: Option<AskUserRequired> = None;

    for raw_call in &response.tool_calls {
        let call = if spec.name == "qa" { coerce_qa_call(raw_call.clone()) } else { raw_call.clone() };
        let result = dispatcher.dispatch(spec.name, &call);

        let entry = ActionLogEntry {
            phase: spec.name.to_string(),
            tool: call.name.clone(),
            argument_signature: call.arguments.to_string(),
            timestamp: now,
            success: result.success,
        };
        let mut verdict = loop_detector.observe(entry, &recommendations);

        // `check_dependency_cycle` is the one analysis tool that detects a
        // loop kind directly rather than through the action log (§4.7).
        if call.name == "check_dependency_cycle" && result.success {
            let cycle_found = result.output.as_ref().and_then(|o| o.get("cycle_found")).and_then(Value::as_bool).unwrap_or(false);
            if cycle_found {
                let cycle = result.output.as_ref().and_then(|o| o.get("cycle")).cloned().unwrap_or(Value::Null);
                verdict = loop_detector.raise(LoopKind::CircularDependency, format!("import cycle detected: {cycle}"));
            }
        }

        thread.push(Message::new(Role::Tool, render_tool_result(&call, &result)));
        results.push((call, result));

        if verdict.must_intervene {
            escalation = Some(AskUserRequired {
                phase: spec.name.to_string(),
                reason: verdict.suggestion.clone(),
                task_id: None,
            });
            break;
        }
    }

    // Step 7: apply result handlers to whatever was dispatched so far.
    let state_changed = apply_result_handlers(spec, project_dir, state, &results, now, &response.content)?;

    // Step 8: record an execution pattern for this turn.
    let kind = if results.is_empty() {
        None
    } else if results.iter().all(|(_, r)| r.success) {
        Some(PatternKind::Success)
    } else if results.iter().all(|(_, r)| !r.success) {
        Some(PatternKind::Failure)
    } else {
        Some(PatternKind::ToolSequence)
    };
    if let Some(kind) = kind {
        let signature = format!("{}:{}", spec.name, results.iter().map(|(c, _)| c.name.as_str()).collect::<Vec<_>>().join(","));
        patterns.record(kind, signature, now);
    }

    if let Some(escalation) = escalation {
        return Err(escalation.into());
    }

    let tool_call_count = results.len();
    let result = if results.is_empty() {
        PhaseResult::NoOp
    } else if results.iter().all(|(_, r)| !r.success) {
        PhaseResult::Failure
    } else {
        PhaseResult::Success
    };

    Ok(PhaseOutcome { result, state_changed, tool_call_count })
}

fn source_label(source: &ContextSource) -> String {
    match source {
        ContextSource::Architecture => "Architecture".to_string(),
        ContextSource::Ipc(name) => format!("IPC: {name}"),
        ContextSource::StateTasks => "Tasks".to_string(),
        ContextSource::StateFiles => "Files".to_string(),
        ContextSource::Analysis(kind) => format!("Analysis: {kind}"),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn render_tool_result(call: &ToolCall, result: &ToolResult) -> String {
    if result.success {
        format!("{} -> {}", call.name, result.output.clone().unwrap_or(Value::Null))
    } else {
        format!("{} failed: {}", call.name, result.error.clone().unwrap_or_default())
    }
}

/// B1: a blank tool-call name is a dialect the model used without naming
/// its call explicitly. qa's two legal calls are distinguished by which
/// fields are present: issue-shaped arguments mean `report_issue`,
/// anything else defaults to `approve_code`.
fn coerce_qa_call(call: ToolCall) -> ToolCall {
    if !call.name.is_empty() {
        return call;
    }
    let looks_like_issue = call.arguments.get("issue_type").is_some()
        || call.arguments.get("description").is_some()
        || call.arguments.get("line_number").is_some();
    let name = if looks_like_issue { "report_issue" } else { "approve_code" };
    ToolCall { name: name.to_string(), ..call }
}

fn apply_result_handlers(
    spec: &PhaseSpec,
    project_dir: &Path,
    state: &mut PipelineState,
    results: &[(ToolCall, ToolResult)],
    now: DateTime<Utc>,
    response_content: &str,
) -> Result<bool, PhaseExecutionError> {
    let mut changed = false;
    for handler in &spec.result_handlers {
        changed |= match handler {
            ResultHandler::TaskCreator => apply_task_creator(state, results, now),
            ResultHandler::FileWriter => apply_file_writer(state, results, now, spec.name),
            ResultHandler::IpcSender => apply_ipc_sender(project_dir, spec.name, results, now)?,
            ResultHandler::QaOutcome => apply_qa_outcome(state, results, now, response_content),
            ResultHandler::DebuggingOutcome => apply_debugging_outcome(state, results, now, spec.name),
        };
    }
    Ok(changed)
}

/// Planning's duplicate-task guard: a `create_task` whose description is
/// ≥ 0.8 Jaccard-similar to an existing task's is silently dropped rather
/// than creating a near-duplicate.
///
/// A call that names an `objective_id` links the new task to it (I2): the
/// id is stamped onto the task, and the task id is appended to the
/// objective's own `tasks` list in the same step so the invariant holds
/// the moment the call is applied.
fn apply_task_creator(state: &mut PipelineState, results: &[(ToolCall, ToolResult)], now: DateTime<Utc>) -> bool {
    const DUPLICATE_THRESHOLD: f64 = 0.8;
    let mut changed = false;
    for (call, result) in results {
        if call.name != "create_task" || !result.success {
            continue;
        }
        let description = call.arguments.get("description").and_then(Value::as_str).unwrap_or("untitled task").to_string();
        let is_duplicate = state.tasks.values().any(|t| signature_similarity(&t.description, &description) >= DUPLICATE_THRESHOLD);
        if is_duplicate {
            continue;
        }
        let id = result
            .output
            .as_ref()
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("task_{}", call.call_id));
        let objective_id = call.arguments.get("objective_id").and_then(Value::as_str).map(str::to_string);

        let mut task = TaskState::new(&id, &description);
        task.created_at = now;
        task.updated_at = now;
        task.objective_id = objective_id.clone();
        state.tasks.insert(id.clone(), task);

        if let Some(objective_id) = objective_id {
            if let Some(objective) = state.objectives.values_mut().flatten().find(|o| o.id == objective_id) {
                if !objective.tasks.contains(&id) {
                    objective.tasks.push(id);
                }
            }
        }
        changed = true;
    }
    changed
}

fn apply_file_writer(state: &mut PipelineState, results: &[(ToolCall, ToolResult)], _now: DateTime<Utc>, phase: &str) -> bool {
    let mut changed = false;
    for (call, result) in results {
        if !result.success || (call.name != "write_file" && call.name != "str_replace") {
            continue;
        }
        let Some(path) = call.arguments.get("path").and_then(Value::as_str) else { continue };
        let entry = state.files.entry(path.to_string()).or_insert_with(|| FileState::new(path));
        entry.status = if entry.status == FileStatus::Unknown { FileStatus::Created } else { FileStatus::Modified };
        entry.last_modified_by_phase = Some(phase.to_string());
        changed = true;
    }
    changed
}

/// Appends a turn summary to the phase's IPC WRITE document so downstream
/// phases and human reviewers can see what happened without replaying the
/// conversation thread.
fn apply_ipc_sender(project_dir: &Path, phase: &str, results: &[(ToolCall, ToolResult)], now: DateTime<Utc>) -> Result<bool, PhaseExecutionError> {
    if results.is_empty() {
        return Ok(false);
    }
    let path = ipc::write_doc_path(project_dir, phase);
    let mut doc = ipc::document::load_or_init(&path, &format!("# {phase} output\n"))?;
    let summary = results
        .iter()
        .map(|(call, result)| {
            if result.success {
                format!("- {} succeeded", call.name)
            } else {
                format!("- {} failed: {}", call.name, result.error.clone().unwrap_or_default())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    doc.append_section(&format!("Turn {}", now.to_rfc3339()), &summary);
    ipc::document::save(&path, &doc)?;
    Ok(true)
}

/// Resolves a qa tool call to the task it's about: by explicit `task_id`, by
/// a `filepath`/`path` argument matched against a task's file set, or — if
/// neither is given and exactly one task is awaiting QA — that task.
fn find_task_id_for_call(state: &PipelineState, call: &ToolCall) -> Option<String> {
    if let Some(task_id) = call.arguments.get("task_id").and_then(Value::as_str) {
        if state.tasks.contains_key(task_id) {
            return Some(task_id.to_string());
        }
    }
    if let Some(path) = call.arguments.get("filepath").or_else(|| call.arguments.get("path")).and_then(Value::as_str) {
        if let Some((id, _)) = state.tasks.iter().find(|(_, t)| t.files.contains(path)) {
            return Some(id.clone());
        }
    }
    find_single_qa_pending_task_id(state)
}

fn find_single_qa_pending_task_id(state: &PipelineState) -> Option<String> {
    let mut pending = state.tasks.iter().filter(|(_, t)| t.status == TaskStatus::QaPending).map(|(id, _)| id.clone());
    let only = pending.next()?;
    if pending.next().is_some() {
        return None;
    }
    Some(only)
}

/// Completes a task and marks each of its files VERIFIED (spec.md's QA
/// approval postcondition), whether the approval arrived as a dispatched
/// `approve_code` call or as free-text content (S2).
fn complete_task_and_verify_files(state: &mut PipelineState, task_id: &str, now: DateTime<Utc>) {
    let file_paths: Vec<String> = state.tasks.get(task_id).map(|t| t.files.iter().cloned().collect()).unwrap_or_default();
    if let Some(task) = state.tasks.get_mut(task_id) {
        task.transition(TaskStatus::Completed, now);
    }
    for path in file_paths {
        if let Some(file) = state.files.get_mut(&path) {
            file.status = FileStatus::Verified;
        }
    }
}

/// S2: the model can approve by returning no tool calls at all and just
/// saying so in its response text, rather than calling `approve_code`.
fn looks_like_approval(response_content: &str) -> bool {
    response_content.to_uppercase().contains("APPROVED")
}

fn apply_qa_outcome(state: &mut PipelineState, results: &[(ToolCall, ToolResult)], now: DateTime<Utc>, response_content: &str) -> bool {
    let mut changed = false;
    for (call, result) in results {
        if !result.success {
            continue;
        }
        match call.name.as_str() {
            "report_issue" => {
                if let Some(task_id) = find_task_id_for_call(state, call) {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.transition(TaskStatus::QaFailed, now);
                    }
                    changed = true;
                }
            }
            "approve_code" => {
                if let Some(task_id) = find_task_id_for_call(state, call) {
                    complete_task_and_verify_files(state, &task_id, now);
                    changed = true;
                }
            }
            _ => {}
        }
    }

    if results.is_empty() && looks_like_approval(response_content) {
        if let Some(task_id) = find_single_qa_pending_task_id(state) {
            complete_task_and_verify_files(state, &task_id, now);
            changed = true;
        }
    }
    changed
}

/// A failed edit on a task's file records the failure and sends the task
/// back to `NeedsFixes` (accumulated errors survive per B3); a successful
/// edit on a task already in `NeedsFixes`/`QaFailed` sends it back to QA.
fn apply_debugging_outcome(state: &mut PipelineState, results: &[(ToolCall, ToolResult)], now: DateTime<Utc>, phase: &str) -> bool {
    let mut changed = false;
    for (call, result) in results {
        if call.name != "write_file" && call.name != "str_replace" {
            continue;
        }
        let Some(path) = call.arguments.get("path").and_then(Value::as_str).map(str::to_string) else { continue };
        let Some(task) = state.tasks.values_mut().find(|t| t.files.contains(&path)) else { continue };

        if result.success {
            if matches!(task.status, TaskStatus::NeedsFixes | TaskStatus::QaFailed) {
                task.transition(TaskStatus::QaPending, now);
                changed = true;
            }
        } else {
            task.record_error(
                TaskError {
                    phase: phase.to_string(),
                    kind: "tool_failure".to_string(),
                    message: result.error.clone().unwrap_or_default(),
                    file: Some(path),
                    line: None,
                    timestamp: now,
                    file_snapshot: None,
                },
                now,
            );
            task.transition(TaskStatus::NeedsFixes, now);
            changed = true;
        }
    }
    changed
}
