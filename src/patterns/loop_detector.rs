//! LoopDetector (C5, §4.7): observes a phase's action stream and raises
//! loop signals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::types::{ExecutionPattern, PatternKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    ActionRepeat,
    ModificationLoop,
    ConversationLoop,
    CircularDependency,
    StateCycle,
    PatternRepetition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopVerdict {
    pub detected: bool,
    pub kind: Option<LoopKind>,
    pub severity: Option<Severity>,
    pub suggestion: String,
    pub must_intervene: bool,
}

impl LoopVerdict {
    fn clean() -> Self {
        Self { detected: false, kind: None, severity: None, suggestion: String::new(), must_intervene: false }
    }
}

#[derive(Debug, Clone)]
pub struct ActionLogEntry {
    pub phase: String,
    pub tool: String,
    pub argument_signature: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

fn threshold_for(kind: LoopKind) -> u32 {
    match kind {
        LoopKind::ActionRepeat => 3,
        LoopKind::ModificationLoop => 4,
        LoopKind::ConversationLoop => 3,
        LoopKind::CircularDependency => 1,
        LoopKind::StateCycle => 2,
        LoopKind::PatternRepetition => 2,
    }
}

/// Rolling action log for one phase invocation (one "session"). Archived
/// (dropped) once the phase invocation ends so it can't cause false
/// positives in the next session.
pub struct LoopDetector {
    log: Vec<ActionLogEntry>,
    /// Count of `must_intervene` verdicts already raised this session, per
    /// kind, so a repeated non-critical loop escalates after the third hit.
    interventions: HashMap<LoopKind, u32>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self { log: Vec::new(), interventions: HashMap::new() }
    }

    /// Start a new session, discarding the prior one's log.
    pub fn reset_session(&mut self) {
        self.log.clear();
        self.interventions.clear();
    }

    /// Record one action and evaluate every loop kind. Returns the most
    /// severe verdict detected, or a clean verdict if none triggered.
    ///
    /// `recommendations` is the calling phase's advisory pattern list (C6,
    /// `PatternStore::recommendations_for`) — a session-local action log
    /// alone can't see a failure pattern learned across prior sessions, so
    /// `check_pattern_repetition` is driven by it instead of `self.log`.
    pub fn observe(&mut self, entry: ActionLogEntry, recommendations: &[&ExecutionPattern]) -> LoopVerdict {
        self.log.push(entry);

        let mut verdicts = Vec::new();
        if let Some(v) = self.check_action_repeat() {
            verdicts.push(v);
        }
        if let Some(v) = self.check_modification_loop() {
            verdicts.push(v);
        }
        if let Some(v) = self.check_conversation_loop() {
            verdicts.push(v);
        }
        if let Some(v) = self.check_pattern_repetition(recommendations) {
            verdicts.push(v);
        }

        let Some(mut verdict) = verdicts.into_iter().max_by_key(|v| v.severity) else {
            return LoopVerdict::clean();
        };

        let kind = verdict.kind.expect("verdict with severity always has a kind");
        let count = self.interventions.entry(kind).or_insert(0);
        *count += 1;
        verdict.must_intervene = matches!(verdict.severity, Some(Severity::Critical)) || *count >= 3;
        verdict
    }

    /// `circular_dependency` and `state_cycle` are raised directly by the
    /// caller (an analysis tool result, or a state-hash comparison) rather
    /// than inferred from the action log; this records that signal and
    /// folds it into the intervention count the same way `observe` does.
    pub fn raise(&mut self, kind: LoopKind, suggestion: impl Into<String>) -> LoopVerdict {
        let severity = if matches!(kind, LoopKind::CircularDependency) { Severity::Critical } else { Severity::High };
        let count = self.interventions.entry(kind).or_insert(0);
        *count += 1;
        LoopVerdict {
            detected: true,
            kind: Some(kind),
            severity: Some(severity),
            suggestion: suggestion.into(),
            must_intervene: matches!(severity, Severity::Critical) || *count >= 3,
        }
    }

    fn check_action_repeat(&self) -> Option<LoopVerdict> {
        let Some(last) = self.log.last() else { return None };
        let count = self
            .log
            .iter()
            .filter(|e| e.tool == last.tool && e.argument_signature == last.argument_signature)
            .count() as u32;
        let threshold = threshold_for(LoopKind::ActionRepeat);
        if count >= threshold {
            Some(LoopVerdict {
                detected: true,
                kind: Some(LoopKind::ActionRepeat),
                severity: Some(severity_for_overshoot(count, threshold)),
                suggestion: format!("'{}' has been called identically {count} times; try a different approach", last.tool),
                must_intervene: false,
            })
        } else {
            None
        }
    }

    /// B2: modifying many distinct files in coding is normal development,
    /// not a loop. Only the *same path* repeated ≥ 4 times counts.
    fn check_modification_loop(&self) -> Option<LoopVerdict> {
        let Some(last) = self.log.last() else { return None };
        if !is_modifying_tool(&last.tool) {
            return None;
        }
        let count = self
            .log
            .iter()
            .filter(|e| is_modifying_tool(&e.tool) && e.argument_signature == last.argument_signature)
            .count() as u32;
        let threshold = threshold_for(LoopKind::ModificationLoop);
        if count >= threshold {
            Some(LoopVerdict {
                detected: true,
                kind: Some(LoopKind::ModificationLoop),
                severity: Some(severity_for_overshoot(count, threshold)),
                suggestion: "the same file has been modified repeatedly; reconsider the approach".to_string(),
                must_intervene: false,
            })
        } else {
            None
        }
    }

    fn check_conversation_loop(&self) -> Option<LoopVerdict> {
        let Some(last) = self.log.last() else { return None };
        if last.tool != "read_file" {
            return None;
        }
        let count = self
            .log
            .iter()
            .filter(|e| e.tool == "read_file" && e.argument_signature == last.argument_signature)
            .count() as u32;
        let threshold = threshold_for(LoopKind::ConversationLoop);
        if count >= threshold {
            Some(LoopVerdict {
                detected: true,
                kind: Some(LoopKind::ConversationLoop),
                severity: Some(severity_for_overshoot(count, threshold)),
                suggestion: "the same file is being re-read without any action taken".to_string(),
                must_intervene: false,
            })
        } else {
            None
        }
    }

    /// §4.7's `pattern_repetition`: the action just taken matches a recorded
    /// Failure pattern already recommended for this phase, which means this
    /// session is repeating a mistake prior sessions already made.
    fn check_pattern_repetition(&self, recommendations: &[&ExecutionPattern]) -> Option<LoopVerdict> {
        let last = self.log.last()?;
        let threshold = threshold_for(LoopKind::PatternRepetition);
        let hit = recommendations
            .iter()
            .filter(|p| p.kind == PatternKind::Failure && p.signature.contains(&last.tool))
            .max_by_key(|p| p.occurrences)?;
        if hit.occurrences < threshold {
            return None;
        }
        Some(LoopVerdict {
            detected: true,
            kind: Some(LoopKind::PatternRepetition),
            severity: Some(severity_for_overshoot(hit.occurrences, threshold)),
            suggestion: format!("'{}' matches a recorded failure pattern seen {} times; try a different approach", last.tool, hit.occurrences),
            must_intervene: false,
        })
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_modifying_tool(tool: &str) -> bool {
    matches!(tool, "write_file" | "str_replace")
}

fn severity_for_overshoot(count: u32, threshold: u32) -> Severity {
    if count >= threshold * 2 {
        Severity::Critical
    } else if count > threshold {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tool: &str, sig: &str) -> ActionLogEntry {
        ActionLogEntry {
            phase: "debugging".to_string(),
            tool: tool.to_string(),
            argument_signature: sig.to_string(),
            timestamp: Utc::now(),
            success: true,
        }
    }

    #[test]
    fn action_repeat_triggers_at_threshold_s4() {
        let mut detector = LoopDetector::new();
        assert!(!detector.observe(entry("str_replace", "a.rs:foo->bar"), &[]).detected);
        assert!(!detector.observe(entry("str_replace", "a.rs:foo->bar"), &[]).detected);
        let verdict = detector.observe(entry("str_replace", "a.rs:foo->bar"), &[]);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some(LoopKind::ActionRepeat));
    }

    #[test]
    fn must_intervene_after_three_interventions_same_kind() {
        let mut detector = LoopDetector::new();
        // The first two pushes stay under the action_repeat threshold (3);
        // the 3rd, 4th and 5th each trigger a verdict, so the 5th push is
        // this kind's third intervention.
        for _ in 0..4 {
            detector.observe(entry("str_replace", "a.rs:x"), &[]);
        }
        let verdict = detector.observe(entry("str_replace", "a.rs:x"), &[]);
        assert!(verdict.must_intervene);
    }

    #[test]
    fn coding_four_distinct_files_does_not_trigger_modification_loop_b2() {
        let mut detector = LoopDetector::new();
        for i in 0..4 {
            let verdict = detector.observe(entry("write_file", &format!("file_{i}.rs")), &[]);
            assert!(!verdict.detected, "distinct files must not trigger modification_loop");
        }
    }

    #[test]
    fn same_file_modified_four_times_triggers_modification_loop() {
        let mut detector = LoopDetector::new();
        for _ in 0..3 {
            detector.observe(entry("write_file", "a.rs"), &[]);
        }
        let verdict = detector.observe(entry("write_file", "a.rs"), &[]);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some(LoopKind::ModificationLoop));
    }

    #[test]
    fn conversation_loop_triggers_on_repeated_reads() {
        let mut detector = LoopDetector::new();
        detector.observe(entry("read_file", "a.rs"), &[]);
        detector.observe(entry("read_file", "a.rs"), &[]);
        let verdict = detector.observe(entry("read_file", "a.rs"), &[]);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some(LoopKind::ConversationLoop));
    }

    #[test]
    fn reset_session_clears_log_and_interventions() {
        let mut detector = LoopDetector::new();
        for _ in 0..3 {
            detector.observe(entry("str_replace", "a.rs:x"), &[]);
        }
        detector.reset_session();
        let verdict = detector.observe(entry("str_replace", "a.rs:x"), &[]);
        assert!(!verdict.detected);
    }

    #[test]
    fn circular_dependency_is_always_critical_and_must_intervene() {
        let mut detector = LoopDetector::new();
        let verdict = detector.raise(LoopKind::CircularDependency, "import cycle: a -> b -> a");
        assert_eq!(verdict.severity, Some(Severity::Critical));
        assert!(verdict.must_intervene);
    }

    #[test]
    fn pattern_repetition_triggers_on_recommended_failure_pattern() {
        let mut detector = LoopDetector::new();
        let pattern = ExecutionPattern {
            kind: PatternKind::Failure,
            signature: "debugging:str_replace".to_string(),
            occurrences: 5,
            confidence: 0.9,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            attributes: Default::default(),
        };
        let verdict = detector.observe(entry("str_replace", "a.rs:x"), &[&pattern]);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some(LoopKind::PatternRepetition));
    }

    #[test]
    fn pattern_repetition_does_not_trigger_below_threshold() {
        let mut detector = LoopDetector::new();
        let pattern = ExecutionPattern {
            kind: PatternKind::Failure,
            signature: "debugging:str_replace".to_string(),
            occurrences: 1,
            confidence: 0.9,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            attributes: Default::default(),
        };
        let verdict = detector.observe(entry("str_replace", "a.rs:x"), &[&pattern]);
        assert!(!verdict.detected);
    }
}
