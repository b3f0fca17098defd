//! PatternStore (C6, §4.7): recognized execution patterns with confidence
//! scoring and advisory recommendations.

use chrono::{DateTime, Utc};

use crate::state::types::{ExecutionPattern, PatternKind};

const CONFIDENCE_K: f64 = 0.1;
const CONFIDENCE_CAP: f64 = 0.95;
const FAILURE_THRESHOLD: f64 = 0.7;
const SUCCESS_THRESHOLD: f64 = 0.8;
const MAX_RECOMMENDATIONS: usize = 5;
const COMPACTION_INTERVAL: u64 = 50;
const LOW_CONFIDENCE_FLOOR: f64 = 0.3;
const STALE_DAYS: i64 = 90;
const MERGE_SIMILARITY: f64 = 0.85;

pub struct PatternStore {
    patterns: Vec<ExecutionPattern>,
    executions_since_compaction: u64,
}

impl PatternStore {
    pub fn new() -> Self {
        Self { patterns: Vec::new(), executions_since_compaction: 0 }
    }

    pub fn from_patterns(patterns: Vec<ExecutionPattern>) -> Self {
        Self { patterns, executions_since_compaction: 0 }
    }

    pub fn patterns(&self) -> &[ExecutionPattern] {
        &self.patterns
    }

    /// Record one occurrence, deduplicated by canonical signature.
    /// I3: confidence is non-decreasing in occurrence count and capped.
    pub fn record(&mut self, kind: PatternKind, signature: impl Into<String>, now: DateTime<Utc>) {
        let signature = signature.into();
        if let Some(existing) = self.patterns.iter_mut().find(|p| p.kind == kind && p.signature == signature) {
            existing.occurrences += 1;
            existing.confidence = (existing.confidence + CONFIDENCE_K / (existing.occurrences as f64)).min(CONFIDENCE_CAP);
            existing.last_seen = now;
        } else {
            self.patterns.push(ExecutionPattern {
                kind,
                signature,
                occurrences: 1,
                confidence: CONFIDENCE_K,
                first_seen: now,
                last_seen: now,
                attributes: Default::default(),
            });
        }

        self.executions_since_compaction += 1;
        if self.executions_since_compaction >= COMPACTION_INTERVAL {
            self.compact(now);
            self.executions_since_compaction = 0;
        }
    }

    /// Advisory recommendations for `context` (a signature prefix or exact
    /// match), filtered by confidence and capped at five, highest first.
    pub fn recommendations_for(&self, context: &str) -> Vec<&ExecutionPattern> {
        let mut matches: Vec<&ExecutionPattern> = self
            .patterns
            .iter()
            .filter(|p| p.signature.contains(context))
            .filter(|p| {
                let threshold = match p.kind {
                    PatternKind::Failure => FAILURE_THRESHOLD,
                    PatternKind::Success => SUCCESS_THRESHOLD,
                    _ => FAILURE_THRESHOLD,
                };
                p.confidence >= threshold
            })
            .collect();
        matches.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
        matches.truncate(MAX_RECOMMENDATIONS);
        matches
    }

    /// Drop low-confidence patterns, archive (here: drop — there is no
    /// separate archive store) ones unused for ≥ 90 days, and merge near-
    /// duplicate pairs.
    pub fn compact(&mut self, now: DateTime<Utc>) {
        self.patterns.retain(|p| p.confidence >= LOW_CONFIDENCE_FLOOR);
        self.patterns.retain(|p| (now - p.last_seen).num_days() < STALE_DAYS);
        self.merge_similar();
    }

    fn merge_similar(&mut self) {
        let mut merged: Vec<ExecutionPattern> = Vec::new();
        'outer: for pattern in self.patterns.drain(..) {
            for existing in merged.iter_mut() {
                if existing.kind == pattern.kind && signature_similarity(&existing.signature, &pattern.signature) >= MERGE_SIMILARITY {
                    existing.occurrences += pattern.occurrences;
                    existing.confidence = existing.confidence.max(pattern.confidence).min(CONFIDENCE_CAP);
                    existing.last_seen = existing.last_seen.max(pattern.last_seen);
                    continue 'outer;
                }
            }
            merged.push(pattern);
        }
        self.patterns = merged;
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-set Jaccard similarity, reused for both pattern merging and the
/// planning phase's duplicate-task detection (§4.2a).
pub fn signature_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
