//! ConversationThread (C8, §4.5): bounded, pruned chat history owned by
//! one phase instance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const PRESERVE_FIRST: usize = 5;
const PRESERVE_LAST: usize = 20;
const SUMMARY_TOKEN_BUDGET: usize = 512;
const PRUNE_CANDIDATE_MIN_AGE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<bool>,
}

impl MessageAttributes {
    fn preserved(&self) -> bool {
        self.error.unwrap_or(false) || self.decision.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: MessageAttributes,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now(), attributes: MessageAttributes::default() }
    }

    pub fn tagged_error(mut self) -> Self {
        self.attributes.error = Some(true);
        self
    }

    pub fn tagged_decision(mut self) -> Self {
        self.attributes.decision = Some(true);
        self
    }
}

/// Rough token estimate: ~4 characters per token, matching the
/// conservative heuristic the corpus uses elsewhere for context budgeting.
fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub model: String,
    pub role_label: String,
    pub token_budget: usize,
    messages: Vec<Message>,
}

impl ConversationThread {
    pub fn new(model: impl Into<String>, role_label: impl Into<String>, token_budget: usize) -> Self {
        Self { model: model.into(), role_label: role_label.into(), token_budget, messages: Vec::new() }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn total_tokens(&self) -> usize {
        self.messages.iter().map(|m| estimate_tokens(&m.content)).sum()
    }

    /// Apply the pruning policy in place (§4.5), called before each send.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        if self.total_tokens() <= self.token_budget {
            return;
        }
        if self.messages.len() <= PRESERVE_FIRST + PRESERVE_LAST {
            return;
        }

        let last_start = self.messages.len() - PRESERVE_LAST;
        let min_age = Duration::minutes(PRUNE_CANDIDATE_MIN_AGE_MINUTES);

        let mut summarized = Vec::new();
        let mut kept_middle = Vec::new();
        for (i, message) in self.messages.iter().enumerate().skip(PRESERVE_FIRST).take(last_start - PRESERVE_FIRST) {
            let old_enough = now - message.timestamp >= min_age;
            if message.attributes.preserved() || !old_enough {
                kept_middle.push(message.clone());
            } else {
                summarized.push(message.clone());
            }
        }

        if summarized.is_empty() {
            return;
        }

        let mut summary_text: String = summarized
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join(" / ");
        let max_chars = SUMMARY_TOKEN_BUDGET * 4;
        if summary_text.len() > max_chars {
            summary_text.truncate(max_chars);
            summary_text.push_str(" (truncated)");
        }
        let summary_message = Message::new(
            Role::Assistant,
            format!("(summary of {} earlier messages) {summary_text}", summarized.len()),
        );

        let mut rebuilt = Vec::with_capacity(PRESERVE_FIRST + 1 + kept_middle.len() + PRESERVE_LAST);
        rebuilt.extend(self.messages[..PRESERVE_FIRST].iter().cloned());
        rebuilt.push(summary_message);
        rebuilt.extend(kept_middle);
        rebuilt.extend(self.messages[last_start..].iter().cloned());
        self.messages = rebuilt;
    }
}
