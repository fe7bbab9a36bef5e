//! History reduction: replacing a prefix of the conversation with a single
//! summary message for LLM consumption only.
//!
//! The reduction itself is produced by an external `HistoryReducer`; this
//! module owns the cacheable state around it: which prefix was summarized,
//! the integrity hash guarding it, and the validity window for reuse.

use crate::config::ReductionSettings;
use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use turnloop::{Message, Role};

/// Immutable record of one computed reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryReductionState {
    /// Index into the full message list up to which messages were
    /// summarized (exclusive).
    pub summarized_up_to_index: usize,
    /// Full message count at the time the reduction was computed.
    pub message_count_at_reduction: usize,
    pub summary_content: String,
    pub created_at: i64,
    /// SHA-256 over `"{role}|{text}\n"` for each summarized message.
    pub message_hash: String,
    pub target_message_count: usize,
    pub reduction_threshold: usize,
}

fn role_tag(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Hashes the prefix `messages[0..up_to]` in the canonical reduction format.
pub fn hash_message_prefix(messages: &[Message], up_to: usize) -> String {
    let mut hasher = Sha256::new();
    for message in &messages[..up_to.min(messages.len())] {
        hasher.update(role_tag(message.role).as_bytes());
        hasher.update(b"|");
        hasher.update(message.text().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

impl HistoryReductionState {
    /// Whether this reduction can be reused for a history that has grown to
    /// `current_count` messages: nothing was deleted, and fewer than
    /// `reduction_threshold` messages accumulated since.
    pub fn is_valid_for(&self, current_count: usize) -> bool {
        current_count >= self.message_count_at_reduction
            && current_count - self.message_count_at_reduction <= self.reduction_threshold
    }

    /// Whether the stored integrity hash still matches the given history's
    /// summarized prefix.
    pub fn matches_prefix(&self, messages: &[Message]) -> bool {
        self.summarized_up_to_index <= messages.len()
            && hash_message_prefix(messages, self.summarized_up_to_index) == self.message_hash
    }

    /// Produces the reduced view: `[system?] ++ [summary] ++ tail`.
    /// Fails when the summarized prefix no longer hashes to what was
    /// recorded (messages were edited or reordered underneath the cache).
    pub fn apply_to_messages(
        &self,
        all_messages: &[Message],
        system_message: Option<&Message>,
    ) -> Result<Vec<Message>, EngineError> {
        if !self.matches_prefix(all_messages) {
            return Err(EngineError::IntegrityCheckFailed);
        }
        let mut out = Vec::with_capacity(all_messages.len() - self.summarized_up_to_index + 2);
        if let Some(system) = system_message {
            out.push(system.clone());
        }
        out.push(Message::assistant(self.summary_content.clone()));
        out.extend_from_slice(&all_messages[self.summarized_up_to_index..]);
        Ok(out)
    }
}

/// External collaborator that produces a reduced message list: any leading
/// system messages, then a single assistant summary, then the preserved
/// recent tail.
#[async_trait]
pub trait HistoryReducer: Send + Sync {
    async fn reduce(&self, messages: &[Message]) -> Result<Vec<Message>, EngineError>;
}

/// Builds a `HistoryReductionState` from a freshly reduced list.
///
/// The summary message is located positionally: the first assistant message
/// after any leading system messages. Returns `None` when the reduced list
/// has no recognizable summary.
pub fn reduction_state_from(
    working: &[Message],
    reduced: &[Message],
    settings: &ReductionSettings,
) -> Option<HistoryReductionState> {
    let mut index = 0;
    while index < reduced.len() && reduced[index].role == Role::System {
        index += 1;
    }
    let summary = reduced.get(index).filter(|m| m.role == Role::Assistant)?;

    let summarized_up_to_index = (working.len() + 1).checked_sub(reduced.len())?;
    Some(HistoryReductionState {
        summarized_up_to_index,
        message_count_at_reduction: working.len(),
        summary_content: summary.text(),
        created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        message_hash: hash_message_prefix(working, summarized_up_to_index),
        target_message_count: settings.target_message_count,
        reduction_threshold: settings.reduction_threshold,
    })
}
