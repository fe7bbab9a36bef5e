//! Immutable loop state.
//!
//! `LoopState` is the complete record of one run's progress. Every
//! transition returns a new instance; nothing in the engine mutates a state
//! in place, which is what makes concurrent runs on one engine trivially
//! safe and checkpointing a pure serialization concern.

use crate::error::EngineError;
use crate::reduction::HistoryReductionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use turnloop::{Message, ResponseUpdate};

/// Current checkpoint schema version. Deserialization accepts any version up
/// to and including this one, defaulting fields the older version lacked.
pub const LOOP_STATE_VERSION: u32 = 1;

/// Where a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    #[default]
    Initial,
    Loop,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    #[serde(default)]
    pub source: StateSource,
    #[serde(default)]
    pub step: u32,
}

/// A successful function result recorded durably before the iteration
/// checkpoint, keyed by the checkpoint eTag it precedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub call_id: String,
    pub function_name: String,
    pub result_json: Value,
    pub completed_at: i64,
    pub iteration: u32,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub run_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub agent_name: String,
    pub start_time: i64,

    /// Full, unreduced conversation as the LLM context evolves this turn.
    #[serde(default)]
    pub current_messages: Vec<Message>,
    /// Messages to persist to the thread at the end of the turn.
    #[serde(default)]
    pub turn_history: Vec<Message>,

    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub is_terminated: bool,
    #[serde(default)]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default)]
    pub last_signature_per_tool: BTreeMap<String, String>,
    #[serde(default)]
    pub consecutive_count_per_tool: BTreeMap<String, u32>,

    #[serde(default)]
    pub expanded_plugin_containers: BTreeSet<String>,
    #[serde(default)]
    pub expanded_skill_containers: BTreeSet<String>,
    #[serde(default)]
    pub active_skill_instructions: BTreeMap<String, String>,
    #[serde(default)]
    pub completed_functions: BTreeSet<String>,

    #[serde(default)]
    pub active_reduction: Option<HistoryReductionState>,

    #[serde(default)]
    pub inner_client_tracks_history: bool,
    #[serde(default)]
    pub messages_sent_to_inner_client: usize,

    #[serde(default)]
    pub last_assistant_message_id: Option<String>,
    /// Raw streamed updates not yet flushed into an assistant message.
    #[serde(default)]
    pub response_updates: Vec<ResponseUpdate>,

    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,

    pub version: u32,
    #[serde(default)]
    pub metadata: StateMetadata,
    #[serde(default)]
    pub etag: Option<String>,
}

impl LoopState {
    pub fn new(
        run_id: impl Into<String>,
        agent_name: impl Into<String>,
        current_messages: Vec<Message>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            conversation_id: None,
            agent_name: agent_name.into(),
            start_time: time::OffsetDateTime::now_utc().unix_timestamp(),
            current_messages,
            turn_history: Vec::new(),
            iteration: 0,
            is_terminated: false,
            termination_reason: None,
            consecutive_failures: 0,
            last_signature_per_tool: BTreeMap::new(),
            consecutive_count_per_tool: BTreeMap::new(),
            expanded_plugin_containers: BTreeSet::new(),
            expanded_skill_containers: BTreeSet::new(),
            active_skill_instructions: BTreeMap::new(),
            completed_functions: BTreeSet::new(),
            active_reduction: None,
            inner_client_tracks_history: false,
            messages_sent_to_inner_client: 0,
            last_assistant_message_id: None,
            response_updates: Vec::new(),
            pending_writes: Vec::new(),
            version: LOOP_STATE_VERSION,
            metadata: StateMetadata::default(),
            etag: None,
        }
    }

    // ── Transitions ────────────────────────────────────────────────────────

    pub fn next_iteration(&self) -> Self {
        let mut next = self.clone();
        next.iteration += 1;
        next
    }

    pub fn with_messages(&self, messages: Vec<Message>) -> Self {
        let mut next = self.clone();
        next.current_messages = messages;
        next
    }

    pub fn append_message(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.current_messages.push(message);
        next
    }

    pub fn append_to_turn_history(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.turn_history.push(message);
        next
    }

    pub fn with_success(&self) -> Self {
        let mut next = self.clone();
        next.consecutive_failures = 0;
        next
    }

    pub fn with_failure(&self) -> Self {
        let mut next = self.clone();
        next.consecutive_failures += 1;
        next
    }

    pub fn terminate(&self, reason: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.is_terminated = true;
        next.termination_reason = Some(reason.into());
        next
    }

    pub fn with_expanded_plugin(&self, container: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.expanded_plugin_containers.insert(container.into());
        next
    }

    pub fn with_expanded_skill(&self, container: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.expanded_skill_containers.insert(container.into());
        next
    }

    pub fn with_skill_instructions(
        &self,
        skill: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        let mut next = self.clone();
        next.active_skill_instructions
            .insert(skill.into(), instructions.into());
        next
    }

    pub fn clear_skill_instructions(&self) -> Self {
        let mut next = self.clone();
        next.active_skill_instructions.clear();
        next
    }

    pub fn with_pending_write(&self, write: PendingWrite) -> Self {
        let mut next = self.clone();
        next.pending_writes.push(write);
        next
    }

    pub fn clear_pending_writes(&self) -> Self {
        let mut next = self.clone();
        next.pending_writes.clear();
        next
    }

    pub fn complete_function(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.completed_functions.insert(name.into());
        next
    }

    /// Records one tool call for circuit-breaker accounting: an identical
    /// consecutive signature increments the counter, anything else resets it.
    pub fn record_tool_call(&self, name: &str, signature: &str) -> Self {
        let mut next = self.clone();
        let count = match next.last_signature_per_tool.get(name) {
            Some(last) if last == signature => {
                next.consecutive_count_per_tool.get(name).copied().unwrap_or(0) + 1
            }
            _ => 1,
        };
        next.consecutive_count_per_tool.insert(name.to_string(), count);
        next.last_signature_per_tool
            .insert(name.to_string(), signature.to_string());
        next
    }

    /// Consecutive-call count for a tool, but only when the signature matches
    /// its last recorded one.
    pub fn consecutive_calls_with(&self, name: &str, signature: &str) -> u32 {
        match self.last_signature_per_tool.get(name) {
            Some(last) if last == signature => self
                .consecutive_count_per_tool
                .get(name)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn enable_history_tracking(&self, conversation_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.inner_client_tracks_history = true;
        next.conversation_id = Some(conversation_id.into());
        next
    }

    pub fn disable_history_tracking(&self) -> Self {
        let mut next = self.clone();
        next.inner_client_tracks_history = false;
        next
    }

    pub fn with_messages_sent(&self, count: usize) -> Self {
        let mut next = self.clone();
        next.messages_sent_to_inner_client = count;
        next
    }

    pub fn with_reduction(&self, reduction: HistoryReductionState) -> Self {
        let mut next = self.clone();
        next.active_reduction = Some(reduction);
        next
    }

    pub fn clear_reduction(&self) -> Self {
        let mut next = self.clone();
        next.active_reduction = None;
        next
    }

    pub fn with_metadata(&self, source: StateSource, step: u32) -> Self {
        let mut next = self.clone();
        next.metadata = StateMetadata { source, step };
        next
    }

    pub fn with_etag(&self, etag: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.etag = Some(etag.into());
        next
    }

    // ── Checkpoint serialization ───────────────────────────────────────────

    /// Serializes this state for checkpointing. A fresh eTag is minted on
    /// every save; the returned state carries it so subsequent pending
    /// writes key against the checkpoint they precede.
    pub fn to_checkpoint(&self) -> Result<(String, LoopState), EngineError> {
        let stamped = self.with_etag(uuid::Uuid::new_v4().to_string());
        let json = serde_json::to_string(&stamped)?;
        Ok((json, stamped))
    }

    /// Restores a checkpoint. Older schema versions deserialize with
    /// defaulted fields; a version newer than this build supports is an
    /// error rather than silent data loss.
    pub fn from_checkpoint(json: &str) -> Result<LoopState, EngineError> {
        let value: Value = serde_json::from_str(json)?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if version > LOOP_STATE_VERSION {
            return Err(EngineError::CheckpointVersionTooNew {
                version,
                supported: LOOP_STATE_VERSION,
            });
        }
        let mut state: LoopState = serde_json::from_value(value)?;
        state.version = LOOP_STATE_VERSION;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_state() -> LoopState {
        LoopState::new("run-1", "tester", vec![Message::user("hi")])
    }

    // ── Transition semantics ───────────────────────────────────────────────

    #[test]
    fn transitions_do_not_alias_the_original() {
        let state = base_state();
        let next = state.next_iteration().with_failure().terminate("done");
        assert_eq!(state.iteration, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.is_terminated);
        assert_eq!(next.iteration, 1);
        assert_eq!(next.consecutive_failures, 1);
        assert_eq!(next.termination_reason.as_deref(), Some("done"));
    }

    #[test]
    fn with_success_resets_failure_count() {
        let state = base_state().with_failure().with_failure();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.with_success().consecutive_failures, 0);
    }

    #[test]
    fn record_tool_call_increments_on_identical_signature() {
        let state = base_state()
            .record_tool_call("get_weather", "get_weather(city=\"X\")")
            .record_tool_call("get_weather", "get_weather(city=\"X\")");
        assert_eq!(
            state.consecutive_calls_with("get_weather", "get_weather(city=\"X\")"),
            2
        );
    }

    #[test]
    fn record_tool_call_resets_on_different_signature() {
        let state = base_state()
            .record_tool_call("get_weather", "get_weather(city=\"X\")")
            .record_tool_call("get_weather", "get_weather(city=\"Y\")");
        assert_eq!(
            state.consecutive_calls_with("get_weather", "get_weather(city=\"Y\")"),
            1
        );
        assert_eq!(
            state.consecutive_calls_with("get_weather", "get_weather(city=\"X\")"),
            0
        );
    }

    #[test]
    fn skill_bookkeeping_round_trips() {
        let state = base_state()
            .with_expanded_plugin("web")
            .with_expanded_skill("research")
            .with_skill_instructions("research", "cite sources");
        assert!(state.expanded_plugin_containers.contains("web"));
        assert!(state.expanded_skill_containers.contains("research"));
        assert_eq!(
            state.active_skill_instructions.get("research").unwrap(),
            "cite sources"
        );
        assert!(
            state
                .clear_skill_instructions()
                .active_skill_instructions
                .is_empty()
        );
    }

    // ── Checkpoint round-trip (R1) ─────────────────────────────────────────

    #[test]
    fn checkpoint_round_trips_modulo_etag() {
        let state = base_state()
            .next_iteration()
            .record_tool_call("now", "now()")
            .complete_function("now")
            .with_pending_write(PendingWrite {
                call_id: "c7".into(),
                function_name: "now".into(),
                result_json: json!("42"),
                completed_at: 0,
                iteration: 2,
                thread_id: "t-1".into(),
            });
        let (json, stamped) = state.to_checkpoint().unwrap();
        let restored = LoopState::from_checkpoint(&json).unwrap();
        assert_eq!(restored, stamped);
        // Everything except the freshly minted eTag matches the original.
        let mut normalized = restored.clone();
        normalized.etag = None;
        assert_eq!(normalized, state);
    }

    #[test]
    fn each_checkpoint_mints_a_new_etag() {
        let state = base_state();
        let (_, first) = state.to_checkpoint().unwrap();
        let (_, second) = first.to_checkpoint().unwrap();
        assert!(first.etag.is_some());
        assert_ne!(first.etag, second.etag);
    }

    // ── Versioning (I8) ────────────────────────────────────────────────────

    #[test]
    fn newer_version_fails_to_deserialize() {
        let state = base_state();
        let (json, _) = state.to_checkpoint().unwrap();
        let mut value: Value = serde_json::from_str(&json).unwrap();
        value["version"] = json!(LOOP_STATE_VERSION + 1);
        let err = LoopState::from_checkpoint(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CheckpointVersionTooNew { version, .. }
                if version == LOOP_STATE_VERSION + 1
        ));
    }

    #[test]
    fn older_version_deserializes_with_defaults() {
        // A minimal version-0 document missing every newer field.
        let legacy = json!({
            "run_id": "run-0",
            "agent_name": "old",
            "start_time": 1_700_000_000,
            "version": 0
        });
        let state = LoopState::from_checkpoint(&legacy.to_string()).unwrap();
        assert_eq!(state.run_id, "run-0");
        assert_eq!(state.iteration, 0);
        assert!(state.pending_writes.is_empty());
        assert!(!state.inner_client_tracks_history);
        assert_eq!(state.version, LOOP_STATE_VERSION);
    }
}
