//! Checkpointing: the thread record, the checkpointer contract, and resume
//! validation.

use crate::error::EngineError;
use crate::reduction::HistoryReductionState;
use crate::state::{LoopState, PendingWrite};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use turnloop::Message;

/// The persistent conversation record. The engine reads it at turn
/// preparation and writes it back at finalization; durable storage is the
/// checkpointer's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentThread {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Serialized `LoopState` of an interrupted run, when one exists.
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub last_reduction: Option<HistoryReductionState>,
    /// Service-assigned id when server-side history tracking is active.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl AgentThread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Durable store for threads and their pending-writes sidecar.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save_thread(&self, thread: &AgentThread) -> Result<(), EngineError>;

    async fn load_thread(&self, thread_id: &str) -> Result<Option<AgentThread>, EngineError>;

    /// Associates writes with a specific pre-checkpoint state.
    async fn save_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
        writes: &[PendingWrite],
    ) -> Result<(), EngineError>;

    async fn load_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
    ) -> Result<Vec<PendingWrite>, EngineError>;

    /// Best-effort cleanup after a successful checkpoint.
    async fn delete_pending_writes(&self, thread_id: &str, etag: &str) -> Result<(), EngineError>;
}

/// How a run should start, given the thread and the caller's messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePlan {
    Fresh,
    Resume(Box<LoopState>),
}

/// Validates the four resume scenarios before the loop is entered.
pub fn validate_resume(
    has_messages: bool,
    thread: Option<&AgentThread>,
    allow_stale: bool,
) -> Result<ResumePlan, EngineError> {
    let checkpoint_json = thread.and_then(|t| t.execution_state.as_deref());

    let Some(json) = checkpoint_json else {
        let has_history = thread.map(|t| !t.messages.is_empty()).unwrap_or(false);
        if !has_messages && !has_history {
            return Err(EngineError::EmptyRun);
        }
        return Ok(ResumePlan::Fresh);
    };

    if has_messages {
        return Err(EngineError::ResumeWithMessages);
    }

    let state = LoopState::from_checkpoint(json)?;
    if let Some(thread) = thread {
        if !allow_stale && thread.messages.len() != state.current_messages.len() {
            return Err(EngineError::CheckpointMismatch {
                details: format!(
                    "thread has {} messages but checkpoint recorded {}",
                    thread.messages.len(),
                    state.current_messages.len()
                ),
            });
        }
    }

    Ok(ResumePlan::Resume(Box::new(state)))
}

/// In-memory checkpointer for tests and embedders without durability needs.
#[derive(Default)]
pub struct MemoryCheckpointer {
    threads: Mutex<HashMap<String, AgentThread>>,
    pending: Mutex<HashMap<(String, String), Vec<PendingWrite>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save_thread(&self, thread: &AgentThread) -> Result<(), EngineError> {
        self.threads
            .lock()
            .insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<Option<AgentThread>, EngineError> {
        Ok(self.threads.lock().get(thread_id).cloned())
    }

    async fn save_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
        writes: &[PendingWrite],
    ) -> Result<(), EngineError> {
        let key = (thread_id.to_string(), etag.to_string());
        self.pending
            .lock()
            .entry(key)
            .or_default()
            .extend_from_slice(writes);
        Ok(())
    }

    async fn load_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
    ) -> Result<Vec<PendingWrite>, EngineError> {
        let key = (thread_id.to_string(), etag.to_string());
        Ok(self.pending.lock().get(&key).cloned().unwrap_or_default())
    }

    async fn delete_pending_writes(&self, thread_id: &str, etag: &str) -> Result<(), EngineError> {
        let key = (thread_id.to_string(), etag.to_string());
        self.pending.lock().remove(&key);
        Ok(())
    }
}
