//! Context types for the five middleware kinds.

use crate::coordinator::EventCoordinator;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turnloop::{ChatOptions, FinishReason, FunctionCallRequest, Message, ResponseUpdate, ToolMetadata};

/// Pre-turn pipeline context: may substitute, augment, or reorder the
/// candidate message list and adjust options before the first LLM call.
pub struct PromptContext {
    pub messages: Vec<Message>,
    pub options: ChatOptions,
    pub coordinator: Arc<EventCoordinator>,
}

/// What one LLM call produced (streamed or supplied by middleware).
#[derive(Debug, Clone, Default)]
pub struct IterationResponse {
    /// The assembled assistant message (text + reasoning + function calls).
    pub message: Option<Message>,
    pub tool_requests: Vec<FunctionCallRequest>,
    pub conversation_id: Option<String>,
    pub finish_reason: Option<FinishReason>,
    /// Raw updates as streamed, for state bookkeeping.
    pub updates: Vec<ResponseUpdate>,
}

impl IterationResponse {
    /// A cached response supplied by middleware in place of an LLM call.
    pub fn cached(message: Message) -> Self {
        let tool_requests = message.function_calls();
        Self {
            message: Some(message),
            tool_requests,
            ..Default::default()
        }
    }
}

/// Wraps one LLM call. Runs even when the call is skipped.
pub struct IterationContext {
    pub iteration: u32,
    /// True on the last iteration the cap allows.
    pub is_final_iteration: bool,
    /// The exact message slice about to be sent.
    pub messages: Vec<Message>,
    pub options: ChatOptions,

    /// Set by middleware to suppress the LLM call and use
    /// `cached_response` instead.
    pub skip_llm_call: bool,
    pub cached_response: Option<IterationResponse>,
    /// Filled by the terminal action (or from `cached_response`).
    pub response: Option<IterationResponse>,

    /// Signal consumed by the driver after the call: drop accumulated
    /// skill instructions.
    pub clear_skill_instructions: bool,
    /// Set by continuation middleware at the iteration cap.
    pub continuation_approved: Option<bool>,
    /// Free-form signals between middleware.
    pub properties: Map<String, Value>,

    pub coordinator: Arc<EventCoordinator>,
    pub cancel: CancellationToken,
}

/// Wraps a tool invocation; also the permission-pipeline context. A
/// permission middleware that terminates the context denies the call, with
/// `result` as the reason.
pub struct FunctionInvocationContext {
    pub request: FunctionCallRequest,
    pub metadata: ToolMetadata,
    pub iteration: u32,
    pub is_terminated: bool,
    pub result: Option<Value>,
    /// Error description when the invocation failed; carried onto the
    /// function result for downstream consumers.
    pub exception: Option<String>,
    pub coordinator: Arc<EventCoordinator>,
    pub cancel: CancellationToken,
}

impl FunctionInvocationContext {
    pub fn new(
        request: FunctionCallRequest,
        metadata: ToolMetadata,
        iteration: u32,
        coordinator: Arc<EventCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            metadata,
            iteration,
            is_terminated: false,
            result: None,
            exception: None,
            coordinator,
            cancel,
        }
    }

    /// Terminates the invocation with a reason (permission pipeline: deny).
    pub fn terminate(&mut self, reason: impl Into<String>) {
        self.is_terminated = true;
        self.result = Some(Value::String(reason.into()));
    }

    pub fn result_text(&self) -> Option<String> {
        self.result.as_ref().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Runs once after the whole turn; read-only for persistence.
pub struct MessageTurnContext {
    pub turn_history: Arc<Vec<Message>>,
    pub termination_reason: String,
    pub duration: Duration,
    pub coordinator: Arc<EventCoordinator>,
}
