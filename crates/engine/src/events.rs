//! The closed event taxonomy the engine emits.
//!
//! Every event carries the correlation ids needed to reconstruct the run
//! tree: the run id and iteration ride in the envelope, per-entity ids
//! (call ids, message ids, permission ids, request ids) ride in the kind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Linear phases of a reasoning block within one model message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    SessionStart,
    MessageStart,
    Delta,
    MessageEnd,
    SessionEnd,
}

/// Checkpointer operations surfaced as observability events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOp {
    Saved,
    Restored,
    PendingWritesSaved,
    PendingWritesLoaded,
    PendingWritesDeleted,
}

/// Retry-executor progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Attempting,
    Exhausted,
}

/// Compact decision summary for the `AgentDecision` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    CallLlm,
    Complete,
    Terminate,
}

/// Container flavours, for the `ContainerExpanded` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Plugin,
    Skill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Monotone per-run sequence number, stamped at emit time.
    pub seq: u64,
    pub timestamp: i64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    // ── Turn lifecycle ─────────────────────────────────────────────
    MessageTurnStarted {
        message_turn_id: String,
    },
    MessageTurnFinished {
        message_turn_id: String,
        duration_ms: u64,
    },
    AgentTurnStarted {
        iteration: u32,
    },
    AgentTurnFinished {
        iteration: u32,
    },
    /// Point-in-time view of loop state, emitted at the top of each
    /// iteration.
    StateSnapshot {
        iteration: u32,
        message_count: usize,
        consecutive_failures: u32,
        is_terminated: bool,
    },
    AgentDecision {
        decision: DecisionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    AgentCompletion {
        reason: String,
        iterations: u32,
    },

    // ── Content streaming ──────────────────────────────────────────
    TextMessageStart {
        message_id: String,
    },
    TextDelta {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    Reasoning {
        message_id: String,
        phase: ReasoningPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },

    // ── Tool calls ─────────────────────────────────────────────────
    ToolCallStart {
        call_id: String,
        tool_name: String,
    },
    ToolCallArgs {
        call_id: String,
        arguments: String,
    },
    ToolCallEnd {
        call_id: String,
    },
    ToolCallResult {
        call_id: String,
        tool_name: String,
        is_error: bool,
        result: String,
    },

    // ── Bidirectional ──────────────────────────────────────────────
    PermissionRequest {
        permission_id: String,
        call_id: String,
        tool_name: String,
        arguments: String,
    },
    PermissionResponse {
        permission_id: String,
        approved: bool,
    },
    PermissionApproved {
        permission_id: String,
        tool_name: String,
    },
    PermissionDenied {
        permission_id: String,
        tool_name: String,
        reason: String,
    },
    ContinuationRequest {
        request_id: String,
        iteration: u32,
    },
    ContinuationResponse {
        request_id: String,
        approved: bool,
    },
    ClarificationRequest {
        request_id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_schema: Option<serde_json::Value>,
    },
    ClarificationResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<serde_json::Value>,
    },
    MiddlewareProgress {
        middleware: String,
        message: String,
    },
    MiddlewareError {
        middleware: String,
        message: String,
    },

    // ── Observability ──────────────────────────────────────────────
    ScopedToolsVisible {
        tools: Vec<String>,
    },
    ContainerExpanded {
        container: String,
        kind: ContainerKind,
    },
    MiddlewarePipelineStart {
        pipeline: String,
    },
    MiddlewarePipelineEnd {
        pipeline: String,
    },
    PermissionCheck {
        tool_name: String,
        call_id: String,
        is_approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        denial_reason: Option<String>,
    },
    IterationStart {
        iteration: u32,
    },
    IterationMessages {
        message_count: usize,
    },
    CircuitBreakerTriggered {
        tool_name: String,
        consecutive_calls: u32,
    },
    HistoryReductionCache {
        is_hit: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summarized_up_to: Option<usize>,
    },
    Checkpoint {
        op: CheckpointOp,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        write_count: Option<usize>,
    },
    ParallelToolExecution {
        call_count: usize,
        max_parallel: usize,
    },
    Retry {
        status: RetryStatus,
        tool_name: String,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    /// Server-side history tracking became active: subsequent iterations
    /// send only the message delta.
    DeltaSendingActivated {
        conversation_id: String,
    },
    PlanModeActivated,
    NestedAgentInvoked {
        agent_name: String,
    },
    DocumentProcessed {
        name: String,
    },
    MessagePrepared {
        message_count: usize,
        reduced: bool,
    },
    BidirectionalEventProcessed {
        request_id: String,
    },
}

impl EngineEventKind {
    /// Short name of the variant, for logging and observer filters.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEventKind::MessageTurnStarted { .. } => "message_turn_started",
            EngineEventKind::MessageTurnFinished { .. } => "message_turn_finished",
            EngineEventKind::AgentTurnStarted { .. } => "agent_turn_started",
            EngineEventKind::AgentTurnFinished { .. } => "agent_turn_finished",
            EngineEventKind::StateSnapshot { .. } => "state_snapshot",
            EngineEventKind::AgentDecision { .. } => "agent_decision",
            EngineEventKind::AgentCompletion { .. } => "agent_completion",
            EngineEventKind::TextMessageStart { .. } => "text_message_start",
            EngineEventKind::TextDelta { .. } => "text_delta",
            EngineEventKind::TextMessageEnd { .. } => "text_message_end",
            EngineEventKind::Reasoning { .. } => "reasoning",
            EngineEventKind::ToolCallStart { .. } => "tool_call_start",
            EngineEventKind::ToolCallArgs { .. } => "tool_call_args",
            EngineEventKind::ToolCallEnd { .. } => "tool_call_end",
            EngineEventKind::ToolCallResult { .. } => "tool_call_result",
            EngineEventKind::PermissionRequest { .. } => "permission_request",
            EngineEventKind::PermissionResponse { .. } => "permission_response",
            EngineEventKind::PermissionApproved { .. } => "permission_approved",
            EngineEventKind::PermissionDenied { .. } => "permission_denied",
            EngineEventKind::ContinuationRequest { .. } => "continuation_request",
            EngineEventKind::ContinuationResponse { .. } => "continuation_response",
            EngineEventKind::ClarificationRequest { .. } => "clarification_request",
            EngineEventKind::ClarificationResponse { .. } => "clarification_response",
            EngineEventKind::MiddlewareProgress { .. } => "middleware_progress",
            EngineEventKind::MiddlewareError { .. } => "middleware_error",
            EngineEventKind::ScopedToolsVisible { .. } => "scoped_tools_visible",
            EngineEventKind::ContainerExpanded { .. } => "container_expanded",
            EngineEventKind::MiddlewarePipelineStart { .. } => "middleware_pipeline_start",
            EngineEventKind::MiddlewarePipelineEnd { .. } => "middleware_pipeline_end",
            EngineEventKind::PermissionCheck { .. } => "permission_check",
            EngineEventKind::IterationStart { .. } => "iteration_start",
            EngineEventKind::IterationMessages { .. } => "iteration_messages",
            EngineEventKind::CircuitBreakerTriggered { .. } => "circuit_breaker_triggered",
            EngineEventKind::HistoryReductionCache { .. } => "history_reduction_cache",
            EngineEventKind::Checkpoint { .. } => "checkpoint",
            EngineEventKind::ParallelToolExecution { .. } => "parallel_tool_execution",
            EngineEventKind::Retry { .. } => "retry",
            EngineEventKind::DeltaSendingActivated { .. } => "delta_sending_activated",
            EngineEventKind::PlanModeActivated => "plan_mode_activated",
            EngineEventKind::NestedAgentInvoked { .. } => "nested_agent_invoked",
            EngineEventKind::DocumentProcessed { .. } => "document_processed",
            EngineEventKind::MessagePrepared { .. } => "message_prepared",
            EngineEventKind::BidirectionalEventProcessed { .. } => "bidirectional_event_processed",
        }
    }
}

/// External observer notified of every forwarded event, isolated by a
/// per-observer circuit breaker (see `observer::ObserverHealth`).
#[async_trait]
pub trait EngineObserver: Send + Sync {
    /// Cheap pre-filter; return false to skip `on_event` for this event.
    fn should_process(&self, _event: &EngineEvent) -> bool {
        true
    }

    async fn on_event(&self, event: &EngineEvent) -> Result<(), anyhow::Error>;
}
