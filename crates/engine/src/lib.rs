//! turnloop-engine: a protocol-agnostic, stateless agentic execution
//! engine.
//!
//! The engine drives a conversational model through the iterated cycle of
//! chat completion, tool execution, and result feedback until the model
//! produces a final response, terminates, or a safety limit fires. One
//! engine instance supports any number of concurrent runs; each run streams
//! its events in real time and supports cooperative human-in-the-loop
//! prompts, durable checkpointing with crash recovery, and cost-optimizing
//! history reduction with caching.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod engine;
pub mod error;
pub mod events;
pub mod functions;
pub mod middleware;
pub mod observer;
pub mod permission;
pub mod prepare;
pub mod reduction;
pub mod retry;
pub mod signature;
pub mod sqlite;
pub mod state;

pub use checkpoint::{AgentThread, Checkpointer, MemoryCheckpointer, ResumePlan, validate_resume};
pub use config::{
    AgentConfiguration, CheckpointFrequency, EngineConfig, ReductionSettings, ReductionTrigger,
    RetryPolicy,
};
pub use coordinator::{
    ClarificationAnswer, ContinuationDecision, EventCoordinator, PermissionDecision,
    ResponsePayload,
};
pub use decision::{Decision, decide};
pub use engine::{ActiveRun, AgentEngine, AgentEngineBuilder, RunOutcome, RunRequest};
pub use error::{EngineError, WaitError};
pub use events::{
    CheckpointOp, ContainerKind, DecisionKind, EngineEvent, EngineEventKind, EngineObserver,
    ReasoningPhase, RetryStatus,
};
pub use functions::{ExecutedCall, FunctionCallProcessor, ProcessedCalls, build_function_map};
pub use middleware::{
    ContinuationPrompt, FunctionInvocationContext, IterationContext, IterationResponse,
    MessageTurnContext, Middleware, Next, NoopTerminal, Pipeline, PromptContext, TerminalAction,
};
pub use observer::{ObserverHealth, ObserverHealthConfig, ObserverSet, ObserverToken};
pub use permission::{
    CoordinatorPermissionMiddleware, NO_PERMISSION_MIDDLEWARE, PermissionManager,
    PermissionVerdict,
};
pub use prepare::{PreparedTurn, TurnPreparer, inject_instructions, merge_options};
pub use reduction::{HistoryReducer, HistoryReductionState, hash_message_prefix};
pub use retry::{ProviderErrorHandler, RetryDelayStrategy, RetryExecutor};
pub use signature::{StableHash, call_signature};
pub use sqlite::SqliteCheckpointer;
pub use state::{LOOP_STATE_VERSION, LoopState, PendingWrite, StateMetadata, StateSource};
