//! Middleware pipelines.
//!
//! Five pipeline kinds share one composition mechanism (`Pipeline`):
//! prompt (pre-turn), iteration (around each LLM call), AI function
//! (around each tool invocation), permission (dedicated gate before
//! tool execution), and message turn (once after the whole turn).

pub mod builtin;
pub mod context;
pub mod pipeline;

pub use builtin::ContinuationPrompt;
pub use context::{
    FunctionInvocationContext, IterationContext, IterationResponse, MessageTurnContext,
    PromptContext,
};
pub use pipeline::{Middleware, Next, NoopTerminal, Pipeline, TerminalAction};

/// Pipeline aliases, one per middleware kind.
pub type PromptPipeline = Pipeline<PromptContext>;
pub type IterationPipeline = Pipeline<IterationContext>;
pub type FunctionPipeline = Pipeline<FunctionInvocationContext>;
pub type PermissionPipeline = Pipeline<FunctionInvocationContext>;
pub type MessageTurnPipeline = Pipeline<MessageTurnContext>;
