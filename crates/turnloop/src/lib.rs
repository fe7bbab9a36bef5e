//! Boundary abstractions for the turnloop agentic engine.
//!
//! This crate defines the data model and collaborator interfaces the engine
//! consumes: chat messages and content parts, the streaming chat-client
//! trait, the tool (AI function) trait, and the provider error taxonomy.
//! The engine itself lives in `turnloop-engine`.

pub mod chat;
pub mod error;
pub mod tool;

pub use chat::{
    ChatClient, ChatOptions, ContentPart, FinishReason, FunctionCallRequest, Message,
    ResponseStream, ResponseUpdate, Role, ToolChoice,
};
pub use error::{ClientError, ErrorCategory};
pub use tool::{AiFunction, ToolDescriptor, ToolError, ToolMetadata};
