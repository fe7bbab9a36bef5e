//! Chat data model and the streaming chat-client interface.

use crate::error::ClientError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions.
    System,
    /// The user/human participant.
    User,
    /// The model.
    Assistant,
    /// A tool-result carrier message.
    Tool,
}

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// Model chain-of-thought. Streamed live but excluded from persisted
    /// history unless the engine is configured to preserve it.
    Reasoning { text: String },
    /// A tool invocation requested by the model.
    FunctionCall {
        call_id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    /// The result of a tool invocation. `exception` carries the error
    /// description when the invocation failed.
    FunctionResult {
        call_id: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
    },
    /// Binary content (images, audio, documents).
    Data {
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Token accounting reported by the provider.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub contents: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, contents: Vec<ContentPart>) -> Self {
        Self {
            role,
            contents,
            id: None,
            additional: Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    /// Builds the tool-role message that carries a batch of function results.
    pub fn tool(results: Vec<ContentPart>) -> Self {
        Self::new(Role::Tool, results)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Concatenated text content, ignoring non-text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.contents {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// All function calls in this message, in order.
    pub fn function_calls(&self) -> Vec<FunctionCallRequest> {
        self.contents
            .iter()
            .filter_map(|part| match part {
                ContentPart::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some(FunctionCallRequest {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_function_calls(&self) -> bool {
        self.contents
            .iter()
            .any(|part| matches!(part, ContentPart::FunctionCall { .. }))
    }

    /// Returns a copy with all reasoning parts removed. Used when committing
    /// assistant messages to persistent history.
    pub fn without_reasoning(&self) -> Self {
        let mut clone = self.clone();
        clone
            .contents
            .retain(|part| !matches!(part, ContentPart::Reasoning { .. }));
        clone
    }
}

/// An owned view of a `ContentPart::FunctionCall`, the unit the engine's
/// function-call processor works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// How the model should use the available tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides whether to call tools.
    #[default]
    Auto,
    /// Model must call at least one tool.
    Any,
    /// Tools are disabled for this call.
    None,
    /// Model must call the named tool.
    Tool(String),
}

/// Options for a chat completion request. All fields optional; merging is the
/// engine's job (caller wins field by field).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<crate::tool::ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_multiple_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional: Map<String, Value>,
}

/// Why a completion stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

/// One streamed delta from the chat client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseUpdate {
    #[serde(default)]
    pub contents: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl ResponseUpdate {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            contents: vec![ContentPart::Text { text: delta.into() }],
            ..Default::default()
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            contents: vec![ContentPart::Reasoning { text: delta.into() }],
            ..Default::default()
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            contents: vec![ContentPart::FunctionCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            }],
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }
}

/// The streamed response type produced by a chat client.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseUpdate, ClientError>> + Send>>;

/// The chat completion collaborator. The engine holds at most one active
/// stream per run, so implementations need not be re-entrant.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streaming completion for the given conversation.
    async fn stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ClientError>;
}
