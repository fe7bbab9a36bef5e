//! Tool (AI function) abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Metadata a tool advertises beyond its schema.
///
/// Containers are meta-tools: invoking one reveals further tools within the
/// current turn. Skills are containers that additionally inject instructions
/// for the model once expanded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default)]
    pub is_container: bool,
    #[serde(default)]
    pub is_skill: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_skill_container: Option<String>,
    #[serde(default)]
    pub requires_permission: bool,
}

/// The schema-level description of a tool, as sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

/// Errors produced by a tool body.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("{0}")]
    Invocation(String),

    #[error("tool '{tool}' timed out")]
    Timeout { tool: String },

    #[error("argument error: {0}")]
    Arguments(String),
}

/// A callable tool. Schema generation is out of scope; implementations supply
/// their parameter schema directly.
#[async_trait]
pub trait AiFunction: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments object.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }

    async fn invoke(
        &self,
        arguments: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}
