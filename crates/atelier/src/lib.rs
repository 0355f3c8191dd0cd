//! Unified interface for interacting with Large Language Model providers.
//!
//! The crate abstracts provider-specific wire protocols behind one trait:
//! chat with tools, streaming with typed chunks, and model discovery. The
//! agent crate consumes this interface and never speaks HTTP itself.

use serde::{Deserialize, Serialize};

/// Chat messages, tools, streaming chunks and the provider trait
pub mod chat;

/// Error types and handling
pub mod error;

/// Concrete provider implementations
pub mod providers;

/// Token estimation utilities
pub mod tokens;

pub use chat::{ChatProvider, ChatRequest, ChatStream, FinishReason, StreamChunk};
pub use error::LLMError;

/// Tool call represents a function call that an LLM wants to make.
/// This is a standardized structure used across all providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// FunctionCall contains details about which function to call and with what arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, serialized as a JSON string.
    pub arguments: String,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Token usage reported by a provider for one request.
#[derive(Debug, Serialize, Deserialize, Clone, Default, Eq, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}
