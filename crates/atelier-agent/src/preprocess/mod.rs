//! Ordered, fault-isolated message transforms.
//!
//! Each preprocessor has a priority (lower runs first) and rewrites the
//! shared [`PromptContext`]. A failing preprocessor is logged and skipped so
//! one broken transform cannot take down prompt assembly.

pub mod auto_compaction;
pub mod memory_strategy;
pub mod project_context;
pub mod system_prompt;
pub mod todo_reminder;
pub mod token_estimate;
pub mod tool_result_pruner;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atelier::chat::{ChatMessage, ChatProvider, ChatRole};
use atelier::ToolCall;
use serde_json::Value;

use crate::error::AgentError;

/// A conversation message plus the persistence metadata the transforms need
/// (waterline tracking, reminder placement). Metadata never reaches the
/// provider — [`ContextMessage::to_chat`] strips it.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: ChatRole,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    /// Persisted message id, when this entry mirrors a stored message
    pub message_id: Option<String>,
    pub timestamp: Option<String>,
}

impl ContextMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            message_id: None,
            timestamp: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            message_id: None,
            timestamp: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }

    pub fn strip_all(messages: &[ContextMessage]) -> Vec<ChatMessage> {
        messages.iter().map(ContextMessage::to_chat).collect()
    }
}

/// Mutable bag of state that flows through the pipeline.
pub struct PromptContext {
    pub chat_id: String,
    pub messages: Vec<ContextMessage>,
    pub model: String,
    pub context_limit: usize,
    pub estimated_tokens: usize,
    pub system_prompt: Option<String>,
    pub project_path: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl PromptContext {
    pub fn new(chat_id: impl Into<String>, messages: Vec<ContextMessage>, model: impl Into<String>, context_limit: usize) -> Self {
        Self {
            chat_id: chat_id.into(),
            messages,
            model: model.into(),
            context_limit,
            estimated_tokens: 0,
            system_prompt: None,
            project_path: None,
            metadata: HashMap::new(),
        }
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        ContextMessage::strip_all(&self.messages)
    }
}

/// Single-responsibility message transform.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first (0-99).
    fn priority(&self) -> u8;

    async fn process(
        &self,
        ctx: &mut PromptContext,
        provider: &dyn ChatProvider,
    ) -> Result<(), AgentError>;
}

/// Runs preprocessors in priority order with error isolation.
pub struct PreprocessorPipeline {
    preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl PreprocessorPipeline {
    pub fn new(mut preprocessors: Vec<Arc<dyn Preprocessor>>) -> Self {
        preprocessors.sort_by_key(|p| p.priority());
        Self { preprocessors }
    }

    pub fn register(&mut self, preprocessor: Arc<dyn Preprocessor>) {
        self.preprocessors.push(preprocessor);
        self.preprocessors.sort_by_key(|p| p.priority());
    }

    pub async fn run(&self, ctx: &mut PromptContext, provider: &dyn ChatProvider) {
        for pp in &self.preprocessors {
            if let Err(err) = pp.process(ctx, provider).await {
                log::warn!("preprocessor {} failed, skipping: {}", pp.name(), err);
            }
        }
    }
}
