//! Inject the system prompt at the head of the message list.

use async_trait::async_trait;
use atelier::chat::{ChatProvider, ChatRole};

use crate::error::AgentError;
use crate::preprocess::{ContextMessage, Preprocessor, PromptContext};

pub struct SystemPromptPreprocessor {
    default_prompt: String,
}

impl SystemPromptPreprocessor {
    pub fn new(default_prompt: impl Into<String>) -> Self {
        Self {
            default_prompt: default_prompt.into(),
        }
    }
}

#[async_trait]
impl Preprocessor for SystemPromptPreprocessor {
    fn name(&self) -> &str {
        "system_prompt"
    }

    fn priority(&self) -> u8 {
        10
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        let prompt = ctx
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.default_prompt.clone());
        let has_system_head = ctx
            .messages
            .first()
            .map(|first| first.role == ChatRole::System)
            .unwrap_or(false);
        if has_system_head {
            ctx.messages[0].content = prompt;
        } else {
            ctx.messages.insert(0, ContextMessage::system(prompt));
        }
        Ok(())
    }
}
