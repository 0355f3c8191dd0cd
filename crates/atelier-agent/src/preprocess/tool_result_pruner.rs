//! Truncate excessively long tool outputs already in the history.

use async_trait::async_trait;
use atelier::chat::{ChatProvider, ChatRole};

use crate::error::AgentError;
use crate::preprocess::{Preprocessor, PromptContext};

const MAX_TOOL_OUTPUT_CHARS: usize = 4000;

pub struct ToolResultPrunerPreprocessor {
    max_chars: usize,
}

impl ToolResultPrunerPreprocessor {
    pub fn new() -> Self {
        Self {
            max_chars: MAX_TOOL_OUTPUT_CHARS,
        }
    }
}

impl Default for ToolResultPrunerPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Preprocessor for ToolResultPrunerPreprocessor {
    fn name(&self) -> &str {
        "tool_result_pruner"
    }

    fn priority(&self) -> u8 {
        40
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        for message in &mut ctx.messages {
            if message.role != ChatRole::Tool || message.content.len() <= self.max_chars {
                continue;
            }
            let mut end = self.max_chars;
            while end > 0 && !message.content.is_char_boundary(end) {
                end -= 1;
            }
            message.content = format!("{}\n... [truncated]", &message.content[..end]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ContextMessage;
    use crate::test_utils::NullProvider;

    #[tokio::test]
    async fn long_tool_outputs_are_truncated() {
        let pp = ToolResultPrunerPreprocessor::new();
        let mut ctx = PromptContext::new(
            "c",
            vec![
                ContextMessage::tool_result("tc-1", "x".repeat(10_000)),
                ContextMessage::user("y".repeat(10_000)),
            ],
            "m",
            1000,
        );
        pp.process(&mut ctx, &NullProvider).await.unwrap();
        assert!(ctx.messages[0].content.len() < 5000);
        assert!(ctx.messages[0].content.ends_with("[truncated]"));
        // Non-tool messages are untouched.
        assert_eq!(ctx.messages[1].content.len(), 10_000);
    }

    #[tokio::test]
    async fn short_tool_outputs_pass_through() {
        let pp = ToolResultPrunerPreprocessor::new();
        let mut ctx = PromptContext::new(
            "c",
            vec![ContextMessage::tool_result("tc-1", "short")],
            "m",
            1000,
        );
        pp.process(&mut ctx, &NullProvider).await.unwrap();
        assert_eq!(ctx.messages[0].content, "short");
    }
}
