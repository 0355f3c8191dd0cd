//! Record the estimated token count of the assembled messages.

use async_trait::async_trait;
use atelier::chat::ChatProvider;
use atelier::tokens;

use crate::error::AgentError;
use crate::preprocess::{Preprocessor, PromptContext};

pub struct TokenEstimatePreprocessor;

#[async_trait]
impl Preprocessor for TokenEstimatePreprocessor {
    fn name(&self) -> &str {
        "token_estimate"
    }

    fn priority(&self) -> u8 {
        20
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        ctx.estimated_tokens = tokens::count_messages(&ctx.chat_messages());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ContextMessage;
    use crate::test_utils::NullProvider;

    #[tokio::test]
    async fn estimate_tracks_content_size() {
        let pp = TokenEstimatePreprocessor;
        let mut small = PromptContext::new("c", vec![ContextMessage::user("hi")], "m", 1000);
        pp.process(&mut small, &NullProvider).await.unwrap();
        let mut large = PromptContext::new(
            "c",
            vec![ContextMessage::user("word ".repeat(500))],
            "m",
            1000,
        );
        pp.process(&mut large, &NullProvider).await.unwrap();
        assert!(large.estimated_tokens > small.estimated_tokens);
    }
}
