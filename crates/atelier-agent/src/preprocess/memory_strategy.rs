//! Observational-memory strategy: replace observed messages with the
//! active observation block.

use async_trait::async_trait;
use atelier::chat::{ChatProvider, ChatRole};

use crate::error::AgentError;
use crate::memory::ObservationMemoryService;
use crate::preprocess::{Preprocessor, PromptContext};
use crate::store::ChatStore;

pub struct ObservationalMemoryPreprocessor {
    store: ChatStore,
}

impl ObservationalMemoryPreprocessor {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Preprocessor for ObservationalMemoryPreprocessor {
    fn name(&self) -> &str {
        "observational_memory"
    }

    fn priority(&self) -> u8 {
        50
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        let Some(observation) = self.store.latest_observation(&ctx.chat_id).await? else {
            return Ok(());
        };

        // The system prompt (and overview) sit ahead of the conversation;
        // split only the conversational tail at the waterline.
        let system_prefix_len = ctx
            .messages
            .iter()
            .position(|m| m.role != ChatRole::System)
            .unwrap_or(ctx.messages.len());
        let system_msgs: Vec<_> = ctx.messages[..system_prefix_len].to_vec();
        let conversation = &ctx.messages[system_prefix_len..];

        let (_, unobserved) =
            ObservationMemoryService::unobserved_for(conversation, Some(&observation));

        let mut rebuilt = ObservationMemoryService::build_context_with_observations(
            &observation,
            unobserved,
            system_msgs.first().cloned(),
        );
        // Re-insert any additional leading system messages (project
        // overview) after the prompt.
        for (offset, extra) in system_msgs.iter().skip(1).enumerate() {
            rebuilt.insert(1 + offset, extra.clone());
        }

        ctx.metadata.insert(
            "observation_generation".to_string(),
            serde_json::json!(observation.generation),
        );
        ctx.metadata.insert(
            "observation_tokens".to_string(),
            serde_json::json!(observation.token_count),
        );
        ctx.messages = rebuilt;
        Ok(())
    }
}
