//! Last-resort compaction of the conversation prefix near the context
//! limit.

use async_trait::async_trait;
use atelier::chat::{ChatMessage, ChatProvider, ChatRequest, ChatRole};
use atelier::tokens;

use crate::error::AgentError;
use crate::preprocess::{ContextMessage, Preprocessor, PromptContext};

const RECENT_COUNT: usize = 4;

/// Pick a split index that does not start the retained window on a tool
/// result.
pub fn stable_compaction_split_index(messages: &[ContextMessage], recent_count: usize) -> usize {
    let mut split_idx = messages.len().saturating_sub(recent_count);
    while split_idx > 0 && messages[split_idx].role == ChatRole::Tool {
        split_idx -= 1;
    }
    split_idx
}

pub struct AutoCompactionPreprocessor {
    threshold_ratio: f64,
}

impl AutoCompactionPreprocessor {
    pub fn new(threshold_ratio: f64) -> Self {
        Self { threshold_ratio }
    }
}

#[async_trait]
impl Preprocessor for AutoCompactionPreprocessor {
    fn name(&self) -> &str {
        "auto_compaction"
    }

    fn priority(&self) -> u8 {
        95
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        let estimated = tokens::count_messages(&ctx.chat_messages());
        ctx.estimated_tokens = estimated;
        let threshold = (ctx.context_limit as f64 * self.threshold_ratio) as usize;
        if estimated < threshold || ctx.messages.len() <= RECENT_COUNT {
            return Ok(());
        }

        let split_idx = stable_compaction_split_index(&ctx.messages, RECENT_COUNT);
        if split_idx == 0 {
            return Ok(());
        }
        let old_messages = &ctx.messages[..split_idx];

        let digest: Vec<String> = old_messages
            .iter()
            .map(|m| {
                let clipped: String = m.content.chars().take(500).collect();
                format!("[{}]: {}", m.role.as_str(), clipped)
            })
            .collect();
        let request = ChatRequest::new(
            ctx.model.clone(),
            vec![ChatMessage::user(format!(
                "Summarize the following conversation history concisely. Preserve key \
                 decisions, file paths mentioned, and tool results.\n\n{}",
                digest.join("\n")
            ))],
        )
        .with_sampling(512, 0.0);

        let summary = match provider.chat(&request).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            // Compaction is best-effort; an unavailable provider leaves the
            // prompt oversized rather than empty.
            _ => return Ok(()),
        };

        let compacted_count = split_idx;
        let mut compacted =
            vec![ContextMessage::system(format!("[Conversation summary]: {}", summary))];
        compacted.extend_from_slice(&ctx.messages[split_idx..]);
        ctx.messages = compacted;
        ctx.estimated_tokens = tokens::count_messages(&ctx.chat_messages());
        ctx.metadata
            .insert("compaction_applied".to_string(), serde_json::json!(true));
        ctx.metadata.insert(
            "compacted_message_count".to_string(),
            serde_json::json!(compacted_count),
        );
        Ok(())
    }
}
