//! Deterministic prompt composition under the model's context window.
//!
//! Assembly order: system prompt → todo reminder → project overview → token
//! estimate → tool-result pruning → spillover of oversized tool messages →
//! memory strategy → compaction fallback. With the observational strategy
//! active, compaction is skipped entirely; otherwise it fires at 95% of the
//! context limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atelier::chat::{ChatProvider, ChatRole};
use serde_json::Value;

use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::error::AgentError;
use crate::memory::MemoryMode;
use crate::preprocess::auto_compaction::AutoCompactionPreprocessor;
use crate::preprocess::memory_strategy::ObservationalMemoryPreprocessor;
use crate::preprocess::project_context::ProjectContextPreprocessor;
use crate::preprocess::system_prompt::SystemPromptPreprocessor;
use crate::preprocess::todo_reminder::TodoReminderPreprocessor;
use crate::preprocess::token_estimate::TokenEstimatePreprocessor;
use crate::preprocess::tool_result_pruner::ToolResultPrunerPreprocessor;
use crate::preprocess::{ContextMessage, Preprocessor, PreprocessorPipeline, PromptContext};
use crate::store::ChatStore;

pub struct ContextBudgetResult {
    pub messages: Vec<ContextMessage>,
    pub estimated_tokens: usize,
    pub metadata: HashMap<String, Value>,
}

/// Spill oversized tool-result messages to disk between pruning and the
/// memory strategy.
struct SpilloverPreprocessor {
    artifacts: ArtifactStore,
    project_id: String,
}

#[async_trait]
impl Preprocessor for SpilloverPreprocessor {
    fn name(&self) -> &str {
        "tool_output_spillover"
    }

    fn priority(&self) -> u8 {
        45
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        for message in &mut ctx.messages {
            if message.role != ChatRole::Tool {
                continue;
            }
            let result = self
                .artifacts
                .materialize_tool_output(&message.content, &self.project_id);
            if result.record.is_some() {
                message.content = result.content;
            }
        }
        Ok(())
    }
}

pub struct ContextBudgetManager {
    store: ChatStore,
    artifacts: ArtifactStore,
}

impl ContextBudgetManager {
    pub fn new(store: ChatStore, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn prepare(
        &self,
        chat_id: &str,
        base_messages: Vec<ContextMessage>,
        settings: &Settings,
        project_path: Option<String>,
        project_id: &str,
        provider: &dyn ChatProvider,
    ) -> Result<ContextBudgetResult, AgentError> {
        let memory_mode = MemoryMode::from_name(&settings.memory.mode);

        let mut preprocessors: Vec<Arc<dyn Preprocessor>> = vec![
            Arc::new(SystemPromptPreprocessor::new(settings.system_prompt())),
            Arc::new(TodoReminderPreprocessor::new(self.store.clone())),
            Arc::new(ProjectContextPreprocessor::new()),
            Arc::new(TokenEstimatePreprocessor),
            Arc::new(ToolResultPrunerPreprocessor::new()),
            Arc::new(SpilloverPreprocessor {
                artifacts: self.artifacts.clone(),
                project_id: project_id.to_string(),
            }),
        ];
        if memory_mode == MemoryMode::Observational {
            // Observational memory owns prompt compression; the summarizing
            // fallback would fight its waterline bookkeeping.
            preprocessors.push(Arc::new(ObservationalMemoryPreprocessor::new(self.store.clone())));
        } else {
            preprocessors.push(Arc::new(AutoCompactionPreprocessor::new(0.95)));
        }
        let pipeline = PreprocessorPipeline::new(preprocessors);

        let mut ctx = PromptContext::new(
            chat_id,
            base_messages,
            settings.model.clone(),
            settings.context_limit,
        );
        ctx.project_path = project_path;
        pipeline.run(&mut ctx, provider).await;

        if memory_mode == MemoryMode::Observational {
            ctx.metadata
                .insert("compaction_applied".to_string(), serde_json::json!(false));
            ctx.metadata.insert(
                "compaction_skipped".to_string(),
                serde_json::json!("observational_memory"),
            );
        }
        ctx.estimated_tokens = atelier::tokens::count_messages(&ctx.chat_messages());
        ctx.metadata.insert(
            "estimated_tokens".to_string(),
            serde_json::json!(ctx.estimated_tokens),
        );
        ctx.metadata
            .insert("memory_mode".to_string(), serde_json::json!(settings.memory.mode));

        Ok(ContextBudgetResult {
            messages: ctx.messages,
            estimated_tokens: ctx.estimated_tokens,
            metadata: ctx.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedProvider, seed_chat};

    fn fixtures() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("tool_outputs"), 2000, 50);
        (dir, artifacts)
    }

    #[tokio::test]
    async fn first_message_is_always_the_system_prompt() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (project, chat) = seed_chat(&store).await;
        let (_dir, artifacts) = fixtures();
        let manager = ContextBudgetManager::new(store, artifacts);
        let settings = Settings::default();
        let provider = ScriptedProvider::new(vec![]);

        let result = manager
            .prepare(
                &chat.id,
                vec![ContextMessage::user("hello")],
                &settings,
                None,
                &project.id,
                provider.as_ref(),
            )
            .await
            .unwrap();

        assert_eq!(result.messages[0].role, ChatRole::System);
        assert!(result.messages[0].content.starts_with(settings.system_prompt()));
        assert!(result.estimated_tokens > 0);
        assert_eq!(result.metadata["memory_mode"], serde_json::json!("observational"));
    }

    #[tokio::test]
    async fn oversized_tool_results_are_spilled() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (project, chat) = seed_chat(&store).await;
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("tool_outputs"), 50, 10);
        let manager = ContextBudgetManager::new(store, artifacts);
        let settings = Settings::default();
        let provider = ScriptedProvider::new(vec![]);

        let big_output = "line of tool output\n".repeat(500);
        let result = manager
            .prepare(
                &chat.id,
                vec![
                    ContextMessage::user("run it"),
                    ContextMessage::tool_result("tc-1", big_output),
                ],
                &settings,
                None,
                &project.id,
                provider.as_ref(),
            )
            .await
            .unwrap();

        let tool_msg = result
            .messages
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("Use read_file"));
    }

    #[tokio::test]
    async fn compact_mode_summarizes_when_over_limit() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (project, chat) = seed_chat(&store).await;
        let (_dir, artifacts) = fixtures();
        let manager = ContextBudgetManager::new(store, artifacts);
        let mut settings = Settings::default();
        settings.memory.mode = "compact".to_string();
        settings.context_limit = 200;
        let provider = ScriptedProvider::new(vec![]).with_completions(vec![
            "summary one".to_string(),
            "summary two".to_string(),
        ]);

        let base: Vec<ContextMessage> = (0..10)
            .map(|i| ContextMessage::user(format!("msg {} {}", i, "filler ".repeat(100))))
            .collect();
        let result = manager
            .prepare(&chat.id, base, &settings, None, &project.id, provider.as_ref())
            .await
            .unwrap();

        assert!(
            result
                .messages
                .iter()
                .any(|m| m.content.starts_with("[Conversation summary]:")),
        );
    }
}
