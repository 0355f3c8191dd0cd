//! Chat operations the HTTP edge calls into.

use std::sync::Arc;

use atelier::chat::{ChatMessage, ChatRequest};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::container::AppContainer;
use crate::error::AgentError;
use crate::events::{ChatEventKind, CheckpointOut, FileEditOut, MessageOut, ToolCallOut};
use crate::history::{ChatHistory, ChatHistoryAssembler};
use crate::ids::{generate_id, utc_now_iso};
use crate::runtime::{TurnMode, cancel_chat_work, schedule_turn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message: MessageOut,
    pub checkpoint: CheckpointOut,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub tool_call: ToolCallOut,
    pub file_edits: Vec<FileEditOut>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeResponse {
    pub summary: String,
}

pub struct ChatService {
    container: Arc<AppContainer>,
}

impl ChatService {
    pub fn new(container: Arc<AppContainer>) -> Self {
        Self { container }
    }

    pub async fn get_chat_history(&self, chat_id: &str) -> Result<ChatHistory, AgentError> {
        ChatHistoryAssembler::new(self.container.store.clone())
            .assemble(chat_id)
            .await
    }

    /// Persist a user message with its checkpoint, publish the events, and
    /// schedule the agent turn in the background.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        mode: &str,
        active_plan_id: Option<String>,
    ) -> Result<SendMessageResponse, AgentError> {
        if content.trim().is_empty() {
            return Err(AgentError::Validation("content is required".to_string()));
        }
        let chat = self
            .container
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| AgentError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;
        let is_first_message = self.container.store.list_messages(chat_id).await?.is_empty();

        let timestamp = utc_now_iso();
        let msg_id = generate_id("msg");
        let cp_id = generate_id("cp");
        let label = format!("User message: {}", clip(content, 48));

        self.container
            .store
            .create_message(&msg_id, chat_id, "user", content, &timestamp, None, None)
            .await?;
        self.container
            .store
            .create_checkpoint(&cp_id, chat_id, &msg_id, &label, &timestamp)
            .await?;
        self.container
            .store
            .link_message_checkpoint(&msg_id, &cp_id)
            .await?;
        self.container
            .store
            .update_chat_timestamp(chat_id, &timestamp)
            .await?;

        if is_first_message && chat.title == "New chat" {
            let title = clip(content, 48);
            self.container.store.set_chat_title(chat_id, &title).await?;
            self.container.event_bus.publish(
                chat_id,
                ChatEventKind::ChatTitleUpdated {
                    chat_id: chat_id.to_string(),
                    title,
                },
            );
        }

        let message_out = MessageOut {
            id: msg_id,
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: timestamp.clone(),
            checkpoint_id: Some(cp_id.clone()),
        };
        let checkpoint_out = CheckpointOut {
            id: cp_id.clone(),
            message_id: message_out.id.clone(),
            timestamp,
            label,
            file_edits: vec![],
            tool_calls: vec![],
            reasoning_blocks: vec![],
        };
        self.container.event_bus.publish(
            chat_id,
            ChatEventKind::Message {
                message: message_out.clone(),
            },
        );
        self.container.event_bus.publish(
            chat_id,
            ChatEventKind::Checkpoint {
                checkpoint: checkpoint_out.clone(),
            },
        );

        schedule_turn(
            self.container.clone(),
            chat_id.to_string(),
            cp_id,
            content.to_string(),
            TurnMode::from_name(mode),
            active_plan_id,
        )
        .await?;

        Ok(SendMessageResponse {
            message: message_out,
            checkpoint: checkpoint_out,
        })
    }

    /// Resume the agent from the latest checkpoint without a new message.
    pub async fn continue_agent(&self, chat_id: &str) -> Result<CheckpointOut, AgentError> {
        let checkpoint = self
            .container
            .store
            .latest_checkpoint(chat_id)
            .await?
            .ok_or_else(|| AgentError::Validation("chat has no checkpoint to continue from".into()))?;
        let message = self
            .container
            .store
            .get_message(&checkpoint.message_id)
            .await?
            .ok_or_else(|| AgentError::Internal("checkpoint message missing".into()))?;

        schedule_turn(
            self.container.clone(),
            chat_id.to_string(),
            checkpoint.id.clone(),
            message.content,
            TurnMode::Default,
            None,
        )
        .await?;

        Ok(CheckpointOut {
            id: checkpoint.id,
            message_id: checkpoint.message_id,
            timestamp: checkpoint.timestamp,
            label: checkpoint.label,
            file_edits: vec![],
            tool_calls: vec![],
            reasoning_blocks: vec![],
        })
    }

    /// Rewrite a user message: cancel the in-flight turn, revert to the
    /// message's checkpoint, update the content in place (the checkpoint id
    /// survives), and reschedule.
    pub async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ChatHistory, AgentError> {
        let message = self
            .container
            .store
            .get_message(message_id)
            .await?
            .filter(|m| m.chat_id == chat_id)
            .ok_or_else(|| AgentError::Validation(format!("Message not found: {}", message_id)))?;
        if message.role != "user" {
            return Err(AgentError::Validation("Only user messages can be edited".into()));
        }
        let checkpoint = self
            .container
            .store
            .get_checkpoint_by_message(message_id)
            .await?
            .ok_or_else(|| {
                AgentError::Validation(format!("No checkpoint found for message: {}", message_id))
            })?;

        cancel_chat_work(&self.container, chat_id).await?;

        let revert = crate::revert::RevertEngine::new(
            self.container.store.clone(),
            self.container.memory_runner.clone(),
        );
        revert.revert_to_checkpoint(chat_id, &checkpoint.id).await?;

        self.container
            .store
            .update_message_content(message_id, content)
            .await?;
        self.container
            .store
            .set_checkpoint_label(&checkpoint.id, &format!("User message: {}", clip(content, 48)))
            .await?;

        self.container.event_bus.publish(
            chat_id,
            ChatEventKind::MessageEdited {
                message_id: message_id.to_string(),
                content: content.to_string(),
            },
        );

        schedule_turn(
            self.container.clone(),
            chat_id.to_string(),
            checkpoint.id,
            content.to_string(),
            TurnMode::Default,
            None,
        )
        .await?;

        self.get_chat_history(chat_id).await
    }

    /// Cancel the in-flight turn and the memory runner for a chat.
    pub async fn cancel_agent(&self, chat_id: &str) -> Result<bool, AgentError> {
        cancel_chat_work(&self.container, chat_id).await
    }

    /// Execute an approved tool call and wake its waiter. Status is
    /// committed before the signal so the loop reads it from persistence.
    pub async fn approve(&self, chat_id: &str, tool_call_id: &str) -> Result<ApproveResponse, AgentError> {
        let approval = self.container.approval_service();
        let (tool_call, file_edits) = approval
            .approve(chat_id, tool_call_id, CancellationToken::new())
            .await?;
        self.container.waiter.signal_approved(chat_id, tool_call_id);
        Ok(ApproveResponse {
            tool_call,
            file_edits,
        })
    }

    pub async fn reject(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        reason: Option<&str>,
    ) -> Result<ToolCallOut, AgentError> {
        let approval = self.container.approval_service();
        let tool_call = approval.reject(chat_id, tool_call_id, reason).await?;
        self.container.waiter.signal_rejected(chat_id, tool_call_id);
        Ok(tool_call)
    }

    /// Force a compaction-style summary of the conversation.
    pub async fn summarize(&self, chat_id: &str) -> Result<SummarizeResponse, AgentError> {
        let messages = self.container.store.list_messages(chat_id).await?;
        if messages.is_empty() {
            return Ok(SummarizeResponse {
                summary: String::new(),
            });
        }
        let digest: Vec<String> = messages
            .iter()
            .map(|m| format!("[{}]: {}", m.role, clip(&m.content, 500)))
            .collect();
        let settings = self.container.settings_snapshot();
        let request = ChatRequest::new(
            settings.model,
            vec![ChatMessage::user(format!(
                "Summarize the following conversation history concisely. Preserve key \
                 decisions, file paths mentioned, and tool results.\n\n{}",
                digest.join("\n")
            ))],
        )
        .with_sampling(512, 0.0);
        let summary = self.container.provider().chat(&request).await?;
        Ok(SummarizeResponse { summary })
    }

    pub async fn revert_to_checkpoint(&self, chat_id: &str, checkpoint_id: &str) -> Result<ChatHistory, AgentError> {
        cancel_chat_work(&self.container, chat_id).await?;
        let revert = crate::revert::RevertEngine::new(
            self.container.store.clone(),
            self.container.memory_runner.clone(),
        );
        revert.revert_to_checkpoint(chat_id, checkpoint_id).await?;
        self.get_chat_history(chat_id).await
    }

    pub async fn revert_file(&self, chat_id: &str, file_edit_id: &str) -> Result<ChatHistory, AgentError> {
        let revert = crate::revert::RevertEngine::new(
            self.container.store.clone(),
            self.container.memory_runner.clone(),
        );
        revert.revert_file(chat_id, file_edit_id).await?;
        self.get_chat_history(chat_id).await
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() > max_chars {
        flat.chars().take(max_chars).collect()
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::ChatStore;
    use crate::test_utils::seed_chat;

    async fn service_fixture() -> (Arc<AppContainer>, ChatService, String) {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let container = AppContainer::initialize_with_store(Settings::default(), store)
            .await
            .unwrap();
        let (_, chat) = seed_chat(&container.store).await;
        let service = ChatService::new(container.clone());
        (container, service, chat.id)
    }

    #[tokio::test]
    async fn send_message_persists_and_publishes_then_schedules() {
        let (container, service, chat_id) = service_fixture().await;
        let mut sub = container.event_bus.subscribe(&chat_id);

        let response = service
            .send_message(&chat_id, "please look at main.rs", "default", None)
            .await
            .unwrap();

        assert_eq!(response.message.role, "user");
        assert_eq!(
            response.message.checkpoint_id.as_deref(),
            Some(response.checkpoint.id.as_str())
        );
        let stored = container.store.list_messages(&chat_id).await.unwrap();
        assert_eq!(stored.len(), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind.type_name().to_string());
        }
        assert!(kinds.contains(&"chat_title_updated".to_string()));
        assert!(kinds.contains(&"message".to_string()));
        assert!(kinds.contains(&"checkpoint".to_string()));

        // A turn was scheduled for the chat.
        container.tasks.cancel_and_wait(&chat_id).await;
        container.shutdown().await;
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let (container, service, chat_id) = service_fixture().await;
        let err = service.send_message(&chat_id, "  ", "default", None).await.unwrap_err();
        assert!(err.is_validation());
        container.shutdown().await;
    }

    #[tokio::test]
    async fn edit_message_keeps_checkpoint_id() {
        let (container, service, chat_id) = service_fixture().await;
        let sent = service
            .send_message(&chat_id, "first version", "default", None)
            .await
            .unwrap();
        container.tasks.cancel_and_wait(&chat_id).await;

        let history = service
            .edit_message(&chat_id, &sent.message.id, "second version")
            .await
            .unwrap();
        container.tasks.cancel_and_wait(&chat_id).await;

        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "second version");
        assert_eq!(history.checkpoints.len(), 1);
        // The checkpoint survives the edit with the same id.
        assert_eq!(history.checkpoints[0].id, sent.checkpoint.id);
        container.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_agent_without_turn_is_false() {
        let (container, service, chat_id) = service_fixture().await;
        assert!(!service.cancel_agent(&chat_id).await.unwrap());
        container.shutdown().await;
    }
}
