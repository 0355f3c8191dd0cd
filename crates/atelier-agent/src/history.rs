//! Read-side projection: join every entity of a chat into one view.

use serde::Serialize;

use crate::error::AgentError;
use crate::events::{
    ArtifactOut, CheckpointOut, ContextItemOut, FileEditOut, MessageOut, PlanOut,
    ReasoningBlockOut, TodoOut, ToolCallOut,
};
use crate::store::ChatStore;
use crate::store::domain::ProjectPlanRow;

fn map_role_for_ui(role: &str) -> String {
    match role {
        "assistant" => "agent".to_string(),
        other => other.to_string(),
    }
}

fn truncate_label(text: &str, max_len: usize) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() > max_len {
        let clipped: String = flat.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", clipped)
    } else {
        flat
    }
}

pub fn plan_out(plan: &ProjectPlanRow, content: Option<String>) -> PlanOut {
    PlanOut {
        id: plan.id.clone(),
        chat_id: plan.chat_id.clone(),
        project_id: plan.project_id.clone(),
        checkpoint_id: plan.checkpoint_id.clone(),
        title: plan.title.clone(),
        status: plan.status.clone(),
        file_path: plan.file_path.clone(),
        revision: plan.revision,
        content_sha: plan.content_sha.clone(),
        last_editor: plan.last_editor.clone(),
        approved_action: plan.approved_action.clone(),
        implementation_chat_id: plan.implementation_chat_id.clone(),
        created_at: plan.created_at.clone(),
        updated_at: plan.updated_at.clone(),
        content,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub chat_id: String,
    pub title: String,
    pub messages: Vec<MessageOut>,
    pub tool_calls: Vec<ToolCallOut>,
    pub file_edits: Vec<FileEditOut>,
    pub checkpoints: Vec<CheckpointOut>,
    pub reasoning_blocks: Vec<ReasoningBlockOut>,
    pub todos: Vec<TodoOut>,
    pub plans: Vec<PlanOut>,
    pub context_items: Vec<ContextItemOut>,
}

pub struct ChatHistoryAssembler {
    store: ChatStore,
}

impl ChatHistoryAssembler {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    pub async fn assemble(&self, chat_id: &str) -> Result<ChatHistory, AgentError> {
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| AgentError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;

        let messages: Vec<MessageOut> = self
            .store
            .list_messages(chat_id)
            .await?
            .into_iter()
            .map(|m| MessageOut {
                id: m.id,
                role: map_role_for_ui(&m.role),
                content: m.content,
                timestamp: m.timestamp,
                checkpoint_id: m.checkpoint_id,
            })
            .collect();

        let raw_tool_calls = self.store.list_tool_calls(chat_id).await?;
        let raw_file_edits = self.store.list_file_edits(chat_id).await?;
        let raw_reasoning = self.store.list_reasoning_blocks(chat_id).await?;

        let mut tool_calls = Vec::with_capacity(raw_tool_calls.len());
        for call in &raw_tool_calls {
            let artifacts: Vec<ArtifactOut> = self
                .store
                .list_tool_artifacts_for_tool_call(&call.id)
                .await?
                .into_iter()
                .map(|a| ArtifactOut {
                    artifact_type: a.artifact_type,
                    path: a.file_path,
                    line_count: a.line_count,
                    preview_lines: a.preview_lines,
                })
                .collect();
            tool_calls.push(ToolCallOut {
                id: call.id.clone(),
                name: call.name.clone(),
                status: call.status.as_str().to_string(),
                input: serde_json::from_str(&call.input_json).unwrap_or(serde_json::Value::Null),
                output: call.output_text.clone(),
                timestamp: call.timestamp.clone(),
                duration: call.duration_ms,
                is_parallel: call.parallel_group.as_ref().map(|_| true),
                parallel_group_id: call.parallel_group.clone(),
                approval_required: None,
                checkpoint_id: Some(call.checkpoint_id.clone()),
                artifacts,
            });
        }

        let file_edits: Vec<FileEditOut> = raw_file_edits
            .iter()
            .map(|f| FileEditOut {
                id: f.id.clone(),
                file_path: f.file_path.clone(),
                action: f.action.as_str().to_string(),
                diff: f.diff.clone(),
                timestamp: f.timestamp.clone(),
                checkpoint_id: Some(f.checkpoint_id.clone()),
            })
            .collect();

        let reasoning_blocks: Vec<ReasoningBlockOut> = raw_reasoning
            .iter()
            .map(|r| ReasoningBlockOut {
                id: r.id.clone(),
                content: r.content.clone(),
                timestamp: r.timestamp.clone(),
                checkpoint_id: r.checkpoint_id.clone(),
                duration: r.duration_ms,
                tokens: None,
            })
            .collect();

        // Checkpoints carry the ids of the state they scope.
        let checkpoints: Vec<CheckpointOut> = self
            .store
            .list_checkpoints(chat_id)
            .await?
            .into_iter()
            .map(|cp| CheckpointOut {
                file_edits: raw_file_edits
                    .iter()
                    .filter(|f| f.checkpoint_id == cp.id)
                    .map(|f| f.id.clone())
                    .collect(),
                tool_calls: raw_tool_calls
                    .iter()
                    .filter(|t| t.checkpoint_id == cp.id)
                    .map(|t| t.id.clone())
                    .collect(),
                reasoning_blocks: raw_reasoning
                    .iter()
                    .filter(|r| r.checkpoint_id.as_deref() == Some(cp.id.as_str()))
                    .map(|r| r.id.clone())
                    .collect(),
                id: cp.id,
                message_id: cp.message_id,
                timestamp: cp.timestamp,
                label: cp.label,
            })
            .collect();

        let todos: Vec<TodoOut> = self
            .store
            .list_todos(chat_id)
            .await?
            .into_iter()
            .map(|t| TodoOut {
                id: t.id,
                content: t.content,
                status: t.status,
                sort_order: t.sort_order,
                timestamp: t.timestamp,
                checkpoint_id: t.checkpoint_id,
            })
            .collect();

        let plans: Vec<PlanOut> = self
            .store
            .list_plans(chat_id)
            .await?
            .iter()
            .map(|p| plan_out(p, None))
            .collect();

        let context_items = build_context_items(&messages, &raw_tool_calls, &raw_reasoning);

        Ok(ChatHistory {
            chat_id: chat.id,
            title: chat.title,
            messages,
            tool_calls,
            file_edits,
            checkpoints,
            reasoning_blocks,
            todos,
            plans,
            context_items,
        })
    }
}

/// Token-counted view of what makes up the prompt, for display.
fn build_context_items(
    messages: &[MessageOut],
    tool_calls: &[crate::store::domain::ToolCallRow],
    reasoning: &[crate::store::domain::ReasoningBlockRow],
) -> Vec<ContextItemOut> {
    let mut items = Vec::new();
    for m in messages {
        items.push(ContextItemOut {
            id: m.id.clone(),
            item_type: "conversation".to_string(),
            name: format!("{}: {}", m.role, truncate_label(&m.content, 48)),
            tokens: atelier::tokens::count_text(&m.content) as i64,
            full_name: None,
        });
    }
    for call in tool_calls {
        let payload = format!(
            "{}({}){}",
            call.name,
            call.input_json,
            call.output_text
                .as_ref()
                .map(|o| format!(" -> {}", o))
                .unwrap_or_default()
        );
        items.push(ContextItemOut {
            id: call.id.clone(),
            item_type: "tool_output".to_string(),
            name: format!("{}: {}", call.name, truncate_label(&call.input_json, 48)),
            tokens: atelier::tokens::count_text(&payload) as i64,
            full_name: Some(format!("{}({})", call.name, call.input_json)),
        });
    }
    for block in reasoning {
        items.push(ContextItemOut {
            id: block.id.clone(),
            item_type: "conversation".to_string(),
            name: format!("Reasoning: {}", truncate_label(&block.content, 48)),
            tokens: atelier::tokens::count_text(&block.content) as i64,
            full_name: None,
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::utc_now_iso;
    use crate::store::domain::{ToolCallRow, ToolCallStatus};
    use crate::test_utils::seed_chat;

    #[tokio::test]
    async fn history_joins_entities_and_maps_roles() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let ts = utc_now_iso();
        store
            .create_message("m1", &chat.id, "user", "hello", &ts, Some("cp-1"), None)
            .await
            .unwrap();
        store
            .create_checkpoint("cp-1", &chat.id, "m1", "User message: hello", &ts)
            .await
            .unwrap();
        store
            .create_message("m2", &chat.id, "assistant", "hi there", &ts, None, None)
            .await
            .unwrap();
        store
            .create_tool_call(ToolCallRow {
                id: "tc-1".into(),
                chat_id: chat.id.clone(),
                checkpoint_id: "cp-1".into(),
                name: "grep".into(),
                status: ToolCallStatus::Completed,
                input_json: "{\"pattern\":\"x\"}".into(),
                output_text: Some("no matches".into()),
                timestamp: ts.clone(),
                duration_ms: Some(5),
                parallel_group: None,
            })
            .await
            .unwrap();

        let history = ChatHistoryAssembler::new(store).assemble(&chat.id).await.unwrap();

        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[1].role, "agent");
        assert_eq!(history.tool_calls.len(), 1);
        assert_eq!(history.checkpoints.len(), 1);
        assert_eq!(history.checkpoints[0].tool_calls, vec!["tc-1".to_string()]);
        assert!(!history.context_items.is_empty());
    }

    #[tokio::test]
    async fn missing_chat_is_a_validation_error() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let err = ChatHistoryAssembler::new(store)
            .assemble("chat-missing")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
