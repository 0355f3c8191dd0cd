//! Event types published on the per-chat bus and streamed over SSE.
//!
//! Wire shape: `{"type": "...", "payload": {...}, "chatId": "...",
//! "timestamp": "...", "sequence": n}` — the kind enum supplies `type` and
//! `payload`, the envelope supplies the rest.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message as the frontend sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOut {
    pub id: String,
    /// "user" | "agent" | "system"
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOut {
    pub id: String,
    pub message_id: String,
    pub timestamp: String,
    pub label: String,
    #[serde(default)]
    pub file_edits: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub reasoning_blocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOut {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: String,
    pub line_count: Option<i64>,
    pub preview_lines: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOut {
    pub id: String,
    pub name: String,
    pub status: String,
    pub input: Value,
    pub output: Option<String>,
    pub timestamp: String,
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEditOut {
    pub id: String,
    pub file_path: String,
    /// "created" | "modified" | "deleted"
    pub action: String,
    pub diff: Option<String>,
    pub timestamp: String,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningBlockOut {
    pub id: String,
    pub content: String,
    pub timestamp: String,
    pub checkpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoOut {
    pub id: String,
    pub content: String,
    /// "pending" | "in_progress" | "completed"
    pub status: String,
    pub sort_order: i64,
    pub timestamp: String,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOut {
    pub id: String,
    pub chat_id: String,
    pub project_id: String,
    pub checkpoint_id: Option<String>,
    pub title: String,
    pub status: String,
    pub file_path: String,
    pub revision: i64,
    pub content_sha: String,
    pub last_editor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation_chat_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItemOut {
    pub id: String,
    /// "file" | "conversation" | "tool_output"
    #[serde(rename = "type")]
    pub item_type: String,
    pub name: String,
    pub tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// Everything that can be published for a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatEventKind {
    #[serde(rename_all = "camelCase")]
    Message { message: MessageOut },
    #[serde(rename_all = "camelCase")]
    ContentDelta { message_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    Checkpoint { checkpoint: CheckpointOut },
    #[serde(rename_all = "camelCase")]
    ReasoningStart { reasoning_block: ReasoningBlockOut },
    #[serde(rename_all = "camelCase")]
    ReasoningDelta {
        reasoning_block_id: String,
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningEnd { reasoning_block: ReasoningBlockOut },
    #[serde(rename_all = "camelCase")]
    ToolCallStart { tool_call: ToolCallOut },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call: ToolCallOut },
    #[serde(rename_all = "camelCase")]
    FileEdit { file_edit: FileEditOut },
    #[serde(rename_all = "camelCase")]
    ApprovalRequired { tool_call: ToolCallOut },
    #[serde(rename_all = "camelCase")]
    AgentDone { checkpoint_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    VerificationIssues {
        checkpoint_id: String,
        summary: String,
        issue_count: usize,
        file_count: usize,
        by_tool: Value,
    },
    #[serde(rename_all = "camelCase")]
    ObservationStatus {
        /// "observing" | "observed" | "reflecting" | "reflected"
        status: String,
        chat_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_saved: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_before: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_after: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    PlanReady { plan: PlanOut },
    #[serde(rename_all = "camelCase")]
    PlanUpdated { plan: PlanOut },
    #[serde(rename_all = "camelCase")]
    PlanConflict { plan: PlanOut, reason: String },
    #[serde(rename_all = "camelCase")]
    PlanApproved { plan: PlanOut },
    #[serde(rename_all = "camelCase")]
    SubAgentStart {
        sub_agent_id: String,
        task: String,
        model: String,
        tool_call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SubAgentProgress {
        sub_agent_id: String,
        iteration: usize,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SubAgentToolCall {
        sub_agent_id: String,
        tool_call_id: String,
        tool_call: Value,
    },
    #[serde(rename_all = "camelCase")]
    SubAgentEnd {
        sub_agent_id: String,
        status: String,
        output: String,
        duration: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkpoint_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retryable: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_action: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageEdited {
        message_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatTitleUpdated { chat_id: String, title: String },
    #[serde(rename_all = "camelCase")]
    ContextUpdate { items: Vec<ContextItemOut> },
    Heartbeat {},
}

impl ChatEventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChatEventKind::Message { .. } => "message",
            ChatEventKind::ContentDelta { .. } => "content_delta",
            ChatEventKind::Checkpoint { .. } => "checkpoint",
            ChatEventKind::ReasoningStart { .. } => "reasoning_start",
            ChatEventKind::ReasoningDelta { .. } => "reasoning_delta",
            ChatEventKind::ReasoningEnd { .. } => "reasoning_end",
            ChatEventKind::ToolCallStart { .. } => "tool_call_start",
            ChatEventKind::ToolCallEnd { .. } => "tool_call_end",
            ChatEventKind::FileEdit { .. } => "file_edit",
            ChatEventKind::ApprovalRequired { .. } => "approval_required",
            ChatEventKind::AgentDone { .. } => "agent_done",
            ChatEventKind::VerificationIssues { .. } => "verification_issues",
            ChatEventKind::ObservationStatus { .. } => "observation_status",
            ChatEventKind::PlanReady { .. } => "plan_ready",
            ChatEventKind::PlanUpdated { .. } => "plan_updated",
            ChatEventKind::PlanConflict { .. } => "plan_conflict",
            ChatEventKind::PlanApproved { .. } => "plan_approved",
            ChatEventKind::SubAgentStart { .. } => "sub_agent_start",
            ChatEventKind::SubAgentProgress { .. } => "sub_agent_progress",
            ChatEventKind::SubAgentToolCall { .. } => "sub_agent_tool_call",
            ChatEventKind::SubAgentEnd { .. } => "sub_agent_end",
            ChatEventKind::Error { .. } => "error",
            ChatEventKind::MessageEdited { .. } => "message_edited",
            ChatEventKind::ChatTitleUpdated { .. } => "chat_title_updated",
            ChatEventKind::ContextUpdate { .. } => "context_update",
            ChatEventKind::Heartbeat {} => "heartbeat",
        }
    }
}

/// A published event, stamped by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(flatten)]
    pub kind: ChatEventKind,
    pub chat_id: String,
    pub timestamp: String,
    pub sequence: u64,
}

impl ChatEventKind {
    /// Convenience constructor for error events with only a message.
    pub fn error(message: impl Into<String>) -> Self {
        ChatEventKind::Error {
            message: message.into(),
            source: None,
            checkpoint_id: None,
            tool_call_id: None,
            tool_name: None,
            retryable: None,
            retry_action: None,
        }
    }

    /// Retryable observational-memory error.
    pub fn memory_error(message: impl Into<String>, source: &str) -> Self {
        ChatEventKind::Error {
            message: message.into(),
            source: Some(source.to_string()),
            checkpoint_id: None,
            tool_call_id: None,
            tool_name: None,
            retryable: Some(true),
            retry_action: Some("retry_observation".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_payload_and_metadata() {
        let event = ChatEvent {
            kind: ChatEventKind::ContentDelta {
                message_id: "msg-1".into(),
                delta: "hi".into(),
            },
            chat_id: "chat-1".into(),
            timestamp: "2026-08-01T00:00:00Z".into(),
            sequence: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["payload"]["messageId"], "msg-1");
        assert_eq!(json["payload"]["delta"], "hi");
        assert_eq!(json["chatId"], "chat-1");
        assert_eq!(json["sequence"], 7);
    }

    #[test]
    fn type_name_matches_serde_tag() {
        let kinds = vec![
            ChatEventKind::AgentDone { checkpoint_id: None },
            ChatEventKind::Heartbeat {},
            ChatEventKind::error("boom"),
        ];
        for kind in kinds {
            let json = serde_json::to_value(&kind).unwrap();
            assert_eq!(json["type"], kind.type_name());
        }
    }

    #[test]
    fn tool_call_out_round_trips() {
        let out = ToolCallOut {
            id: "tc-1".into(),
            name: "read_file".into(),
            status: "completed".into(),
            input: serde_json::json!({"path": "/p"}),
            output: Some("ok".into()),
            timestamp: "t".into(),
            duration: Some(12),
            is_parallel: None,
            parallel_group_id: None,
            approval_required: None,
            checkpoint_id: Some("cp-1".into()),
            artifacts: vec![],
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["checkpointId"], "cp-1");
        let back: ToolCallOut = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, "tc-1");
    }
}
