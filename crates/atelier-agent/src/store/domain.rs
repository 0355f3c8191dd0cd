//! Persisted entities.
//!
//! Rows mirror the tables in [`crate::store::schema`]. Status fields that
//! drive state machines get real enums; free-form labels stay strings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub pinned: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    /// "user" | "assistant" | "tool" | "system"
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub checkpoint_id: Option<String>,
    /// JSON list of multimodal attachments, when present
    pub attachments_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub label: String,
    pub timestamp: String,
}

/// Tool call lifecycle: `pending → running → {completed | error}`, or
/// `pending → rejected`. Manual approval may land `pending → error` when
/// execution throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Rejected,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Completed => "completed",
            ToolCallStatus::Rejected => "rejected",
            ToolCallStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => ToolCallStatus::Running,
            "completed" => ToolCallStatus::Completed,
            "rejected" => ToolCallStatus::Rejected,
            "error" => ToolCallStatus::Error,
            _ => ToolCallStatus::Pending,
        }
    }

    /// Valid transitions of the state machine.
    pub fn can_transition_to(&self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Rejected) | (Pending, Error) | (Running, Completed) | (Running, Error)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallRow {
    pub id: String,
    pub chat_id: String,
    pub checkpoint_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    pub input_json: String,
    pub output_text: Option<String>,
    pub timestamp: String,
    pub duration_ms: Option<i64>,
    pub parallel_group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEditAction {
    Created,
    Modified,
    Deleted,
}

impl FileEditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEditAction::Created => "created",
            FileEditAction::Modified => "modified",
            FileEditAction::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "created" => FileEditAction::Created,
            "deleted" => FileEditAction::Deleted,
            _ => FileEditAction::Modified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEditRow {
    pub id: String,
    pub chat_id: String,
    pub checkpoint_id: String,
    pub file_path: String,
    pub action: FileEditAction,
    pub diff: Option<String>,
    pub timestamp: String,
}

/// Immutable pre-edit content; `content` is None for files that did not
/// exist before (action `created`).
#[derive(Debug, Clone)]
pub struct FileSnapshotRow {
    pub id: String,
    pub chat_id: String,
    pub checkpoint_id: Option<String>,
    pub file_edit_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub file_path: String,
    pub content: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct ReasoningBlockRow {
    pub id: String,
    pub chat_id: String,
    pub checkpoint_id: Option<String>,
    pub content: String,
    pub timestamp: String,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ToolArtifactRow {
    pub id: String,
    pub tool_call_id: String,
    pub chat_id: String,
    pub project_id: String,
    pub artifact_type: String,
    pub file_path: String,
    pub line_count: Option<i64>,
    pub preview_lines: Option<i64>,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct TodoRow {
    pub id: String,
    pub chat_id: String,
    pub checkpoint_id: Option<String>,
    pub content: String,
    /// "pending" | "in_progress" | "completed"
    pub status: String,
    pub sort_order: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub id: String,
    pub chat_id: String,
    pub generation: i64,
    pub content: String,
    pub token_count: i64,
    pub trigger_token_count: Option<i64>,
    pub observed_up_to_message_id: Option<String>,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct MemoryStateRow {
    pub id: String,
    pub chat_id: String,
    pub strategy: String,
    pub state_json: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct SubAgentRunRow {
    pub id: String,
    pub chat_id: String,
    pub tool_call_id: String,
    pub task: String,
    pub model: String,
    /// "running" | "completed" | "cancelled" | "error" | "max_iterations"
    pub status: String,
    pub output_text: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct ProjectPlanRow {
    pub id: String,
    pub chat_id: String,
    pub project_id: String,
    pub checkpoint_id: Option<String>,
    pub title: String,
    /// "draft" | "ready" | "approved"
    pub status: String,
    pub file_path: String,
    pub revision: i64,
    pub content_sha: String,
    pub last_editor: String,
    pub approved_action: Option<String>,
    pub implementation_chat_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ProjectPlanRevisionRow {
    pub id: String,
    pub plan_id: String,
    pub revision: i64,
    pub content_sha: String,
    pub last_editor: String,
    pub checkpoint_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApproveRule {
    pub id: String,
    /// "tool" | "path" | "extension" | "directory" | "pattern"
    pub field: String,
    pub value: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct McpServerRow {
    pub id: String,
    pub name: String,
    /// "stdio" | "http" | "sse"
    pub transport: String,
    pub config_json: String,
    pub enabled: bool,
    pub last_connected_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct McpToolCacheRow {
    pub id: String,
    pub server_id: String,
    pub tool_name: String,
    pub description: Option<String>,
    pub schema_json: String,
    pub enabled: bool,
    pub discovered_at: String,
}
