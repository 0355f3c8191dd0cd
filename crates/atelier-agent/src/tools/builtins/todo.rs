//! Todo list tool for agent task tracking.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ApprovalPolicy, Tool, ToolContext, ToolError, ToolOutcome};

const VALID_STATUSES: &[&str] = &["pending", "in_progress", "completed"];

/// Normalize raw todo items: drop empty contents, default status to
/// `pending`, and number sort order by position when absent.
pub fn normalize_todo_items(items: &[Value]) -> Vec<(String, String, i64)> {
    let mut normalized = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let content = item
            .get("content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            continue;
        }
        let status_raw = item
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("pending")
            .to_lowercase();
        let status = if VALID_STATUSES.contains(&status_raw.as_str()) {
            status_raw
        } else {
            "pending".to_string()
        };
        let sort_order = item
            .get("sort_order")
            .and_then(Value::as_i64)
            .unwrap_or(index as i64);
        normalized.push((content.to_string(), status, sort_order));
    }
    normalized
}

/// Replace the chat's todo list with the provided items.
pub struct UpdateTodoListTool;

impl UpdateTodoListTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UpdateTodoListTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for UpdateTodoListTool {
    fn name(&self) -> &str {
        "update_todo_list"
    }

    fn description(&self) -> &str {
        "Update your current task/reminder list. Use this for multi-step tasks: create items \
         with status 'pending', mark 'in_progress' when working on them, and 'completed' when \
         done. Call whenever you add, edit, check off, or complete items. Pass the full list \
         each time (replaces existing)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "Full list of todos. Each item has content and status.",
                    "items": {
                        "type": "object",
                        "required": ["content"],
                        "properties": {
                            "content": {"type": "string", "description": "Task description"},
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"],
                                "default": "pending"
                            },
                            "sort_order": {
                                "type": "integer",
                                "description": "Display order (0-based)",
                                "default": 0
                            }
                        }
                    }
                }
            }
        })
    }

    fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Always
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let Some(chat_id) = ctx.chat_id.as_deref() else {
            return Ok(ToolOutcome::failure("update_todo_list requires chat context"));
        };
        let Some(store) = ctx.store.as_ref() else {
            return Ok(ToolOutcome::failure("update_todo_list requires a store"));
        };
        let Some(items) = args.get("todos").and_then(Value::as_array) else {
            return Ok(ToolOutcome::failure("todos must be an array"));
        };

        let normalized = normalize_todo_items(items);
        let count = normalized.len();
        store
            .replace_todos(chat_id, ctx.checkpoint_id.as_deref(), normalized)
            .await
            .map_err(ToolError::from)?;
        Ok(ToolOutcome::success(format!("Todo list updated with {} item(s).", count)))
    }
}
