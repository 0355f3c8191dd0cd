//! Loop terminator: the agent calls this when all work is done.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ApprovalPolicy, Tool, ToolContext, ToolError, ToolOutcome};

pub const SUBMIT_TASK_OUTPUT: &str = "Task submitted.";

pub struct SubmitTaskTool;

impl SubmitTaskTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SubmitTaskTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SubmitTaskTool {
    fn name(&self) -> &str {
        "submit_task"
    }

    fn description(&self) -> &str {
        "Signal that you have completed all tasks. Call this once your work is done to end \
         the agent loop. The loop continues until you call this tool."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Always
    }

    async fn run(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        if let (Some(chat_id), Some(store)) = (ctx.chat_id.as_deref(), ctx.store.as_ref()) {
            let todos = store.list_todos(chat_id).await.map_err(ToolError::from)?;
            let incomplete = todos.iter().filter(|t| t.status != "completed").count();
            if incomplete > 0 {
                return Ok(ToolOutcome::failure(
                    "Todo list has incomplete items. Verify everything is done, use \
                     update_todo_list to mark all items as completed, then call submit_task again.",
                ));
            }
        }
        Ok(ToolOutcome::success(SUBMIT_TASK_OUTPUT))
    }
}
