//! Pause the loop to ask the user something.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ApprovalPolicy, Tool, ToolContext, ToolError, ToolOutcome};

pub const USER_QUERY_OUTPUT: &str = "Awaiting user response.";

pub struct UserQueryTool;

impl UserQueryTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UserQueryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for UserQueryTool {
    fn name(&self) -> &str {
        "user_query"
    }

    fn description(&self) -> &str {
        "Pause the agent loop to request more information from the user. Use this when you \
         need clarification, additional context, or decisions from the user before \
         proceeding. Pass your question or request in the 'query' parameter. The user's \
         next message will resume the agent loop."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The question or request to show the user while awaiting their response."
                }
            }
        })
    }

    fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Always
    }

    async fn run(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        Ok(ToolOutcome::success(USER_QUERY_OUTPUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tool_context;

    #[tokio::test]
    async fn always_reports_waiting() {
        let (_dir, ctx) = tool_context();
        let outcome = UserQueryTool::new()
            .run(json!({"query": "which database?"}), &ctx)
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.output, USER_QUERY_OUTPUT);
    }
}
