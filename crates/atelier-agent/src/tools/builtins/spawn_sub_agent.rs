//! Delegate a subtask to a sub-agent running its own loop.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::events::ChatEventKind;
use crate::ids::{generate_id, utc_now_iso};
use crate::store::domain::SubAgentRunRow;
use crate::subagent::{SubAgentParams, SubAgentRunner};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

pub struct SpawnSubAgentTool;

impl SpawnSubAgentTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SpawnSubAgentTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SpawnSubAgentTool {
    fn name(&self) -> &str {
        "spawn_sub_agent"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained subtask to a sub-agent with its own fresh conversation \
         and tool access. Use for parallelizable or exploratory work. Pass the task \
         description in 'task' and any relevant findings in 'context_hint'. Returns the \
         sub-agent's final report."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["task"],
            "properties": {
                "task": {"type": "string", "description": "The subtask to perform"},
                "context_hint": {
                    "type": "string",
                    "description": "Context from the parent conversation the sub-agent needs"
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if task.is_empty() {
            return Ok(ToolOutcome::failure("Error: task is required."));
        }
        let context_hint = args
            .get("context_hint")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let (Some(chat_id), Some(store), Some(services)) =
            (ctx.chat_id.clone(), ctx.store.clone(), ctx.services.clone())
        else {
            return Ok(ToolOutcome::failure("Error: chat context required."));
        };
        let tool_call_id = ctx.tool_call_id.clone().unwrap_or_default();
        let model = services.settings.sub_agent_model().to_string();
        let max_iterations = services.settings.sub_agent.max_iterations;

        let sub_agent_id = generate_id("sa");
        store
            .create_sub_agent_run(SubAgentRunRow {
                id: sub_agent_id.clone(),
                chat_id: chat_id.clone(),
                tool_call_id: tool_call_id.clone(),
                task: task.clone(),
                model: model.clone(),
                status: "running".to_string(),
                output_text: None,
                duration_ms: None,
                timestamp: utc_now_iso(),
            })
            .await
            .map_err(ToolError::from)?;

        services.event_bus.publish(
            &chat_id,
            ChatEventKind::SubAgentStart {
                sub_agent_id: sub_agent_id.clone(),
                task: task.clone(),
                model: model.clone(),
                tool_call_id: tool_call_id.clone(),
            },
        );

        let runner = SubAgentRunner::new(services.clone(), store.clone(), ctx.resolver.clone());
        let result = runner
            .run(SubAgentParams {
                chat_id: chat_id.clone(),
                sub_agent_id: sub_agent_id.clone(),
                tool_call_id,
                task,
                context_hint,
                project_root: ctx.project_root.clone(),
                project_id: ctx.project_id.clone(),
                model,
                max_iterations,
                cancel: ctx.cancel.clone(),
            })
            .await;

        store
            .set_sub_agent_run_status(
                &sub_agent_id,
                &result.status,
                Some(result.output_text.clone()),
                Some(result.duration_ms),
            )
            .await
            .map_err(ToolError::from)?;

        services.event_bus.publish(
            &chat_id,
            ChatEventKind::SubAgentEnd {
                sub_agent_id,
                status: result.status.clone(),
                output: result.output_text.clone(),
                duration: result.duration_ms,
            },
        );

        if result.status == "error" {
            return Ok(ToolOutcome::failure(result.output_text));
        }
        Ok(ToolOutcome::success(format!(
            "Sub-agent finished ({}):\n\n{}",
            result.status, result.output_text
        )))
    }
}
