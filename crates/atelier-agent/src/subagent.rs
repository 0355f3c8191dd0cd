//! Stripped-down agent loop for sub-agents spawned by `spawn_sub_agent`.
//!
//! Fresh conversation, filtered tool set, silent streaming, and a lower
//! iteration cap. Tool calls run directly (no approval pipeline — the
//! parent's `spawn_sub_agent` call is the approval surface) and progress is
//! published as `sub_agent_*` events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use atelier::chat::{ChatRequest, FinishReason};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::ChatEventKind;
use crate::ids::generate_id;
use crate::overview::{PROJECT_OVERVIEW_TOKEN_TARGET, apply_project_overview};
use crate::paths::PathResolver;
use crate::preprocess::ContextMessage;
use crate::store::ChatStore;
use crate::streamer::{LlmStreamer, StreamOptions};
use crate::tools::builtins::SPAWN_SUB_AGENT;
use crate::tools::{ToolContext, ToolServices};

#[derive(Debug, Clone)]
pub struct SubAgentParams {
    pub chat_id: String,
    pub sub_agent_id: String,
    pub tool_call_id: String,
    pub task: String,
    pub context_hint: Option<String>,
    pub project_root: Option<PathBuf>,
    pub project_id: Option<String>,
    pub model: String,
    pub max_iterations: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct SubAgentRunResult {
    pub output_text: String,
    /// "completed" | "cancelled" | "error" | "max_iterations"
    pub status: String,
    pub duration_ms: i64,
}

pub struct SubAgentRunner {
    services: Arc<ToolServices>,
    store: ChatStore,
    resolver: PathResolver,
}

impl SubAgentRunner {
    pub fn new(services: Arc<ToolServices>, store: ChatStore, resolver: PathResolver) -> Self {
        Self {
            services,
            store,
            resolver,
        }
    }

    fn iteration_guardrails(max_iterations: usize) -> String {
        format!(
            "You are a sub-agent handling a delegated subtask. You have at most {} iterations. \
             Work efficiently: explore only what the task needs, then finish with a clear text \
             report of what you found or changed. Your final text response is returned to the \
             parent agent verbatim.",
            max_iterations
        )
    }

    fn completion_reminder(remaining: usize, max_iterations: usize) -> String {
        format!(
            "If the task is complete, respond with your final report now. Otherwise continue \
             with tools. {} of {} iterations remain.",
            remaining, max_iterations
        )
    }

    pub async fn run(&self, params: SubAgentParams) -> SubAgentRunResult {
        let started = Instant::now();
        let result = self.run_inner(&params, started).await;
        match result {
            Ok(result) => result,
            Err(err) => SubAgentRunResult {
                output_text: format!("Sub-agent failed: {}", err),
                status: "error".to_string(),
                duration_ms: started.elapsed().as_millis() as i64,
            },
        }
    }

    async fn run_inner(
        &self,
        params: &SubAgentParams,
        started: Instant,
    ) -> Result<SubAgentRunResult, crate::error::AgentError> {
        let settings = &self.services.settings;
        let streamer = LlmStreamer::new(self.store.clone(), self.services.event_bus.clone());
        let tools = self
            .services
            .registry
            .read()
            .definitions_excluding(&[SPAWN_SUB_AGENT]);

        let mut user_content = params.task.clone();
        if let Some(hint) = &params.context_hint {
            user_content = format!("{}\n\nContext from parent: {}", user_content, hint);
        }

        let mut messages = vec![
            ContextMessage::system(settings.system_prompt()),
            ContextMessage::system(Self::iteration_guardrails(params.max_iterations)),
            ContextMessage::user(user_content),
        ];
        apply_project_overview(
            &mut messages,
            params.project_root.as_ref().and_then(|p| p.to_str()),
            PROJECT_OVERVIEW_TOKEN_TARGET,
        );

        let tool_ctx = ToolContext {
            project_root: params.project_root.clone(),
            project_id: params.project_id.clone(),
            chat_id: Some(params.chat_id.clone()),
            checkpoint_id: None,
            tool_call_id: Some(params.tool_call_id.clone()),
            store: Some(self.store.clone()),
            resolver: self.resolver.clone(),
            cancel: params.cancel.clone(),
            services: Some(self.services.clone()),
        };

        let options = StreamOptions {
            silent: true,
            suppress_content_events: true,
        };
        let mut last_text = String::new();

        for iteration in 1..=params.max_iterations {
            if params.cancel.is_cancelled() {
                return Ok(SubAgentRunResult {
                    output_text: "Sub-agent cancelled.".to_string(),
                    status: "cancelled".to_string(),
                    duration_ms: started.elapsed().as_millis() as i64,
                });
            }

            self.services.event_bus.publish(
                &params.chat_id,
                ChatEventKind::SubAgentProgress {
                    sub_agent_id: params.sub_agent_id.clone(),
                    iteration,
                    message: format!("Iteration {}", iteration),
                },
            );

            let request = ChatRequest::new(params.model.clone(), ContextMessage::strip_all(&messages))
                .with_tools(if tools.is_empty() { None } else { Some(tools.clone()) })
                .with_reasoning(settings.reasoning());
            let msg_id = generate_id("msg");
            let result = streamer
                .stream_completion(
                    self.services.provider.as_ref(),
                    &request,
                    &params.chat_id,
                    &msg_id,
                    None,
                    &options,
                )
                .await?;

            let text = if !result.text.is_empty() {
                result.text.clone()
            } else {
                result.finish_content.trim().to_string()
            };
            if !text.is_empty() {
                last_text = text.clone();
            }

            if result.finish_reason == FinishReason::Stop || result.tool_calls.is_empty() {
                if !text.is_empty() {
                    return Ok(SubAgentRunResult {
                        output_text: last_text,
                        status: "completed".to_string(),
                        duration_ms: started.elapsed().as_millis() as i64,
                    });
                }
                let remaining = params.max_iterations.saturating_sub(iteration);
                messages.push(ContextMessage::assistant(text));
                messages.push(ContextMessage::user(Self::completion_reminder(
                    remaining,
                    params.max_iterations,
                )));
                continue;
            }

            let mut assistant = ContextMessage::assistant(text);
            assistant.tool_calls = Some(result.tool_calls.clone());
            messages.push(assistant);

            for call in &result.tool_calls {
                let input: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::json!({}));
                self.services.event_bus.publish(
                    &params.chat_id,
                    ChatEventKind::SubAgentToolCall {
                        sub_agent_id: params.sub_agent_id.clone(),
                        tool_call_id: call.id.clone(),
                        tool_call: serde_json::json!({
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                            "status": "running",
                        }),
                    },
                );

                let tool = self.services.registry.read().find(&call.function.name);
                let output = match tool {
                    // The parent cannot recursively spawn from here.
                    Some(_) if call.function.name == SPAWN_SUB_AGENT => {
                        "Tool not available to sub-agents: spawn_sub_agent".to_string()
                    }
                    Some(tool) => match tool.run(input, &tool_ctx).await {
                        Ok(outcome) => outcome.output,
                        Err(err) => format!("Error: {}", err),
                    },
                    None => format!("Tool not found: {}", call.function.name),
                };
                messages.push(ContextMessage::tool_result(call.id.clone(), output));
            }
        }

        Ok(SubAgentRunResult {
            output_text: if last_text.is_empty() {
                "Sub-agent hit its iteration limit without a final report.".to_string()
            } else {
                last_text
            },
            status: "max_iterations".to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::test_utils::{ScriptedProvider, ScriptedTurn, seed_chat};
    use crate::tools::ToolRegistry;
    use atelier::ToolCall;

    async fn runner_fixture(
        provider: Arc<ScriptedProvider>,
    ) -> (tempfile::TempDir, ChatStore, Arc<EventBus>, SubAgentRunner, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(parking_lot::RwLock::new(ToolRegistry::new()));
        for tool in crate::tools::builtins::all_builtin_tools() {
            registry.write().add(tool);
        }
        let services = Arc::new(ToolServices {
            event_bus: bus.clone(),
            provider,
            settings: crate::config::Settings::default(),
            registry,
        });
        let resolver = PathResolver::new(dir.path().join("tool_outputs"));
        let runner = SubAgentRunner::new(services, store.clone(), resolver);
        (dir, store, bus, runner, chat.id)
    }

    fn params(chat_id: &str, max_iterations: usize) -> SubAgentParams {
        SubAgentParams {
            chat_id: chat_id.to_string(),
            sub_agent_id: "sa-1".to_string(),
            tool_call_id: "tc-1".to_string(),
            task: "inspect the code".to_string(),
            context_hint: None,
            project_root: None,
            project_id: None,
            model: "model".to_string(),
            max_iterations,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn completes_with_final_report() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::Text("report: all good".into())]);
        let (_dir, _store, bus, runner, chat_id) = runner_fixture(provider).await;
        let mut sub = bus.subscribe(&chat_id);

        let result = runner.run(params(&chat_id, 5)).await;
        assert_eq!(result.status, "completed");
        assert_eq!(result.output_text, "report: all good");

        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind.type_name().to_string());
        }
        assert!(kinds.contains(&"sub_agent_progress".to_string()));
        // Silent streaming: no content deltas leak to the parent chat.
        assert!(!kinds.contains(&"content_delta".to_string()));
    }

    #[tokio::test]
    async fn iteration_cap_reports_max_iterations() {
        // Text-less turns force the reminder path until the cap.
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::Text("".into()),
            ScriptedTurn::Text("".into()),
        ]);
        let (_dir, _store, _bus, runner, chat_id) = runner_fixture(provider).await;
        let result = runner.run(params(&chat_id, 2)).await;
        assert_eq!(result.status, "max_iterations");
    }

    #[tokio::test]
    async fn spawn_sub_agent_is_filtered_from_sub_agents() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::ToolCalls(vec![ToolCall::function("c1", "spawn_sub_agent", "{}".to_string())]),
            ScriptedTurn::Text("done anyway".into()),
        ]);
        let (_dir, _store, _bus, runner, chat_id) = runner_fixture(provider.clone()).await;
        let result = runner.run(params(&chat_id, 3)).await;
        assert_eq!(result.status, "completed");

        // The tool definitions sent to the provider exclude the spawner.
        let requests = provider.requests.lock();
        let tools = requests[0].tools.as_ref().unwrap();
        assert!(tools.iter().all(|t| t.function.name != "spawn_sub_agent"));
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::Text("never".into())]);
        let (_dir, _store, _bus, runner, chat_id) = runner_fixture(provider).await;
        let mut p = params(&chat_id, 3);
        p.cancel.cancel();
        let result = runner.run(p).await;
        assert_eq!(result.status, "cancelled");
    }
}
