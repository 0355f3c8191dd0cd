//! The agent turn runtime: a bounded, cancellable loop of assemble →
//! stream → execute → repeat.

use std::sync::Arc;

use atelier::chat::{ChatProvider, ChatRequest, ChatRole, FinishReason};
use atelier::tokens;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::context_budget::ContextBudgetManager;
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{ChatEventKind, MessageOut};
use crate::executor::{ToolExecutor, tool_call_db_id};
use crate::ids::{generate_id, utc_now_iso};
use crate::memory::observational::runner::{MemoryRequest, MemoryRunner};
use crate::memory::{MemoryMode, ObservationMemoryService};
use crate::preprocess::ContextMessage;
use crate::store::ChatStore;
use crate::store::domain::ToolCallStatus;
use crate::streamer::{LlmStreamer, StreamOptions};
use crate::tools::ToolRegistry;

const NO_TOOL_NUDGE: &str = "You used no tools and provided no response. You must use tools for \
    every response except your last response, which must have text content to the user.";

/// Outcome of one agent turn.
#[derive(Debug, Clone, Default)]
pub struct AgentLoopResult {
    /// The loop ended on its own terms (stop, submit_task)
    pub completed: bool,
    pub final_assistant_text: String,
}

pub struct AgentLoop {
    store: ChatStore,
    event_bus: Arc<EventBus>,
    provider: Arc<dyn ChatProvider>,
    budget: ContextBudgetManager,
    streamer: LlmStreamer,
    executor: Arc<ToolExecutor>,
    memory_runner: Arc<MemoryRunner>,
    registry: Arc<parking_lot::RwLock<ToolRegistry>>,
    settings: Settings,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ChatStore,
        event_bus: Arc<EventBus>,
        provider: Arc<dyn ChatProvider>,
        budget: ContextBudgetManager,
        streamer: LlmStreamer,
        executor: Arc<ToolExecutor>,
        memory_runner: Arc<MemoryRunner>,
        registry: Arc<parking_lot::RwLock<ToolRegistry>>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            event_bus,
            provider,
            budget,
            streamer,
            executor,
            memory_runner,
            registry,
            settings,
        }
    }

    /// Run one turn. `extra_messages` lets modes (plan_edit) prepend their
    /// own framing without persisting it.
    #[tracing::instrument(name = "agent.turn", skip_all, fields(chat_id = %chat_id, checkpoint_id = %checkpoint_id))]
    pub async fn run(
        &self,
        chat_id: &str,
        checkpoint_id: &str,
        content: &str,
        extra_messages: Vec<ContextMessage>,
        cancel: CancellationToken,
    ) -> Result<AgentLoopResult, AgentError> {
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| AgentError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;
        let project = self.store.get_project(&chat.project_id).await?;
        let project_path = project.as_ref().map(|p| p.path.clone());

        let mut messages = self.assemble_messages(chat_id, content).await?;
        messages.extend(extra_messages);

        let tools = self.registry.read().definitions();
        let mut reasoning = self.settings.reasoning();
        let mut last_assistant_text = String::new();

        for iteration in 1..=self.settings.max_agent_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            log::debug!("agent turn chat={} iteration={}", chat_id, iteration);

            let prepared = self
                .budget
                .prepare(
                    chat_id,
                    messages.clone(),
                    &self.settings,
                    project_path.clone(),
                    &chat.project_id,
                    self.provider.as_ref(),
                )
                .await?;

            let msg_id = generate_id("msg");
            let ts = utc_now_iso();
            let request = ChatRequest::new(self.settings.model.clone(), ContextMessage::strip_all(&prepared.messages))
                .with_tools(if tools.is_empty() { None } else { Some(tools.clone()) })
                .with_reasoning(reasoning);

            let stream_options = StreamOptions::default();
            let stream_result = tokio::select! {
                result = self.streamer.stream_completion(
                    self.provider.as_ref(),
                    &request,
                    chat_id,
                    &msg_id,
                    Some(checkpoint_id),
                    &stream_options,
                ) => result,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            let result = match stream_result {
                Ok(result) => result,
                Err(err) => {
                    // Some models reject the reasoning parameter outright;
                    // retry once without it before failing the turn.
                    let message = err.to_string();
                    if reasoning.is_some() && message.contains("status 400") {
                        log::warn!(
                            "provider rejected reasoning for model={}, retrying without it",
                            self.settings.model
                        );
                        reasoning = None;
                        let retry_request = request.with_reasoning(None);
                        let retry_stream_options = StreamOptions::default();
                        tokio::select! {
                            result = self.streamer.stream_completion(
                                self.provider.as_ref(),
                                &retry_request,
                                chat_id,
                                &msg_id,
                                Some(checkpoint_id),
                                &retry_stream_options,
                            ) => result?,
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        }
                    } else {
                        return Err(err);
                    }
                }
            };

            let final_text = if !result.text.is_empty() {
                result.text.clone()
            } else {
                result.finish_content.trim().to_string()
            };
            let has_content = !final_text.is_empty();

            if has_content {
                self.store
                    .create_message(&msg_id, chat_id, "assistant", &final_text, &ts, None, None)
                    .await?;
                self.store.update_chat_timestamp(chat_id, &ts).await?;
                self.event_bus.publish(
                    chat_id,
                    ChatEventKind::Message {
                        message: MessageOut {
                            id: msg_id.clone(),
                            role: "agent".to_string(),
                            content: final_text.clone(),
                            timestamp: ts.clone(),
                            checkpoint_id: None,
                        },
                    },
                );
                last_assistant_text = final_text.clone();
            }

            if result.finish_reason == FinishReason::Stop || result.tool_calls.is_empty() {
                if !has_content {
                    messages.push(ContextMessage::assistant(""));
                    messages.push(ContextMessage::user(NO_TOOL_NUDGE));
                    continue;
                }
                self.publish_done(chat_id, checkpoint_id);
                return Ok(AgentLoopResult {
                    completed: true,
                    final_assistant_text: last_assistant_text,
                });
            }

            let mut assistant = ContextMessage::assistant(final_text.clone()).with_message_id(msg_id.clone());
            assistant.tool_calls = Some(result.tool_calls.clone());
            messages.push(assistant);

            let tool_results = self
                .executor
                .execute_tool_calls(&result.tool_calls, chat_id, checkpoint_id, cancel.clone())
                .await?;
            for tool_result in tool_results {
                messages.push(tool_result);
            }

            self.maybe_schedule_observation(chat_id, &messages).await;

            // submit_task ends the loop once it actually completed; a
            // user_query pause ends the turn awaiting the user's reply.
            if self.loop_terminator_fired(&result.tool_calls, "submit_task").await {
                self.publish_done(chat_id, checkpoint_id);
                return Ok(AgentLoopResult {
                    completed: true,
                    final_assistant_text: last_assistant_text,
                });
            }
            if self.loop_terminator_fired(&result.tool_calls, "user_query").await {
                self.publish_done(chat_id, checkpoint_id);
                return Ok(AgentLoopResult {
                    completed: false,
                    final_assistant_text: last_assistant_text,
                });
            }
        }

        self.publish_done(chat_id, checkpoint_id);
        Ok(AgentLoopResult {
            completed: false,
            final_assistant_text: last_assistant_text,
        })
    }

    fn publish_done(&self, chat_id: &str, checkpoint_id: &str) {
        self.event_bus.publish(
            chat_id,
            ChatEventKind::AgentDone {
                checkpoint_id: Some(checkpoint_id.to_string()),
            },
        );
    }

    /// The stored conversation as provider messages, with ids for waterline
    /// tracking. Tool calls are not stored as messages; their results ride
    /// within the turn only.
    async fn assemble_messages(&self, chat_id: &str, content: &str) -> Result<Vec<ContextMessage>, AgentError> {
        let mut messages = Vec::new();
        for m in self.store.list_messages(chat_id).await? {
            let role = if m.role == "assistant" {
                ChatRole::Assistant
            } else {
                ChatRole::User
            };
            messages.push(
                ContextMessage::new(role, m.content)
                    .with_message_id(m.id)
                    .with_timestamp(m.timestamp),
            );
        }
        if messages.is_empty() {
            messages.push(ContextMessage::user(content));
        }
        Ok(messages)
    }

    async fn loop_terminator_fired(&self, calls: &[atelier::ToolCall], tool_name: &str) -> bool {
        for call in calls {
            if call.function.name != tool_name {
                continue;
            }
            if let Ok(Some(row)) = self.store.get_tool_call(&tool_call_db_id(&call.id)).await {
                if row.status == ToolCallStatus::Completed {
                    return true;
                }
            }
        }
        false
    }

    /// Kick the background observer when the unobserved tail crosses a
    /// buffer interval. The runner re-checks all thresholds itself.
    async fn maybe_schedule_observation(&self, chat_id: &str, messages: &[ContextMessage]) {
        if MemoryMode::from_name(&self.settings.memory.mode) != MemoryMode::Observational {
            return;
        }
        let latest = match self.store.latest_observation(chat_id).await {
            Ok(latest) => latest,
            Err(err) => {
                log::warn!("observation lookup failed for chat={}: {}", chat_id, err);
                return;
            }
        };
        let (_, unobserved) = ObservationMemoryService::unobserved_for(messages, latest.as_ref());
        let unobserved_tokens: usize = unobserved.iter().map(|m| tokens::count_text(&m.content)).sum();
        let interval = self.settings.memory.buffer_tokens.max(500);
        if unobserved_tokens < interval {
            return;
        }
        self.memory_runner.schedule(MemoryRequest {
            chat_id: chat_id.to_string(),
            model: self.settings.model.clone(),
            observer_model: self.settings.memory.observer_model.clone(),
            reflector_model: self.settings.memory.reflector_model.clone(),
            observer_threshold: self.settings.memory.observer_threshold,
            buffer_tokens: self.settings.memory.buffer_tokens,
            reflector_threshold: self.settings.memory.reflector_threshold,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalService, ApprovalWaiter};
    use crate::artifacts::ArtifactStore;
    use crate::paths::PathResolver;
    use crate::store::domain::AutoApproveRule;
    use crate::test_utils::{ScriptedProvider, ScriptedTurn};
    use crate::tools::ToolServices;
    use atelier::ToolCall;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ChatStore,
        bus: Arc<EventBus>,
        agent_loop: AgentLoop,
        chat_id: String,
        project_root: String,
    }

    async fn fixture(provider: Arc<ScriptedProvider>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::connect_in_memory().await.unwrap();
        let project_root = dir.path().join("project");
        std::fs::create_dir_all(&project_root).unwrap();
        let project = store
            .create_project("p", project_root.to_str().unwrap())
            .await
            .unwrap();
        let chat = store.create_chat(&project.id, "New chat").await.unwrap();

        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(parking_lot::RwLock::new(ToolRegistry::new()));
        for tool in crate::tools::builtins::all_builtin_tools() {
            registry.write().add(tool);
        }
        let resolver = PathResolver::new(dir.path().join("tool_outputs"));
        let artifacts = ArtifactStore::new(dir.path().join("tool_outputs"), 2000, 50);
        let settings = Settings::default();
        let services = Arc::new(ToolServices {
            event_bus: bus.clone(),
            provider: provider.clone(),
            settings: settings.clone(),
            registry: registry.clone(),
        });
        let approval = Arc::new(ApprovalService::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            resolver,
            artifacts.clone(),
            services,
        ));
        let waiter = Arc::new(ApprovalWaiter::new());
        let executor = Arc::new(ToolExecutor::new(
            store.clone(),
            approval,
            waiter,
            bus.clone(),
            settings.tool_parallelism,
            std::time::Duration::from_millis(300),
        ));
        let memory_runner = Arc::new(MemoryRunner::new(store.clone(), bus.clone(), provider.clone()));
        let agent_loop = AgentLoop::new(
            store.clone(),
            bus.clone(),
            provider,
            ContextBudgetManager::new(store.clone(), artifacts),
            LlmStreamer::new(store.clone(), bus.clone()),
            executor,
            memory_runner,
            registry,
            settings,
        );
        Fixture {
            _dir: dir,
            store,
            bus,
            agent_loop,
            chat_id: chat.id,
            project_root: project_root.display().to_string(),
        }
    }

    async fn seed_user_message(store: &ChatStore, chat_id: &str, content: &str) -> String {
        let ts = utc_now_iso();
        let msg = store
            .create_message(&generate_id("msg"), chat_id, "user", content, &ts, None, None)
            .await
            .unwrap();
        let cp = store
            .create_checkpoint(&generate_id("cp"), chat_id, &msg.id, "User message", &ts)
            .await
            .unwrap();
        store.link_message_checkpoint(&msg.id, &cp.id).await.unwrap();
        cp.id
    }

    fn event_kinds(sub: &mut crate::event_bus::Subscription) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind.type_name().to_string());
        }
        kinds
    }

    #[tokio::test]
    async fn text_only_turn_persists_message_and_finishes() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::Text("All done.".into())]);
        let f = fixture(provider).await;
        let cp = seed_user_message(&f.store, &f.chat_id, "hello").await;
        let mut sub = f.bus.subscribe(&f.chat_id);

        let result = f
            .agent_loop
            .run(&f.chat_id, &cp, "hello", vec![], CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        assert_eq!(result.final_assistant_text, "All done.");
        let messages = f.store.list_messages(&f.chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");

        let kinds = event_kinds(&mut sub);
        assert!(kinds.contains(&"content_delta".to_string()));
        assert!(kinds.contains(&"message".to_string()));
        assert_eq!(kinds.last().map(String::as_str), Some("agent_done"));
    }

    #[tokio::test]
    async fn tool_turn_executes_then_finishes_on_stop() {
        // The fixture owns the project root, so probe it first and inject
        // the scripted call afterwards — the script queue is shared.
        let provider = ScriptedProvider::new(vec![]);
        let f = fixture(provider.clone()).await;
        let readme = format!("{}/README.md", f.project_root);
        std::fs::write(&readme, "# hello readme\n").unwrap();
        {
            let mut turns = Vec::new();
            turns.push(ScriptedTurn::ToolCalls(vec![ToolCall::function(
                "call_1",
                "read_file",
                json!({"path": readme, "start": 1, "end": 1}).to_string(),
            )]));
            turns.push(ScriptedTurn::Text("The readme says hello.".into()));
            provider.push_turns(turns);
        }
        f.store
            .upsert_auto_approve_rule(AutoApproveRule {
                id: "r1".into(),
                field: "tool".into(),
                value: "read_file".into(),
                enabled: true,
            })
            .await
            .unwrap();
        let cp = seed_user_message(&f.store, &f.chat_id, "read the readme").await;
        let mut sub = f.bus.subscribe(&f.chat_id);

        let result = f
            .agent_loop
            .run(&f.chat_id, &cp, "read the readme", vec![], CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        let kinds = event_kinds(&mut sub);
        assert!(kinds.contains(&"tool_call_start".to_string()));
        assert!(kinds.contains(&"tool_call_end".to_string()));
        assert!(!kinds.contains(&"approval_required".to_string()));
        assert_eq!(kinds.last().map(String::as_str), Some("agent_done"));

        let rows = f.store.list_tool_calls(&f.chat_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ToolCallStatus::Completed);
    }

    #[tokio::test]
    async fn empty_response_gets_nudged_then_finishes() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::Text("".into()),
            ScriptedTurn::Text("Real answer.".into()),
        ]);
        let f = fixture(provider.clone()).await;
        let cp = seed_user_message(&f.store, &f.chat_id, "hi").await;

        let result = f
            .agent_loop
            .run(&f.chat_id, &cp, "hi", vec![], CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        assert_eq!(result.final_assistant_text, "Real answer.");
        // The second request carried the nudge.
        let requests = provider.requests.lock();
        let second = &requests[1];
        assert!(second.messages.iter().any(|m| m.content.contains("You used no tools")));
    }

    #[tokio::test]
    async fn submit_task_terminates_the_loop() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::ToolCalls(vec![ToolCall::function("c1", "submit_task", "{}".to_string())]),
            // Never reached.
            ScriptedTurn::Text("should not stream".into()),
        ]);
        let f = fixture(provider.clone()).await;
        let cp = seed_user_message(&f.store, &f.chat_id, "finish up").await;

        let result = f
            .agent_loop
            .run(&f.chat_id, &cp, "finish up", vec![], CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        // Only one streaming request went out.
        assert_eq!(provider.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::Text("never".into())]);
        let f = fixture(provider).await;
        let cp = seed_user_message(&f.store, &f.chat_id, "hi").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .agent_loop
            .run(&f.chat_id, &cp, "hi", vec![], cancel)
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
