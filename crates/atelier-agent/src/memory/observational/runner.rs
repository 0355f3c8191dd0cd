//! Background scheduler for Observer/Reflector cycles.
//!
//! At most one cycle runs per chat; newer requests coalesce into a single
//! pending slot behind it. Cancellation is cooperative and always leaves a
//! terminal `observation_status` behind once `observing` was emitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use atelier::chat::{ChatProvider, ChatRole};
use atelier::tokens;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::ChatEventKind;
use crate::memory::OBSERVATIONAL_STRATEGY;
use crate::memory::observational::service::ObservationMemoryService;
use crate::memory::observational::state::ObservationalState;
use crate::preprocess::ContextMessage;
use crate::store::ChatStore;

#[derive(Debug, Clone)]
pub struct MemoryRequest {
    pub chat_id: String,
    pub model: String,
    pub observer_model: Option<String>,
    pub reflector_model: Option<String>,
    pub observer_threshold: usize,
    pub buffer_tokens: usize,
    pub reflector_threshold: usize,
}

struct RunningCycle {
    handle: tokio::task::JoinHandle<()>,
    token: CancellationToken,
}

pub struct RunnerState {
    store: ChatStore,
    event_bus: Arc<EventBus>,
    provider: Arc<dyn ChatProvider>,
    running: parking_lot::Mutex<HashMap<String, RunningCycle>>,
    pending: parking_lot::Mutex<HashMap<String, MemoryRequest>>,
}

/// Cheap handle over the shared runner state; cycles clone it into their
/// spawned tasks so a finished cycle can promote the queued request.
#[derive(Clone)]
pub struct MemoryRunner {
    inner: Arc<RunnerState>,
}

impl std::ops::Deref for MemoryRunner {
    type Target = RunnerState;

    fn deref(&self) -> &RunnerState {
        &self.inner
    }
}

impl MemoryRunner {
    pub fn new(store: ChatStore, event_bus: Arc<EventBus>, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            inner: Arc::new(RunnerState {
                store,
                event_bus,
                provider,
                running: parking_lot::Mutex::new(HashMap::new()),
                pending: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fire-and-forget scheduling. A request arriving while a cycle runs
    /// replaces any previously queued request for the chat.
    pub fn schedule(&self, request: MemoryRequest) {
        let chat_id = request.chat_id.clone();
        {
            let running = self.running.lock();
            if let Some(cycle) = running.get(&chat_id) {
                if !cycle.handle.is_finished() {
                    self.pending.lock().insert(chat_id, request);
                    return;
                }
            }
        }
        self.start(request);
    }

    /// Cancel the running cycle and drop any queued request.
    pub fn cancel(&self, chat_id: &str) {
        self.pending.lock().remove(chat_id);
        if let Some(cycle) = self.running.lock().remove(chat_id) {
            cycle.token.cancel();
        }
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.running
            .lock()
            .get(chat_id)
            .map(|c| !c.handle.is_finished())
            .unwrap_or(false)
    }

    fn start(&self, request: MemoryRequest) {
        let chat_id = request.chat_id.clone();
        let token = CancellationToken::new();
        let runner = self.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let observing_emitted = Arc::new(AtomicBool::new(false));
            let terminal_emitted = Arc::new(AtomicBool::new(false));
            let chat_id = request.chat_id.clone();

            let cycle = runner.run_cycle(
                request,
                observing_emitted.clone(),
                terminal_emitted.clone(),
            );
            tokio::select! {
                result = cycle => {
                    if let Err(err) = result {
                        log::warn!("observation cycle failed for chat={}: {}", chat_id, err);
                        runner.event_bus.publish(
                            &chat_id,
                            ChatEventKind::memory_error("Observation run failed unexpectedly.", "observer"),
                        );
                    }
                }
                _ = task_token.cancelled() => {
                    if observing_emitted.load(Ordering::SeqCst)
                        && !terminal_emitted.load(Ordering::SeqCst)
                    {
                        runner.event_bus.publish(
                            &chat_id,
                            observed_status(&chat_id, 0),
                        );
                    }
                }
            }

            // Promote the coalesced request, if any.
            runner.running.lock().remove(&chat_id);
            let next = runner.pending.lock().remove(&chat_id);
            if let Some(next) = next {
                runner.start(next);
            }
        });

        self.running
            .lock()
            .insert(chat_id, RunningCycle { handle, token });
    }

    async fn run_cycle(
        &self,
        request: MemoryRequest,
        observing_emitted: Arc<AtomicBool>,
        terminal_emitted: Arc<AtomicBool>,
    ) -> Result<(), AgentError> {
        let chat_id = request.chat_id.as_str();
        let svc = ObservationMemoryService::new(self.store.clone());

        let publish_observing = |already: &AtomicBool| {
            if !already.swap(true, Ordering::SeqCst) {
                self.event_bus.publish(
                    chat_id,
                    ChatEventKind::ObservationStatus {
                        status: "observing".to_string(),
                        chat_id: chat_id.to_string(),
                        tokens_saved: None,
                        tokens_before: None,
                        tokens_after: None,
                    },
                );
            }
        };

        let latest_obs = self.store.latest_observation(chat_id).await?;
        let mut state = match self.store.get_memory_state(chat_id, OBSERVATIONAL_STRATEGY).await? {
            Some(row) => ObservationalState::from_json(&row.state_json, request.buffer_tokens),
            None => ObservationalState::new(request.buffer_tokens),
        };
        state.buffer.tokens = request.buffer_tokens.max(500);

        // First run after an activation elsewhere: seed the passive-buffer
        // waterline from the active observation.
        if let Some(obs) = &latest_obs {
            if state.buffer.up_to_message_id.is_none() {
                state.buffer.up_to_message_id = obs.observed_up_to_message_id.clone();
            }
            if state.buffer.up_to_timestamp.is_none() {
                state.buffer.up_to_timestamp = Some(obs.timestamp.clone());
            }
        }

        let observation_messages = self
            .load_observation_messages(chat_id, latest_obs.as_ref().map(|o| o.timestamp.as_str()))
            .await?;

        let (_, unobserved_active) =
            ObservationMemoryService::unobserved_for(&observation_messages, latest_obs.as_ref());
        let unobserved_tokens_active = count_context_tokens(&unobserved_active);

        let (_, unobserved_buffer) = ObservationMemoryService::split_at_waterline(
            &observation_messages,
            state.buffer.up_to_message_id.as_deref(),
            state.buffer.up_to_timestamp.as_deref(),
        );
        let unobserved_tokens_buffer = count_context_tokens(&unobserved_buffer);

        // ── Passive buffering ────────────────────────────────────────────
        let interval = state.buffer.tokens.max(500);
        let boundary = (unobserved_tokens_buffer / interval) as u64;
        if boundary > state.buffer.last_boundary && !unobserved_buffer.is_empty() {
            publish_observing(&observing_emitted);

            let prior: Vec<String> = state
                .buffer
                .chunks
                .iter()
                .rev()
                .take(2)
                .rev()
                .map(|c| c.content.clone())
                .collect();
            let chunk = svc
                .run_observer_for_chunk(
                    &unobserved_buffer,
                    &request.model,
                    request.observer_model.as_deref(),
                    self.provider.as_ref(),
                    if prior.is_empty() { None } else { Some(&prior) },
                )
                .await;
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.event_bus
                        .publish(chat_id, ChatEventKind::memory_error(err.to_string(), "observer"));
                    return Ok(());
                }
            };

            let tokens_saved = match chunk {
                Some(chunk) => {
                    let saved = unobserved_tokens_buffer.saturating_sub(chunk.token_count);
                    if chunk.observed_up_to_message_id.is_some() {
                        state.buffer.up_to_message_id = chunk.observed_up_to_message_id.clone();
                    }
                    if chunk.observed_up_to_timestamp.is_some() {
                        state.buffer.up_to_timestamp = chunk.observed_up_to_timestamp.clone();
                    }
                    state.buffer.chunks.push(chunk);
                    saved
                }
                None => 0,
            };
            state.buffer.last_boundary = boundary;
            self.store
                .save_memory_state(chat_id, OBSERVATIONAL_STRATEGY, &state.to_json())
                .await?;

            terminal_emitted.store(true, Ordering::SeqCst);
            self.event_bus.publish(chat_id, observed_status(chat_id, tokens_saved));
        }

        // ── Activation ───────────────────────────────────────────────────
        if unobserved_tokens_active < request.observer_threshold {
            if !terminal_emitted.swap(true, Ordering::SeqCst) {
                self.event_bus.publish(chat_id, observed_status(chat_id, 0));
            }
            return Ok(());
        }

        publish_observing(&observing_emitted);

        let mut chunks = state.buffer.chunks.clone();
        if chunks.is_empty() && !unobserved_active.is_empty() {
            // Threshold reached before any passive boundary fired; build a
            // fallback chunk from the active backlog.
            match svc
                .run_observer_for_chunk(
                    &unobserved_active,
                    &request.model,
                    request.observer_model.as_deref(),
                    self.provider.as_ref(),
                    None,
                )
                .await
            {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => {}
                Err(err) => {
                    self.event_bus
                        .publish(chat_id, ChatEventKind::memory_error(err.to_string(), "observer"));
                    return Ok(());
                }
            }
        }

        let activated = svc
            .activate_buffered_observations(
                chat_id,
                latest_obs.as_ref(),
                &chunks,
                unobserved_tokens_active,
            )
            .await?;
        let Some(mut active) = activated else {
            terminal_emitted.store(true, Ordering::SeqCst);
            self.event_bus.publish(chat_id, observed_status(chat_id, 0));
            return Ok(());
        };

        state.buffer.chunks.clear();
        state.buffer.last_boundary = 0;
        state.buffer.up_to_message_id = active.observed_up_to_message_id.clone();
        state.buffer.up_to_timestamp = Some(active.timestamp.clone());
        self.store
            .save_memory_state(chat_id, OBSERVATIONAL_STRATEGY, &state.to_json())
            .await?;

        let tokens_saved = unobserved_tokens_active.saturating_sub(active.token_count as usize);
        terminal_emitted.store(true, Ordering::SeqCst);
        self.event_bus.publish(chat_id, observed_status(chat_id, tokens_saved));

        // ── Reflection ───────────────────────────────────────────────────
        if (active.token_count as usize) >= request.reflector_threshold {
            terminal_emitted.store(false, Ordering::SeqCst);
            self.event_bus.publish(
                chat_id,
                ChatEventKind::ObservationStatus {
                    status: "reflecting".to_string(),
                    chat_id: chat_id.to_string(),
                    tokens_saved: None,
                    tokens_before: None,
                    tokens_after: None,
                },
            );
            let tokens_before = active.token_count as usize;

            match svc
                .run_reflector(
                    chat_id,
                    &request.model,
                    request.reflector_model.as_deref(),
                    request.reflector_threshold,
                    self.provider.as_ref(),
                )
                .await
            {
                Ok(Some(reflected)) => {
                    active = reflected;
                }
                Ok(None) => {}
                Err(err) => {
                    self.event_bus
                        .publish(chat_id, ChatEventKind::memory_error(err.to_string(), "reflector"));
                    return Ok(());
                }
            }

            state.buffer.up_to_message_id = active.observed_up_to_message_id.clone();
            state.buffer.up_to_timestamp = Some(active.timestamp.clone());
            self.store
                .save_memory_state(chat_id, OBSERVATIONAL_STRATEGY, &state.to_json())
                .await?;

            terminal_emitted.store(true, Ordering::SeqCst);
            self.event_bus.publish(
                chat_id,
                ChatEventKind::ObservationStatus {
                    status: "reflected".to_string(),
                    chat_id: chat_id.to_string(),
                    tokens_saved: None,
                    tokens_before: Some(tokens_before),
                    tokens_after: Some(active.token_count as usize),
                },
            );
        }

        Ok(())
    }

    /// Load all chat messages plus supplemental tool calls and reasoning
    /// blocks created since the latest observation, sorted by timestamp.
    async fn load_observation_messages(
        &self,
        chat_id: &str,
        latest_observation_timestamp: Option<&str>,
    ) -> Result<Vec<ContextMessage>, AgentError> {
        let mut messages: Vec<ContextMessage> = Vec::new();
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

        let mut supplemental: Vec<ContextMessage> = Vec::new();
        for tc in self.store.list_tool_calls(chat_id).await? {
            if let Some(cutoff) = latest_observation_timestamp {
                if tc.timestamp.as_str() <= cutoff {
                    continue;
                }
            }
            let mut parts = vec![
                format!("Tool call: {}", tc.name),
                format!("Input: {}", tc.input_json),
            ];
            if let Some(output) = &tc.output_text {
                parts.push(format!("Output: {}", output));
            }
            supplemental.push(
                ContextMessage::new(ChatRole::Tool, parts.join("\n")).with_timestamp(tc.timestamp),
            );
        }
        for rb in self.store.list_reasoning_blocks(chat_id).await? {
            if let Some(cutoff) = latest_observation_timestamp {
                if rb.timestamp.as_str() <= cutoff {
                    continue;
                }
            }
            supplemental.push(
                ContextMessage::new(ChatRole::Assistant, format!("[reasoning] {}", rb.content))
                    .with_timestamp(rb.timestamp),
            );
        }
        supplemental.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        messages.extend(supplemental);
        Ok(messages)
    }
}

fn observed_status(chat_id: &str, tokens_saved: usize) -> ChatEventKind {
    ChatEventKind::ObservationStatus {
        status: "observed".to_string(),
        chat_id: chat_id.to_string(),
        tokens_saved: Some(tokens_saved),
        tokens_before: None,
        tokens_after: None,
    }
}

fn count_context_tokens(messages: &[ContextMessage]) -> usize {
    messages.iter().map(|m| tokens::count_text(&m.content)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedProvider, seed_chat};

    fn request(chat_id: &str, observer_threshold: usize, reflector_threshold: usize) -> MemoryRequest {
        MemoryRequest {
            chat_id: chat_id.to_string(),
            model: "model".to_string(),
            observer_model: None,
            reflector_model: None,
            observer_threshold,
            buffer_tokens: 500,
            reflector_threshold,
        }
    }

    async fn seed_messages(store: &ChatStore, chat_id: &str, count: usize, words_each: usize) {
        for i in 0..count {
            let content = "filler word content ".repeat(words_each);
            store
                .create_message(
                    &format!("m-{}", i),
                    chat_id,
                    if i % 2 == 0 { "user" } else { "assistant" },
                    &content,
                    &format!("2026-01-01T00:{:02}:00Z", i),
                    None,
                    None,
                )
                .await
                .unwrap();
        }
    }

    async fn drain_statuses(
        sub: &mut crate::event_bus::Subscription,
    ) -> Vec<String> {
        let mut statuses = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            if let ChatEventKind::ObservationStatus { status, .. } = event.kind {
                statuses.push(status);
            }
        }
        statuses
    }

    #[tokio::test]
    async fn below_threshold_cycle_ends_with_observed() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        seed_messages(&store, &chat.id, 2, 2).await;
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(&chat.id);
        let provider = ScriptedProvider::new(vec![]);

        let runner = Arc::new(MemoryRunner::new(store, bus, provider));
        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let statuses = drain_statuses(&mut sub).await;
        assert_eq!(statuses, vec!["observed"]);
    }

    #[tokio::test]
    async fn crossing_threshold_activates_an_observation() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        seed_messages(&store, &chat.id, 6, 200).await;
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(&chat.id);
        let provider = ScriptedProvider::new(vec![]).with_completions(vec![
            "observed summary\n<current-task>keep working</current-task>".to_string(),
            "second summary".to_string(),
        ]);

        let runner = Arc::new(MemoryRunner::new(store.clone(), bus, provider));
        runner.schedule(request(&chat.id, 100, 1_000_000));
        for _ in 0..50 {
            if !runner.is_running(&chat.id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let statuses = drain_statuses(&mut sub).await;
        assert_eq!(statuses.first().map(String::as_str), Some("observing"));
        assert!(statuses.contains(&"observed".to_string()));

        let observation = store.latest_observation(&chat.id).await.unwrap().unwrap();
        assert!(observation.content.contains("summary"));
        assert_eq!(observation.current_task.as_deref(), Some("keep working"));
        assert!(observation.observed_up_to_message_id.is_some());
    }

    #[tokio::test]
    async fn coalesces_requests_behind_running_cycle() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let bus = Arc::new(EventBus::new());
        let provider = ScriptedProvider::new(vec![]);
        let runner = Arc::new(MemoryRunner::new(store, bus, provider));

        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        // At most one pending request survives coalescing.
        assert!(runner.pending.lock().len() <= 1);
    }

    #[tokio::test]
    async fn cancel_clears_pending_and_running() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let bus = Arc::new(EventBus::new());
        let provider = ScriptedProvider::new(vec![]);
        let runner = Arc::new(MemoryRunner::new(store, bus, provider));

        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        runner.schedule(request(&chat.id, 1_000_000, 2_000_000));
        runner.cancel(&chat.id);
        assert!(runner.pending.lock().is_empty());
        assert!(!runner.is_running(&chat.id));
    }
}
