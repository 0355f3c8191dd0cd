//! Observer and Reflector logic: waterline splitting, passive chunk
//! generation, activation, and reflection.

use atelier::chat::{ChatProvider, ChatRequest};
use atelier::tokens;
use time::OffsetDateTime;

use crate::error::AgentError;
use crate::ids::{generate_id, utc_now_iso};
use crate::memory::observational::prompts::{
    build_observer_prompt, build_reflector_prompt, parse_observation_output,
};
use crate::memory::observational::state::BufferedChunk;
use crate::preprocess::ContextMessage;
use crate::store::ChatStore;
use crate::store::domain::ObservationRow;

/// Today as a human-readable date like "February 19, 2026".
fn today_str() -> String {
    let now = OffsetDateTime::now_utc();
    format!("{} {:02}, {}", now.month(), now.day(), now.year())
}

fn last_waterline(messages: &[ContextMessage]) -> (Option<String>, Option<String>) {
    let id = messages.iter().rev().find_map(|m| m.message_id.clone());
    let ts = messages.iter().rev().find_map(|m| m.timestamp.clone());
    (id, ts)
}

pub struct ObservationMemoryService {
    store: ChatStore,
}

impl ObservationMemoryService {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    /// Split messages into (observed, unobserved) at a waterline message id,
    /// falling back to the waterline timestamp for rows without ids. An
    /// unknown waterline treats everything as unobserved.
    pub fn split_at_waterline(
        messages: &[ContextMessage],
        waterline_message_id: Option<&str>,
        waterline_timestamp: Option<&str>,
    ) -> (Vec<ContextMessage>, Vec<ContextMessage>) {
        let Some(waterline_id) = waterline_message_id else {
            return (Vec::new(), messages.to_vec());
        };
        let waterline_idx = messages
            .iter()
            .position(|m| m.message_id.as_deref() == Some(waterline_id));
        let Some(idx) = waterline_idx else {
            return (Vec::new(), messages.to_vec());
        };

        let mut observed: Vec<ContextMessage> = messages[..=idx].to_vec();
        let mut unobserved: Vec<ContextMessage> = Vec::new();
        for message in &messages[idx + 1..] {
            // Supplemental rows carry only timestamps; fold those at or
            // before the waterline timestamp into the observed side.
            let is_observed = match (&message.message_id, &message.timestamp, waterline_timestamp) {
                (None, Some(ts), Some(cutoff)) => ts.as_str() <= cutoff,
                _ => false,
            };
            if is_observed {
                observed.push(message.clone());
            } else {
                unobserved.push(message.clone());
            }
        }
        (observed, unobserved)
    }

    /// Split against the active observation's waterline.
    pub fn unobserved_for(
        messages: &[ContextMessage],
        observation: Option<&ObservationRow>,
    ) -> (Vec<ContextMessage>, Vec<ContextMessage>) {
        match observation {
            Some(obs) => Self::split_at_waterline(
                messages,
                obs.observed_up_to_message_id.as_deref(),
                Some(obs.timestamp.as_str()),
            ),
            None => (Vec::new(), messages.to_vec()),
        }
    }

    /// Run the Observer over a buffered interval, producing a chunk summary.
    /// The last couple of prior chunks ride along as dedup context.
    pub async fn run_observer_for_chunk(
        &self,
        messages: &[ContextMessage],
        model: &str,
        observer_model: Option<&str>,
        provider: &dyn ChatProvider,
        prior_chunks: Option<&[String]>,
    ) -> Result<Option<BufferedChunk>, AgentError> {
        if messages.is_empty() {
            return Ok(None);
        }
        let clean = ContextMessage::strip_all(messages);
        let prompt = build_observer_prompt(None, &clean, &today_str(), prior_chunks);
        let request = ChatRequest::new(observer_model.unwrap_or(model), prompt).with_sampling(4096, 0.1);
        let raw = provider
            .chat(&request)
            .await
            .map_err(|e| AgentError::Provider(format!("observer call failed: {}", e)))?;
        let (content, current_task, suggested_response) = parse_observation_output(&raw);
        if content.is_empty() {
            return Ok(None);
        }
        let (up_to_id, up_to_ts) = last_waterline(messages);
        Ok(Some(BufferedChunk {
            token_count: tokens::count_text(&content),
            content,
            observed_up_to_message_id: up_to_id,
            observed_up_to_timestamp: up_to_ts,
            current_task,
            suggested_response,
        }))
    }

    /// Activate buffered chunks into a new Observation generation. The
    /// previous generation's content is carried into the merge; earlier
    /// generations stay until the Reflector prunes them.
    pub async fn activate_buffered_observations(
        &self,
        chat_id: &str,
        base_observation: Option<&ObservationRow>,
        chunks: &[BufferedChunk],
        trigger_token_count: usize,
    ) -> Result<Option<ObservationRow>, AgentError> {
        if chunks.is_empty() {
            return Ok(None);
        }

        let mut merged_parts: Vec<String> = Vec::new();
        if let Some(base) = base_observation {
            merged_parts.push(base.content.clone());
        }
        merged_parts.extend(chunks.iter().map(|c| c.content.clone()));
        let content = merged_parts.join("\n\n");

        let generation = base_observation.map(|o| o.generation + 1).unwrap_or(0);
        // Collision safety: generation is unique per chat.
        if let Some(existing) = self
            .store
            .list_observations(chat_id)
            .await?
            .into_iter()
            .find(|o| o.generation == generation)
        {
            self.store.delete_observation(&existing.id).await?;
        }

        let last = chunks.last().expect("chunks checked non-empty");
        let observation = ObservationRow {
            id: generate_id("obs"),
            chat_id: chat_id.to_string(),
            generation,
            token_count: tokens::count_text(&content) as i64,
            content,
            trigger_token_count: Some(trigger_token_count as i64),
            observed_up_to_message_id: last.observed_up_to_message_id.clone(),
            current_task: last.current_task.clone(),
            suggested_response: last.suggested_response.clone(),
            timestamp: utc_now_iso(),
        };
        self.store.create_observation(observation.clone()).await?;
        log::info!(
            "activated observation chat={} gen={} tokens={}",
            chat_id,
            generation,
            observation.token_count
        );
        Ok(Some(observation))
    }

    /// Run the Reflector when the active observation is too large. Inserts a
    /// higher generation and deletes all earlier ones.
    pub async fn run_reflector(
        &self,
        chat_id: &str,
        model: &str,
        reflector_model: Option<&str>,
        reflector_threshold: usize,
        provider: &dyn ChatProvider,
    ) -> Result<Option<ObservationRow>, AgentError> {
        let Some(latest) = self.store.latest_observation(chat_id).await? else {
            return Ok(None);
        };
        if (latest.token_count as usize) < reflector_threshold {
            return Ok(None);
        }

        let prompt = build_reflector_prompt(&latest.content);
        let request = ChatRequest::new(reflector_model.unwrap_or(model), prompt).with_sampling(4096, 0.1);
        let raw = provider
            .chat(&request)
            .await
            .map_err(|e| AgentError::Provider(format!("reflector call failed: {}", e)))?;
        let (content, current_task, suggested_response) = parse_observation_output(&raw);
        if content.is_empty() {
            return Ok(None);
        }

        let new_generation = latest.generation + 1;
        let observation = ObservationRow {
            id: generate_id("obs"),
            chat_id: chat_id.to_string(),
            generation: new_generation,
            token_count: tokens::count_text(&content) as i64,
            content,
            trigger_token_count: latest.trigger_token_count,
            observed_up_to_message_id: latest.observed_up_to_message_id.clone(),
            current_task,
            suggested_response,
            timestamp: utc_now_iso(),
        };
        self.store.create_observation(observation.clone()).await?;
        self.store
            .delete_observations_before_generation(chat_id, new_generation)
            .await?;
        log::info!(
            "reflected observation chat={} gen={} tokens={} (was {})",
            chat_id,
            new_generation,
            observation.token_count,
            latest.token_count
        );
        Ok(Some(observation))
    }

    /// Assemble the prompt when the observational strategy is active:
    /// `[system] [observations block] [continuation exchange] [unobserved]`.
    pub fn build_context_with_observations(
        observation: &ObservationRow,
        unobserved: Vec<ContextMessage>,
        system_prompt_msg: Option<ContextMessage>,
    ) -> Vec<ContextMessage> {
        let mut result = Vec::new();
        if let Some(system) = system_prompt_msg {
            result.push(system);
        }
        result.push(ContextMessage::system(Self::format_observations_for_context(
            &observation.content,
            observation.current_task.as_deref(),
        )));

        if let Some(suggested) = &observation.suggested_response {
            result.push(ContextMessage::user(
                "Here is a summary of the conversation history so far. Use it naturally as \
                 your memory — don't acknowledge it explicitly.",
            ));
            result.push(ContextMessage::assistant(format!(
                "Understood. I'll continue from where we left off: {}",
                suggested
            )));
        }
        result.extend(unobserved);
        result
    }

    pub fn format_observations_for_context(observations: &str, current_task: Option<&str>) -> String {
        let mut lines = vec![
            "<observations>".to_string(),
            "The following is a structured memory of this conversation so far.".to_string(),
            "Treat it as your long-term memory. Prefer the MOST RECENT information for".to_string(),
            "any conflicting facts. Assume planned actions in the past were completed".to_string(),
            "unless explicitly stated otherwise. Do not mention this memory system — just".to_string(),
            "use the information naturally.".to_string(),
            String::new(),
            observations.to_string(),
        ];
        if let Some(task) = current_task {
            lines.push(String::new());
            lines.push(format!("**Current task**: {}", task));
        }
        lines.push("</observations>".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedProvider, seed_chat};

    fn msg(id: Option<&str>, content: &str) -> ContextMessage {
        let mut m = ContextMessage::user(content);
        if let Some(id) = id {
            m = m.with_message_id(id);
        }
        m
    }

    fn observation(generation: i64, waterline: Option<&str>, tokens: i64) -> ObservationRow {
        ObservationRow {
            id: generate_id("obs"),
            chat_id: "chat-1".into(),
            generation,
            content: "existing log".into(),
            token_count: tokens,
            trigger_token_count: None,
            observed_up_to_message_id: waterline.map(str::to_string),
            current_task: None,
            suggested_response: Some("keep going".into()),
            timestamp: utc_now_iso(),
        }
    }

    #[test]
    fn split_honors_waterline_id() {
        let messages = vec![msg(Some("m1"), "a"), msg(Some("m2"), "b"), msg(Some("m3"), "c")];
        let (observed, unobserved) =
            ObservationMemoryService::split_at_waterline(&messages, Some("m2"), None);
        assert_eq!(observed.len(), 2);
        assert_eq!(unobserved.len(), 1);
        assert_eq!(unobserved[0].message_id.as_deref(), Some("m3"));
    }

    #[test]
    fn missing_waterline_treats_all_unobserved() {
        let messages = vec![msg(Some("m1"), "a")];
        let (observed, unobserved) =
            ObservationMemoryService::split_at_waterline(&messages, Some("gone"), None);
        assert!(observed.is_empty());
        assert_eq!(unobserved.len(), 1);
    }

    #[test]
    fn messages_without_ids_are_unobserved() {
        let messages = vec![msg(Some("m1"), "a"), msg(None, "fresh")];
        let (_, unobserved) =
            ObservationMemoryService::split_at_waterline(&messages, Some("m1"), None);
        assert_eq!(unobserved.len(), 1);
        assert_eq!(unobserved[0].content, "fresh");
    }

    #[test]
    fn context_includes_observation_block_and_continuation() {
        let obs = observation(0, Some("m1"), 100);
        let out = ObservationMemoryService::build_context_with_observations(
            &obs,
            vec![msg(Some("m9"), "latest")],
            Some(ContextMessage::system("prompt")),
        );
        assert_eq!(out[0].content, "prompt");
        assert!(out[1].content.starts_with("<observations>"));
        assert!(out[1].content.contains("existing log"));
        assert!(out[2].content.contains("summary of the conversation"));
        assert!(out[3].content.contains("keep going"));
        assert_eq!(out[4].content, "latest");
    }

    #[tokio::test]
    async fn activation_bumps_generation_and_merges_chunks() {
        let store = crate::store::ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        store
            .create_message("m1", &chat.id, "user", "x", &utc_now_iso(), None, None)
            .await
            .unwrap();
        let mut base = observation(0, Some("m1"), 50);
        base.chat_id = chat.id.clone();
        store.create_observation(base.clone()).await.unwrap();

        let svc = ObservationMemoryService::new(store.clone());
        let chunks = vec![
            BufferedChunk {
                content: "chunk one".into(),
                token_count: 10,
                observed_up_to_message_id: Some("m1".into()),
                observed_up_to_timestamp: None,
                current_task: Some("task".into()),
                suggested_response: None,
            },
        ];
        let activated = svc
            .activate_buffered_observations(&chat.id, Some(&base), &chunks, 1234)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(activated.generation, 1);
        assert!(activated.content.contains("existing log"));
        assert!(activated.content.contains("chunk one"));
        assert_eq!(activated.trigger_token_count, Some(1234));
        // Both generations exist until reflection prunes.
        assert_eq!(store.list_observations(&chat.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reflector_below_threshold_is_a_no_op() {
        let store = crate::store::ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let mut base = observation(0, None, 100);
        base.chat_id = chat.id.clone();
        store.create_observation(base).await.unwrap();

        let svc = ObservationMemoryService::new(store.clone());
        let provider = ScriptedProvider::new(vec![]);
        let result = svc
            .run_reflector(&chat.id, "model", None, 8000, provider.as_ref())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reflector_replaces_earlier_generations() {
        let store = crate::store::ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        for generation in [0, 1] {
            let mut obs = observation(generation, None, 9000);
            obs.chat_id = chat.id.clone();
            store.create_observation(obs).await.unwrap();
        }

        let svc = ObservationMemoryService::new(store.clone());
        let provider =
            ScriptedProvider::new(vec![]).with_completions(vec!["compressed log".to_string()]);
        let reflected = svc
            .run_reflector(&chat.id, "model", None, 8000, provider.as_ref())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reflected.generation, 2);
        let remaining = store.list_observations(&chat.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "compressed log");
    }
}
