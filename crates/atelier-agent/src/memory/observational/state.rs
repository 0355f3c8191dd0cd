//! Persisted observer-buffer state (the MemoryState JSON blob).

use serde::{Deserialize, Serialize};

/// A chunk summary produced passively between activation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedChunk {
    pub content: String,
    pub token_count: usize,
    pub observed_up_to_message_id: Option<String>,
    pub observed_up_to_timestamp: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub suggested_response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferState {
    /// Buffering interval in tokens (floored at 500 when loaded)
    pub tokens: usize,
    /// Last boundary number a chunk was produced for
    pub last_boundary: u64,
    /// Passive-buffer waterline
    pub up_to_message_id: Option<String>,
    pub up_to_timestamp: Option<String>,
    #[serde(default)]
    pub chunks: Vec<BufferedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationalState {
    pub buffer: BufferState,
}

impl ObservationalState {
    pub fn new(buffer_tokens: usize) -> Self {
        Self {
            buffer: BufferState {
                tokens: buffer_tokens.max(500),
                last_boundary: 0,
                up_to_message_id: None,
                up_to_timestamp: None,
                chunks: Vec::new(),
            },
        }
    }

    pub fn from_json(raw: &str, default_buffer_tokens: usize) -> Self {
        match serde_json::from_str::<ObservationalState>(raw) {
            Ok(mut state) => {
                state.buffer.tokens = state.buffer.tokens.max(500);
                state
            }
            Err(err) => {
                log::warn!("resetting malformed memory state: {}", err);
                Self::new(default_buffer_tokens)
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Drop buffered chunks whose waterline message was deleted (revert).
    pub fn retain_chunks_with_existing_messages(&mut self, existing: &[String]) {
        self.buffer.chunks.retain(|chunk| match &chunk.observed_up_to_message_id {
            Some(id) => existing.iter().any(|m| m == id),
            None => true,
        });
        if self.buffer.chunks.is_empty() {
            self.buffer.last_boundary = 0;
        }
        if let Some(id) = &self.buffer.up_to_message_id {
            if !existing.iter().any(|m| m == id) {
                self.buffer.up_to_message_id = self
                    .buffer
                    .chunks
                    .last()
                    .and_then(|c| c.observed_up_to_message_id.clone());
                self.buffer.up_to_timestamp = self
                    .buffer
                    .chunks
                    .last()
                    .and_then(|c| c.observed_up_to_timestamp.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut state = ObservationalState::new(1000);
        state.buffer.last_boundary = 3;
        state.buffer.chunks.push(BufferedChunk {
            content: "chunk".into(),
            token_count: 42,
            observed_up_to_message_id: Some("msg-5".into()),
            observed_up_to_timestamp: Some("t".into()),
            current_task: None,
            suggested_response: None,
        });
        let json = state.to_json();
        assert!(json.contains("lastBoundary"));
        let back = ObservationalState::from_json(&json, 500);
        assert_eq!(back.buffer.last_boundary, 3);
        assert_eq!(back.buffer.chunks.len(), 1);
    }

    #[test]
    fn malformed_json_resets_cleanly() {
        let state = ObservationalState::from_json("not json", 900);
        assert_eq!(state.buffer.tokens, 900);
        assert!(state.buffer.chunks.is_empty());
    }

    #[test]
    fn interval_is_floored_at_500() {
        let state = ObservationalState::new(100);
        assert_eq!(state.buffer.tokens, 500);
    }

    #[test]
    fn retain_drops_chunks_for_deleted_messages() {
        let mut state = ObservationalState::new(1000);
        for id in ["msg-1", "msg-2"] {
            state.buffer.chunks.push(BufferedChunk {
                content: id.into(),
                token_count: 1,
                observed_up_to_message_id: Some(id.into()),
                observed_up_to_timestamp: None,
                current_task: None,
                suggested_response: None,
            });
        }
        state.buffer.up_to_message_id = Some("msg-2".into());

        state.retain_chunks_with_existing_messages(&["msg-1".to_string()]);
        assert_eq!(state.buffer.chunks.len(), 1);
        assert_eq!(state.buffer.up_to_message_id.as_deref(), Some("msg-1"));
    }
}
