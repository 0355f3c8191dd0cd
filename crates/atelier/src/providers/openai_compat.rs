//! OpenAI-compatible chat provider (OpenRouter, Groq, local gateways).
//!
//! Speaks the `/chat/completions` wire with `stream: true` server-sent
//! events. Tool-call fragments arrive indexed; they are forwarded as typed
//! chunks and also assembled here so the stream always ends with
//! `ToolUseComplete` items before `Done`. Upstream 429/5xx responses are
//! retried with a fixed backoff ladder, but only before the first chunk has
//! been yielded — a broken stream is never silently restarted.

use std::collections::BTreeMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::chat::{
    ChatProvider, ChatRequest, ChatStream, FinishReason, ModelInfo, StreamChunk,
};
use crate::error::LLMError;
use crate::{FunctionCall, ToolCall, Usage};

const BACKOFF_SECS: [u64; 4] = [5, 10, 15, 20];

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
    completed: bool,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn build_payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": wire_messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if stream {
            payload["stream"] = Value::Bool(true);
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                payload["tools"] = serde_json::to_value(tools).unwrap_or(Value::Null);
            }
        }
        if let Some(effort) = request.reasoning {
            payload["reasoning"] = json!({"effort": effort.to_string()});
        }
        payload
    }

    /// POST with the retry ladder applied to 429/5xx responses.
    async fn post_with_retry(&self, payload: &Value) -> Result<reqwest::Response, LLMError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0usize;
        loop {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < BACKOFF_SECS.len() {
                let jitter_ms = rand::thread_rng().gen_range(0..1000);
                log::warn!(
                    "provider returned {}, retrying in {}s (attempt {})",
                    status,
                    BACKOFF_SECS[attempt],
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECS[attempt]) + Duration::from_millis(jitter_ms))
                    .await;
                attempt += 1;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(LLMError::HttpError(format!(
                "status {} from provider: {}",
                status.as_u16(),
                truncate(&body, 400)
            )));
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    let mut end = max.min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    &text[..end.min(text.len())]
}

fn wire_messages(request: &ChatRequest) -> Vec<Value> {
    request
        .messages
        .iter()
        .map(|m| {
            let mut msg = json!({
                "role": m.role.as_str(),
                "content": m.content,
            });
            if let Some(calls) = &m.tool_calls {
                msg["tool_calls"] = serde_json::to_value(calls).unwrap_or(Value::Null);
            }
            if let Some(id) = &m.tool_call_id {
                msg["tool_call_id"] = Value::String(id.clone());
            }
            msg
        })
        .collect()
}

/// Fold one streamed `tool_calls` delta entry into the accumulator, emitting
/// start/delta chunks as fields become known.
fn accumulate_tool_delta(
    pending: &mut BTreeMap<usize, PendingCall>,
    entry: &Value,
    fallback_index: usize,
    out: &mut Vec<StreamChunk>,
) {
    let index = entry
        .get("index")
        .and_then(Value::as_u64)
        .map(|i| i as usize)
        .unwrap_or(fallback_index);
    let slot = pending.entry(index).or_default();
    if slot.completed {
        // Providers that emit both incremental deltas and a final
        // "output_item.done" style record repeat the call; ignore repeats.
        return;
    }
    if let Some(id) = entry.get("id").and_then(Value::as_str) {
        if !id.is_empty() {
            slot.id = id.to_string();
        }
    }
    if let Some(function) = entry.get("function") {
        if let Some(name) = function.get("name").and_then(Value::as_str) {
            if !name.is_empty() && slot.name != name {
                slot.name.push_str(name);
            }
        }
        if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
            if !arguments.is_empty() {
                slot.arguments.push_str(arguments);
                out.push(StreamChunk::ToolUseInputDelta {
                    index,
                    partial_json: arguments.to_string(),
                });
            }
        }
    }
    if !slot.started && !slot.id.is_empty() && !slot.name.is_empty() {
        slot.started = true;
        out.push(StreamChunk::ToolUseStart {
            index,
            id: slot.id.clone(),
            name: slot.name.clone(),
        });
    }
}

fn drain_completed_calls(pending: &mut BTreeMap<usize, PendingCall>, out: &mut Vec<StreamChunk>) {
    for (index, slot) in pending.iter_mut() {
        if slot.completed || slot.name.is_empty() {
            continue;
        }
        slot.completed = true;
        let arguments = if slot.arguments.is_empty() {
            "{}".to_string()
        } else {
            slot.arguments.clone()
        };
        out.push(StreamChunk::ToolUseComplete {
            index: *index,
            tool_call: ToolCall {
                id: slot.id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: slot.name.clone(),
                    arguments,
                },
            },
        });
    }
}

/// Translate one SSE data frame into chunks.
fn parse_frame(
    data: &str,
    pending: &mut BTreeMap<usize, PendingCall>,
    finish_seen: &mut Option<FinishReason>,
    out: &mut Vec<StreamChunk>,
) -> Result<(), LLMError> {
    let value: Value = serde_json::from_str(data).map_err(|e| LLMError::ResponseFormatError {
        message: format!("bad stream frame: {}", e),
        raw_response: truncate(data, 400).to_string(),
    })?;

    if let Some(usage) = value.get("usage") {
        if usage.is_object() {
            if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                out.push(StreamChunk::Usage(parsed));
            }
        }
    }

    let Some(choice) = value.get("choices").and_then(Value::as_array).and_then(|c| c.first())
    else {
        return Ok(());
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                out.push(StreamChunk::Text(content.to_string()));
            }
        }
        if let Some(reasoning) = delta.get("reasoning").and_then(Value::as_str) {
            if !reasoning.is_empty() {
                out.push(StreamChunk::Reasoning(reasoning.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (i, entry) in calls.iter().enumerate() {
                accumulate_tool_delta(pending, entry, i, out);
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        *finish_seen = Some(FinishReason::from_wire(reason));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        if !self.has_credentials() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LLMError::HttpError(format!(
                "status {} listing models",
                response.status().as_u16()
            )));
        }
        let body: Value = response.json().await?;
        let data = body.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(data
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<ModelInfo>(entry).ok())
            .collect())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, LLMError> {
        if !self.has_credentials() {
            return Err(LLMError::AuthError("no API key configured".to_string()));
        }
        let payload = self.build_payload(request, false);
        let response = self.post_with_retry(&payload).await?;
        let body: Value = response.json().await?;
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(content.to_string())
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, LLMError> {
        if !self.has_credentials() {
            return Err(LLMError::AuthError("no API key configured".to_string()));
        }
        let payload = self.build_payload(request, true);
        let response = self.post_with_retry(&payload).await?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, LLMError>>(64);
        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            let mut pending: BTreeMap<usize, PendingCall> = BTreeMap::new();
            let mut finish_seen: Option<FinishReason> = None;
            let mut done_emitted = false;

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            break;
                        }
                        let mut out = Vec::new();
                        if let Err(err) =
                            parse_frame(&event.data, &mut pending, &mut finish_seen, &mut out)
                        {
                            log::debug!("skipping malformed stream frame: {}", err);
                            continue;
                        }
                        for chunk in out {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(LLMError::HttpError(format!("stream read failed: {}", err))))
                            .await;
                        done_emitted = true;
                        break;
                    }
                }
            }

            if !done_emitted {
                let mut out = Vec::new();
                drain_completed_calls(&mut pending, &mut out);
                let finish_reason = match finish_seen {
                    Some(reason) => reason,
                    None if out.iter().any(|c| matches!(c, StreamChunk::ToolUseComplete { .. })) => {
                        FinishReason::ToolCalls
                    }
                    None => FinishReason::Stop,
                };
                out.push(StreamChunk::Done {
                    finish_reason,
                    content: String::new(),
                });
                for chunk in out {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(frames: &[&str]) -> Vec<StreamChunk> {
        let mut pending = BTreeMap::new();
        let mut finish = None;
        let mut out = Vec::new();
        for frame in frames {
            parse_frame(frame, &mut pending, &mut finish, &mut out).unwrap();
        }
        drain_completed_calls(&mut pending, &mut out);
        out
    }

    #[test]
    fn content_deltas_become_text_chunks() {
        let out = collect_frames(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ]);
        let text: String = out
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn fragmented_tool_call_assembles_by_index() {
        let out = collect_frames(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"/tmp/a\"}"}}]}}]}"#,
            r#"{"choices":[{"finish_reason":"tool_calls","delta":{}}]}"#,
        ]);

        let complete: Vec<&ToolCall> = out
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolUseComplete { tool_call, .. } => Some(tool_call),
                _ => None,
            })
            .collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].id, "call_1");
        assert_eq!(complete[0].function.name, "read_file");
        assert_eq!(complete[0].function.arguments, "{\"path\":\"/tmp/a\"}");

        assert!(out.iter().any(|c| matches!(
            c,
            StreamChunk::ToolUseStart { id, name, .. } if id == "call_1" && name == "read_file"
        )));
    }

    #[test]
    fn duplicate_complete_entries_are_ignored() {
        let mut pending = BTreeMap::new();
        let mut finish = None;
        let mut out = Vec::new();
        let frame = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"grep","arguments":"{}"}}]}}]}"#;
        parse_frame(frame, &mut pending, &mut finish, &mut out).unwrap();
        drain_completed_calls(&mut pending, &mut out);
        // Re-delivery of the same item after completion must not duplicate.
        parse_frame(frame, &mut pending, &mut finish, &mut out).unwrap();
        drain_completed_calls(&mut pending, &mut out);
        let completes = out
            .iter()
            .filter(|c| matches!(c, StreamChunk::ToolUseComplete { .. }))
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn parallel_calls_keep_separate_indexes() {
        let out = collect_frames(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"read_file","arguments":"{}"}},{"index":1,"id":"b","function":{"name":"grep","arguments":"{}"}}]}}]}"#,
        ]);
        let ids: Vec<String> = out
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolUseComplete { tool_call, .. } => Some(tool_call.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reasoning_deltas_pass_through() {
        let out = collect_frames(&[r#"{"choices":[{"delta":{"reasoning":"thinking..."}}]}"#]);
        assert!(matches!(&out[0], StreamChunk::Reasoning(r) if r == "thinking..."));
    }
}
