//! One streaming LLM call: consume typed chunks, publish delta events,
//! persist reasoning blocks, and assemble tool calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use atelier::chat::{ChatProvider, ChatRequest, FinishReason, StreamChunk};
use atelier::{FunctionCall, ToolCall, tokens};
use futures_util::StreamExt;

use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{ChatEventKind, ReasoningBlockOut};
use crate::ids::{generate_id, millis_since, utc_now_iso};
use crate::store::ChatStore;
use crate::store::domain::ReasoningBlockRow;

/// Result of a single streaming LLM call.
#[derive(Debug, Clone)]
pub struct StreamResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub reasoning_blocks: Vec<(String, String)>,
    pub finish_reason: FinishReason,
    pub finish_content: String,
}

/// Per-call knobs: sub-agents stream silently, and a turn retried without
/// reasoning reuses the same message id without re-publishing content.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub silent: bool,
    pub suppress_content_events: bool,
}

pub struct LlmStreamer {
    store: ChatStore,
    event_bus: Arc<EventBus>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

struct ReasoningState {
    block_id: String,
    started_at: String,
    content: String,
    active: bool,
}

impl LlmStreamer {
    pub fn new(store: ChatStore, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn stream_completion(
        &self,
        provider: &dyn ChatProvider,
        request: &ChatRequest,
        chat_id: &str,
        msg_id: &str,
        checkpoint_id: Option<&str>,
        options: &StreamOptions,
    ) -> Result<StreamResult, AgentError> {
        let mut stream = provider.chat_stream(request).await?;

        let mut text = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut finish_content = String::new();
        let mut completed: BTreeMap<usize, ToolCall> = BTreeMap::new();
        let mut partial: BTreeMap<usize, PartialCall> = BTreeMap::new();
        let mut reasoning_blocks: Vec<(String, String)> = Vec::new();
        let mut reasoning = ReasoningState {
            block_id: generate_id("rb"),
            started_at: utc_now_iso(),
            content: String::new(),
            active: false,
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::Provider(e.to_string()))?;
            match chunk {
                StreamChunk::Text(delta) => {
                    self.finish_reasoning(chat_id, checkpoint_id, &mut reasoning, &mut reasoning_blocks, options)
                        .await?;
                    text.push_str(&delta);
                    if !options.silent && !options.suppress_content_events {
                        self.event_bus.publish(
                            chat_id,
                            ChatEventKind::ContentDelta {
                                message_id: msg_id.to_string(),
                                delta,
                            },
                        );
                    }
                }
                StreamChunk::Reasoning(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    let is_first = !reasoning.active;
                    if is_first {
                        reasoning.block_id = generate_id("rb");
                        reasoning.started_at = utc_now_iso();
                        reasoning.content.clear();
                        reasoning.active = true;
                    }
                    reasoning.content.push_str(&delta);
                    if !options.silent {
                        if is_first {
                            self.event_bus.publish(
                                chat_id,
                                ChatEventKind::ReasoningStart {
                                    reasoning_block: ReasoningBlockOut {
                                        id: reasoning.block_id.clone(),
                                        content: reasoning.content.clone(),
                                        timestamp: reasoning.started_at.clone(),
                                        checkpoint_id: checkpoint_id.map(str::to_string),
                                        duration: None,
                                        tokens: None,
                                    },
                                },
                            );
                        } else {
                            self.event_bus.publish(
                                chat_id,
                                ChatEventKind::ReasoningDelta {
                                    reasoning_block_id: reasoning.block_id.clone(),
                                    delta,
                                },
                            );
                        }
                    }
                }
                StreamChunk::ToolUseStart { index, id, name } => {
                    self.finish_reasoning(chat_id, checkpoint_id, &mut reasoning, &mut reasoning_blocks, options)
                        .await?;
                    let slot = partial.entry(index).or_default();
                    if slot.id.is_empty() {
                        slot.id = id;
                    }
                    if slot.name.is_empty() {
                        slot.name = name;
                    }
                }
                StreamChunk::ToolUseInputDelta { index, partial_json } => {
                    partial.entry(index).or_default().arguments.push_str(&partial_json);
                }
                StreamChunk::ToolUseComplete { index, tool_call } => {
                    self.finish_reasoning(chat_id, checkpoint_id, &mut reasoning, &mut reasoning_blocks, options)
                        .await?;
                    // Some providers deliver both incremental deltas and the
                    // completed item; the completed item wins, and an id seen
                    // on another index is a duplicate.
                    let duplicate = completed
                        .values()
                        .any(|existing| !tool_call.id.is_empty() && existing.id == tool_call.id);
                    if !duplicate {
                        partial.remove(&index);
                        completed.insert(index, tool_call);
                    }
                }
                StreamChunk::Usage(_) => {}
                StreamChunk::Done {
                    finish_reason: reason,
                    content,
                } => {
                    finish_reason = reason;
                    finish_content = content;
                    self.finish_reasoning(chat_id, checkpoint_id, &mut reasoning, &mut reasoning_blocks, options)
                        .await?;
                }
            }
        }

        // Fragments that never saw a ToolUseComplete still count when they
        // have enough to execute.
        for (index, slot) in partial {
            if completed.contains_key(&index) || slot.name.is_empty() {
                continue;
            }
            let duplicate = completed
                .values()
                .any(|existing| !slot.id.is_empty() && existing.id == slot.id);
            if duplicate {
                continue;
            }
            completed.insert(
                index,
                ToolCall {
                    id: slot.id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: slot.name,
                        arguments: if slot.arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            slot.arguments
                        },
                    },
                },
            );
        }

        let tool_calls: Vec<ToolCall> = completed.into_values().collect();
        if !tool_calls.is_empty() && finish_reason == FinishReason::Stop {
            finish_reason = FinishReason::ToolCalls;
        }

        Ok(StreamResult {
            text: text.trim().to_string(),
            tool_calls,
            reasoning_blocks,
            finish_reason,
            finish_content,
        })
    }

    /// Close an open reasoning block: persist it with duration and token
    /// count, then publish `reasoning_end`. Commit happens before the event
    /// so the block is queryable when the frontend refetches history.
    async fn finish_reasoning(
        &self,
        chat_id: &str,
        checkpoint_id: Option<&str>,
        reasoning: &mut ReasoningState,
        reasoning_blocks: &mut Vec<(String, String)>,
        options: &StreamOptions,
    ) -> Result<(), AgentError> {
        if !reasoning.active || reasoning.content.is_empty() {
            reasoning.active = false;
            return Ok(());
        }
        let content = std::mem::take(&mut reasoning.content);
        reasoning.active = false;
        let duration_ms = millis_since(&reasoning.started_at);

        self.store
            .create_reasoning_block(ReasoningBlockRow {
                id: reasoning.block_id.clone(),
                chat_id: chat_id.to_string(),
                checkpoint_id: checkpoint_id.map(str::to_string),
                content: content.clone(),
                timestamp: reasoning.started_at.clone(),
                duration_ms,
            })
            .await?;

        if !options.silent {
            self.event_bus.publish(
                chat_id,
                ChatEventKind::ReasoningEnd {
                    reasoning_block: ReasoningBlockOut {
                        id: reasoning.block_id.clone(),
                        content: content.clone(),
                        timestamp: reasoning.started_at.clone(),
                        checkpoint_id: checkpoint_id.map(str::to_string),
                        duration: duration_ms,
                        tokens: Some(tokens::count_text(&content) as i64),
                    },
                },
            );
        }
        reasoning_blocks.push((reasoning.block_id.clone(), content));
        Ok(())
    }
}
