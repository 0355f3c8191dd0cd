//! Shared test fixtures: scripted providers, seeded stores, tool contexts.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use atelier::chat::{
    ChatProvider, ChatRequest, ChatStream, FinishReason, ModelInfo, StreamChunk,
};
use atelier::{LLMError, ToolCall};
use parking_lot::Mutex;

use crate::paths::PathResolver;
use crate::store::ChatStore;
use crate::store::domain::{Chat, Project};
use crate::tools::ToolContext;

/// Provider that returns nothing; for tests that never reach the provider.
pub struct NullProvider;

#[async_trait]
impl ChatProvider for NullProvider {
    async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        Ok(Vec::new())
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<String, LLMError> {
        Ok(String::new())
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChatStream, LLMError> {
        Err(LLMError::NotImplemented("null provider".into()))
    }
}

/// One scripted turn of a streaming conversation.
#[derive(Clone)]
pub enum ScriptedTurn {
    /// Text-only response ending with `stop`
    Text(String),
    /// Tool calls (with optional leading text)
    ToolCalls(Vec<ToolCall>),
    /// Raw chunk sequence for edge cases
    Chunks(Vec<StreamChunk>),
}

/// Provider driven by a fixed script; each `chat_stream` call pops the next
/// turn. `chat` pops from a separate completion script.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    completions: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            completions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_completions(self: Arc<Self>, completions: Vec<String>) -> Arc<Self> {
        *self.completions.lock() = completions.into();
        self
    }

    /// Append turns after construction; fixtures sometimes only learn the
    /// paths they need once the temp project exists.
    pub fn push_turns(&self, turns: Vec<ScriptedTurn>) {
        self.turns.lock().extend(turns);
    }

    fn chunks_for(turn: ScriptedTurn) -> Vec<StreamChunk> {
        match turn {
            ScriptedTurn::Text(text) => vec![
                StreamChunk::Text(text),
                StreamChunk::Done {
                    finish_reason: FinishReason::Stop,
                    content: String::new(),
                },
            ],
            ScriptedTurn::ToolCalls(calls) => {
                let mut chunks: Vec<StreamChunk> = calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, tool_call)| StreamChunk::ToolUseComplete { index, tool_call })
                    .collect();
                chunks.push(StreamChunk::Done {
                    finish_reason: FinishReason::ToolCalls,
                    content: String::new(),
                });
                chunks
            }
            ScriptedTurn::Chunks(chunks) => chunks,
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        Ok(Vec::new())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, LLMError> {
        self.requests.lock().push(request.clone());
        Ok(self
            .completions
            .lock()
            .pop_front()
            .unwrap_or_else(|| "scripted summary".to_string()))
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, LLMError> {
        self.requests.lock().push(request.clone());
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::Text("done".to_string()));
        let chunks = Self::chunks_for(turn);
        Ok(Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(Ok),
        )))
    }
}

/// Seed a project + chat pair into a store.
pub async fn seed_chat(store: &ChatStore) -> (Project, Chat) {
    let project = store.create_project("fixture", "/tmp/fixture").await.unwrap();
    let chat = store.create_chat(&project.id, "New chat").await.unwrap();
    (project, chat)
}

/// Tool context rooted at `<tmp>/project` with spill space at
/// `<tmp>/tool_outputs`.
pub fn tool_context() -> (tempfile::TempDir, ToolContext) {
    let dir = tempfile::tempdir().unwrap();
    let project_root = dir.path().join("project");
    std::fs::create_dir_all(&project_root).unwrap();
    let resolver = PathResolver::new(dir.path().join("tool_outputs"));
    let ctx = ToolContext::basic(resolver, Some(project_root));
    (dir, ctx)
}

/// Like [`tool_context`] but with an in-memory store attached.
pub async fn tool_context_with_store() -> (tempfile::TempDir, ChatStore, ToolContext) {
    let (dir, mut ctx) = tool_context();
    let store = ChatStore::connect_in_memory().await.unwrap();
    ctx.store = Some(store.clone());
    (dir, store, ctx)
}
