//! Tool contract and execution context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use atelier::chat::ChatProvider;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::event_bus::EventBus;
use crate::paths::PathResolver;
use crate::store::ChatStore;
use crate::store::domain::FileEditAction;

/// Unified error type for all tools.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<crate::error::AgentError> for ToolError {
    fn from(err: crate::error::AgentError) -> Self {
        if err.is_validation() {
            ToolError::InvalidRequest(err.to_string())
        } else {
            ToolError::ExecutionFailed(err.to_string())
        }
    }
}

/// When a tool may run without the user's explicit click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Runs without asking (pure bookkeeping tools)
    Always,
    /// Auto-approve rules decide; manual otherwise
    Rules,
    /// Always requires an explicit decision
    Manual,
}

/// A file mutation performed by a tool, with the pre-edit content so the
/// executor can persist a snapshot before anything else happens.
#[derive(Debug, Clone)]
pub struct ToolFileEdit {
    pub file_path: String,
    pub action: FileEditAction,
    pub diff: Option<String>,
    pub original_content: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub output: String,
    /// Pre-materialized preview when the tool already spilled its output
    pub preview: Option<String>,
    pub file_edits: Vec<ToolFileEdit>,
    pub ok: bool,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ok: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            output: message.clone(),
            ok: false,
            error: Some(message),
            ..Default::default()
        }
    }

    pub fn with_file_edit(mut self, edit: ToolFileEdit) -> Self {
        self.file_edits.push(edit);
        self
    }
}

/// Shared service handles a tool may need beyond the filesystem
/// (sub-agent spawning, web search summarization, todo persistence).
pub struct ToolServices {
    pub event_bus: Arc<EventBus>,
    pub provider: Arc<dyn ChatProvider>,
    pub settings: Settings,
    pub registry: Arc<parking_lot::RwLock<crate::tools::ToolRegistry>>,
}

/// Everything a tool receives at execution time.
#[derive(Clone)]
pub struct ToolContext {
    pub project_root: Option<PathBuf>,
    pub project_id: Option<String>,
    pub chat_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub store: Option<ChatStore>,
    pub resolver: PathResolver,
    pub cancel: CancellationToken,
    pub services: Option<Arc<ToolServices>>,
}

impl ToolContext {
    /// Minimal context for tests and detached runs.
    pub fn basic(resolver: PathResolver, project_root: Option<PathBuf>) -> Self {
        Self {
            project_root,
            project_id: None,
            chat_id: None,
            checkpoint_id: None,
            tool_call_id: None,
            store: None,
            resolver,
            cancel: CancellationToken::new(),
            services: None,
        }
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Resolve a path argument inside the project root.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        self.resolver
            .resolve(raw, self.project_root(), false)
            .map_err(ToolError::from)
    }

    /// Resolve a path argument allowing locations outside the project root
    /// (blocked system prefixes still apply).
    pub fn resolve_path_external(&self, raw: &str) -> Result<PathBuf, ToolError> {
        self.resolver
            .resolve(raw, self.project_root(), true)
            .map_err(ToolError::from)
    }
}

/// The tool contract: a name, a JSON schema, an approval policy and an
/// async run method.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Rules
    }

    /// Provider-facing definition built from the metadata above.
    fn definition(&self) -> atelier::chat::Tool {
        atelier::chat::Tool::function(self.name(), self.description(), self.input_schema())
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;
}
