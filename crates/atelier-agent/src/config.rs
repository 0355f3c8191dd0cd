//! Runtime settings.
//!
//! Settings are read once from TOML at startup (path override via
//! `ATELIER_CONFIG`), merged over defaults, and held in an `ArcSwap` so the
//! hot paths take cheap snapshots. Writing new settings swaps the whole
//! struct; derived caches (provider client, model list) are rebuilt by the
//! container on swap.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a coding assistant operating inside an agentic workflow.

All paths in tool calls (read_file, edit_file, list_files, grep, execute_command) must be \
absolute paths under the selected project root, taken from the project overview. \
The user may need to approve tool calls before they run. Prefer small, focused operations \
and explain your reasoning when making changes. Use list_files to explore the project \
structure before reading or editing. Track multi-step work with update_todo_list and call \
submit_task when everything is done.";

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_context_limit() -> usize {
    128_000
}

fn default_max_iterations() -> usize {
    50
}

fn default_tool_parallelism() -> usize {
    4
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_spill_threshold() -> usize {
    2000
}

fn default_preview_tokens() -> usize {
    500
}

fn default_memory_mode() -> String {
    "observational".to_string()
}

fn default_observer_threshold() -> usize {
    4000
}

fn default_buffer_tokens() -> usize {
    1000
}

fn default_reflector_threshold() -> usize {
    8000
}

fn default_sub_agent_iterations() -> usize {
    25
}

/// Observational-memory tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// "observational" or "compact"
    #[serde(default = "default_memory_mode")]
    pub mode: String,
    /// Unobserved tokens required before buffered chunks are activated
    #[serde(default = "default_observer_threshold")]
    pub observer_threshold: usize,
    /// Passive buffering interval in tokens (floored at 500)
    #[serde(default = "default_buffer_tokens")]
    pub buffer_tokens: usize,
    /// Observation size that triggers the reflector
    #[serde(default = "default_reflector_threshold")]
    pub reflector_threshold: usize,
    /// Override model for the observer; main model when unset
    #[serde(default)]
    pub observer_model: Option<String>,
    /// Override model for the reflector; main model when unset
    #[serde(default)]
    pub reflector_model: Option<String>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            mode: default_memory_mode(),
            observer_threshold: default_observer_threshold(),
            buffer_tokens: default_buffer_tokens(),
            reflector_threshold: default_reflector_threshold(),
            observer_model: None,
            reflector_model: None,
        }
    }
}

/// Sub-agent runner tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubAgentSettings {
    /// Override model; main model when unset
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_sub_agent_iterations")]
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_base_url")]
    pub provider_base_url: String,
    #[serde(default)]
    pub provider_api_key: String,
    #[serde(default)]
    pub brave_api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_max_iterations")]
    pub max_agent_iterations: usize,
    #[serde(default = "default_tool_parallelism")]
    pub tool_parallelism: usize,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_spill_threshold")]
    pub tool_output_token_threshold: usize,
    #[serde(default = "default_preview_tokens")]
    pub preview_tokens: usize,
    /// Reasoning effort passed to the provider; None disables reasoning
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub sub_agent: SubAgentSettings,
    /// Root for the database, tool_outputs/ and project_plans/
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_base_url: default_base_url(),
            provider_api_key: String::new(),
            brave_api_key: String::new(),
            model: default_model(),
            context_limit: default_context_limit(),
            max_agent_iterations: default_max_iterations(),
            tool_parallelism: default_tool_parallelism(),
            approval_timeout_secs: default_approval_timeout_secs(),
            tool_output_token_threshold: default_spill_threshold(),
            preview_tokens: default_preview_tokens(),
            reasoning_effort: Some("medium".to_string()),
            system_prompt: None,
            memory: MemorySettings::default(),
            sub_agent: SubAgentSettings::default(),
            data_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing. A malformed file is an error; silent fallback would mask
    /// typos in thresholds.
    pub fn load(path: &Path) -> Result<Self, crate::error::AgentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| crate::error::AgentError::Validation(format!("bad config {}: {}", path.display(), e)))
    }

    /// Default config path: `$ATELIER_CONFIG` or `~/.config/atelier/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ATELIER_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("atelier")
            .join("config.toml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("atelier")
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("atelier.db")
    }

    pub fn tool_outputs_root(&self) -> PathBuf {
        self.data_dir().join("tool_outputs")
    }

    pub fn plans_root(&self) -> PathBuf {
        self.data_dir().join("project_plans")
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub fn reasoning(&self) -> Option<atelier::chat::ReasoningEffort> {
        match self.reasoning_effort.as_deref() {
            Some("low") => Some(atelier::chat::ReasoningEffort::Low),
            Some("medium") => Some(atelier::chat::ReasoningEffort::Medium),
            Some("high") => Some(atelier::chat::ReasoningEffort::High),
            _ => None,
        }
    }

    pub fn sub_agent_model(&self) -> &str {
        self.sub_agent.model.as_deref().unwrap_or(&self.model)
    }
}
