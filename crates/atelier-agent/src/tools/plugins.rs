//! Tool plugins discovered from a directory at startup.
//!
//! A plugin is a TOML manifest exporting a single tool definition:
//!
//! ```toml
//! name = "count_lines"
//! description = "Count lines in a file"
//! approval_policy = "rules"
//! command = ["wc", "-l"]
//!
//! [schema]
//! type = "object"
//! ```
//!
//! The handler executes `command` with the JSON payload on stdin and
//! returns stdout as the tool output. Malformed manifests are logged and
//! skipped; one broken plugin must not block discovery.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::tools::{ApprovalPolicy, Tool, ToolContext, ToolError, ToolOutcome};

const PLUGIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct PluginManifest {
    name: String,
    description: String,
    #[serde(default)]
    approval_policy: Option<String>,
    command: Vec<String>,
    #[serde(default)]
    schema: Option<Value>,
}

pub struct PluginTool {
    name: String,
    description: String,
    approval_policy: ApprovalPolicy,
    command: Vec<String>,
    schema: Value,
}

#[async_trait]
impl Tool for PluginTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn approval_policy(&self) -> ApprovalPolicy {
        self.approval_policy
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = ctx.project_root() {
            cmd.current_dir(root);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("plugin failed to spawn: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            let payload = args.to_string();
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("plugin stdin failed: {}", e)))?;
        }
        let output = tokio::time::timeout(PLUGIN_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ToolError::ExecutionFailed("plugin timed out".to_string()))?
            .map_err(|e| ToolError::ExecutionFailed(format!("plugin failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(ToolOutcome::success(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(ToolOutcome::failure(if stderr.is_empty() { stdout } else { stderr }))
        }
    }
}

fn parse_manifest(path: &Path) -> Option<PluginTool> {
    let raw = std::fs::read_to_string(path).ok()?;
    let manifest: PluginManifest = match toml::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            log::warn!("skipping malformed plugin {}: {}", path.display(), err);
            return None;
        }
    };
    if manifest.name.is_empty() || manifest.command.is_empty() {
        log::warn!("skipping plugin {} without name/command", path.display());
        return None;
    }
    let approval_policy = match manifest.approval_policy.as_deref() {
        Some("always") => ApprovalPolicy::Always,
        Some("manual") => ApprovalPolicy::Manual,
        _ => ApprovalPolicy::Rules,
    };
    Some(PluginTool {
        name: manifest.name,
        description: manifest.description,
        approval_policy,
        command: manifest.command,
        schema: manifest
            .schema
            .unwrap_or_else(|| serde_json::json!({"type": "object"})),
    })
}

/// Walk a plugins directory and load every `*.toml` manifest.
pub fn load_plugin_tools(plugins_dir: &PathBuf) -> Vec<Arc<dyn Tool>> {
    let Ok(entries) = std::fs::read_dir(plugins_dir) else {
        return Vec::new();
    };
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
        .collect();
    paths.sort();
    for path in paths {
        if let Some(tool) = parse_manifest(&path) {
            tools.push(Arc::new(tool));
        }
    }
    tools
}
