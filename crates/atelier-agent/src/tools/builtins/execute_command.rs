//! Shell execution with a blocked-pattern deny list, output caps and
//! subprocess timeout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
    "> /dev/sd",
    "chmod -r 777 /",
    "shutdown",
    "reboot",
    "halt",
    "init 0",
    "init 6",
];

pub const MAX_OUTPUT_BYTES: usize = 100 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 120;

fn cap_bytes(bytes: &[u8]) -> String {
    let slice = &bytes[..bytes.len().min(MAX_OUTPUT_BYTES)];
    String::from_utf8_lossy(slice).trim().to_string()
}

pub struct ExecuteCommandTool;

impl ExecuteCommandTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExecuteCommandTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a local shell command. cwd must be an absolute path when provided \
         (e.g. /path/to/project); defaults to the project root. stdout and stderr are \
         capped at 100KB each; timeout is in seconds (default 30, max 120)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string"},
                "cwd": {"type": "string"},
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds",
                    "default": DEFAULT_TIMEOUT_SECS
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if command.is_empty() {
            return Ok(ToolOutcome::failure("Missing command"));
        }

        let command_lower = command.to_lowercase();
        for pattern in BLOCKED_PATTERNS {
            if command_lower.contains(pattern) {
                return Ok(ToolOutcome::failure(format!(
                    "Blocked: command matches restricted pattern '{}'",
                    pattern
                )));
            }
        }

        let cwd = match args.get("cwd").and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() => match ctx.resolve_path(raw.trim()) {
                Ok(path) => Some(path),
                Err(err) => return Ok(ToolOutcome::failure(err.to_string())),
            },
            _ => ctx.project_root().map(|p| p.to_path_buf()),
        };

        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let mut cmd = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", &command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &command]);
            cmd
        };
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("command failed to spawn: {}", e)))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let collect = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let _ = tokio::join!(
                async {
                    if let Some(ref mut s) = stdout {
                        let _ = s.read_to_end(&mut stdout_buf).await;
                    }
                },
                async {
                    if let Some(ref mut s) = stderr {
                        let _ = s.read_to_end(&mut stderr_buf).await;
                    }
                },
            );
            let status = child.wait().await;
            (status, stdout_buf, stderr_buf)
        };

        let cancel = ctx.cancel.clone();
        let (status, stdout_buf, stderr_buf) = tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), collect) => {
                match result {
                    Ok(output) => output,
                    Err(_) => {
                        // Timeout: the child is killed via kill_on_drop.
                        return Ok(ToolOutcome::failure(format!(
                            "Command timed out after {}s",
                            timeout_secs
                        )));
                    }
                }
            }
            _ = cancel.cancelled() => {
                return Err(ToolError::ExecutionFailed("Cancelled by user".to_string()));
            }
        };

        let status =
            status.map_err(|e| ToolError::ExecutionFailed(format!("command failed: {}", e)))?;
        let out = cap_bytes(&stdout_buf);
        let err = cap_bytes(&stderr_buf);
        let mut output = out;
        if !err.is_empty() {
            if output.is_empty() {
                output = err;
            } else {
                output = format!("{}\n{}", output, err);
            }
        }
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            if output.is_empty() {
                output = format!("(exit code {})", code);
            } else {
                output = format!("{}\n(exit code {})", output, code);
            }
        }
        Ok(ToolOutcome::success(output))
    }
}
