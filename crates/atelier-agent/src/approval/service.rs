//! Tool approval execution: runs an approved tool call, persists file edits
//! with their pre-edit snapshots, spills oversized output, and publishes the
//! lifecycle events.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::approval::rules::matches_auto_approve_rules;
use crate::artifacts::ArtifactStore;
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{ArtifactOut, ChatEventKind, FileEditOut, ToolCallOut};
use crate::ids::{generate_id, millis_since, utc_now_iso};
use crate::paths::PathResolver;
use crate::store::ChatStore;
use crate::store::domain::{
    FileEditAction, FileEditRow, FileSnapshotRow, ToolArtifactRow, ToolCallRow, ToolCallStatus,
};
use crate::tools::{ApprovalPolicy, ToolContext, ToolRegistry, ToolServices};

pub struct ApprovalService {
    store: ChatStore,
    event_bus: Arc<EventBus>,
    registry: Arc<parking_lot::RwLock<ToolRegistry>>,
    resolver: PathResolver,
    artifacts: ArtifactStore,
    services: Arc<ToolServices>,
}

impl ApprovalService {
    pub fn new(
        store: ChatStore,
        event_bus: Arc<EventBus>,
        registry: Arc<parking_lot::RwLock<ToolRegistry>>,
        resolver: PathResolver,
        artifacts: ArtifactStore,
        services: Arc<ToolServices>,
    ) -> Self {
        Self {
            store,
            event_bus,
            registry,
            resolver,
            artifacts,
            services,
        }
    }

    /// Whether this call may run without a user decision: the tool's own
    /// policy first, then the enabled auto-approve rules.
    pub async fn should_auto_approve(&self, tool_name: &str, input: &Value) -> Result<bool, AgentError> {
        let policy = self
            .registry
            .read()
            .find(tool_name)
            .map(|tool| tool.approval_policy());
        match policy {
            Some(ApprovalPolicy::Always) => return Ok(true),
            Some(ApprovalPolicy::Manual) => return Ok(false),
            _ => {}
        }
        let rules = self.store.list_auto_approve_rules().await?;
        Ok(matches_auto_approve_rules(tool_name, input, &rules))
    }

    /// Execute a pending tool call. Emits `tool_call_start`, runs the tool,
    /// persists snapshots + file edits + artifacts, sets the final status,
    /// and emits `tool_call_end`.
    #[tracing::instrument(name = "agent.tool_call", skip_all, fields(chat_id = %chat_id, tool_call_id = %tool_call_id))]
    pub async fn approve(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        cancel: CancellationToken,
    ) -> Result<(ToolCallOut, Vec<FileEditOut>), AgentError> {
        let row = self.load_pending(chat_id, tool_call_id).await?;

        self.store
            .set_tool_call_status(&row.id, ToolCallStatus::Running, None, None)
            .await?;
        let running = self.tool_call_out(&row, ToolCallStatus::Running, None, None).await?;
        self.event_bus
            .publish(chat_id, ChatEventKind::ToolCallStart { tool_call: running });

        let started_at = utc_now_iso();
        let payload: Value = serde_json::from_str(&row.input_json).unwrap_or(Value::Object(Default::default()));

        let (project_root, project_id) = self.project_for_chat(chat_id).await?;
        let ctx = ToolContext {
            project_root: project_root.map(std::path::PathBuf::from),
            project_id: project_id.clone(),
            chat_id: Some(chat_id.to_string()),
            checkpoint_id: Some(row.checkpoint_id.clone()),
            tool_call_id: Some(row.id.clone()),
            store: Some(self.store.clone()),
            resolver: self.resolver.clone(),
            cancel,
            services: Some(self.services.clone()),
        };

        let tool = self.registry.read().find(&row.name);
        let run_result = match tool {
            Some(tool) => tool.run(payload, &ctx).await,
            None => Err(crate::tools::ToolError::InvalidRequest(format!(
                "Tool not registered: {}",
                row.name
            ))),
        };

        let mut file_edits_out = Vec::new();
        let duration_ms = millis_since(&started_at);

        let (status, output) = match run_result {
            Ok(outcome) => {
                for edit in &outcome.file_edits {
                    let out = self.persist_file_edit(chat_id, &row, edit).await?;
                    self.event_bus
                        .publish(chat_id, ChatEventKind::FileEdit { file_edit: out.clone() });
                    file_edits_out.push(out);
                }
                let output = self
                    .spill_if_oversized(chat_id, &row, project_id.as_deref(), &outcome.output)
                    .await?;
                let status = if outcome.ok {
                    ToolCallStatus::Completed
                } else {
                    ToolCallStatus::Error
                };
                (status, output)
            }
            Err(err) => {
                self.event_bus.publish(
                    chat_id,
                    ChatEventKind::Error {
                        message: err.to_string(),
                        source: Some("tool".to_string()),
                        checkpoint_id: None,
                        tool_call_id: Some(row.id.clone()),
                        tool_name: Some(row.name.clone()),
                        retryable: None,
                        retry_action: None,
                    },
                );
                (ToolCallStatus::Error, err.to_string())
            }
        };

        self.store
            .set_tool_call_status(&row.id, status, Some(output.clone()), duration_ms)
            .await?;
        let tool_out = self
            .tool_call_out(&row, status, Some(output), duration_ms)
            .await?;
        self.event_bus.publish(
            chat_id,
            ChatEventKind::ToolCallEnd {
                tool_call: tool_out.clone(),
            },
        );
        Ok((tool_out, file_edits_out))
    }

    /// Mark a pending call rejected and emit `tool_call_end`.
    pub async fn reject(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        reason: Option<&str>,
    ) -> Result<ToolCallOut, AgentError> {
        let row = self.load_pending(chat_id, tool_call_id).await?;
        let message = match reason {
            Some(reason) => format!("Rejected: {}", reason),
            None => "Rejected".to_string(),
        };
        self.store
            .set_tool_call_status(&row.id, ToolCallStatus::Rejected, Some(message.clone()), None)
            .await?;
        let tool_out = self
            .tool_call_out(&row, ToolCallStatus::Rejected, Some(message), None)
            .await?;
        self.event_bus.publish(
            chat_id,
            ChatEventKind::ToolCallEnd {
                tool_call: tool_out.clone(),
            },
        );
        Ok(tool_out)
    }

    async fn load_pending(&self, chat_id: &str, tool_call_id: &str) -> Result<ToolCallRow, AgentError> {
        let row = self
            .store
            .get_tool_call(tool_call_id)
            .await?
            .filter(|row| row.chat_id == chat_id)
            .ok_or_else(|| AgentError::ToolCallNotFound {
                tool_call_id: tool_call_id.to_string(),
            })?;
        if row.status != ToolCallStatus::Pending {
            return Err(AgentError::ToolCallNotPending {
                tool_call_id: tool_call_id.to_string(),
            });
        }
        Ok(row)
    }

    async fn project_for_chat(&self, chat_id: &str) -> Result<(Option<String>, Option<String>), AgentError> {
        let Some(chat) = self.store.get_chat(chat_id).await? else {
            return Ok((None, None));
        };
        let project = self.store.get_project(&chat.project_id).await?;
        Ok((project.map(|p| p.path), Some(chat.project_id)))
    }

    /// Persist the snapshot first, then the edit row. The snapshot carries
    /// the pre-edit content (None for created files) so revert can restore.
    async fn persist_file_edit(
        &self,
        chat_id: &str,
        row: &ToolCallRow,
        edit: &crate::tools::ToolFileEdit,
    ) -> Result<FileEditOut, AgentError> {
        let now = utc_now_iso();
        let file_edit_id = generate_id("fe");
        self.store
            .create_file_snapshot(FileSnapshotRow {
                id: generate_id("fs"),
                chat_id: chat_id.to_string(),
                checkpoint_id: Some(row.checkpoint_id.clone()),
                file_edit_id: Some(file_edit_id.clone()),
                tool_call_id: Some(row.id.clone()),
                file_path: edit.file_path.clone(),
                content: match edit.action {
                    FileEditAction::Created => None,
                    _ => edit.original_content.clone(),
                },
                timestamp: now.clone(),
            })
            .await?;
        self.store
            .create_file_edit(FileEditRow {
                id: file_edit_id.clone(),
                chat_id: chat_id.to_string(),
                checkpoint_id: row.checkpoint_id.clone(),
                file_path: edit.file_path.clone(),
                action: edit.action,
                diff: edit.diff.clone(),
                timestamp: now.clone(),
            })
            .await?;
        Ok(FileEditOut {
            id: file_edit_id,
            file_path: edit.file_path.clone(),
            action: edit.action.as_str().to_string(),
            diff: edit.diff.clone(),
            timestamp: now,
            checkpoint_id: Some(row.checkpoint_id.clone()),
        })
    }

    async fn spill_if_oversized(
        &self,
        chat_id: &str,
        row: &ToolCallRow,
        project_id: Option<&str>,
        output: &str,
    ) -> Result<String, AgentError> {
        let project_id = project_id.unwrap_or("unassigned");
        let result = self.artifacts.materialize_tool_output(output, project_id);
        if let Some(record) = result.record {
            self.store
                .create_tool_artifact(ToolArtifactRow {
                    id: generate_id("ta"),
                    tool_call_id: row.id.clone(),
                    chat_id: chat_id.to_string(),
                    project_id: project_id.to_string(),
                    artifact_type: record.artifact_type,
                    file_path: record.file_path,
                    line_count: Some(record.line_count),
                    preview_lines: Some(record.preview_lines),
                    timestamp: utc_now_iso(),
                })
                .await?;
        }
        Ok(result.content)
    }

    async fn tool_call_out(
        &self,
        row: &ToolCallRow,
        status: ToolCallStatus,
        output: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<ToolCallOut, AgentError> {
        let artifacts = self
            .store
            .list_tool_artifacts_for_tool_call(&row.id)
            .await?
            .into_iter()
            .map(|a| ArtifactOut {
                artifact_type: a.artifact_type,
                path: a.file_path,
                line_count: a.line_count,
                preview_lines: a.preview_lines,
            })
            .collect();
        Ok(ToolCallOut {
            id: row.id.clone(),
            name: row.name.clone(),
            status: status.as_str().to_string(),
            input: serde_json::from_str(&row.input_json).unwrap_or(Value::Null),
            output: output.or_else(|| row.output_text.clone()),
            timestamp: row.timestamp.clone(),
            duration: duration_ms.or(row.duration_ms),
            is_parallel: row.parallel_group.as_ref().map(|_| true),
            parallel_group_id: row.parallel_group.clone(),
            approval_required: None,
            checkpoint_id: Some(row.checkpoint_id.clone()),
            artifacts,
        })
    }
}
