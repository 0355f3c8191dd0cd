//! Turn scheduling: one agent task per chat, cancellation, modes, and the
//! post-agent verification follow-up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::container::AppContainer;
use crate::error::AgentError;
use crate::events::{ChatEventKind, CheckpointOut, MessageOut};
use crate::ids::{generate_id, utc_now_iso};
use crate::plans::apply_plan_edit_output;
use crate::preprocess::ContextMessage;
use crate::verification::{format_message_for_agent, is_verification_message, run_verification};

/// Send-message modes; anything unrecognized falls back to default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Default,
    Planning,
    PlanEdit,
}

impl TurnMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "planning" => TurnMode::Planning,
            "plan_edit" => TurnMode::PlanEdit,
            _ => TurnMode::Default,
        }
    }
}

struct RunningTurn {
    handle: tokio::task::JoinHandle<()>,
    token: CancellationToken,
}

/// At most one agent turn runs per chat; scheduling a new one requires
/// cancelling the old one first.
pub struct AgentTaskManager {
    tasks: parking_lot::Mutex<HashMap<String, RunningTurn>>,
}

impl AgentTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.tasks
            .lock()
            .get(chat_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    fn register(&self, chat_id: &str, turn: RunningTurn) {
        self.tasks.lock().insert(chat_id.to_string(), turn);
    }

    fn remove_if_finished(&self, chat_id: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(turn) = tasks.get(chat_id) {
            if turn.handle.is_finished() {
                tasks.remove(chat_id);
            }
        }
    }

    /// Signal the running turn's token and wait for the task to wind down.
    pub async fn cancel_and_wait(&self, chat_id: &str) -> bool {
        let turn = self.tasks.lock().remove(chat_id);
        let Some(turn) = turn else {
            return false;
        };
        if turn.handle.is_finished() {
            return false;
        }
        turn.token.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), turn.handle).await;
        true
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for (_, turn) in tasks.drain() {
            turn.token.cancel();
            turn.handle.abort();
        }
    }
}

impl Default for AgentTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel the in-flight turn and the memory runner, auto-rejecting any
/// pending tool approvals with reason "cancelled". Returns whether a turn
/// was actually cancelled.
pub async fn cancel_chat_work(container: &Arc<AppContainer>, chat_id: &str) -> Result<bool, AgentError> {
    container.memory_runner.cancel(chat_id);

    // Reject pendings before the task unwinds so its approval waits resolve
    // from persistence, not from the timeout.
    let approval = container.approval_service();
    for call in container.store.list_pending_tool_calls(chat_id).await? {
        match approval.reject(chat_id, &call.id, Some("cancelled")).await {
            Ok(_) => container.waiter.signal_rejected(chat_id, &call.id),
            Err(err) => log::debug!("pending reject skipped for {}: {}", call.id, err),
        }
    }

    Ok(container.tasks.cancel_and_wait(chat_id).await)
}

/// Spawn a turn in the background. Any in-flight turn for the chat is
/// cancelled first. Returns a boxed future because verification follow-ups
/// re-enter this function from inside the spawned turn.
pub fn schedule_turn(
    container: Arc<AppContainer>,
    chat_id: String,
    checkpoint_id: String,
    content: String,
    mode: TurnMode,
    active_plan_id: Option<String>,
) -> futures_util::future::BoxFuture<'static, Result<(), AgentError>> {
    Box::pin(schedule_turn_inner(
        container,
        chat_id,
        checkpoint_id,
        content,
        mode,
        active_plan_id,
    ))
}

async fn schedule_turn_inner(
    container: Arc<AppContainer>,
    chat_id: String,
    checkpoint_id: String,
    content: String,
    mode: TurnMode,
    active_plan_id: Option<String>,
) -> Result<(), AgentError> {
    cancel_chat_work(&container, &chat_id).await?;

    let token = CancellationToken::new();
    let task_token = token.clone();
    let task_container = container.clone();
    let task_chat = chat_id.clone();

    let handle = tokio::spawn(async move {
        let outcome = run_agent_turn(
            &task_container,
            &task_chat,
            &checkpoint_id,
            &content,
            mode,
            active_plan_id.as_deref(),
            task_token.clone(),
        )
        .await;

        match outcome {
            Ok(Some(follow_up)) => {
                // Verification found issues: chain the fix turn.
                let result = schedule_turn(
                    task_container.clone(),
                    task_chat.clone(),
                    follow_up.checkpoint_id,
                    follow_up.content,
                    TurnMode::Default,
                    None,
                )
                .await;
                if let Err(err) = result {
                    log::error!("failed to schedule verification follow-up: {}", err);
                }
            }
            Ok(None) => {}
            Err(AgentError::Cancelled) => {
                // Expected path; pendings were rejected by the canceller.
                task_container.event_bus.publish(
                    &task_chat,
                    ChatEventKind::AgentDone {
                        checkpoint_id: Some(checkpoint_id.clone()),
                    },
                );
            }
            Err(err) => {
                log::error!(
                    "agent turn failed chat={} checkpoint={}: {}",
                    task_chat,
                    checkpoint_id,
                    err
                );
                let message = err.to_string();
                task_container.event_bus.publish(
                    &task_chat,
                    ChatEventKind::Message {
                        message: MessageOut {
                            id: generate_id("msg"),
                            role: "agent".to_string(),
                            content: format!("Error: {}", message),
                            timestamp: utc_now_iso(),
                            checkpoint_id: Some(checkpoint_id.clone()),
                        },
                    },
                );
                task_container.event_bus.publish(
                    &task_chat,
                    ChatEventKind::Error {
                        message,
                        source: Some("backend".to_string()),
                        checkpoint_id: Some(checkpoint_id.clone()),
                        tool_call_id: None,
                        tool_name: None,
                        retryable: None,
                        retry_action: None,
                    },
                );
                task_container.event_bus.publish(
                    &task_chat,
                    ChatEventKind::AgentDone {
                        checkpoint_id: Some(checkpoint_id),
                    },
                );
            }
        }
        task_container.tasks.remove_if_finished(&task_chat);
    });

    container.tasks.register(&chat_id, RunningTurn { handle, token });
    Ok(())
}

pub struct FollowUpTurn {
    pub checkpoint_id: String,
    pub content: String,
}

/// Run one full turn: mode framing, the agent loop, mode post-processing,
/// and post-agent verification. Returns a follow-up turn when verification
/// found issues.
pub async fn run_agent_turn(
    container: &Arc<AppContainer>,
    chat_id: &str,
    checkpoint_id: &str,
    content: &str,
    mode: TurnMode,
    active_plan_id: Option<&str>,
    cancel: CancellationToken,
) -> Result<Option<FollowUpTurn>, AgentError> {
    let mut extra_messages: Vec<ContextMessage> = Vec::new();
    let plan_service = container.plan_service();

    if mode == TurnMode::PlanEdit {
        let plan_id = active_plan_id
            .ok_or_else(|| AgentError::Validation("activePlanId is required for plan_edit mode".into()))?;
        plan_service.sync_external_if_needed(chat_id, plan_id).await?;
        let existing = plan_service.get_plan(chat_id, plan_id, true).await?;
        extra_messages.push(ContextMessage::system(
            "You are editing an existing markdown implementation plan. Return either updated \
             markdown directly, or JSON object: \
             {\"ops\":[{\"op\":\"replace_section\",\"heading\":\"...\",\"content\":\"...\"}]}.",
        ));
        extra_messages.push(ContextMessage::user(format!(
            "Current plan markdown:\n\n{}\n\nEdit request:\n{}",
            existing.content.unwrap_or_default(),
            content
        )));
    }

    let agent_loop = container.agent_loop();
    let run_result = agent_loop
        .run(chat_id, checkpoint_id, content, extra_messages, cancel)
        .await?;

    // Refresh the prompt-composition view for the frontend.
    match crate::history::ChatHistoryAssembler::new(container.store.clone())
        .assemble(chat_id)
        .await
    {
        Ok(history) => {
            container.event_bus.publish(
                chat_id,
                ChatEventKind::ContextUpdate {
                    items: history.context_items,
                },
            );
        }
        Err(err) => log::debug!("context update skipped for chat={}: {}", chat_id, err),
    }

    match mode {
        TurnMode::Planning => {
            if !run_result.completed {
                log::warn!(
                    "planning mode did not complete; skipping plan persistence chat={}",
                    chat_id
                );
                return Ok(None);
            }
            let markdown = run_result.final_assistant_text.trim().to_string();
            if markdown.is_empty() {
                log::warn!("planning mode finished without assistant markdown chat={}", chat_id);
                return Ok(None);
            }
            plan_service
                .create_plan(
                    chat_id,
                    Some(checkpoint_id),
                    &markdown,
                    "Implementation Plan",
                    "ready",
                    "agent",
                )
                .await?;
            return Ok(None);
        }
        TurnMode::PlanEdit => {
            let plan_id = active_plan_id.expect("checked above");
            if !run_result.completed {
                log::warn!("plan edit mode did not complete; skipping update chat={}", chat_id);
                return Ok(None);
            }
            let current = plan_service.get_plan(chat_id, plan_id, true).await?;
            let next = apply_plan_edit_output(
                current.content.as_deref().unwrap_or(""),
                &run_result.final_assistant_text,
            );
            plan_service
                .update_plan(chat_id, plan_id, &next, current.revision, "agent", Some(checkpoint_id))
                .await?;
            return Ok(None);
        }
        TurnMode::Default => {}
    }

    // Post-agent verification over files edited this turn; verification
    // prompts themselves are exempt so the chain always terminates.
    if is_verification_message(content) {
        return Ok(None);
    }
    let Some(chat) = container.store.get_chat(chat_id).await? else {
        return Ok(None);
    };
    let Some(project) = container.store.get_project(&chat.project_id).await? else {
        return Ok(None);
    };
    let edits = container
        .store
        .list_file_edits_for_checkpoint(chat_id, checkpoint_id)
        .await?;
    if edits.is_empty() {
        return Ok(None);
    }
    let mut edited_paths: Vec<PathBuf> = edits.iter().map(|e| PathBuf::from(&e.file_path)).collect();
    edited_paths.sort();
    edited_paths.dedup();

    let (issues, summary, by_tool) =
        run_verification(&edited_paths, std::path::Path::new(&project.path)).await;
    if issues.is_empty() {
        return Ok(None);
    }

    let verification_content = format_message_for_agent(&issues);
    let ts = utc_now_iso();
    let fix_msg_id = generate_id("msg");
    let fix_cp_id = generate_id("cp");
    container
        .store
        .create_message(&fix_msg_id, chat_id, "user", &verification_content, &ts, None, None)
        .await?;
    container
        .store
        .create_checkpoint(&fix_cp_id, chat_id, &fix_msg_id, "Verification issues found", &ts)
        .await?;
    container
        .store
        .link_message_checkpoint(&fix_msg_id, &fix_cp_id)
        .await?;
    container.store.update_chat_timestamp(chat_id, &ts).await?;

    container.event_bus.publish(
        chat_id,
        ChatEventKind::Checkpoint {
            checkpoint: CheckpointOut {
                id: fix_cp_id.clone(),
                message_id: fix_msg_id.clone(),
                timestamp: ts.clone(),
                label: "Verification issues found".to_string(),
                file_edits: vec![],
                tool_calls: vec![],
                reasoning_blocks: vec![],
            },
        },
    );
    container.event_bus.publish(
        chat_id,
        ChatEventKind::Message {
            message: MessageOut {
                id: fix_msg_id,
                role: "user".to_string(),
                content: verification_content.clone(),
                timestamp: ts,
                checkpoint_id: Some(fix_cp_id.clone()),
            },
        },
    );
    let file_count = {
        let unique: std::collections::BTreeSet<&str> = issues.iter().map(|i| i.file.as_str()).collect();
        unique.len()
    };
    container.event_bus.publish(
        chat_id,
        ChatEventKind::VerificationIssues {
            checkpoint_id: checkpoint_id.to_string(),
            summary,
            issue_count: issues.len(),
            file_count,
            by_tool: serde_json::to_value(by_tool).unwrap_or_default(),
        },
    );

    Ok(Some(FollowUpTurn {
        checkpoint_id: fix_cp_id,
        content: verification_content,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_mode_parses_with_default_fallback() {
        assert_eq!(TurnMode::from_name("planning"), TurnMode::Planning);
        assert_eq!(TurnMode::from_name("plan_edit"), TurnMode::PlanEdit);
        assert_eq!(TurnMode::from_name("default"), TurnMode::Default);
        assert_eq!(TurnMode::from_name("weird"), TurnMode::Default);
    }

    #[tokio::test]
    async fn cancel_and_wait_on_idle_chat_is_false() {
        let manager = AgentTaskManager::new();
        assert!(!manager.cancel_and_wait("chat-1").await);
        assert!(!manager.is_running("chat-1"));
    }

    #[tokio::test]
    async fn cancel_and_wait_stops_a_running_task() {
        let manager = AgentTaskManager::new();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            task_token.cancelled().await;
        });
        manager.register("chat-1", RunningTurn { handle, token });
        assert!(manager.is_running("chat-1"));

        assert!(manager.cancel_and_wait("chat-1").await);
        assert!(!manager.is_running("chat-1"));
    }
}
