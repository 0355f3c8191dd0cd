//! Routes tool calls from a stream through the approval pipeline and
//! executes them with bounded parallelism.

use std::sync::Arc;
use std::time::Duration;

use atelier::ToolCall;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalService, ApprovalWaiter, WaitOutcome};
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{ChatEventKind, ToolCallOut};
use crate::ids::{generate_id, utc_now_iso};
use crate::preprocess::ContextMessage;
use crate::store::ChatStore;
use crate::store::domain::{ToolCallRow, ToolCallStatus};

/// Normalize a provider call id into the persisted `tc-` keyspace.
pub fn tool_call_db_id(provider_id: &str) -> String {
    if provider_id.starts_with("tc-") {
        provider_id.to_string()
    } else {
        format!("tc-{}", provider_id)
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    store: ChatStore,
    approval: Arc<ApprovalService>,
    waiter: Arc<ApprovalWaiter>,
    event_bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    approval_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(
        store: ChatStore,
        approval: Arc<ApprovalService>,
        waiter: Arc<ApprovalWaiter>,
        event_bus: Arc<EventBus>,
        parallelism: usize,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            store,
            approval,
            waiter,
            event_bus,
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            approval_timeout,
        }
    }

    /// Execute the calls from one stream. Parallel groups are persisted in a
    /// single commit before anything runs; execution is bounded by the
    /// semaphore. Returns tool-result messages in call order.
    pub async fn execute_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        chat_id: &str,
        checkpoint_id: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<ContextMessage>, AgentError> {
        if tool_calls.is_empty() {
            return Ok(Vec::new());
        }
        let is_parallel = tool_calls.len() > 1;
        let parallel_group = is_parallel.then(|| generate_id("pg"));

        let rows: Vec<ToolCallRow> = tool_calls
            .iter()
            .map(|call| ToolCallRow {
                id: tool_call_db_id(&call.id),
                chat_id: chat_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
                name: call.function.name.clone(),
                status: ToolCallStatus::Pending,
                input_json: call.function.arguments.clone(),
                output_text: None,
                timestamp: utc_now_iso(),
                duration_ms: None,
                parallel_group: parallel_group.clone(),
            })
            .collect();
        self.store.create_tool_calls(rows).await?;

        let mut join_set: JoinSet<(usize, ContextMessage)> = JoinSet::new();
        for (index, call) in tool_calls.iter().enumerate() {
            let executor = self.clone();
            let call = call.clone();
            let chat_id = chat_id.to_string();
            let checkpoint_id = checkpoint_id.to_string();
            let group = parallel_group.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = executor
                    .semaphore
                    .acquire()
                    .await
                    .expect("executor semaphore closed");
                let message = executor
                    .execute_one(&call, &chat_id, &checkpoint_id, group.as_deref(), cancel)
                    .await;
                (index, message)
            });
        }

        let mut indexed: Vec<(usize, ContextMessage)> = Vec::with_capacity(tool_calls.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => indexed.push(result),
                Err(err) => log::error!("tool task panicked: {}", err),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, message)| message).collect())
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        chat_id: &str,
        checkpoint_id: &str,
        parallel_group: Option<&str>,
        cancel: CancellationToken,
    ) -> ContextMessage {
        let db_id = tool_call_db_id(&call.id);
        let input: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::json!({}));

        let auto = match self.approval.should_auto_approve(&call.function.name, &input).await {
            Ok(auto) => auto,
            Err(err) => {
                log::warn!("auto-approve check failed for {}: {}", call.function.name, err);
                false
            }
        };

        let output = if auto {
            self.run_approved(chat_id, &db_id, cancel).await
        } else {
            self.wait_manual(call, chat_id, checkpoint_id, &db_id, &input, parallel_group, cancel)
                .await
        };
        ContextMessage::tool_result(call.id.clone(), output)
    }

    async fn run_approved(&self, chat_id: &str, db_id: &str, cancel: CancellationToken) -> String {
        match self.approval.approve(chat_id, db_id, cancel).await {
            Ok((out, _)) => out.output.unwrap_or_default(),
            Err(err) => {
                // The row may already carry a final status (e.g. a
                // concurrent reject); prefer what persistence says.
                if let Ok(Some(row)) = self.store.get_tool_call(db_id).await {
                    if row.status != ToolCallStatus::Pending && row.status != ToolCallStatus::Running {
                        return row.output_text.unwrap_or_else(|| err.to_string());
                    }
                    let _ = self
                        .store
                        .set_tool_call_status(db_id, ToolCallStatus::Error, Some(err.to_string()), None)
                        .await;
                }
                err.to_string()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn wait_manual(
        &self,
        call: &ToolCall,
        chat_id: &str,
        checkpoint_id: &str,
        db_id: &str,
        input: &serde_json::Value,
        parallel_group: Option<&str>,
        cancel: CancellationToken,
    ) -> String {
        self.event_bus.publish(
            chat_id,
            ChatEventKind::ApprovalRequired {
                tool_call: ToolCallOut {
                    id: db_id.to_string(),
                    name: call.function.name.clone(),
                    status: "pending".to_string(),
                    input: input.clone(),
                    output: None,
                    timestamp: utc_now_iso(),
                    duration: None,
                    is_parallel: parallel_group.map(|_| true),
                    parallel_group_id: parallel_group.map(str::to_string),
                    approval_required: Some(true),
                    checkpoint_id: Some(checkpoint_id.to_string()),
                    artifacts: vec![],
                },
            },
        );

        let outcome = tokio::select! {
            outcome = self.waiter.register_and_wait(chat_id, db_id, self.approval_timeout) => outcome,
            _ = cancel.cancelled() => WaitOutcome::Rejected,
        };

        // The approval route commits before signaling, so the row is the
        // source of truth on wake-up — including after a timeout.
        let row = self.store.get_tool_call(db_id).await.ok().flatten();
        match row {
            Some(row) if row.status == ToolCallStatus::Completed => row.output_text.unwrap_or_default(),
            Some(row) if row.status == ToolCallStatus::Error && row.output_text.is_some() => {
                row.output_text.unwrap_or_default()
            }
            Some(row) if row.status == ToolCallStatus::Rejected && row.output_text.is_some() => {
                row.output_text.unwrap_or_default()
            }
            _ => format!("Rejected or timed out: {}", outcome.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::paths::PathResolver;
    use crate::store::domain::AutoApproveRule;
    use crate::test_utils::ScriptedProvider;
    use crate::tools::{ToolRegistry, ToolServices};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ChatStore,
        bus: Arc<EventBus>,
        executor: Arc<ToolExecutor>,
        waiter: Arc<ApprovalWaiter>,
        approval: Arc<ApprovalService>,
        chat_id: String,
        project_root: String,
    }

    async fn fixture(parallelism: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::connect_in_memory().await.unwrap();
        let project_root = dir.path().join("project");
        std::fs::create_dir_all(&project_root).unwrap();
        let project = store
            .create_project("p", project_root.to_str().unwrap())
            .await
            .unwrap();
        let chat = store.create_chat(&project.id, "New chat").await.unwrap();

        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(parking_lot::RwLock::new(ToolRegistry::new()));
        for tool in crate::tools::builtins::all_builtin_tools() {
            registry.write().add(tool);
        }
        let resolver = PathResolver::new(dir.path().join("tool_outputs"));
        let artifacts = ArtifactStore::new(dir.path().join("tool_outputs"), 2000, 50);
        let services = Arc::new(ToolServices {
            event_bus: bus.clone(),
            provider: ScriptedProvider::new(vec![]),
            settings: crate::config::Settings::default(),
            registry: registry.clone(),
        });
        let approval = Arc::new(ApprovalService::new(
            store.clone(),
            bus.clone(),
            registry,
            resolver,
            artifacts,
            services,
        ));
        let waiter = Arc::new(ApprovalWaiter::new());
        let executor = Arc::new(ToolExecutor::new(
            store.clone(),
            approval.clone(),
            waiter.clone(),
            bus.clone(),
            parallelism,
            Duration::from_secs(2),
        ));
        Fixture {
            _dir: dir,
            store,
            bus,
            executor,
            waiter,
            approval,
            chat_id: chat.id,
            project_root: project_root.display().to_string(),
        }
    }

    async fn allow_tool(store: &ChatStore, tool: &str) {
        store
            .upsert_auto_approve_rule(AutoApproveRule {
                id: format!("rule-{}", tool),
                field: "tool".into(),
                value: tool.into(),
                enabled: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_approved_call_runs_without_approval_event() {
        let f = fixture(4).await;
        allow_tool(&f.store, "read_file").await;
        let path = format!("{}/a.txt", f.project_root);
        std::fs::write(&path, "content here\n").unwrap();
        let mut sub = f.bus.subscribe(&f.chat_id);

        let calls = vec![ToolCall::function(
            "call_1",
            "read_file",
            json!({"path": path, "start": 1, "end": 1}).to_string(),
        )];
        let results = f
            .executor
            .execute_tool_calls(&calls, &f.chat_id, "cp-1", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(results[0].content.contains("content here"));

        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind.type_name().to_string());
        }
        assert!(kinds.contains(&"tool_call_start".to_string()));
        assert!(kinds.contains(&"tool_call_end".to_string()));
        assert!(!kinds.contains(&"approval_required".to_string()));
    }

    #[tokio::test]
    async fn manual_call_waits_for_approval() {
        let f = fixture(4).await;
        let path = format!("{}/b.txt", f.project_root);
        std::fs::write(&path, "secret\n").unwrap();

        let calls = vec![ToolCall::function(
            "call_2",
            "read_file",
            json!({"path": path, "start": 1, "end": 1}).to_string(),
        )];
        let executor = f.executor.clone();
        let chat_id = f.chat_id.clone();
        let handle = tokio::spawn(async move {
            executor
                .execute_tool_calls(&calls, &chat_id, "cp-1", CancellationToken::new())
                .await
        });

        // Let the executor publish approval_required and register its wait,
        // then play the approval route: execute + signal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.approval
            .approve(&f.chat_id, "tc-call_2", CancellationToken::new())
            .await
            .unwrap();
        f.waiter.signal_approved(&f.chat_id, "tc-call_2");

        let results = handle.await.unwrap().unwrap();
        assert!(results[0].content.contains("secret"));
    }

    #[tokio::test]
    async fn manual_rejection_feeds_rejection_text_back() {
        let f = fixture(4).await;
        let calls = vec![ToolCall::function(
            "call_3",
            "read_file",
            json!({"path": "/nope"}).to_string(),
        )];
        let executor = f.executor.clone();
        let chat_id = f.chat_id.clone();
        let handle = tokio::spawn(async move {
            executor
                .execute_tool_calls(&calls, &chat_id, "cp-1", CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        f.approval
            .reject(&f.chat_id, "tc-call_3", Some("dangerous"))
            .await
            .unwrap();
        f.waiter.signal_rejected(&f.chat_id, "tc-call_3");

        let results = handle.await.unwrap().unwrap();
        assert!(results[0].content.contains("Rejected: dangerous"));
        let row = f.store.get_tool_call("tc-call_3").await.unwrap().unwrap();
        assert_eq!(row.status, ToolCallStatus::Rejected);
    }

    #[tokio::test]
    async fn parallel_group_rows_exist_before_execution_finishes() {
        let f = fixture(4).await;
        allow_tool(&f.store, "read_file").await;
        let path = format!("{}/c.txt", f.project_root);
        std::fs::write(&path, "x\n").unwrap();

        let calls = vec![
            ToolCall::function("p1", "read_file", json!({"path": path, "start": 1, "end": 1}).to_string()),
            ToolCall::function("p2", "read_file", json!({"path": path, "start": 1, "end": 1}).to_string()),
        ];
        let results = f
            .executor
            .execute_tool_calls(&calls, &f.chat_id, "cp-1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("p1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("p2"));

        let rows = f.store.list_tool_calls(&f.chat_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let group = rows[0].parallel_group.clone().unwrap();
        assert!(rows.iter().all(|r| r.parallel_group.as_deref() == Some(group.as_str())));
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrency() {
        let f = fixture(1).await;
        allow_tool(&f.store, "execute_command").await;

        let calls = vec![
            ToolCall::function("s1", "execute_command", json!({"command": "sleep 0.2"}).to_string()),
            ToolCall::function("s2", "execute_command", json!({"command": "sleep 0.2"}).to_string()),
        ];
        let started = std::time::Instant::now();
        let results = f
            .executor
            .execute_tool_calls(&calls, &f.chat_id, "cp-1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        // With a single permit the sleeps serialize.
        assert!(started.elapsed() >= Duration::from_millis(380));
    }

    #[tokio::test]
    async fn timeout_without_decision_reports_timeout() {
        let f = fixture(4).await;
        let calls = vec![ToolCall::function(
            "t1",
            "read_file",
            json!({"path": "/never"}).to_string(),
        )];
        let results = f
            .executor
            .execute_tool_calls(&calls, &f.chat_id, "cp-1", CancellationToken::new())
            .await
            .unwrap();
        assert!(results[0].content.contains("Rejected or timed out: timeout"));
    }
}
