//! Revert engine: roll files back from snapshots and delete
//! post-checkpoint state.

use std::path::Path;
use std::sync::Arc;

use crate::error::AgentError;
use crate::memory::{MemoryRunner, OBSERVATIONAL_STRATEGY};
use crate::memory::observational::state::ObservationalState;
use crate::store::ChatStore;
use crate::store::domain::FileSnapshotRow;

pub struct RevertEngine {
    store: ChatStore,
    memory_runner: Arc<MemoryRunner>,
}

impl RevertEngine {
    pub fn new(store: ChatStore, memory_runner: Arc<MemoryRunner>) -> Self {
        Self {
            store,
            memory_runner,
        }
    }

    /// Restore every file edited after the checkpoint from its snapshot,
    /// then delete all later chat state and re-anchor memory waterlines.
    pub async fn revert_to_checkpoint(&self, chat_id: &str, checkpoint_id: &str) -> Result<(), AgentError> {
        // Stop the observer before touching the state it reads.
        self.memory_runner.cancel(chat_id);

        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| AgentError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .filter(|cp| cp.chat_id == chat.id)
            .ok_or_else(|| AgentError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })?;

        // Newest-first so stacked edits to the same file unwind to the
        // oldest snapshot last.
        let edits = self
            .store
            .list_file_edits_since(chat_id, &checkpoint.timestamp)
            .await?;
        for edit in &edits {
            if let Some(snapshot) = self.store.get_snapshot_for_edit(&edit.id).await? {
                restore_snapshot(&snapshot)?;
            }
        }

        self.store
            .delete_after_checkpoint(chat_id, &checkpoint.timestamp)
            .await?;
        self.store.prune_observations_missing_waterline(chat_id).await?;
        self.trim_memory_state(chat_id).await?;
        self.store
            .update_chat_timestamp(chat_id, &checkpoint.timestamp)
            .await?;
        Ok(())
    }

    /// Restore a single file from its snapshot and drop the edit row.
    pub async fn revert_file(&self, chat_id: &str, file_edit_id: &str) -> Result<(), AgentError> {
        self.memory_runner.cancel(chat_id);

        let edit = self
            .store
            .get_file_edit(file_edit_id)
            .await?
            .filter(|edit| edit.chat_id == chat_id)
            .ok_or_else(|| {
                AgentError::Validation(format!("File edit not found: {}", file_edit_id))
            })?;
        if let Some(snapshot) = self.store.get_snapshot_for_edit(&edit.id).await? {
            restore_snapshot(&snapshot)?;
        }
        self.store.delete_file_edit(&edit.id).await?;
        Ok(())
    }

    /// Drop buffered chunks whose waterline message was deleted so the
    /// observer never resumes from a message that no longer exists.
    async fn trim_memory_state(&self, chat_id: &str) -> Result<(), AgentError> {
        let Some(row) = self
            .store
            .get_memory_state(chat_id, OBSERVATIONAL_STRATEGY)
            .await?
        else {
            return Ok(());
        };
        let mut state = ObservationalState::from_json(&row.state_json, 1000);
        let existing: Vec<String> = self
            .store
            .list_messages(chat_id)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        state.retain_chunks_with_existing_messages(&existing);
        self.store
            .save_memory_state(chat_id, OBSERVATIONAL_STRATEGY, &state.to_json())
            .await?;
        Ok(())
    }
}

/// Write the pre-edit content back, or unlink the file when it was created
/// from nothing.
fn restore_snapshot(snapshot: &FileSnapshotRow) -> Result<(), AgentError> {
    let path = Path::new(&snapshot.file_path);
    match &snapshot.content {
        Some(content) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        None => {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::ids::{generate_id, utc_now_iso};
    use crate::store::domain::*;
    use crate::test_utils::{NullProvider, seed_chat};

    async fn engine_fixture() -> (tempfile::TempDir, ChatStore, RevertEngine, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let runner = Arc::new(MemoryRunner::new(
            store.clone(),
            Arc::new(EventBus::new()),
            Arc::new(NullProvider),
        ));
        let engine = RevertEngine::new(store.clone(), runner);
        (dir, store, engine, chat.id)
    }

    async fn seed_checkpoint(store: &ChatStore, chat_id: &str, msg_id: &str, ts: &str) -> String {
        store
            .create_message(msg_id, chat_id, "user", "msg", ts, None, None)
            .await
            .unwrap();
        let cp_id = generate_id("cp");
        store
            .create_checkpoint(&cp_id, chat_id, msg_id, "cp", ts)
            .await
            .unwrap();
        cp_id
    }

    async fn seed_edit_with_snapshot(
        store: &ChatStore,
        chat_id: &str,
        checkpoint_id: &str,
        path: &Path,
        original: Option<&str>,
        ts: &str,
    ) -> String {
        let edit_id = generate_id("fe");
        store
            .create_file_edit(FileEditRow {
                id: edit_id.clone(),
                chat_id: chat_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
                file_path: path.display().to_string(),
                action: if original.is_some() {
                    FileEditAction::Modified
                } else {
                    FileEditAction::Created
                },
                diff: None,
                timestamp: ts.to_string(),
            })
            .await
            .unwrap();
        store
            .create_file_snapshot(FileSnapshotRow {
                id: generate_id("fs"),
                chat_id: chat_id.to_string(),
                checkpoint_id: Some(checkpoint_id.to_string()),
                file_edit_id: Some(edit_id.clone()),
                tool_call_id: None,
                file_path: path.display().to_string(),
                content: original.map(str::to_string),
                timestamp: ts.to_string(),
            })
            .await
            .unwrap();
        edit_id
    }

    #[tokio::test]
    async fn revert_restores_modified_file_and_deletes_rows() {
        let (dir, store, engine, chat_id) = engine_fixture().await;
        let cp = seed_checkpoint(&store, &chat_id, "msg-1", "2026-01-01T00:00:00Z").await;

        let file = dir.path().join("code.rs");
        std::fs::write(&file, "after edit").unwrap();
        seed_edit_with_snapshot(
            &store,
            &chat_id,
            "cp-later",
            &file,
            Some("before edit"),
            "2026-01-01T00:05:00Z",
        )
        .await;
        store
            .create_message("msg-2", &chat_id, "assistant", "later", "2026-01-01T00:05:00Z", None, None)
            .await
            .unwrap();

        engine.revert_to_checkpoint(&chat_id, &cp).await.unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "before edit");
        assert_eq!(store.list_messages(&chat_id).await.unwrap().len(), 1);
        assert!(store.list_file_edits(&chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revert_unlinks_created_files() {
        let (dir, store, engine, chat_id) = engine_fixture().await;
        let cp = seed_checkpoint(&store, &chat_id, "msg-1", "2026-01-01T00:00:00Z").await;

        let file = dir.path().join("brand_new.txt");
        std::fs::write(&file, "fresh").unwrap();
        seed_edit_with_snapshot(&store, &chat_id, "cp-later", &file, None, "2026-01-01T00:05:00Z").await;

        engine.revert_to_checkpoint(&chat_id, &cp).await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn revert_prunes_observations_past_checkpoint() {
        let (_dir, store, engine, chat_id) = engine_fixture().await;
        let cp = seed_checkpoint(&store, &chat_id, "msg-1", "2026-01-01T00:00:00Z").await;
        store
            .create_message("msg-2", &chat_id, "assistant", "later", "2026-01-01T00:05:00Z", None, None)
            .await
            .unwrap();

        for (id, generation, waterline, ts) in [
            ("obs-0", 0, "msg-1", "2026-01-01T00:01:00Z"),
            ("obs-1", 1, "msg-2", "2026-01-01T00:06:00Z"),
        ] {
            store
                .create_observation(ObservationRow {
                    id: id.into(),
                    chat_id: chat_id.clone(),
                    generation,
                    content: "o".into(),
                    token_count: 10,
                    trigger_token_count: None,
                    observed_up_to_message_id: Some(waterline.into()),
                    current_task: None,
                    suggested_response: None,
                    timestamp: ts.into(),
                })
                .await
                .unwrap();
        }

        engine.revert_to_checkpoint(&chat_id, &cp).await.unwrap();

        let observations = store.list_observations(&chat_id).await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].generation, 0);
        assert_eq!(observations[0].observed_up_to_message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn revert_trims_buffered_chunks() {
        let (_dir, store, engine, chat_id) = engine_fixture().await;
        let cp = seed_checkpoint(&store, &chat_id, "msg-1", "2026-01-01T00:00:00Z").await;

        let mut state = ObservationalState::new(1000);
        for id in ["msg-1", "msg-ghost"] {
            state.buffer.chunks.push(crate::memory::observational::state::BufferedChunk {
                content: id.into(),
                token_count: 5,
                observed_up_to_message_id: Some(id.into()),
                observed_up_to_timestamp: None,
                current_task: None,
                suggested_response: None,
            });
        }
        store
            .save_memory_state(&chat_id, OBSERVATIONAL_STRATEGY, &state.to_json())
            .await
            .unwrap();

        engine.revert_to_checkpoint(&chat_id, &cp).await.unwrap();

        let row = store
            .get_memory_state(&chat_id, OBSERVATIONAL_STRATEGY)
            .await
            .unwrap()
            .unwrap();
        let trimmed = ObservationalState::from_json(&row.state_json, 1000);
        assert_eq!(trimmed.buffer.chunks.len(), 1);
        assert_eq!(
            trimmed.buffer.chunks[0].observed_up_to_message_id.as_deref(),
            Some("msg-1")
        );
    }

    #[tokio::test]
    async fn revert_file_restores_single_edit() {
        let (dir, store, engine, chat_id) = engine_fixture().await;
        let _cp = seed_checkpoint(&store, &chat_id, "msg-1", "2026-01-01T00:00:00Z").await;
        let file = dir.path().join("one.txt");
        std::fs::write(&file, "changed").unwrap();
        let edit_id = seed_edit_with_snapshot(
            &store,
            &chat_id,
            "cp-x",
            &file,
            Some("original"),
            "2026-01-01T00:02:00Z",
        )
        .await;

        engine.revert_file(&chat_id, &edit_id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");
        assert!(store.get_file_edit(&edit_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_a_validation_error() {
        let (_dir, _store, engine, chat_id) = engine_fixture().await;
        let err = engine.revert_to_checkpoint(&chat_id, "cp-missing").await.unwrap_err();
        assert!(err.is_validation());
    }
}
