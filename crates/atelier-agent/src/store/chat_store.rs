//! SQLite-backed store.
//!
//! One connection behind a mutex; every call hops to the blocking pool so
//! the async runtime never holds the database lock. Background tasks clone
//! the store handle freely — commits are serialized by the connection lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::AgentError;
use crate::ids::{generate_id, utc_now_iso};
use crate::store::domain::*;
use crate::store::schema::init_schema;

#[derive(Clone)]
pub struct ChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChatStore {
    pub async fn connect(path: PathBuf) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let mut conn = Connection::open(&path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("failed to spawn blocking task: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn connect_in_memory() -> Result<Self, AgentError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, rusqlite::Error> {
            let mut conn = Connection::open_in_memory()?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("failed to spawn blocking task: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, AgentError>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("task execution failed: {}", e)))?
        .map_err(AgentError::from)
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub async fn create_project(&self, name: &str, path: &str) -> Result<Project, AgentError> {
        let project = Project {
            id: generate_id("proj"),
            name: name.to_string(),
            path: path.to_string(),
            sort_order: 0,
            created_at: utc_now_iso(),
            updated_at: utc_now_iso(),
        };
        let row = project.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, path, sort_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.name, row.path, row.sort_order, row.created_at, row.updated_at],
            )?;
            Ok(())
        })
        .await?;
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, AgentError> {
        let id = project_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, name, path, sort_order, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        path: row.get(2)?,
                        sort_order: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<(), AgentError> {
        let id = project_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    // ── Chats ─────────────────────────────────────────────────────────────

    pub async fn create_chat(&self, project_id: &str, title: &str) -> Result<Chat, AgentError> {
        let chat = Chat {
            id: generate_id("chat"),
            project_id: project_id.to_string(),
            title: title.to_string(),
            pinned: false,
            sort_order: 0,
            created_at: utc_now_iso(),
            updated_at: utc_now_iso(),
        };
        let row = chat.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO chats (id, project_id, title, pinned, sort_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.project_id,
                    row.title,
                    row.pinned as i64,
                    row.sort_order,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(chat)
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, project_id, title, pinned, sort_order, created_at, updated_at
                 FROM chats WHERE id = ?1",
                params![id],
                map_chat,
            )
            .optional()
        })
        .await
    }

    pub async fn update_chat_timestamp(&self, chat_id: &str, timestamp: &str) -> Result<(), AgentError> {
        let (id, ts) = (chat_id.to_string(), timestamp.to_string());
        self.run_blocking(move |conn| {
            conn.execute("UPDATE chats SET updated_at = ?2 WHERE id = ?1", params![id, ts])?;
            Ok(())
        })
        .await
    }

    pub async fn set_chat_title(&self, chat_id: &str, title: &str) -> Result<(), AgentError> {
        let (id, title) = (chat_id.to_string(), title.to_string());
        self.run_blocking(move |conn| {
            conn.execute("UPDATE chats SET title = ?2 WHERE id = ?1", params![id, title])?;
            Ok(())
        })
        .await
    }

    // ── Messages ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_message(
        &self,
        message_id: &str,
        chat_id: &str,
        role: &str,
        content: &str,
        timestamp: &str,
        checkpoint_id: Option<&str>,
        attachments_json: Option<&str>,
    ) -> Result<Message, AgentError> {
        let message = Message {
            id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: timestamp.to_string(),
            checkpoint_id: checkpoint_id.map(str::to_string),
            attachments_json: attachments_json.map(str::to_string),
        };
        let row = message.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, role, content, timestamp, checkpoint_id, attachments_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.chat_id,
                    row.role,
                    row.content,
                    row.timestamp,
                    row.checkpoint_id,
                    row.attachments_json
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(message)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>, AgentError> {
        let id = message_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, role, content, timestamp, checkpoint_id, attachments_json
                 FROM messages WHERE id = ?1",
                params![id],
                map_message,
            )
            .optional()
        })
        .await
    }

    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, role, content, timestamp, checkpoint_id, attachments_json
                 FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![id], map_message)?;
            rows.collect()
        })
        .await
    }

    pub async fn update_message_content(&self, message_id: &str, content: &str) -> Result<(), AgentError> {
        let (id, content) = (message_id.to_string(), content.to_string());
        self.run_blocking(move |conn| {
            conn.execute("UPDATE messages SET content = ?2 WHERE id = ?1", params![id, content])?;
            Ok(())
        })
        .await
    }

    pub async fn link_message_checkpoint(&self, message_id: &str, checkpoint_id: &str) -> Result<(), AgentError> {
        let (id, cp) = (message_id.to_string(), checkpoint_id.to_string());
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE messages SET checkpoint_id = ?2 WHERE id = ?1",
                params![id, cp],
            )?;
            Ok(())
        })
        .await
    }

    // ── Checkpoints ───────────────────────────────────────────────────────

    pub async fn create_checkpoint(
        &self,
        checkpoint_id: &str,
        chat_id: &str,
        message_id: &str,
        label: &str,
        timestamp: &str,
    ) -> Result<Checkpoint, AgentError> {
        let checkpoint = Checkpoint {
            id: checkpoint_id.to_string(),
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            label: label.to_string(),
            timestamp: timestamp.to_string(),
        };
        let row = checkpoint.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, chat_id, message_id, label, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.id, row.chat_id, row.message_id, row.label, row.timestamp],
            )?;
            Ok(())
        })
        .await?;
        Ok(checkpoint)
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let id = checkpoint_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, message_id, label, timestamp FROM checkpoints WHERE id = ?1",
                params![id],
                map_checkpoint,
            )
            .optional()
        })
        .await
    }

    pub async fn get_checkpoint_by_message(&self, message_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let id = message_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, message_id, label, timestamp FROM checkpoints WHERE message_id = ?1",
                params![id],
                map_checkpoint,
            )
            .optional()
        })
        .await
    }

    pub async fn latest_checkpoint(&self, chat_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, message_id, label, timestamp FROM checkpoints
                 WHERE chat_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![id],
                map_checkpoint,
            )
            .optional()
        })
        .await
    }

    pub async fn list_checkpoints(&self, chat_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, message_id, label, timestamp FROM checkpoints
                 WHERE chat_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![id], map_checkpoint)?;
            rows.collect()
        })
        .await
    }

    pub async fn set_checkpoint_label(&self, checkpoint_id: &str, label: &str) -> Result<(), AgentError> {
        let (id, label) = (checkpoint_id.to_string(), label.to_string());
        self.run_blocking(move |conn| {
            conn.execute("UPDATE checkpoints SET label = ?2 WHERE id = ?1", params![id, label])?;
            Ok(())
        })
        .await
    }

    // ── Tool calls ────────────────────────────────────────────────────────

    pub async fn create_tool_call(&self, row: ToolCallRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            insert_tool_call(conn, &row)?;
            Ok(())
        })
        .await
    }

    /// Create every row of a parallel group in one transaction so the group
    /// becomes visible atomically.
    pub async fn create_tool_calls(&self, rows: Vec<ToolCallRow>) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                insert_tool_call(&tx, row)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_tool_call(&self, tool_call_id: &str) -> Result<Option<ToolCallRow>, AgentError> {
        let id = tool_call_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, checkpoint_id, name, status, input_json, output_text,
                        timestamp, duration_ms, parallel_group
                 FROM tool_calls WHERE id = ?1",
                params![id],
                map_tool_call,
            )
            .optional()
        })
        .await
    }

    pub async fn list_tool_calls(&self, chat_id: &str) -> Result<Vec<ToolCallRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, name, status, input_json, output_text,
                        timestamp, duration_ms, parallel_group
                 FROM tool_calls WHERE chat_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![id], map_tool_call)?;
            rows.collect()
        })
        .await
    }

    pub async fn list_pending_tool_calls(&self, chat_id: &str) -> Result<Vec<ToolCallRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, name, status, input_json, output_text,
                        timestamp, duration_ms, parallel_group
                 FROM tool_calls WHERE chat_id = ?1 AND status = 'pending' ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![id], map_tool_call)?;
            rows.collect()
        })
        .await
    }

    pub async fn set_tool_call_status(
        &self,
        tool_call_id: &str,
        status: ToolCallStatus,
        output_text: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<(), AgentError> {
        let id = tool_call_id.to_string();
        self.run_blocking(move |conn| {
            match output_text {
                Some(output) => conn.execute(
                    "UPDATE tool_calls SET status = ?2, output_text = ?3, duration_ms = COALESCE(?4, duration_ms)
                     WHERE id = ?1",
                    params![id, status.as_str(), output, duration_ms],
                )?,
                None => conn.execute(
                    "UPDATE tool_calls SET status = ?2, duration_ms = COALESCE(?3, duration_ms) WHERE id = ?1",
                    params![id, status.as_str(), duration_ms],
                )?,
            };
            Ok(())
        })
        .await
    }

    // ── File edits & snapshots ────────────────────────────────────────────

    pub async fn create_file_edit(&self, row: FileEditRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO file_edits (id, chat_id, checkpoint_id, file_path, action, diff, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.chat_id,
                    row.checkpoint_id,
                    row.file_path,
                    row.action.as_str(),
                    row.diff,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_file_edit(&self, file_edit_id: &str) -> Result<Option<FileEditRow>, AgentError> {
        let id = file_edit_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, checkpoint_id, file_path, action, diff, timestamp
                 FROM file_edits WHERE id = ?1",
                params![id],
                map_file_edit,
            )
            .optional()
        })
        .await
    }

    pub async fn list_file_edits(&self, chat_id: &str) -> Result<Vec<FileEditRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, file_path, action, diff, timestamp
                 FROM file_edits WHERE chat_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![id], map_file_edit)?;
            rows.collect()
        })
        .await
    }

    pub async fn list_file_edits_for_checkpoint(
        &self,
        chat_id: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<FileEditRow>, AgentError> {
        let (chat, cp) = (chat_id.to_string(), checkpoint_id.to_string());
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, file_path, action, diff, timestamp
                 FROM file_edits WHERE chat_id = ?1 AND checkpoint_id = ?2 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![chat, cp], map_file_edit)?;
            rows.collect()
        })
        .await
    }

    /// File edits created at or after the cutoff, newest first, so revert
    /// can unwind them in reverse order.
    pub async fn list_file_edits_since(
        &self,
        chat_id: &str,
        cutoff_timestamp: &str,
    ) -> Result<Vec<FileEditRow>, AgentError> {
        let (chat, cutoff) = (chat_id.to_string(), cutoff_timestamp.to_string());
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, file_path, action, diff, timestamp
                 FROM file_edits WHERE chat_id = ?1 AND timestamp > ?2
                 ORDER BY timestamp DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![chat, cutoff], map_file_edit)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_file_edit(&self, file_edit_id: &str) -> Result<(), AgentError> {
        let id = file_edit_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM file_snapshots WHERE file_edit_id = ?1", params![id])?;
            conn.execute("DELETE FROM file_edits WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn create_file_snapshot(&self, row: FileSnapshotRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO file_snapshots (id, chat_id, checkpoint_id, file_edit_id, tool_call_id,
                                             file_path, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    row.chat_id,
                    row.checkpoint_id,
                    row.file_edit_id,
                    row.tool_call_id,
                    row.file_path,
                    row.content,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_snapshot_for_edit(&self, file_edit_id: &str) -> Result<Option<FileSnapshotRow>, AgentError> {
        let id = file_edit_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, checkpoint_id, file_edit_id, tool_call_id, file_path, content, timestamp
                 FROM file_snapshots WHERE file_edit_id = ?1",
                params![id],
                map_file_snapshot,
            )
            .optional()
        })
        .await
    }

    pub async fn list_snapshots_for_tool_call(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<FileSnapshotRow>, AgentError> {
        let id = tool_call_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, file_edit_id, tool_call_id, file_path, content, timestamp
                 FROM file_snapshots WHERE tool_call_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], map_file_snapshot)?;
            rows.collect()
        })
        .await
    }

    // ── Reasoning blocks ──────────────────────────────────────────────────

    pub async fn create_reasoning_block(&self, row: ReasoningBlockRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO reasoning_blocks (id, chat_id, checkpoint_id, content, timestamp, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.chat_id, row.checkpoint_id, row.content, row.timestamp, row.duration_ms],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_reasoning_blocks(&self, chat_id: &str) -> Result<Vec<ReasoningBlockRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, content, timestamp, duration_ms
                 FROM reasoning_blocks WHERE chat_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![id], map_reasoning_block)?;
            rows.collect()
        })
        .await
    }

    // ── Tool artifacts ────────────────────────────────────────────────────

    pub async fn create_tool_artifact(&self, row: ToolArtifactRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO tool_artifacts (id, tool_call_id, chat_id, project_id, artifact_type,
                                             file_path, line_count, preview_lines, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.tool_call_id,
                    row.chat_id,
                    row.project_id,
                    row.artifact_type,
                    row.file_path,
                    row.line_count,
                    row.preview_lines,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_tool_artifacts_for_tool_call(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<ToolArtifactRow>, AgentError> {
        let id = tool_call_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tool_call_id, chat_id, project_id, artifact_type, file_path,
                        line_count, preview_lines, timestamp
                 FROM tool_artifacts WHERE tool_call_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], map_tool_artifact)?;
            rows.collect()
        })
        .await
    }

    pub async fn list_artifacts_for_project(&self, project_id: &str) -> Result<Vec<ToolArtifactRow>, AgentError> {
        let id = project_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tool_call_id, chat_id, project_id, artifact_type, file_path,
                        line_count, preview_lines, timestamp
                 FROM tool_artifacts WHERE project_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], map_tool_artifact)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_artifacts_for_project(&self, project_id: &str) -> Result<(), AgentError> {
        let id = project_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM tool_artifacts WHERE project_id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    // ── Todos ─────────────────────────────────────────────────────────────

    /// Replace the chat's todo list wholesale. Calling twice with the same
    /// payload leaves the same set (new row ids, same content/status/order).
    pub async fn replace_todos(
        &self,
        chat_id: &str,
        checkpoint_id: Option<&str>,
        items: Vec<(String, String, i64)>,
    ) -> Result<Vec<TodoRow>, AgentError> {
        let chat = chat_id.to_string();
        let cp = checkpoint_id.map(str::to_string);
        let ts = utc_now_iso();
        let rows: Vec<TodoRow> = items
            .into_iter()
            .map(|(content, status, sort_order)| TodoRow {
                id: generate_id("todo"),
                chat_id: chat.clone(),
                checkpoint_id: cp.clone(),
                content,
                status,
                sort_order,
                timestamp: ts.clone(),
            })
            .collect();
        let to_insert = rows.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM todos WHERE chat_id = ?1", params![chat])?;
            for row in &to_insert {
                tx.execute(
                    "INSERT INTO todos (id, chat_id, checkpoint_id, content, status, sort_order, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id,
                        row.chat_id,
                        row.checkpoint_id,
                        row.content,
                        row.status,
                        row.sort_order,
                        row.timestamp
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(rows)
    }

    pub async fn list_todos(&self, chat_id: &str) -> Result<Vec<TodoRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, checkpoint_id, content, status, sort_order, timestamp
                 FROM todos WHERE chat_id = ?1 ORDER BY sort_order ASC, timestamp ASC",
            )?;
            let rows = stmt.query_map(params![id], map_todo)?;
            rows.collect()
        })
        .await
    }

    // ── Observations & memory state ───────────────────────────────────────

    pub async fn create_observation(&self, row: ObservationRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO observations (id, chat_id, generation, content, token_count,
                                           trigger_token_count, observed_up_to_message_id,
                                           current_task, suggested_response, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.id,
                    row.chat_id,
                    row.generation,
                    row.content,
                    row.token_count,
                    row.trigger_token_count,
                    row.observed_up_to_message_id,
                    row.current_task,
                    row.suggested_response,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn latest_observation(&self, chat_id: &str) -> Result<Option<ObservationRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, generation, content, token_count, trigger_token_count,
                        observed_up_to_message_id, current_task, suggested_response, timestamp
                 FROM observations WHERE chat_id = ?1 ORDER BY generation DESC LIMIT 1",
                params![id],
                map_observation,
            )
            .optional()
        })
        .await
    }

    pub async fn list_observations(&self, chat_id: &str) -> Result<Vec<ObservationRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, generation, content, token_count, trigger_token_count,
                        observed_up_to_message_id, current_task, suggested_response, timestamp
                 FROM observations WHERE chat_id = ?1 ORDER BY generation ASC",
            )?;
            let rows = stmt.query_map(params![id], map_observation)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_observation(&self, observation_id: &str) -> Result<(), AgentError> {
        let id = observation_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM observations WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn delete_observations_before_generation(
        &self,
        chat_id: &str,
        generation: i64,
    ) -> Result<(), AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "DELETE FROM observations WHERE chat_id = ?1 AND generation < ?2",
                params![id, generation],
            )?;
            Ok(())
        })
        .await
    }

    /// Drop observations whose waterline message no longer exists. Used by
    /// revert so no observation references a deleted message.
    pub async fn prune_observations_missing_waterline(&self, chat_id: &str) -> Result<usize, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM observations
                 WHERE chat_id = ?1
                   AND observed_up_to_message_id IS NOT NULL
                   AND observed_up_to_message_id NOT IN (SELECT id FROM messages WHERE chat_id = ?1)",
                params![id],
            )?;
            Ok(deleted)
        })
        .await
    }

    pub async fn get_memory_state(&self, chat_id: &str, strategy: &str) -> Result<Option<MemoryStateRow>, AgentError> {
        let (chat, strategy) = (chat_id.to_string(), strategy.to_string());
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, strategy, state_json, updated_at
                 FROM memory_states WHERE chat_id = ?1 AND strategy = ?2",
                params![chat, strategy],
                |row| {
                    Ok(MemoryStateRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        strategy: row.get(2)?,
                        state_json: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn save_memory_state(
        &self,
        chat_id: &str,
        strategy: &str,
        state_json: &str,
    ) -> Result<(), AgentError> {
        let (chat, strategy, json) = (chat_id.to_string(), strategy.to_string(), state_json.to_string());
        let (id, now) = (generate_id("mem"), utc_now_iso());
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO memory_states (id, chat_id, strategy, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chat_id, strategy)
                 DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
                params![id, chat, strategy, json, now],
            )?;
            Ok(())
        })
        .await
    }

    // ── Sub-agent runs ────────────────────────────────────────────────────

    pub async fn create_sub_agent_run(&self, row: SubAgentRunRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO sub_agent_runs (id, chat_id, tool_call_id, task, model, status,
                                             output_text, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.chat_id,
                    row.tool_call_id,
                    row.task,
                    row.model,
                    row.status,
                    row.output_text,
                    row.duration_ms,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_sub_agent_run_status(
        &self,
        sub_agent_id: &str,
        status: &str,
        output_text: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<(), AgentError> {
        let (id, status) = (sub_agent_id.to_string(), status.to_string());
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE sub_agent_runs SET status = ?2,
                        output_text = COALESCE(?3, output_text),
                        duration_ms = COALESCE(?4, duration_ms)
                 WHERE id = ?1",
                params![id, status, output_text, duration_ms],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_sub_agent_runs(&self, chat_id: &str) -> Result<Vec<SubAgentRunRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, tool_call_id, task, model, status, output_text, duration_ms, timestamp
                 FROM sub_agent_runs WHERE chat_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![id], map_sub_agent_run)?;
            rows.collect()
        })
        .await
    }

    // ── Plans ─────────────────────────────────────────────────────────────

    pub async fn create_plan(&self, row: ProjectPlanRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO project_plans (id, chat_id, project_id, checkpoint_id, title, status,
                                            file_path, revision, content_sha, last_editor,
                                            approved_action, implementation_chat_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    row.id,
                    row.chat_id,
                    row.project_id,
                    row.checkpoint_id,
                    row.title,
                    row.status,
                    row.file_path,
                    row.revision,
                    row.content_sha,
                    row.last_editor,
                    row.approved_action,
                    row.implementation_chat_id,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<ProjectPlanRow>, AgentError> {
        let id = plan_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, chat_id, project_id, checkpoint_id, title, status, file_path, revision,
                        content_sha, last_editor, approved_action, implementation_chat_id,
                        created_at, updated_at
                 FROM project_plans WHERE id = ?1",
                params![id],
                map_plan,
            )
            .optional()
        })
        .await
    }

    pub async fn list_plans(&self, chat_id: &str) -> Result<Vec<ProjectPlanRow>, AgentError> {
        let id = chat_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, project_id, checkpoint_id, title, status, file_path, revision,
                        content_sha, last_editor, approved_action, implementation_chat_id,
                        created_at, updated_at
                 FROM project_plans WHERE chat_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![id], map_plan)?;
            rows.collect()
        })
        .await
    }

    pub async fn update_plan(&self, row: ProjectPlanRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE project_plans SET title = ?2, status = ?3, revision = ?4, content_sha = ?5,
                        last_editor = ?6, approved_action = ?7, implementation_chat_id = ?8,
                        updated_at = ?9, checkpoint_id = ?10
                 WHERE id = ?1",
                params![
                    row.id,
                    row.title,
                    row.status,
                    row.revision,
                    row.content_sha,
                    row.last_editor,
                    row.approved_action,
                    row.implementation_chat_id,
                    row.updated_at,
                    row.checkpoint_id
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_plan_revision(&self, row: ProjectPlanRevisionRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO project_plan_revisions (id, plan_id, revision, content_sha, last_editor,
                                                     checkpoint_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.plan_id,
                    row.revision,
                    row.content_sha,
                    row.last_editor,
                    row.checkpoint_id,
                    row.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_plan_revisions(&self, plan_id: &str) -> Result<Vec<ProjectPlanRevisionRow>, AgentError> {
        let id = plan_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, plan_id, revision, content_sha, last_editor, checkpoint_id, timestamp
                 FROM project_plan_revisions WHERE plan_id = ?1 ORDER BY revision ASC",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok(ProjectPlanRevisionRow {
                    id: row.get(0)?,
                    plan_id: row.get(1)?,
                    revision: row.get(2)?,
                    content_sha: row.get(3)?,
                    last_editor: row.get(4)?,
                    checkpoint_id: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    // ── Auto-approve rules ────────────────────────────────────────────────

    pub async fn list_auto_approve_rules(&self) -> Result<Vec<AutoApproveRule>, AgentError> {
        self.run_blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, field, value, enabled FROM auto_approve_rules ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(AutoApproveRule {
                    id: row.get(0)?,
                    field: row.get(1)?,
                    value: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                })
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn upsert_auto_approve_rule(&self, rule: AutoApproveRule) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO auto_approve_rules (id, field, value, enabled) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET field = excluded.field, value = excluded.value,
                                               enabled = excluded.enabled",
                params![rule.id, rule.field, rule.value, rule.enabled as i64],
            )?;
            Ok(())
        })
        .await
    }

    // ── MCP servers & tool cache ──────────────────────────────────────────

    pub async fn list_enabled_mcp_servers(&self) -> Result<Vec<McpServerRow>, AgentError> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, transport, config_json, enabled, last_connected_at
                 FROM mcp_servers WHERE enabled = 1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], map_mcp_server)?;
            rows.collect()
        })
        .await
    }

    pub async fn upsert_mcp_server(&self, row: McpServerRow) -> Result<(), AgentError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO mcp_servers (id, name, transport, config_json, enabled, last_connected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, transport = excluded.transport,
                        config_json = excluded.config_json, enabled = excluded.enabled",
                params![
                    row.id,
                    row.name,
                    row.transport,
                    row.config_json,
                    row.enabled as i64,
                    row.last_connected_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_mcp_last_connected(&self, server_id: &str, timestamp: &str) -> Result<(), AgentError> {
        let (id, ts) = (server_id.to_string(), timestamp.to_string());
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE mcp_servers SET last_connected_at = ?2 WHERE id = ?1",
                params![id, ts],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn replace_server_tools(
        &self,
        server_id: &str,
        tools: Vec<McpToolCacheRow>,
    ) -> Result<(), AgentError> {
        let id = server_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM mcp_tool_cache WHERE server_id = ?1", params![id])?;
            for tool in &tools {
                tx.execute(
                    "INSERT INTO mcp_tool_cache (id, server_id, tool_name, description, schema_json,
                                                 enabled, discovered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        tool.id,
                        tool.server_id,
                        tool.tool_name,
                        tool.description,
                        tool.schema_json,
                        tool.enabled as i64,
                        tool.discovered_at
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_cached_tools_for_server(&self, server_id: &str) -> Result<Vec<McpToolCacheRow>, AgentError> {
        let id = server_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, tool_name, description, schema_json, enabled, discovered_at
                 FROM mcp_tool_cache WHERE server_id = ?1 ORDER BY tool_name ASC",
            )?;
            let rows = stmt.query_map(params![id], map_mcp_tool_cache)?;
            rows.collect()
        })
        .await
    }

    // ── Revert support ────────────────────────────────────────────────────

    /// Delete all chat state created after the checkpoint: messages, tool
    /// calls, file edits (and their snapshots), reasoning blocks, todos,
    /// plans, sub-agent runs, and later checkpoints. Rows scoped to a
    /// checkpoint that no longer exists afterwards are removed too.
    pub async fn delete_after_checkpoint(
        &self,
        chat_id: &str,
        cutoff_timestamp: &str,
    ) -> Result<(), AgentError> {
        let (chat, cutoff) = (chat_id.to_string(), cutoff_timestamp.to_string());
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND timestamp > ?2",
                params![chat, cutoff],
            )?;
            tx.execute(
                "DELETE FROM checkpoints WHERE chat_id = ?1 AND timestamp > ?2",
                params![chat, cutoff],
            )?;
            for table in [
                "tool_calls",
                "file_edits",
                "file_snapshots",
                "reasoning_blocks",
                "todos",
                "sub_agent_runs",
            ] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE chat_id = ?1 AND timestamp > ?2", table),
                    params![chat, cutoff],
                )?;
            }
            tx.execute(
                "DELETE FROM project_plans WHERE chat_id = ?1 AND created_at > ?2",
                params![chat, cutoff],
            )?;
            // Rows tagged with a checkpoint that was deleted above.
            for table in ["tool_calls", "file_edits", "reasoning_blocks"] {
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE chat_id = ?1
                         AND checkpoint_id NOT IN (SELECT id FROM checkpoints WHERE chat_id = ?1)",
                        table
                    ),
                    params![chat],
                )?;
            }
            tx.execute(
                "DELETE FROM todos WHERE chat_id = ?1 AND checkpoint_id IS NOT NULL
                 AND checkpoint_id NOT IN (SELECT id FROM checkpoints WHERE chat_id = ?1)",
                params![chat],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn map_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        pinned: row.get::<_, i64>(3)? != 0,
        sort_order: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        checkpoint_id: row.get(5)?,
        attachments_json: row.get(6)?,
    })
}

fn map_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        label: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn insert_tool_call(conn: &Connection, row: &ToolCallRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tool_calls (id, chat_id, checkpoint_id, name, status, input_json,
                                 output_text, timestamp, duration_ms, parallel_group)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            row.id,
            row.chat_id,
            row.checkpoint_id,
            row.name,
            row.status.as_str(),
            row.input_json,
            row.output_text,
            row.timestamp,
            row.duration_ms,
            row.parallel_group
        ],
    )?;
    Ok(())
}

fn map_tool_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRow> {
    let status: String = row.get(4)?;
    Ok(ToolCallRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        name: row.get(3)?,
        status: ToolCallStatus::parse(&status),
        input_json: row.get(5)?,
        output_text: row.get(6)?,
        timestamp: row.get(7)?,
        duration_ms: row.get(8)?,
        parallel_group: row.get(9)?,
    })
}

fn map_file_edit(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileEditRow> {
    let action: String = row.get(4)?;
    Ok(FileEditRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        file_path: row.get(3)?,
        action: FileEditAction::parse(&action),
        diff: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn map_file_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileSnapshotRow> {
    Ok(FileSnapshotRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        file_edit_id: row.get(3)?,
        tool_call_id: row.get(4)?,
        file_path: row.get(5)?,
        content: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

fn map_reasoning_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReasoningBlockRow> {
    Ok(ReasoningBlockRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        duration_ms: row.get(5)?,
    })
}

fn map_tool_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolArtifactRow> {
    Ok(ToolArtifactRow {
        id: row.get(0)?,
        tool_call_id: row.get(1)?,
        chat_id: row.get(2)?,
        project_id: row.get(3)?,
        artifact_type: row.get(4)?,
        file_path: row.get(5)?,
        line_count: row.get(6)?,
        preview_lines: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

fn map_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<TodoRow> {
    Ok(TodoRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        sort_order: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn map_observation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObservationRow> {
    Ok(ObservationRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        generation: row.get(2)?,
        content: row.get(3)?,
        token_count: row.get(4)?,
        trigger_token_count: row.get(5)?,
        observed_up_to_message_id: row.get(6)?,
        current_task: row.get(7)?,
        suggested_response: row.get(8)?,
        timestamp: row.get(9)?,
    })
}

fn map_sub_agent_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubAgentRunRow> {
    Ok(SubAgentRunRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        tool_call_id: row.get(2)?,
        task: row.get(3)?,
        model: row.get(4)?,
        status: row.get(5)?,
        output_text: row.get(6)?,
        duration_ms: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

fn map_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectPlanRow> {
    Ok(ProjectPlanRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        project_id: row.get(2)?,
        checkpoint_id: row.get(3)?,
        title: row.get(4)?,
        status: row.get(5)?,
        file_path: row.get(6)?,
        revision: row.get(7)?,
        content_sha: row.get(8)?,
        last_editor: row.get(9)?,
        approved_action: row.get(10)?,
        implementation_chat_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_mcp_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpServerRow> {
    Ok(McpServerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        transport: row.get(2)?,
        config_json: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        last_connected_at: row.get(5)?,
    })
}

fn map_mcp_tool_cache(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpToolCacheRow> {
    Ok(McpToolCacheRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        tool_name: row.get(2)?,
        description: row.get(3)?,
        schema_json: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        discovered_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::seed_chat;

    #[tokio::test]
    async fn message_checkpoint_round_trip() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        let ts = utc_now_iso();
        let msg = store
            .create_message("msg-1", &chat.id, "user", "hello", &ts, None, None)
            .await
            .unwrap();
        let cp = store
            .create_checkpoint("cp-1", &chat.id, &msg.id, "User message: hello", &ts)
            .await
            .unwrap();
        store.link_message_checkpoint(&msg.id, &cp.id).await.unwrap();

        let loaded = store.get_message("msg-1").await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_id.as_deref(), Some("cp-1"));
        assert_eq!(
            store.get_checkpoint_by_message("msg-1").await.unwrap().unwrap().id,
            "cp-1"
        );
    }

    #[tokio::test]
    async fn replace_todos_is_idempotent() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        let items = vec![
            ("write tests".to_string(), "pending".to_string(), 0),
            ("run them".to_string(), "in_progress".to_string(), 1),
        ];
        store
            .replace_todos(&chat.id, None, items.clone())
            .await
            .unwrap();
        store.replace_todos(&chat.id, None, items).await.unwrap();

        let todos = store.list_todos(&chat.id).await.unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].content, "write tests");
        assert_eq!(todos[1].status, "in_progress");
    }

    #[tokio::test]
    async fn delete_after_checkpoint_removes_later_rows_only() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        store
            .create_message("msg-1", &chat.id, "user", "first", "2026-01-01T00:00:00Z", None, None)
            .await
            .unwrap();
        store
            .create_checkpoint("cp-1", &chat.id, "msg-1", "cp", "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        store
            .create_message("msg-2", &chat.id, "assistant", "later", "2026-01-01T00:01:00Z", None, None)
            .await
            .unwrap();
        store
            .create_tool_call(ToolCallRow {
                id: "tc-1".into(),
                chat_id: chat.id.clone(),
                checkpoint_id: "cp-1".into(),
                name: "read_file".into(),
                status: ToolCallStatus::Completed,
                input_json: "{}".into(),
                output_text: None,
                timestamp: "2026-01-01T00:01:00Z".into(),
                duration_ms: None,
                parallel_group: None,
            })
            .await
            .unwrap();

        store
            .delete_after_checkpoint(&chat.id, "2026-01-01T00:00:00Z")
            .await
            .unwrap();

        let messages = store.list_messages(&chat.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "msg-1");
        assert!(store.list_tool_calls(&chat.id).await.unwrap().is_empty());
        // The checkpoint itself survives.
        assert!(store.get_checkpoint("cp-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_observations_drops_dangling_waterlines() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        store
            .create_message("msg-keep", &chat.id, "user", "x", "2026-01-01T00:00:00Z", None, None)
            .await
            .unwrap();
        for (id, generation, waterline) in [
            ("obs-0", 0, Some("msg-keep")),
            ("obs-1", 1, Some("msg-gone")),
        ] {
            store
                .create_observation(ObservationRow {
                    id: id.into(),
                    chat_id: chat.id.clone(),
                    generation,
                    content: "o".into(),
                    token_count: 10,
                    trigger_token_count: None,
                    observed_up_to_message_id: waterline.map(str::to_string),
                    current_task: None,
                    suggested_response: None,
                    timestamp: utc_now_iso(),
                })
                .await
                .unwrap();
        }

        let pruned = store.prune_observations_missing_waterline(&chat.id).await.unwrap();
        assert_eq!(pruned, 1);
        let latest = store.latest_observation(&chat.id).await.unwrap().unwrap();
        assert_eq!(latest.id, "obs-0");
    }

    #[tokio::test]
    async fn memory_state_upserts() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        store
            .save_memory_state(&chat.id, "observational", "{\"a\":1}")
            .await
            .unwrap();
        store
            .save_memory_state(&chat.id, "observational", "{\"a\":2}")
            .await
            .unwrap();
        let state = store
            .get_memory_state(&chat.id, "observational")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.state_json, "{\"a\":2}");
    }

    #[tokio::test]
    async fn project_delete_cascades_to_chat_rows() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (project, chat) = seed_chat(&store).await;
        store
            .create_message("msg-1", &chat.id, "user", "x", &utc_now_iso(), None, None)
            .await
            .unwrap();

        store.delete_project(&project.id).await.unwrap();
        assert!(store.get_chat(&chat.id).await.unwrap().is_none());
        assert!(store.get_message("msg-1").await.unwrap().is_none());
    }
}
