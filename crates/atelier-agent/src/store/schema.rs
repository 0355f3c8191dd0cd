//! Database schema initialization (breaking changes allowed, no migrations).
//!
//! Forward foreign keys only: navigation goes through store lookups, never
//! bidirectional object graphs. Deletion cascades follow chat ownership.

use rusqlite::Connection;

pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            title TEXT NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chats_project ON chats(project_id);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            checkpoint_id TEXT,
            attachments_json TEXT,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_id, timestamp);

        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            label TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_chat_ts ON checkpoints(chat_id, timestamp);

        CREATE TABLE IF NOT EXISTS tool_calls (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            input_json TEXT NOT NULL,
            output_text TEXT,
            timestamp TEXT NOT NULL,
            duration_ms INTEGER,
            parallel_group TEXT,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tool_calls_chat_ts ON tool_calls(chat_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_tool_calls_status ON tool_calls(chat_id, status)
            WHERE status IN ('pending', 'running');

        CREATE TABLE IF NOT EXISTS file_edits (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            action TEXT NOT NULL,
            diff TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_file_edits_chat_ts ON file_edits(chat_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_file_edits_checkpoint ON file_edits(checkpoint_id);

        CREATE TABLE IF NOT EXISTS file_snapshots (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            checkpoint_id TEXT,
            file_edit_id TEXT,
            tool_call_id TEXT,
            file_path TEXT NOT NULL,
            content TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_file_snapshots_edit ON file_snapshots(file_edit_id);

        CREATE TABLE IF NOT EXISTS reasoning_blocks (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            checkpoint_id TEXT,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            duration_ms INTEGER,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_reasoning_chat_ts ON reasoning_blocks(chat_id, timestamp);

        CREATE TABLE IF NOT EXISTS tool_artifacts (
            id TEXT PRIMARY KEY,
            tool_call_id TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            artifact_type TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line_count INTEGER,
            preview_lines INTEGER,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tool_artifacts_call ON tool_artifacts(tool_call_id);
        CREATE INDEX IF NOT EXISTS idx_tool_artifacts_project ON tool_artifacts(project_id);

        CREATE TABLE IF NOT EXISTS todos (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            checkpoint_id TEXT,
            content TEXT NOT NULL,
            status TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_todos_chat ON todos(chat_id, sort_order);

        CREATE TABLE IF NOT EXISTS observations (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            trigger_token_count INTEGER,
            observed_up_to_message_id TEXT,
            current_task TEXT,
            suggested_response TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE,
            UNIQUE(chat_id, generation)
        );

        CREATE TABLE IF NOT EXISTS memory_states (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            strategy TEXT NOT NULL,
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE,
            UNIQUE(chat_id, strategy)
        );

        CREATE TABLE IF NOT EXISTS sub_agent_runs (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            tool_call_id TEXT NOT NULL,
            task TEXT NOT NULL,
            model TEXT NOT NULL,
            status TEXT NOT NULL,
            output_text TEXT,
            duration_ms INTEGER,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS project_plans (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            checkpoint_id TEXT,
            title TEXT NOT NULL,
            status TEXT NOT NULL,
            file_path TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            content_sha TEXT NOT NULL,
            last_editor TEXT NOT NULL,
            approved_action TEXT,
            implementation_chat_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS project_plan_revisions (
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            content_sha TEXT NOT NULL,
            last_editor TEXT NOT NULL,
            checkpoint_id TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(plan_id) REFERENCES project_plans(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS auto_approve_rules (
            id TEXT PRIMARY KEY,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS mcp_servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            transport TEXT NOT NULL,
            config_json TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_connected_at TEXT
        );

        CREATE TABLE IF NOT EXISTS mcp_tool_cache (
            id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            description TEXT,
            schema_json TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            discovered_at TEXT NOT NULL,
            FOREIGN KEY(server_id) REFERENCES mcp_servers(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mcp_tool_cache_server ON mcp_tool_cache(server_id);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_to_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON;", []).unwrap();
        init_schema(&mut conn).unwrap();
        // Idempotent.
        init_schema(&mut conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'observations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn observation_generation_unique_per_chat() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO projects (id, name, path, created_at, updated_at) VALUES ('p', 'p', '/p', 't', 't')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chats (id, project_id, title, created_at, updated_at) VALUES ('c', 'p', 't', 't', 't')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO observations (id, chat_id, generation, content, token_count, timestamp)
             VALUES ('o1', 'c', 0, 'x', 1, 't')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO observations (id, chat_id, generation, content, token_count, timestamp)
             VALUES ('o2', 'c', 0, 'y', 1, 't')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
