//! Write file contents, capturing diff and pre-edit snapshot data.

use std::path::Path;

use async_trait::async_trait;
use imara_diff::intern::InternedInput;
use imara_diff::{Algorithm, UnifiedDiffBuilder, diff};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::store::domain::FileEditAction;
use crate::tools::{Tool, ToolContext, ToolError, ToolFileEdit, ToolOutcome};

const MAX_DIFF_LINES: usize = 400;

/// Unified diff between the previous and new content, capped so enormous
/// rewrites do not flood the history view.
pub fn unified_diff(before: &str, after: &str) -> String {
    let input = InternedInput::new(before, after);
    let body = diff(Algorithm::Histogram, &input, UnifiedDiffBuilder::new(&input));
    let mut lines: Vec<&str> = body.lines().collect();
    let truncated = lines.len() > MAX_DIFF_LINES;
    if truncated {
        lines.truncate(MAX_DIFF_LINES);
    }
    let mut out = format!("--- before\n+++ after\n{}", lines.join("\n"));
    if truncated {
        out.push_str("\n... [diff truncated]");
    }
    out
}

/// Write via tempfile + rename so readers never observe a half-written file.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, content)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&tmp);
            Err(err)
        }
    }
}

pub struct EditFileTool;

impl EditFileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EditFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. path must be an absolute path under the project root \
         (e.g. /path/to/project/src/main.rs). Creates the file and any missing parent \
         directories; replaces existing content entirely."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let raw_path = args.get("path").and_then(Value::as_str).unwrap_or_default();
        let target = match ctx.resolve_path(raw_path) {
            Ok(path) => path,
            Err(err) => return Ok(ToolOutcome::failure(err.to_string())),
        };
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = tokio::task::spawn_blocking(move || -> Result<ToolOutcome, std::io::Error> {
            let previous = if target.exists() {
                Some(std::fs::read_to_string(&target)?)
            } else {
                None
            };
            if previous.as_deref() == Some(content.as_str()) {
                return Ok(ToolOutcome::success(format!("unchanged {}", target.display())));
            }
            let action = if previous.is_some() {
                FileEditAction::Modified
            } else {
                FileEditAction::Created
            };
            write_atomic(&target, &content)?;

            let diff_text = previous.as_deref().map(|before| unified_diff(before, &content));
            let edit = ToolFileEdit {
                file_path: target.display().to_string(),
                action,
                diff: diff_text,
                original_content: previous,
            };
            Ok(ToolOutcome::success(format!("{} {}", action.as_str(), target.display()))
                .with_file_edit(edit))
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("write task failed: {}", e)))?
        .map_err(|e| ToolError::ExecutionFailed(format!("write failed: {}", e)))?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tool_context;

    #[tokio::test]
    async fn creating_a_file_reports_created_with_null_original() {
        let (dir, ctx) = tool_context();
        let path = dir.path().join("project/new.txt");

        let args = json!({"path": path.to_str().unwrap(), "content": "hello"});
        let outcome = EditFileTool::new().run(args, &ctx).await.unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.file_edits.len(), 1);
        let edit = &outcome.file_edits[0];
        assert_eq!(edit.action, FileEditAction::Created);
        assert!(edit.original_content.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn modifying_captures_original_and_diff() {
        let (dir, ctx) = tool_context();
        let path = dir.path().join("project/code.rs");
        std::fs::write(&path, "fn a() {}\n").unwrap();

        let args = json!({"path": path.to_str().unwrap(), "content": "fn b() {}\n"});
        let outcome = EditFileTool::new().run(args, &ctx).await.unwrap();

        let edit = &outcome.file_edits[0];
        assert_eq!(edit.action, FileEditAction::Modified);
        assert_eq!(edit.original_content.as_deref(), Some("fn a() {}\n"));
        let diff = edit.diff.as_deref().unwrap();
        assert!(diff.contains("-fn a() {}"));
        assert!(diff.contains("+fn b() {}"));
    }

    #[tokio::test]
    async fn identical_content_is_a_no_op() {
        let (dir, ctx) = tool_context();
        let path = dir.path().join("project/same.txt");
        std::fs::write(&path, "stable").unwrap();

        let args = json!({"path": path.to_str().unwrap(), "content": "stable"});
        let outcome = EditFileTool::new().run(args, &ctx).await.unwrap();
        assert!(outcome.output.starts_with("unchanged"));
        assert!(outcome.file_edits.is_empty());
    }

    #[tokio::test]
    async fn outside_project_root_is_refused() {
        let (dir, ctx) = tool_context();
        let outside = dir.path().join("elsewhere.txt");

        let args = json!({"path": outside.to_str().unwrap(), "content": "x"});
        let outcome = EditFileTool::new().run(args, &ctx).await.unwrap();
        assert!(!outcome.ok);
        assert!(!outside.exists());
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        // No stray tempfiles left behind.
        let stray = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(stray, 1);
    }
}
