//! Directory listing with bounded depth and vendor-dir filtering.

use std::path::Path;

use async_trait::async_trait;
use glob::Pattern;
use ignore::WalkBuilder;
use serde_json::{Value, json};

use crate::paths::is_ignored_dir;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

const DEFAULT_MAX_DEPTH: usize = 3;
const MAX_ENTRIES: usize = 500;

fn list_directory(root: &Path, max_depth: usize, ignore_patterns: &[Pattern]) -> (Vec<String>, bool) {
    let mut lines = Vec::new();
    let mut truncated = false;

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .max_depth(Some(max_depth))
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !is_ignored_dir(&name)
        })
        .build();

    for result in walker {
        let Ok(entry) = result else { continue };
        if entry.path() == root {
            continue;
        }
        if lines.len() >= MAX_ENTRIES {
            truncated = true;
            break;
        }
        let relative_path = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if ignore_patterns.iter().any(|pat| pat.matches_path(relative_path)) {
            continue;
        }
        let relative = relative_path.display().to_string();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            lines.push(format!("{}/", relative));
        } else {
            lines.push(relative);
        }
    }
    lines.sort();
    (lines, truncated)
}

pub struct ListFilesTool;

impl ListFilesTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ListFilesTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories under a path. path must be absolute; defaults to the \
         project root. Ignores vendor and cache directories (node_modules, target, .git, \
         __pycache__ and similar). depth bounds recursion (default 3). You can optionally \
         provide an array of glob patterns to skip with the ignore parameter."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "depth": {
                    "type": "integer",
                    "description": "Maximum directory depth",
                    "default": DEFAULT_MAX_DEPTH
                },
                "ignore": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Additional glob patterns to ignore (beyond default ignores)"
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let root = match args.get("path").and_then(Value::as_str) {
            Some(raw) => match ctx.resolve_path(raw) {
                Ok(path) => path,
                Err(err) => return Ok(ToolOutcome::failure(err.to_string())),
            },
            None => match ctx.project_root() {
                Some(root) => root.to_path_buf(),
                None => {
                    return Ok(ToolOutcome::failure(
                        "path is required when no project is selected; use an absolute path.",
                    ));
                }
            },
        };
        if !root.is_dir() {
            return Ok(ToolOutcome::failure(format!("Not a directory: {}", root.display())));
        }

        let depth = args
            .get("depth")
            .and_then(Value::as_u64)
            .map(|d| d.clamp(1, 10) as usize)
            .unwrap_or(DEFAULT_MAX_DEPTH);

        let mut ignore_patterns = Vec::new();
        if let Some(raw_patterns) = args.get("ignore").and_then(Value::as_array) {
            for raw in raw_patterns.iter().filter_map(Value::as_str) {
                match Pattern::new(raw) {
                    Ok(pattern) => ignore_patterns.push(pattern),
                    Err(err) => {
                        return Ok(ToolOutcome::failure(format!(
                            "Invalid ignore pattern '{}': {}",
                            raw, err
                        )));
                    }
                }
            }
        }

        let root_clone = root.clone();
        let (lines, truncated) =
            tokio::task::spawn_blocking(move || list_directory(&root_clone, depth, &ignore_patterns))
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("list task failed: {}", e)))?;

        if lines.is_empty() {
            return Ok(ToolOutcome::success(format!("{} is empty", root.display())));
        }
        let mut output = format!("{}:\n{}", root.display(), lines.join("\n"));
        if truncated {
            output.push_str(&format!("\n... [truncated at {} entries]", MAX_ENTRIES));
        }
        Ok(ToolOutcome::success(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tool_context;

    #[tokio::test]
    async fn lists_entries_and_skips_vendor_dirs() {
        let (dir, ctx) = tool_context();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/main.rs"), "").unwrap();
        std::fs::write(root.join("README.md"), "").unwrap();

        let outcome = ListFilesTool::new().run(json!({}), &ctx).await.unwrap();
        assert!(outcome.output.contains("src/"));
        assert!(outcome.output.contains("README.md"));
        assert!(!outcome.output.contains("node_modules"));
    }

    #[tokio::test]
    async fn depth_bounds_recursion() {
        let (dir, ctx) = tool_context();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/b/c/deep.txt"), "").unwrap();

        let shallow = ListFilesTool::new()
            .run(json!({"depth": 1}), &ctx)
            .await
            .unwrap();
        assert!(shallow.output.contains("a/"));
        assert!(!shallow.output.contains("deep.txt"));

        let deep = ListFilesTool::new()
            .run(json!({"depth": 4}), &ctx)
            .await
            .unwrap();
        assert!(deep.output.contains("deep.txt"));
    }

    #[tokio::test]
    async fn ignore_globs_filter_entries() {
        let (dir, ctx) = tool_context();
        let root = dir.path().join("project");
        std::fs::write(root.join("keep.txt"), "").unwrap();
        std::fs::write(root.join("skip.log"), "").unwrap();

        let outcome = ListFilesTool::new()
            .run(json!({"ignore": ["*.log"]}), &ctx)
            .await
            .unwrap();
        assert!(outcome.output.contains("keep.txt"));
        assert!(!outcome.output.contains("skip.log"));

        let bad = ListFilesTool::new()
            .run(json!({"ignore": ["[unclosed"]}), &ctx)
            .await
            .unwrap();
        assert!(!bad.ok);
        assert!(bad.output.contains("Invalid ignore pattern"));
    }

    #[tokio::test]
    async fn explicit_path_must_be_inside_root() {
        let (dir, ctx) = tool_context();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();

        let outcome = ListFilesTool::new()
            .run(json!({"path": outside.to_str().unwrap()}), &ctx)
            .await
            .unwrap();
        assert!(!outcome.ok);
    }
}
