//! Regex content search with grouped output.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use grep_regex::RegexMatcherBuilder;
use grep_searcher::Searcher;
use grep_searcher::sinks::Lossy;
use ignore::WalkBuilder;
use serde_json::{Value, json};

use crate::paths::is_ignored_dir;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

const MAX_MATCHES: usize = 200;

struct GrepHit {
    line: u64,
    text: String,
}

fn search(
    base: &Path,
    pattern: &str,
    case_insensitive: bool,
    extension: Option<&str>,
    files_only: bool,
) -> Result<String, String> {
    let matcher = RegexMatcherBuilder::new()
        .case_insensitive(case_insensitive)
        .build(pattern)
        .map_err(|e| format!("invalid pattern: {}", e))?;

    let mut grouped: BTreeMap<String, Vec<GrepHit>> = BTreeMap::new();
    let mut total = 0usize;

    let walker = if base.is_file() {
        WalkBuilder::new(base).max_depth(Some(0)).build()
    } else {
        WalkBuilder::new(base)
            .hidden(true)
            .git_ignore(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !is_ignored_dir(&name)
            })
            .build()
    };

    for result in walker {
        if total >= MAX_MATCHES {
            break;
        }
        let Ok(entry) = result else { continue };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if let Some(ext) = extension {
            let matches_ext = path
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                .unwrap_or(false);
            if !matches_ext {
                continue;
            }
        }
        let display = path.display().to_string();
        let hits = grouped.entry(display).or_default();
        let search_result = Searcher::new().search_path(
            &matcher,
            path,
            Lossy(|line_number, line| {
                if total >= MAX_MATCHES {
                    return Ok(false);
                }
                total += 1;
                hits.push(GrepHit {
                    line: line_number,
                    text: line.trim_end().to_string(),
                });
                Ok(true)
            }),
        );
        if search_result.is_err() {
            hits.clear();
        }
    }
    grouped.retain(|_, hits| !hits.is_empty());

    if grouped.is_empty() {
        return Ok("No matches found".to_string());
    }

    if files_only {
        return Ok(grouped.keys().cloned().collect::<Vec<_>>().join("\n"));
    }

    let mut parts = Vec::new();
    for (path, hits) in &grouped {
        parts.push(format!("{}:", path));
        for hit in hits {
            parts.push(format!("  {}: {}", hit.line, hit.text.trim()));
        }
        parts.push(String::new());
    }
    if total >= MAX_MATCHES {
        parts.push(format!("... [stopped at {} matches]", MAX_MATCHES));
    }
    Ok(parts.join("\n").trim_end().to_string())
}

pub struct GrepTool;

impl GrepTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GrepTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in files. path must be absolute when provided (file or \
         directory); omit it to search the project root. Auto-ignores .venv, node_modules, \
         __pycache__, .git, cache, dist, build, target and similar dirs. Output is grouped \
         by file:\n  path/to/file.rs:\n    42: line content here\n    99: another match"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {"type": "string", "description": "Search pattern (regex)"},
                "path": {"type": "string", "description": "File or directory to search in"},
                "case_insensitive": {"type": "boolean", "default": false},
                "type": {"type": "string", "description": "File extension filter (e.g. rs, py, ts)"},
                "files_only": {
                    "type": "boolean",
                    "description": "Only return matching file paths",
                    "default": false
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if pattern.is_empty() {
            return Ok(ToolOutcome::failure("Missing pattern"));
        }

        let base = match args.get("path").and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() && raw.trim() != "." => {
                match ctx.resolve_path(raw) {
                    Ok(path) => path,
                    Err(err) => return Ok(ToolOutcome::failure(err.to_string())),
                }
            }
            _ => match ctx.project_root() {
                Some(root) => root.to_path_buf(),
                None => {
                    return Ok(ToolOutcome::failure(
                        "path is required when no project is selected; use an absolute path.",
                    ));
                }
            },
        };
        if !base.exists() {
            return Ok(ToolOutcome::failure(format!("Path not found: {}", base.display())));
        }

        let case_insensitive = args
            .get("case_insensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let extension = args
            .get("type")
            .and_then(Value::as_str)
            .map(|s| s.trim_start_matches('.').to_string());
        let files_only = args.get("files_only").and_then(Value::as_bool).unwrap_or(false);

        let result = tokio::task::spawn_blocking(move || {
            search(&base, &pattern, case_insensitive, extension.as_deref(), files_only)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("search task failed: {}", e)))?;

        match result {
            Ok(output) => Ok(ToolOutcome::success(output)),
            Err(message) => Ok(ToolOutcome::failure(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tool_context;

    fn seed(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules")).unwrap();
        std::fs::write(root.join("src/a.rs"), "fn alpha() {}\nlet needle = 1;\n").unwrap();
        std::fs::write(root.join("src/b.py"), "needle = 2\n").unwrap();
        std::fs::write(root.join("node_modules/c.js"), "needle everywhere\n").unwrap();
    }

    #[tokio::test]
    async fn output_is_grouped_by_file_with_line_numbers() {
        let (dir, ctx) = tool_context();
        seed(&dir.path().join("project"));

        let outcome = GrepTool::new()
            .run(json!({"pattern": "needle"}), &ctx)
            .await
            .unwrap();
        assert!(outcome.output.contains("a.rs:"));
        assert!(outcome.output.contains("2: let needle = 1;"));
        assert!(outcome.output.contains("b.py:"));
        assert!(!outcome.output.contains("node_modules"));
    }

    #[tokio::test]
    async fn type_filter_narrows_files() {
        let (dir, ctx) = tool_context();
        seed(&dir.path().join("project"));

        let outcome = GrepTool::new()
            .run(json!({"pattern": "needle", "type": "py"}), &ctx)
            .await
            .unwrap();
        assert!(outcome.output.contains("b.py"));
        assert!(!outcome.output.contains("a.rs"));
    }

    #[tokio::test]
    async fn files_only_lists_paths() {
        let (dir, ctx) = tool_context();
        seed(&dir.path().join("project"));

        let outcome = GrepTool::new()
            .run(json!({"pattern": "needle", "files_only": true}), &ctx)
            .await
            .unwrap();
        assert!(outcome.output.contains("a.rs"));
        assert!(!outcome.output.contains(": let"));
    }

    #[tokio::test]
    async fn no_matches_is_explicit() {
        let (dir, ctx) = tool_context();
        seed(&dir.path().join("project"));

        let outcome = GrepTool::new()
            .run(json!({"pattern": "zzz_absent"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output, "No matches found");
    }

    #[tokio::test]
    async fn bad_regex_fails_cleanly() {
        let (dir, ctx) = tool_context();
        seed(&dir.path().join("project"));

        let outcome = GrepTool::new()
            .run(json!({"pattern": "[unclosed"}), &ctx)
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.output.contains("invalid pattern"));
    }
}
