//! Read files by structure or line span.

use std::io::BufRead;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::builtins::file_structure::get_file_structure;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

/// Stream lines and collect only the requested span; stops reading after
/// `end` to save I/O on large files.
fn read_span_streaming(path: &Path, start: usize, end: usize) -> Result<String, std::io::Error> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut span_lines: Vec<String> = Vec::new();
    let mut total = 0usize;
    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        total = line_num;
        if line_num > end {
            break;
        }
        if line_num >= start {
            span_lines.push(line?);
        }
    }
    let total_str = if total > end {
        format!("lines {}-{}", start, end)
    } else {
        format!("{} lines", total)
    };
    Ok(format!("File: {} ({})\n\n{}", path.display(), total_str, span_lines.join("\n")))
}

pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file. path must be absolute. Can read project files, tool output files \
         (spilled outputs under tool_outputs/), and other external paths. \
         Without start/end: returns file structure (declarations with line ranges) and total \
         line count; use that to decide which spans to read. With start and end (1-based): \
         returns that line span. For files without structure support, use start/end to read \
         sections. Always prefer targeted spans over reading entire large files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {"type": "string"},
                "start": {
                    "type": "integer",
                    "description": "Start line (1-based). Omit with end to get structure."
                },
                "end": {
                    "type": "integer",
                    "description": "End line (1-based). Omit with start to get structure."
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let raw_path = args.get("path").and_then(Value::as_str).unwrap_or_default();
        let path = match ctx.resolve_path_external(raw_path) {
            Ok(path) => path,
            Err(err) => return Ok(ToolOutcome::failure(err.to_string())),
        };
        if !path.is_file() {
            return Ok(ToolOutcome::failure(format!("File not found: {}", path.display())));
        }

        let start = args.get("start").and_then(Value::as_i64);
        let end = args.get("end").and_then(Value::as_i64);

        if let (Some(start), Some(end)) = (start, end) {
            if start < 1 || end < 1 {
                return Ok(ToolOutcome::failure(
                    "start and end must be >= 1 (1-based line numbers).",
                ));
            }
            let (start, end) = if start > end {
                (end as usize, start as usize)
            } else {
                (start as usize, end as usize)
            };
            let path_clone = path.clone();
            let output = tokio::task::spawn_blocking(move || read_span_streaming(&path_clone, start, end))
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("read task failed: {}", e)))?
                .map_err(|e| ToolError::ExecutionFailed(format!("read failed: {}", e)))?;
            return Ok(ToolOutcome::success(output));
        }

        let path_str = path.display().to_string();
        let output = tokio::task::spawn_blocking(move || {
            let content = std::fs::read_to_string(&path)?;
            Ok::<_, std::io::Error>(get_file_structure(&content, &path_str))
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("read task failed: {}", e)))?
        .map_err(|e| ToolError::ExecutionFailed(format!("read failed: {}", e)))?;
        Ok(ToolOutcome::success(output))
    }
}
