//! Standalone structure tool for when the agent only wants the outline.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::builtins::file_structure::get_file_structure;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

pub struct GetFileStructureTool;

impl GetFileStructureTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GetFileStructureTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GetFileStructureTool {
    fn name(&self) -> &str {
        "get_file_structure"
    }

    fn description(&self) -> &str {
        "Return the structure of a source file: top-level declarations with 1-based line \
         ranges. path must be absolute. Use read_file with start/end to read the spans you need."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {"type": "string"}
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tool_context;

    #[tokio::test]
    async fn returns_structure_for_rust_file() {
        let (dir, ctx) = tool_context();
        let path = dir.path().join("project/lib.rs");
        let body = format!("struct Thing;\nfn build() {{}}\n{}", "// filler\n".repeat(100));
        std::fs::write(&path, body).unwrap();

        let args = json!({"path": path.to_str().unwrap()});
        let outcome = GetFileStructureTool::new().run(args, &ctx).await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.output.contains("struct_item Thing"));
        assert!(outcome.output.contains("function_item build"));
    }
}
