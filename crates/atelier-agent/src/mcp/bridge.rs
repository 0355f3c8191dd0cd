//! Bridge tools: MCP tools exposed through the local tool registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp::manager::McpClientManager;
use crate::mcp::protocol::McpToolDescriptor;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

pub fn build_mcp_tool_name(server_id: &str, tool_name: &str) -> String {
    format!("mcp__{}__{}", server_id, tool_name)
}

pub struct McpBridgeTool {
    manager: Arc<McpClientManager>,
    server_id: String,
    tool_name: String,
    name: String,
    description: String,
    input_schema: Value,
}

impl McpBridgeTool {
    pub fn new(manager: Arc<McpClientManager>, descriptor: McpToolDescriptor) -> Self {
        let name = build_mcp_tool_name(&descriptor.server_id, &descriptor.name);
        let description = descriptor
            .description
            .unwrap_or_else(|| format!("MCP tool proxy for {}", descriptor.name));
        Self {
            manager,
            server_id: descriptor.server_id,
            tool_name: descriptor.name,
            name,
            description,
            input_schema: descriptor.input_schema,
        }
    }

    /// Build bridge tools for a batch of discovered descriptors.
    pub fn bridge_all(
        manager: &Arc<McpClientManager>,
        descriptors: Vec<McpToolDescriptor>,
    ) -> Vec<Arc<dyn Tool>> {
        descriptors
            .into_iter()
            .filter(|d| !d.server_id.is_empty() && !d.name.is_empty())
            .map(|d| Arc::new(McpBridgeTool::new(manager.clone(), d)) as Arc<dyn Tool>)
            .collect()
    }
}

#[async_trait]
impl Tool for McpBridgeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn run(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        match self.manager.call_tool(&self.server_id, &self.tool_name, args).await {
            Ok(output) => Ok(ToolOutcome::success(output)),
            Err(err) => Ok(ToolOutcome::failure(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_names_are_prefixed() {
        assert_eq!(build_mcp_tool_name("github", "search_issues"), "mcp__github__search_issues");
    }
}
