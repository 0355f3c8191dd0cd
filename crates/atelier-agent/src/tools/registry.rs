//! Name→tool lookup for builtins and MCP bridge tools.

use std::collections::HashMap;
use std::sync::Arc;

use crate::tools::context::Tool;

pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// Registry for the tools available to the agent. Builtins are registered
/// once at startup; MCP tools are swapped wholesale after each discovery
/// refresh without disturbing the builtins.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-facing definitions, sorted by name for stable prompts.
    pub fn definitions(&self) -> Vec<atelier::chat::Tool> {
        let mut tools: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools.iter().map(|t| t.definition()).collect()
    }

    /// Definitions excluding the named tools (sub-agents run with a
    /// filtered set).
    pub fn definitions_excluding(&self, excluded: &[&str]) -> Vec<atelier::chat::Tool> {
        self.definitions()
            .into_iter()
            .filter(|t| !excluded.contains(&t.function.name.as_str()))
            .collect()
    }

    /// Remove all MCP bridge tools (names start with `mcp__`).
    pub fn unregister_mcp_tools(&mut self) {
        self.tools.retain(|name, _| !name.starts_with(MCP_TOOL_PREFIX));
    }

    /// Replace the MCP tool set after a discovery refresh.
    pub fn register_mcp_tools(&mut self, tools: Vec<Arc<dyn Tool>>) {
        self.unregister_mcp_tools();
        for tool in tools {
            if tool.name().starts_with(MCP_TOOL_PREFIX) {
                self.add(tool);
            } else {
                log::warn!("skipping MCP tool without prefix: {}", tool.name());
            }
        }
    }
}
