pub mod bridge;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use bridge::{McpBridgeTool, build_mcp_tool_name};
pub use manager::McpClientManager;
pub use protocol::McpToolDescriptor;
