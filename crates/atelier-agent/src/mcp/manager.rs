//! Discovery and invocation of tools on external MCP servers.

use std::collections::HashMap;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::AgentError;
use crate::ids::utc_now_iso;
use crate::mcp::protocol::{McpToolDescriptor, parse_tool_call_result, parse_tools_list};
use crate::mcp::transport::{McpTransport, build_transport};
use crate::store::ChatStore;
use crate::store::domain::McpToolCacheRow;

pub struct McpClientManager {
    store: ChatStore,
    transports: Mutex<HashMap<String, Box<dyn McpTransport>>>,
    configs: parking_lot::Mutex<HashMap<String, (String, Value)>>,
}

impl McpClientManager {
    pub fn new(store: ChatStore) -> Self {
        Self {
            store,
            transports: Mutex::new(HashMap::new()),
            configs: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Connect to every enabled server, list its tools, and refresh the
    /// cache. A server that fails to connect contributes its cached tools
    /// instead, so a flaky server does not erase its tool set.
    pub async fn discover_and_cache_tools(&self) -> (Vec<McpToolDescriptor>, Vec<String>) {
        let mut discovered = Vec::new();
        let mut errors = Vec::new();

        let servers = match self.store.list_enabled_mcp_servers().await {
            Ok(servers) => servers,
            Err(err) => {
                errors.push(format!("server list: {}", err));
                return (discovered, errors);
            }
        };

        for server in servers {
            let config: Value = serde_json::from_str(&server.config_json).unwrap_or(json!({}));
            self.configs
                .lock()
                .insert(server.id.clone(), (server.transport.clone(), config.clone()));

            match self.refresh_server(&server.id, &server.transport, &config).await {
                Ok(tools) => discovered.extend(tools),
                Err(err) => {
                    errors.push(format!("{}: {}", server.id, err));
                    discovered.extend(self.cached_tools(&server.id).await);
                }
            }
        }
        (discovered, errors)
    }

    async fn refresh_server(
        &self,
        server_id: &str,
        transport_name: &str,
        config: &Value,
    ) -> Result<Vec<McpToolDescriptor>, AgentError> {
        let mut transport = build_transport(transport_name, config)?;
        transport.connect().await?;
        let result = transport.request("tools/list", json!({})).await?;
        self.transports
            .lock()
            .await
            .insert(server_id.to_string(), transport);

        let tools = parse_tools_list(&result, server_id);

        // Preserve per-tool enable flags across refreshes.
        let previous: HashMap<String, bool> = self
            .store
            .list_cached_tools_for_server(server_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|row| (row.tool_name, row.enabled))
            .collect();

        let now = utc_now_iso();
        let rows: Vec<McpToolCacheRow> = tools
            .iter()
            .map(|tool| McpToolCacheRow {
                id: format!("mcpt-{}-{}", server_id, tool.name),
                server_id: server_id.to_string(),
                tool_name: tool.name.clone(),
                description: tool.description.clone(),
                schema_json: tool.input_schema.to_string(),
                enabled: previous.get(&tool.name).copied().unwrap_or(true),
                discovered_at: now.clone(),
            })
            .collect();
        self.store.replace_server_tools(server_id, rows).await?;
        self.store.set_mcp_last_connected(server_id, &now).await?;

        let enabled: HashMap<String, bool> = self
            .store
            .list_cached_tools_for_server(server_id)
            .await?
            .into_iter()
            .map(|row| (row.tool_name, row.enabled))
            .collect();
        Ok(tools
            .into_iter()
            .filter(|tool| enabled.get(&tool.name).copied().unwrap_or(true))
            .collect())
    }

    async fn cached_tools(&self, server_id: &str) -> Vec<McpToolDescriptor> {
        self.store
            .list_cached_tools_for_server(server_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|row| row.enabled)
            .map(|row| McpToolDescriptor {
                server_id: row.server_id,
                name: row.tool_name,
                description: row.description,
                input_schema: serde_json::from_str(&row.schema_json)
                    .unwrap_or(json!({"type": "object"})),
            })
            .collect()
    }

    /// Forward a call to `tools/call` on the owning server, lazily
    /// reconnecting when the transport is gone.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        payload: Value,
    ) -> Result<String, AgentError> {
        let mut transports = self.transports.lock().await;
        if !transports.contains_key(server_id) {
            let (transport_name, config) = self
                .configs
                .lock()
                .get(server_id)
                .cloned()
                .ok_or_else(|| AgentError::Validation(format!("MCP server not available: {}", server_id)))?;
            let mut transport = build_transport(&transport_name, &config)?;
            transport.connect().await?;
            transports.insert(server_id.to_string(), transport);
        }

        let transport = transports.get_mut(server_id).expect("transport just inserted");
        let result = transport
            .request("tools/call", json!({"name": tool_name, "arguments": payload}))
            .await;
        match result {
            Ok(result) => Ok(parse_tool_call_result(&result)),
            Err(err) => {
                // Drop the broken transport; the next call reconnects.
                if let Some(mut dead) = transports.remove(server_id) {
                    dead.close().await;
                }
                Err(err)
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut transports = self.transports.lock().await;
        for (_, transport) in transports.iter_mut() {
            transport.close().await;
        }
        transports.clear();
    }
}
