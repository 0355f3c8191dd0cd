//! Process-scoped application container.
//!
//! Holds the singletons: event bus, approval waiter, tool registry, MCP
//! manager, agent task manager, memory runner, artifact store, and the
//! provider client. Built once at startup and threaded through
//! constructors — never reached from pure functions.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use atelier::chat::ChatProvider;
use atelier::providers::OpenAiCompatProvider;

use crate::agent_loop::AgentLoop;
use crate::approval::{ApprovalService, ApprovalWaiter};
use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::context_budget::ContextBudgetManager;
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::executor::ToolExecutor;
use crate::mcp::bridge::McpBridgeTool;
use crate::mcp::manager::McpClientManager;
use crate::memory::MemoryRunner;
use crate::paths::PathResolver;
use crate::plans::{PlanFileStore, PlanService};
use crate::runtime::AgentTaskManager;
use crate::store::ChatStore;
use crate::streamer::LlmStreamer;
use crate::tools::{ToolRegistry, ToolServices};

pub struct AppContainer {
    pub settings: ArcSwap<Settings>,
    pub store: ChatStore,
    pub event_bus: Arc<EventBus>,
    pub waiter: Arc<ApprovalWaiter>,
    pub registry: Arc<parking_lot::RwLock<ToolRegistry>>,
    pub mcp: Arc<McpClientManager>,
    pub tasks: Arc<AgentTaskManager>,
    pub memory_runner: Arc<MemoryRunner>,
    pub artifacts: ArtifactStore,
    pub resolver: PathResolver,
    provider: ArcSwap<Arc<dyn ChatProvider>>,
}

impl AppContainer {
    /// Build everything from settings: open the database, register builtin
    /// tools, discover MCP tools, and wire the background runners.
    pub async fn initialize(settings: Settings) -> Result<Arc<Self>, AgentError> {
        let store = ChatStore::connect(settings.database_path()).await?;
        Self::initialize_with_store(settings, store).await
    }

    /// Initialization against an existing store (in-memory for tests).
    pub async fn initialize_with_store(
        settings: Settings,
        store: ChatStore,
    ) -> Result<Arc<Self>, AgentError> {
        let event_bus = Arc::new(EventBus::new());
        let waiter = Arc::new(ApprovalWaiter::new());
        let resolver = PathResolver::new(settings.tool_outputs_root());
        let artifacts = ArtifactStore::new(
            settings.tool_outputs_root(),
            settings.tool_output_token_threshold,
            settings.preview_tokens,
        );
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiCompatProvider::new(
            settings.provider_base_url.clone(),
            settings.provider_api_key.clone(),
        ));

        let registry = Arc::new(parking_lot::RwLock::new(ToolRegistry::new()));
        for tool in crate::tools::builtins::all_builtin_tools() {
            registry.write().add(tool);
        }
        // Plugins are discovered once at startup.
        let plugins_dir = settings.data_dir().join("plugins");
        for tool in crate::tools::plugins::load_plugin_tools(&plugins_dir) {
            registry.write().add(tool);
        }

        let mcp = Arc::new(McpClientManager::new(store.clone()));
        let memory_runner = Arc::new(MemoryRunner::new(
            store.clone(),
            event_bus.clone(),
            provider.clone(),
        ));

        let container = Arc::new(Self {
            settings: ArcSwap::from_pointee(settings),
            store,
            event_bus,
            waiter,
            registry,
            mcp,
            tasks: Arc::new(AgentTaskManager::new()),
            memory_runner,
            artifacts,
            resolver,
            provider: ArcSwap::from_pointee(provider),
        });
        container.refresh_mcp_tools().await;
        Ok(container)
    }

    pub fn settings_snapshot(&self) -> Settings {
        self.settings.load().as_ref().clone()
    }

    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        self.provider.load().as_ref().clone()
    }

    /// Swap settings and rebuild the derived provider client.
    pub fn update_settings(&self, settings: Settings) {
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiCompatProvider::new(
            settings.provider_base_url.clone(),
            settings.provider_api_key.clone(),
        ));
        self.provider.store(Arc::new(provider));
        self.settings.store(Arc::new(settings));
    }

    /// Re-discover MCP tools and swap the bridge set in the registry.
    pub async fn refresh_mcp_tools(&self) {
        let (descriptors, errors) = self.mcp.discover_and_cache_tools().await;
        for error in &errors {
            log::warn!("MCP discovery: {}", error);
        }
        let bridges = McpBridgeTool::bridge_all(&self.mcp, descriptors);
        self.registry.write().register_mcp_tools(bridges);
    }

    pub fn tool_services(&self) -> Arc<ToolServices> {
        Arc::new(ToolServices {
            event_bus: self.event_bus.clone(),
            provider: self.provider(),
            settings: self.settings_snapshot(),
            registry: self.registry.clone(),
        })
    }

    pub fn approval_service(&self) -> Arc<ApprovalService> {
        Arc::new(ApprovalService::new(
            self.store.clone(),
            self.event_bus.clone(),
            self.registry.clone(),
            self.resolver.clone(),
            self.artifacts.clone(),
            self.tool_services(),
        ))
    }

    pub fn plan_service(&self) -> PlanService {
        let settings = self.settings_snapshot();
        PlanService::new(
            self.store.clone(),
            PlanFileStore::new(settings.plans_root()),
            self.event_bus.clone(),
        )
    }

    /// Build a fresh agent loop for one turn with the current settings.
    pub fn agent_loop(&self) -> AgentLoop {
        let settings = self.settings_snapshot();
        let executor = Arc::new(ToolExecutor::new(
            self.store.clone(),
            self.approval_service(),
            self.waiter.clone(),
            self.event_bus.clone(),
            settings.tool_parallelism,
            Duration::from_secs(settings.approval_timeout_secs),
        ));
        AgentLoop::new(
            self.store.clone(),
            self.event_bus.clone(),
            self.provider(),
            ContextBudgetManager::new(self.store.clone(), self.artifacts.clone()),
            LlmStreamer::new(self.store.clone(), self.event_bus.clone()),
            executor,
            self.memory_runner.clone(),
            self.registry.clone(),
            settings,
        )
    }

    pub async fn shutdown(&self) {
        self.tasks.cancel_all();
        self.mcp.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_registers_builtin_tools() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let container = AppContainer::initialize_with_store(Settings::default(), store)
            .await
            .unwrap();
        let names = container.registry.read().names();
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"execute_command".to_string()));
        container.shutdown().await;
    }

    #[tokio::test]
    async fn update_settings_swaps_snapshot() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let container = AppContainer::initialize_with_store(Settings::default(), store)
            .await
            .unwrap();
        let mut settings = container.settings_snapshot();
        settings.model = "other/model".to_string();
        container.update_settings(settings);
        assert_eq!(container.settings_snapshot().model, "other/model");
    }
}
