//! Application state wiring the infra implementations into the core engine.
//!
//! Workflow files are loaded lazily by [`AppState::engine`] so memory and
//! secret commands keep working while a workflow file is broken.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use stepwise_core::engine::WorkflowEngine;
use stepwise_core::secret::SecretService;
use stepwise_core::tool::{EchoTool, FanOutTool, ModelCallTool, ToolRegistry};
use stepwise_infra::config::load_engine_config;
use stepwise_infra::filesystem::{load_workflows, resolve_data_dir};
use stepwise_infra::llm::HttpProviderFactory;
use stepwise_infra::secret::{FileVaultProvider, build_secret_chain};
use stepwise_infra::sqlite::memory::SqliteMemoryStore;
use stepwise_infra::sqlite::pool::{DatabasePool, database_url};
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::WorkflowDefinition;

/// The engine pinned to the SQLite memory store.
pub type Engine = WorkflowEngine<SqliteMemoryStore>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub secret_service: Arc<SecretService>,
    workflow_file: Option<PathBuf>,
    registry: Arc<ToolRegistry>,
    store: Arc<SqliteMemoryStore>,
}

impl AppState {
    /// Resolve the data directory, load config, open the database and the
    /// vault, and register the built-in tools.
    pub async fn init(workflow_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("failed to open the memory database")?;
        let store = Arc::new(SqliteMemoryStore::new(pool));

        let vault = match FileVaultProvider::open(&data_dir) {
            Ok(vault) => Some(vault),
            Err(e) => {
                tracing::warn!("secret vault unavailable, using environment only: {e}");
                None
            }
        };
        let secret_service = Arc::new(SecretService::new(build_secret_chain(vault, true)));

        let registry = Arc::new(build_registry(&config, Arc::clone(&secret_service)));

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            data_dir,
            config,
            secret_service,
            workflow_file,
            registry,
            store,
        })
    }

    /// Load and validate every visible workflow and build the engine.
    pub fn engine(&self) -> anyhow::Result<Engine> {
        let workflows = load_workflows(self.workflow_file.as_deref(), &self.data_dir)
            .context("failed to load workflows")?;
        self.engine_with(workflows)
    }

    /// An engine without workflows, for memory housekeeping.
    pub fn memory_engine(&self) -> anyhow::Result<Engine> {
        self.engine_with(Vec::new())
    }

    fn engine_with(&self, workflows: Vec<WorkflowDefinition>) -> anyhow::Result<Engine> {
        Ok(WorkflowEngine::new(
            workflows,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            &self.config,
        )?)
    }

    pub fn workflow_file(&self) -> Option<&Path> {
        self.workflow_file.as_deref()
    }
}

/// Built-in tools: `echo`, `parallel_query` and `model_call`.
pub fn build_registry(config: &EngineConfig, secrets: Arc<SecretService>) -> ToolRegistry {
    let mut registry = ToolRegistry::from_config(config);
    registry.register(EchoTool);
    registry.register(FanOutTool);
    registry.register(ModelCallTool::new(secrets, Arc::new(HttpProviderFactory::new())));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_builtin_tools() {
        let registry = build_registry(&EngineConfig::default(), Arc::new(SecretService::empty()));
        assert_eq!(registry.names(), vec!["echo", "model_call", "parallel_query"]);
    }
}
