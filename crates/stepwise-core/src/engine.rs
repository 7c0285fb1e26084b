//! Workflow engine facade.
//!
//! Owns the validated definitions, the tool registry and the memory manager,
//! and exposes list / run / inspect / cancel to the CLI. Definitions are
//! validated once in [`WorkflowEngine::new`]; the executor only ever sees
//! definitions that passed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::{Map, Value};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::StoreError;
use stepwise_types::memory::{MemorySlice, MemoryStats, RunSummary};
use stepwise_types::run::{RunId, StepResult, WorkflowRun};
use stepwise_types::workflow::{WorkflowDefinition, WorkflowSummary};
use tokio_util::sync::CancellationToken;

use crate::memory::{MemoryManager, MemoryStore};
use crate::tool::ToolRegistry;
use crate::workflow::definition::{validate_definition, validate_params, validate_tools};
use crate::workflow::{Approver, WorkflowError, WorkflowExecutor};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("no recorded memory for run '{0}'")]
    UnknownRun(RunId),

    #[error("run '{0}' is already active")]
    RunActive(RunId),

    #[error(transparent)]
    Validation(#[from] WorkflowError),

    #[error("memory store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything recorded for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInspection {
    pub run_id: RunId,
    pub steps: Vec<StepResult>,
    /// Oldest first.
    pub slices: Vec<MemorySlice>,
}

pub struct WorkflowEngine<S> {
    workflows: Vec<WorkflowDefinition>,
    memory: Arc<MemoryManager<S>>,
    executor: WorkflowExecutor<S>,
    /// Cancellation tokens of in-flight runs.
    active: DashMap<RunId, CancellationToken>,
}

/// Deregisters a run when dropped, including when the run future is
/// dropped before it finishes.
struct ActiveRun<'a> {
    active: &'a DashMap<RunId, CancellationToken>,
    run_id: RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl<S: MemoryStore> WorkflowEngine<S> {
    /// Validate every definition against the registry and build the engine.
    pub fn new(
        workflows: Vec<WorkflowDefinition>,
        registry: Arc<ToolRegistry>,
        store: Arc<S>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut names = HashSet::new();
        for def in &workflows {
            validate_definition(def)?;
            validate_tools(def, &registry)?;
            if !names.insert(def.name.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "workflow '{}' is defined more than once",
                    def.name
                ))
                .into());
            }
        }

        let memory = Arc::new(
            MemoryManager::new(store).tolerate_read_errors(config.tolerate_store_read_errors),
        );
        let executor = WorkflowExecutor::new(registry, Arc::clone(&memory), config);

        tracing::debug!(workflows = workflows.len(), "workflow engine ready");
        Ok(Self {
            workflows,
            memory,
            executor,
            active: DashMap::new(),
        })
    }

    pub fn list(&self) -> Vec<WorkflowSummary> {
        self.workflows.iter().map(WorkflowSummary::from).collect()
    }

    pub fn definition(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Run a workflow under a freshly generated run id.
    pub async fn run<A: Approver>(
        &self,
        name: &str,
        params: Map<String, Value>,
        approver: &A,
    ) -> Result<WorkflowRun, EngineError> {
        self.run_with_id(name, RunId::generate(name), params, approver)
            .await
    }

    /// Run a workflow under a caller-chosen id, so the caller can
    /// [`cancel`](Self::cancel) it from another task.
    pub async fn run_with_id<A: Approver>(
        &self,
        name: &str,
        run_id: RunId,
        params: Map<String, Value>,
        approver: &A,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self
            .definition(name)
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))?;
        let params = validate_params(definition, params)?;

        let cancel = CancellationToken::new();
        match self.active.entry(run_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::RunActive(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        let _active = ActiveRun {
            active: &self.active,
            run_id: run_id.clone(),
        };

        let run = self
            .executor
            .execute(definition, run_id, params, approver, &cancel)
            .await;
        Ok(run)
    }

    /// Request cooperative cancellation. Returns false if the run is not active.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling workflow run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Recorded step results and memory slices of a run.
    pub async fn inspect(&self, run_id: &RunId) -> Result<RunInspection, EngineError> {
        let slices = self.memory.store().history(run_id).await?;
        if slices.is_empty() {
            return Err(EngineError::UnknownRun(run_id.clone()));
        }
        let steps = self.memory.step_results(run_id).await?;
        Ok(RunInspection {
            run_id: run_id.clone(),
            steps,
            slices,
        })
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, EngineError> {
        Ok(self.memory.store().runs(limit).await?)
    }

    /// Housekeeping; never called while a run is in flight.
    pub async fn purge_memory(&self, older_than: Duration) -> Result<u64, EngineError> {
        let removed = self.memory.store().purge(older_than).await?;
        tracing::info!(removed, "purged memory slices");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<MemoryStats, EngineError> {
        Ok(self.memory.store().stats().await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
