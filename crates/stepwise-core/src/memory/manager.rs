//! Memory manager: records run activity into the store and turns a step's
//! declared needs into `memory.*` scope bindings.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use stepwise_types::error::StoreError;
use stepwise_types::memory::{
    Classification, INITIAL_PROMPT_STEP, MemoryNeed, MemorySlice, NewSlice, RUN_START_STEP,
    SliceQuery,
};
use stepwise_types::run::{RunId, StepResult, StepStatus};

use super::store::MemoryStore;
use crate::template::value_to_string;

/// Parameter whose value is also stored as the run's initial user prompt.
pub const USER_PROMPT_PARAM: &str = "user_prompt";

/// Per-run overview derived from a run's slices.
#[derive(Debug, Clone, Serialize)]
pub struct RunMemorySummary {
    pub run_id: RunId,
    pub total_slices: usize,
    pub by_classification: BTreeMap<String, usize>,
    pub steps_recorded: Vec<String>,
}

pub struct MemoryManager<S> {
    store: Arc<S>,
    tolerate_read_errors: bool,
}

impl<S: MemoryStore> MemoryManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            tolerate_read_errors: false,
        }
    }

    /// Degrade failed context reads to "no binding" instead of failing the step.
    pub fn tolerate_read_errors(mut self, tolerate: bool) -> Self {
        self.tolerate_read_errors = tolerate;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record the run's parameters (and its user prompt, when one is given).
    pub async fn start_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
        params: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut meta = Map::new();
        meta.insert("workflow".into(), json!(workflow_name));

        if let Some(prompt) = params.get(USER_PROMPT_PARAM) {
            let slice = NewSlice::new(
                run_id,
                INITIAL_PROMPT_STEP,
                Classification::UserPrompt,
                value_to_string(prompt),
            )
            .with_metadata(meta.clone());
            self.append(slice).await?;
        }

        let content = serde_json::to_string(params)
            .map_err(|e| StoreError::Write(format!("encode parameters: {e}")))?;
        let slice = NewSlice::new(run_id, RUN_START_STEP, Classification::Parameters, content)
            .with_metadata(meta);
        self.append(slice).await
    }

    /// Record a finished (or skipped) step.
    ///
    /// The `step_result` slice holding the encoded result is written first
    /// and is the step's authoritative record; a failed write leaves nothing
    /// behind for the step. Success then adds an `output` slice and failure
    /// an `error` slice for memory needs to read.
    pub async fn record_step(&self, run_id: &RunId, result: &StepResult) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(result)
            .map_err(|e| StoreError::Write(format!("encode step result: {e}")))?;
        let mut meta = Map::new();
        meta.insert("status".into(), json!(result.status));
        let slice = NewSlice::new(
            run_id,
            &result.step_name,
            Classification::StepResult,
            encoded,
        )
        .with_metadata(meta);
        self.append(slice).await?;

        match result.status {
            StepStatus::Success => {
                if let Some(output) = &result.output {
                    let mut meta = output.metadata.clone();
                    if let Some(ms) = result.duration_ms() {
                        meta.insert("execution_time_ms".into(), json!(ms));
                    }
                    let slice = NewSlice::new(
                        run_id,
                        &result.step_name,
                        Classification::Output,
                        &output.output,
                    )
                    .with_metadata(meta);
                    self.append(slice).await?;
                }
            }
            StepStatus::Failed => {
                if let Some(error) = &result.error {
                    let mut meta = Map::new();
                    meta.insert("kind".into(), json!(error.kind));
                    let slice = NewSlice::new(
                        run_id,
                        &result.step_name,
                        Classification::Error,
                        &error.message,
                    )
                    .with_metadata(meta);
                    self.append(slice).await?;
                }
            }
            StepStatus::Skipped => {}
        }
        Ok(())
    }

    async fn append(&self, slice: NewSlice) -> Result<(), StoreError> {
        match self.store.append(slice).await {
            Ok(_) => Ok(()),
            Err(StoreError::Write(msg)) => Err(StoreError::Write(msg)),
            Err(other) => Err(StoreError::Write(other.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Materialize bindings for `needs`. Keys are relative to `memory.`.
    ///
    /// Anything not found in the store is simply absent from the result.
    pub async fn resolve(
        &self,
        run_id: &RunId,
        needs: &[MemoryNeed],
    ) -> Result<Map<String, Value>, StoreError> {
        let mut bindings = Map::new();
        for need in needs {
            match self.resolve_one(run_id, need, &mut bindings).await {
                Ok(()) => {}
                Err(err) if self.tolerate_read_errors => {
                    tracing::warn!(
                        run_id = %run_id,
                        need = %need,
                        error = %err,
                        "memory read failed, continuing without this context"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(bindings)
    }

    async fn resolve_one(
        &self,
        run_id: &RunId,
        need: &MemoryNeed,
        bindings: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        match need {
            MemoryNeed::UserPrompt => {
                let query = SliceQuery::run(run_id).classification(Classification::UserPrompt);
                if let Some(slice) = self.newest(query).await? {
                    bindings.insert("user_prompt".into(), Value::String(slice.content));
                }
            }
            MemoryNeed::Parameters => {
                let query = SliceQuery::run(run_id)
                    .step(RUN_START_STEP)
                    .classification(Classification::Parameters);
                if let Some(slice) = self.newest(query).await? {
                    let params: Map<String, Value> = serde_json::from_str(&slice.content)
                        .map_err(|e| StoreError::Read(format!("decode parameters: {e}")))?;
                    bindings.extend(params);
                }
            }
            MemoryNeed::ToolOutput(step) => {
                let query = SliceQuery::run(run_id)
                    .step(step)
                    .classification(Classification::Output);
                if let Some(slice) = self.newest(query).await? {
                    bindings.insert(format!("{step}_output"), Value::String(slice.content));
                }
            }
            MemoryNeed::Step(step) => {
                let query = SliceQuery::run(run_id)
                    .step(step)
                    .classification(Classification::StepResult);
                if let Some(slice) = self.newest(query).await? {
                    bindings.insert(step.clone(), step_binding(&slice)?);
                }
            }
            MemoryNeed::LastOutput => {
                let query = SliceQuery::run(run_id).classification(Classification::Output);
                if let Some(slice) = self.newest(query).await? {
                    bindings.insert("last_output".into(), Value::String(slice.content));
                }
            }
            MemoryNeed::Classification(tag) => {
                let query =
                    SliceQuery::run(run_id).classification(Classification::from(tag.as_str()));
                if let Some(slice) = self.newest(query).await? {
                    bindings.insert(tag.clone(), Value::String(slice.content));
                }
            }
        }
        Ok(())
    }

    async fn newest(&self, query: SliceQuery) -> Result<Option<MemorySlice>, StoreError> {
        match self.store.query(&query.limit(1)).await {
            Ok(mut slices) => Ok(slices.pop()),
            Err(StoreError::Read(msg)) => Err(StoreError::Read(msg)),
            Err(other) => Err(StoreError::Read(other.to_string())),
        }
    }

    /// Decoded step results of a run, in recording order.
    ///
    /// A later record for the same step replaces the earlier one in place.
    pub async fn step_results(&self, run_id: &RunId) -> Result<Vec<StepResult>, StoreError> {
        let history = self.store.history(run_id).await?;
        let mut results: Vec<StepResult> = Vec::new();
        for slice in history
            .iter()
            .filter(|s| s.classification == Classification::StepResult)
        {
            match serde_json::from_str::<StepResult>(&slice.content) {
                Ok(result) => match results.iter_mut().find(|r| r.step_name == result.step_name) {
                    Some(earlier) => *earlier = result,
                    None => results.push(result),
                },
                Err(e) => {
                    tracing::warn!(run_id = %run_id, slice_id = slice.id, "undecodable step result: {e}");
                }
            }
        }
        Ok(results)
    }

    pub async fn summary(&self, run_id: &RunId) -> Result<RunMemorySummary, StoreError> {
        let history = self.store.history(run_id).await?;
        let mut by_classification = BTreeMap::new();
        let mut steps_recorded = Vec::new();
        for slice in &history {
            *by_classification
                .entry(slice.classification.to_string())
                .or_insert(0) += 1;
            if slice.classification == Classification::StepResult
                && !steps_recorded.contains(&slice.step_name)
            {
                steps_recorded.push(slice.step_name.clone());
            }
        }
        Ok(RunMemorySummary {
            run_id: run_id.clone(),
            total_slices: history.len(),
            by_classification,
            steps_recorded,
        })
    }
}

/// `step(<s>)` binding: the full recorded result plus its timestamp.
fn step_binding(slice: &MemorySlice) -> Result<Value, StoreError> {
    let result: StepResult = serde_json::from_str(&slice.content)
        .map_err(|e| StoreError::Read(format!("decode step result: {e}")))?;
    let output = result.output.unwrap_or_default();
    Ok(json!({
        "status": result.status,
        "output": output.output,
        "outputs": output.outputs,
        "metadata": output.metadata,
        "error": result.error,
        "created_at": slice.created_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
