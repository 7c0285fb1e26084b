//! Workflow executor: strictly sequential step scheduling.
//!
//! Each step moves through
//! `pending -> resolving -> (gate_wait) -> dispatched -> success|failed -> recorded`.
//! A step does not start resolving until its predecessor is recorded in the
//! memory store. Concurrency only exists inside a fan-out tool.
//!
//! # Abort handling
//!
//! - `abort_chain` failure, gate denial/expiry and cancellation skip every
//!   remaining step and record it as `skipped`.
//! - A failed store write aborts immediately; remaining steps are skipped in
//!   the returned run but not persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use stepwise_types::config::EngineConfig;
use stepwise_types::memory::RUN_START_STEP;
use stepwise_types::run::{
    AbortReason, FailureKind, RunId, RunStatus, StepFailure, StepResult, StepStatus, ToolOutput,
    WorkflowRun,
};
use stepwise_types::workflow::{FailurePolicy, StepDefinition, WorkflowDefinition};
use tokio_util::sync::CancellationToken;

use super::context::RunContext;
use super::gate::{Approver, GateOutcome, wait_for_gate};
use crate::memory::{MemoryManager, MemoryStore};
use crate::template::{Scope, TemplateResolver};
use crate::tool::ToolRegistry;

/// How a single step ended, before the run-level policy is applied.
enum StepOutcome {
    Done(StepResult),
    /// The step was never dispatched and the run must stop.
    Halted(StepResult, AbortReason),
}

/// Drives one workflow run to a terminal state.
pub struct WorkflowExecutor<S> {
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryManager<S>>,
    resolver: TemplateResolver,
    gate_timeout: Option<Duration>,
    max_output_bytes: usize,
}

impl<S: MemoryStore> WorkflowExecutor<S> {
    pub fn new(
        registry: Arc<ToolRegistry>,
        memory: Arc<MemoryManager<S>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            resolver: TemplateResolver::new(config.missing_path),
            gate_timeout: config.gate_timeout(),
            max_output_bytes: config.max_step_output_bytes,
        }
    }

    /// Run `definition` with already-validated `params`.
    ///
    /// Always returns a terminal run; failures are reported through
    /// [`WorkflowRun::status`] and [`WorkflowRun::abort`].
    pub async fn execute<A: Approver>(
        &self,
        definition: &WorkflowDefinition,
        run_id: RunId,
        params: Map<String, Value>,
        approver: &A,
        cancel: &CancellationToken,
    ) -> WorkflowRun {
        let mut run = WorkflowRun::new(run_id, &definition.name, params);
        tracing::info!(
            run_id = %run.id,
            workflow = %definition.name,
            steps = definition.steps.len(),
            "workflow run started"
        );

        if let Err(e) = self
            .memory
            .start_run(&run.id, &definition.name, &run.params)
            .await
        {
            let reason = AbortReason::StoreWrite {
                step: RUN_START_STEP.to_string(),
                message: e.to_string(),
            };
            run.steps = definition
                .steps
                .iter()
                .map(|s| StepResult::skipped(&s.name))
                .collect();
            return finish(run, Some(reason));
        }

        let mut ctx = RunContext::new(run.params.clone(), self.max_output_bytes);
        let mut abort: Option<AbortReason> = None;

        for step in &definition.steps {
            if abort.is_some() {
                break;
            }

            let result = if cancel.is_cancelled() {
                abort = Some(AbortReason::Cancelled { step: None });
                StepResult::skipped(&step.name)
            } else {
                match self.run_step(&run.id, step, &ctx, approver, cancel).await {
                    StepOutcome::Halted(result, reason) => {
                        abort = Some(reason);
                        result
                    }
                    StepOutcome::Done(result) => {
                        abort = failure_abort(step, &result);
                        result
                    }
                }
            };

            log_outcome(&run.id, &result);
            if let Err(e) = self.memory.record_step(&run.id, &result).await {
                tracing::error!(run_id = %run.id, step = %step.name, "failed to record step: {e}");
                let unrecorded = unrecorded(result, &e.to_string());
                if unrecorded.status == StepStatus::Failed {
                    self.record_best_effort(&run.id, &unrecorded).await;
                }
                run.steps.push(unrecorded);
                let reason = AbortReason::StoreWrite {
                    step: step.name.clone(),
                    message: e.to_string(),
                };
                self.skip_remaining(&mut run, definition).await;
                return finish(run, Some(reason));
            }
            tracing::debug!(run_id = %run.id, step = %step.name, "recorded");

            ctx.record(&result);
            run.steps.push(result);
        }

        // Persist every step the abort prevented from running.
        while let Some(step) = definition.steps.get(run.steps.len()) {
            let skipped = StepResult::skipped(&step.name);
            if let Err(e) = self.memory.record_step(&run.id, &skipped).await {
                tracing::error!(run_id = %run.id, step = %step.name, "failed to record skipped step: {e}");
                let reason = AbortReason::StoreWrite {
                    step: step.name.clone(),
                    message: e.to_string(),
                };
                run.steps.push(skipped);
                self.skip_remaining(&mut run, definition).await;
                return finish(run, Some(reason));
            }
            run.steps.push(skipped);
        }

        finish(run, abort)
    }

    async fn run_step<A: Approver>(
        &self,
        run_id: &RunId,
        step: &StepDefinition,
        ctx: &RunContext,
        approver: &A,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started_at = Utc::now();
        tracing::debug!(run_id = %run_id, step = %step.name, "resolving");

        let bindings = if step.memory.is_empty() {
            Map::new()
        } else {
            match self.memory.resolve(run_id, &step.memory.needs).await {
                Ok(bindings) => bindings,
                Err(e) => {
                    let failure = StepFailure::new(FailureKind::StoreRead, e.to_string());
                    return StepOutcome::Done(StepResult::failed(&step.name, failure, started_at));
                }
            }
        };
        let scope = ctx.scope(bindings);

        let inputs = match self.resolve_inputs(step, &scope) {
            Ok(inputs) => inputs,
            Err(failure) => {
                return StepOutcome::Done(StepResult::failed(&step.name, failure, started_at));
            }
        };

        let mut approved_prompt = None;
        if let Some(template) = step.gate_prompt() {
            let prompt = match self.resolver.render(&template, &scope) {
                Ok(prompt) => prompt,
                Err(e) => {
                    let failure = StepFailure::new(FailureKind::TemplateResolution, e.to_string());
                    return StepOutcome::Done(StepResult::failed(&step.name, failure, started_at));
                }
            };
            tracing::debug!(run_id = %run_id, step = %step.name, "gate_wait");
            let outcome =
                wait_for_gate(approver, &step.name, &prompt, self.gate_timeout, cancel).await;
            tracing::info!(run_id = %run_id, step = %step.name, ?outcome, "gate answered");

            let name = step.name.clone();
            match outcome {
                GateOutcome::Approved => approved_prompt = Some(prompt),
                GateOutcome::Denied => {
                    return StepOutcome::Halted(
                        StepResult::skipped(&step.name),
                        AbortReason::GateDenied { step: name },
                    );
                }
                GateOutcome::Expired => {
                    return StepOutcome::Halted(
                        StepResult::skipped(&step.name),
                        AbortReason::GateExpired { step: name },
                    );
                }
                GateOutcome::Cancelled => {
                    return StepOutcome::Halted(
                        StepResult::skipped(&step.name),
                        AbortReason::Cancelled { step: Some(name) },
                    );
                }
            }
        }

        let Some(tool) = step.tool.as_deref() else {
            // Pure checkpoint: the approved prompt is the step's output.
            let output = ToolOutput::text(approved_prompt.unwrap_or_default());
            return StepOutcome::Done(StepResult::success(&step.name, output, started_at));
        };

        tracing::debug!(run_id = %run_id, step = %step.name, tool = %tool, "dispatched");
        let timeout = step.timeout_secs.map(Duration::from_secs);
        let result = match self.registry.dispatch(tool, inputs, cancel, timeout).await {
            Ok(output) => StepResult::success(&step.name, output, started_at),
            Err(failure) => StepResult::failed(&step.name, failure, started_at),
        };
        StepOutcome::Done(result)
    }

    /// Mark every step not yet in `run` as skipped, persisting each one when
    /// the store still accepts writes.
    async fn skip_remaining(&self, run: &mut WorkflowRun, definition: &WorkflowDefinition) {
        while let Some(step) = definition.steps.get(run.steps.len()) {
            let skipped = StepResult::skipped(&step.name);
            self.record_best_effort(&run.id, &skipped).await;
            run.steps.push(skipped);
        }
    }

    async fn record_best_effort(&self, run_id: &RunId, result: &StepResult) {
        if let Err(e) = self.memory.record_step(run_id, result).await {
            tracing::warn!(run_id = %run_id, step = %result.step_name, "could not record after store failure: {e}");
        }
    }

    fn resolve_inputs(
        &self,
        step: &StepDefinition,
        scope: &Scope,
    ) -> Result<Map<String, Value>, StepFailure> {
        let mut inputs = Map::new();
        for (key, template) in &step.inputs {
            let value = self.resolver.resolve(template, scope).map_err(|e| {
                StepFailure::new(
                    FailureKind::TemplateResolution,
                    format!("input '{key}': {e}"),
                )
            })?;
            inputs.insert(key.clone(), value);
        }
        Ok(inputs)
    }
}

/// A step whose record could not be written. Success cannot be confirmed,
/// so it becomes a `store_write` failure; other outcomes keep their status.
fn unrecorded(result: StepResult, message: &str) -> StepResult {
    if result.status != StepStatus::Success {
        return result;
    }
    let failure = StepFailure::new(
        FailureKind::StoreWrite,
        format!("step result could not be recorded: {message}"),
    );
    StepResult::failed(
        &result.step_name,
        failure,
        result.started_at.unwrap_or_else(Utc::now),
    )
}

/// Run-level consequence of a finished step.
fn failure_abort(step: &StepDefinition, result: &StepResult) -> Option<AbortReason> {
    let failure = result.error.as_ref()?;
    if failure.kind == FailureKind::Cancelled {
        return Some(AbortReason::Cancelled {
            step: Some(step.name.clone()),
        });
    }
    match step.on_failure {
        FailurePolicy::Continue => None,
        FailurePolicy::AbortChain => Some(AbortReason::StepFailed {
            step: step.name.clone(),
            kind: failure.kind,
            message: failure.message.clone(),
        }),
    }
}

fn log_outcome(run_id: &RunId, result: &StepResult) {
    match &result.error {
        Some(failure) => tracing::warn!(
            run_id = %run_id,
            step = %result.step_name,
            kind = %failure.kind,
            "step failed: {}",
            failure.message
        ),
        None => tracing::info!(
            run_id = %run_id,
            step = %result.step_name,
            status = %result.status,
            duration_ms = result.duration_ms().unwrap_or_default(),
            "step finished"
        ),
    }
}

fn finish(mut run: WorkflowRun, abort: Option<AbortReason>) -> WorkflowRun {
    run.status = if abort.is_some() {
        RunStatus::Aborted
    } else {
        RunStatus::Completed
    };
    run.abort = abort;
    run.finished_at = Some(Utc::now());
    match &run.abort {
        Some(reason) => {
            tracing::warn!(run_id = %run.id, workflow = %run.workflow_name, "workflow run aborted: {reason}")
        }
        None => tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow_name,
            failed_steps = run.failed_steps().count(),
            "workflow run completed"
        ),
    }
    run
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VolatileMemoryStore;
    use crate::tool::EchoTool;
    use crate::tool::testing::ScriptedTool;
    use crate::workflow::gate::{ApproveWith, AutoApprove, AutoDeny};
    use serde_json::json;
    use std::sync::Mutex;
    use stepwise_types::error::StoreError;
    use stepwise_types::memory::{
        Classification, MemoryNeed, MemorySlice, MemoryStats, NewSlice, RunSummary, SliceQuery,
    };
    use stepwise_types::workflow::ParamSpec;

    struct Harness {
        executor: WorkflowExecutor<VolatileMemoryStore>,
        store: Arc<VolatileMemoryStore>,
        calls: Arc<Mutex<Vec<Map<String, Value>>>>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let scripted = ScriptedTool::new("scripted");
        let calls = Arc::clone(&scripted.calls);
        let mut registry = ToolRegistry::from_config(&config);
        registry.register(scripted);
        registry.register(EchoTool);
        let store = Arc::new(VolatileMemoryStore::new());
        let memory = Arc::new(MemoryManager::new(Arc::clone(&store)));
        Harness {
            executor: WorkflowExecutor::new(Arc::new(registry), memory, &config),
            store,
            calls,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            description: None,
            params: vec![ParamSpec::required("x")],
            steps,
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn statuses(run: &WorkflowRun) -> Vec<StepStatus> {
        run.steps.iter().map(|s| s.status).collect()
    }

    async fn run_with<A: Approver>(
        h: &Harness,
        def: &WorkflowDefinition,
        approver: &A,
    ) -> WorkflowRun {
        h.executor
            .execute(
                def,
                RunId::from("run-1"),
                params(json!({"x": "hello"})),
                approver,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn echo_receives_the_parameter() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![StepDefinition::new("s1", "echo").input("text", "{{params.x}}")]);
        let run = run_with(&h, &def, &AutoApprove).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("s1").and_then(|s| s.output_text()), Some("hello"));
    }

    #[tokio::test]
    async fn inputs_reach_the_tool_in_declaration_order() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("s1", "echo")
                .input("zeta", "last letter")
                .input("alpha", "first letter"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;

        assert_eq!(run.step("s1").and_then(|s| s.output_text()), Some("last letter"));
        let keys: Vec<&str> = run.steps[0]
            .output
            .as_ref()
            .map(|o| o.metadata.keys().map(String::as_str).collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn tool_output_need_feeds_the_next_step() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("s1", "echo").input("text", "hi"),
            StepDefinition::new("s2", "echo")
                .needs(MemoryNeed::ToolOutput("s1".into()))
                .input("text", "{{memory.s1_output}}!"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;
        assert_eq!(run.step("s2").and_then(|s| s.output_text()), Some("hi!"));
    }

    #[tokio::test]
    async fn denied_gate_aborts_before_later_steps() {
        let h = harness(EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let prompts = Arc::clone(&seen);
        let approver = ApproveWith(move |_: &str, prompt: &str| {
            prompts.lock().unwrap().push(prompt.to_string());
            false
        });
        let def = workflow(vec![
            StepDefinition::new("s1", "echo").input("text", "draft"),
            StepDefinition::checkpoint("review", "{{steps.s1.output}}?"),
            StepDefinition::new("s3", "scripted").input("text", "never"),
        ]);
        let run = run_with(&h, &def, &approver).await;

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(
            run.abort,
            Some(AbortReason::GateDenied {
                step: "review".into()
            })
        );
        assert_eq!(*seen.lock().unwrap(), vec!["draft?".to_string()]);
        assert!(h.calls.lock().unwrap().is_empty());
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Success, StepStatus::Skipped, StepStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn approved_checkpoint_outputs_its_prompt() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![StepDefinition::checkpoint("ok", "go with {{params.x}}?")]);
        let run = run_with(&h, &def, &AutoApprove).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps[0].output_text(), Some("go with hello?"));
    }

    #[tokio::test]
    async fn gate_on_a_tool_step_runs_the_tool_when_approved() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("s1", "echo")
                .input("text", "guarded")
                .gate("Run it?"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;
        assert_eq!(run.steps[0].output_text(), Some("guarded"));

        let run = run_with(&h, &def, &AutoDeny).await;
        assert_eq!(run.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn unanswered_gate_expires_when_configured() {
        struct Silent;
        impl Approver for Silent {
            async fn approve(&self, _step: &str, _prompt: &str) -> bool {
                std::future::pending().await
            }
        }

        let config = EngineConfig {
            gate_timeout_secs: Some(0),
            ..EngineConfig::default()
        };
        let h = harness(config);
        let def = workflow(vec![StepDefinition::checkpoint("wait", "anyone?")]);
        let run = run_with(&h, &def, &Silent).await;
        assert_eq!(
            run.abort,
            Some(AbortReason::GateExpired {
                step: "wait".into()
            })
        );
    }

    #[tokio::test]
    async fn abort_chain_skips_the_rest() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("a", "scripted").input("text", "1"),
            StepDefinition::new("b", "scripted").input("fail", json!(true)),
            StepDefinition::new("c", "scripted").input("text", "3"),
            StepDefinition::new("d", "scripted").input("text", "4"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;

        assert_eq!(run.status, RunStatus::Aborted);
        assert!(matches!(
            run.abort,
            Some(AbortReason::StepFailed { ref step, kind: FailureKind::ToolExecution, .. }) if step == "b"
        ));
        assert_eq!(
            statuses(&run),
            vec![
                StepStatus::Success,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Skipped
            ]
        );
        assert_eq!(h.calls.lock().unwrap().len(), 2);

        // Skipped steps are persisted too.
        let recorded = h
            .store
            .query(
                &SliceQuery::run(&run.id)
                    .step("d")
                    .classification(Classification::StepResult),
            )
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
    }

    #[tokio::test]
    async fn continue_policy_leaves_the_output_empty() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("s1", "scripted")
                .input("fail", json!(true))
                .on_failure(FailurePolicy::Continue),
            StepDefinition::new("s2", "echo")
                .needs(MemoryNeed::ToolOutput("s1".into()))
                .input("text", "[{{memory.s1_output}}][{{steps.s1.output}}]"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.is_partial_success());
        assert_eq!(run.step("s2").and_then(|s| s.output_text()), Some("[][]"));
    }

    #[tokio::test]
    async fn strict_missing_paths_fail_the_step() {
        let config = EngineConfig {
            missing_path: stepwise_types::config::MissingPathPolicy::Fail,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let def = workflow(vec![
            StepDefinition::new("s1", "echo").input("text", "{{memory.nothing}}"),
        ]);
        let run = run_with(&h, &def, &AutoApprove).await;
        assert!(matches!(
            run.abort,
            Some(AbortReason::StepFailed { kind: FailureKind::TemplateResolution, .. })
        ));
    }

    #[tokio::test]
    async fn steps_run_in_declaration_order() {
        let h = harness(EngineConfig::default());
        // Earlier steps sleep longer; order must still follow declaration.
        let steps = (0..5)
            .map(|i| {
                StepDefinition::new(format!("s{i}"), "scripted")
                    .input("text", format!("{i}"))
                    .input("delay_ms", json!(25 - i * 5))
            })
            .collect();
        let run = run_with(&h, &workflow(steps), &AutoApprove).await;

        let called: Vec<String> = h
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c["text"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(called, vec!["0", "1", "2", "3", "4"]);

        let history = h.store.history(&run.id).await.unwrap();
        let recorded: Vec<&str> = history
            .iter()
            .filter(|s| s.classification == Classification::StepResult)
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(recorded, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_running_step() {
        let h = harness(EngineConfig::default());
        let def = workflow(vec![
            StepDefinition::new("slow", "scripted").input("delay_ms", json!(10_000)),
            StepDefinition::new("after", "scripted").input("text", "x"),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let run = h
            .executor
            .execute(
                &def,
                RunId::from("run-c"),
                params(json!({"x": 1})),
                &AutoApprove,
                &cancel,
            )
            .await;

        assert_eq!(
            run.abort,
            Some(AbortReason::Cancelled {
                step: Some("slow".into())
            })
        );
        assert_eq!(statuses(&run), vec![StepStatus::Failed, StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn store_read_failure_fails_the_requesting_step() {
        let h = harness(EngineConfig::default());
        let broken = Arc::new(FailingStore::reads());
        let executor = WorkflowExecutor::new(
            Arc::clone(&h.executor.registry),
            Arc::new(MemoryManager::new(Arc::clone(&broken))),
            &EngineConfig::default(),
        );
        let def = workflow(vec![
            StepDefinition::new("s1", "echo")
                .needs(MemoryNeed::LastOutput)
                .input("text", "x"),
        ]);
        let run = executor
            .execute(&def, RunId::from("r"), params(json!({"x": 1})), &AutoApprove, &CancellationToken::new())
            .await;
        assert!(matches!(
            run.abort,
            Some(AbortReason::StepFailed { kind: FailureKind::StoreRead, .. })
        ));
    }

    fn failing_executor(h: &Harness, store: &Arc<FailingStore>) -> WorkflowExecutor<FailingStore> {
        WorkflowExecutor::new(
            Arc::clone(&h.executor.registry),
            Arc::new(MemoryManager::new(Arc::clone(store))),
            &EngineConfig::default(),
        )
    }

    fn three_steps() -> WorkflowDefinition {
        workflow(vec![
            StepDefinition::new("s1", "scripted").input("text", "a"),
            StepDefinition::new("s2", "scripted").input("text", "b"),
            StepDefinition::new("s3", "scripted").input("text", "c"),
        ])
    }

    #[tokio::test]
    async fn store_write_failure_is_fatal() {
        let h = harness(EngineConfig::default());
        let broken = Arc::new(FailingStore::writes_after(3));
        let run = failing_executor(&h, &broken)
            .execute(&three_steps(), RunId::from("r"), params(json!({"x": 1})), &AutoApprove, &CancellationToken::new())
            .await;

        // Write 1 is the parameters, writes 2-3 record s1, write 4 (s2) fails.
        assert!(matches!(
            run.abort,
            Some(AbortReason::StoreWrite { ref step, .. }) if step == "s2"
        ));
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Success, StepStatus::Failed, StepStatus::Skipped]
        );
        assert_eq!(
            run.steps[1].error.as_ref().map(|e| e.kind),
            Some(FailureKind::StoreWrite)
        );
        assert_eq!(h.calls.lock().unwrap().len(), 2);

        // Nothing of s2 reached the store.
        let persisted: Vec<String> = broken
            .history(&RunId::from("r"))
            .await
            .unwrap()
            .iter()
            .map(|s| format!("{}:{}", s.step_name, s.classification))
            .collect();
        assert_eq!(persisted, vec!["__run__:parameters", "s1:step_result", "s1:output"]);
    }

    #[tokio::test]
    async fn transient_write_failure_still_records_the_outcome() {
        let h = harness(EngineConfig::default());
        let flaky = Arc::new(FailingStore::write_fails_once(4));
        let run = failing_executor(&h, &flaky)
            .execute(&three_steps(), RunId::from("r"), params(json!({"x": 1})), &AutoApprove, &CancellationToken::new())
            .await;
        assert_eq!(run.status, RunStatus::Aborted);

        let recorded = MemoryManager::new(Arc::clone(&flaky))
            .step_results(&RunId::from("r"))
            .await
            .unwrap();
        let recorded: Vec<(&str, StepStatus)> = recorded
            .iter()
            .map(|r| (r.step_name.as_str(), r.status))
            .collect();
        assert_eq!(
            recorded,
            vec![
                ("s1", StepStatus::Success),
                ("s2", StepStatus::Failed),
                ("s3", StepStatus::Skipped),
            ]
        );
    }

    /// Store that fails reads, or the writes picked by `fail_write` (numbered from 1).
    struct FailingStore {
        inner: VolatileMemoryStore,
        fail_reads: bool,
        fail_write: Box<dyn Fn(usize) -> bool + Send + Sync>,
        writes: Mutex<usize>,
    }

    impl FailingStore {
        fn new(fail_reads: bool, fail_write: impl Fn(usize) -> bool + Send + Sync + 'static) -> Self {
            Self {
                inner: VolatileMemoryStore::new(),
                fail_reads,
                fail_write: Box::new(fail_write),
                writes: Mutex::new(0),
            }
        }

        fn reads() -> Self {
            Self::new(true, |_| false)
        }

        /// Every write after the first `n` fails.
        fn writes_after(n: usize) -> Self {
            Self::new(false, move |write| write > n)
        }

        fn write_fails_once(n: usize) -> Self {
            Self::new(false, move |write| write == n)
        }
    }

    impl MemoryStore for FailingStore {
        async fn append(&self, slice: NewSlice) -> Result<i64, StoreError> {
            {
                let mut writes = self.writes.lock().unwrap();
                *writes += 1;
                if (self.fail_write)(*writes) {
                    return Err(StoreError::Write("disk full".into()));
                }
            }
            self.inner.append(slice).await
        }
        async fn query(&self, query: &SliceQuery) -> Result<Vec<MemorySlice>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Read("unreadable".into()));
            }
            self.inner.query(query).await
        }
        async fn latest(&self, run_id: &RunId) -> Result<Option<MemorySlice>, StoreError> {
            self.inner.latest(run_id).await
        }
        async fn purge(&self, older_than: Duration) -> Result<u64, StoreError> {
            self.inner.purge(older_than).await
        }
        async fn history(&self, run_id: &RunId) -> Result<Vec<MemorySlice>, StoreError> {
            self.inner.history(run_id).await
        }
        async fn runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
            self.inner.runs(limit).await
        }
        async fn stats(&self) -> Result<MemoryStats, StoreError> {
            self.inner.stats().await
        }
    }
}
