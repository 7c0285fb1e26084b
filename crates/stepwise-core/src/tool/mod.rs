//! Tool abstraction, registry and dispatch.
//!
//! A tool validates its resolved inputs and then executes. The registry is
//! an explicit object built once at startup and shared by handle; dispatch
//! converts every tool error (including panics and timeouts) into a
//! [`StepFailure`] so a misbehaving tool never unwinds the run loop.

pub mod echo;
pub mod fan_out;
pub mod model_call;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use stepwise_types::config::EngineConfig;
use stepwise_types::run::{FailureKind, StepFailure, ToolOutput};
use tokio_util::sync::CancellationToken;

pub use echo::EchoTool;
pub use fan_out::FanOutTool;
pub use model_call::ModelCallTool;

/// Errors a tool reports from validation or execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn into_failure(self) -> StepFailure {
        match self {
            ToolError::Validation(msg) => StepFailure::new(FailureKind::ToolValidation, msg),
            ToolError::Execution(msg) => StepFailure::new(FailureKind::ToolExecution, msg),
            ToolError::Cancelled => StepFailure::new(FailureKind::Cancelled, "tool call cancelled"),
        }
    }
}

/// Handed to every execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Registry the tool was dispatched from; fan-out uses it for sub-invocations.
    pub registry: Arc<ToolRegistry>,
    /// Cancelled when the run is cancelled. Tools should stop early when it fires.
    pub cancel: CancellationToken,
}

/// A unit of work invoked by name with validated inputs.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Reject inputs before anything runs.
    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError>;

    fn execute(
        &self,
        inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> impl Future<Output = Result<ToolOutput, ToolError>> + Send;
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// Object-safe version of [`Tool`] with boxed futures.
pub trait ToolDyn: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError>;

    fn execute_boxed<'a>(
        &'a self,
        inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;
}

impl<T: Tool> ToolDyn for T {
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn description(&self) -> &str {
        Tool::description(self)
    }

    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
        Tool::validate(self, inputs)
    }

    fn execute_boxed<'a>(
        &'a self,
        inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>> {
        Box::pin(self.execute(inputs, ctx))
    }
}

/// Shared, type-erased tool.
#[derive(Clone)]
pub struct BoxTool {
    inner: Arc<dyn ToolDyn>,
}

impl BoxTool {
    pub fn new<T: Tool + 'static>(tool: T) -> Self {
        Self {
            inner: Arc::new(tool),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn description(&self) -> &str {
        self.inner.description()
    }

    pub fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
        self.inner.validate(inputs)
    }

    pub async fn execute(
        &self,
        inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.inner.execute_boxed(inputs, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of available tools, indexed by name.
pub struct ToolRegistry {
    tools: HashMap<String, BoxTool>,
    timeouts: HashMap<String, Duration>,
    default_timeout: Option<Duration>,
    max_fan_out: usize,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeouts: HashMap::new(),
            default_timeout: None,
            max_fan_out: EngineConfig::default().max_fan_out_workers,
        }
    }

    /// Empty registry carrying the timeouts and fan-out ceiling from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.default_timeout = config.default_tool_timeout_secs.map(Duration::from_secs);
        registry.timeouts = config
            .tool_timeouts
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect();
        registry.max_fan_out = config.max_fan_out_workers.max(1);
        registry
    }

    /// Register a tool under its own name. Replaces any tool with that name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let tool = BoxTool::new(tool);
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn set_timeout(&mut self, tool: impl Into<String>, timeout: Duration) {
        self.timeouts.insert(tool.into(), timeout);
    }

    pub fn get(&self, name: &str) -> Option<&BoxTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn timeout_for(&self, tool: &str) -> Option<Duration> {
        self.timeouts.get(tool).copied().or(self.default_timeout)
    }

    /// Ceiling on concurrent sub-invocations inside a fan-out step.
    pub fn max_fan_out(&self) -> usize {
        self.max_fan_out
    }

    /// Look up, validate and execute a tool.
    ///
    /// Validation and execution run on their own task so a panic in either
    /// is reported as a failure. The tool's child token is cancelled on
    /// every exit from `dispatch`; work the tool spawned (fan-out
    /// sub-invocations included) stops when the step times out, is
    /// cancelled or is dropped.
    pub async fn dispatch(
        self: &Arc<Self>,
        tool_name: &str,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, StepFailure> {
        let Some(tool) = self.get(tool_name).cloned() else {
            return Err(StepFailure::new(
                FailureKind::UnknownTool,
                format!("no tool registered as '{tool_name}'"),
            ));
        };

        let timeout = timeout.or_else(|| self.timeout_for(tool_name));
        let ctx = ToolContext {
            registry: Arc::clone(self),
            cancel: cancel.child_token(),
        };
        let _cancel_on_exit = ctx.cancel.clone().drop_guard();

        let mut handle = tokio::spawn(async move {
            if let Err(err) = tool.validate(&inputs) {
                return Ok(Err(err));
            }
            match timeout {
                Some(limit) => tokio::time::timeout(limit, tool.execute(inputs, ctx))
                    .await
                    .map_err(|_| limit),
                None => Ok(tool.execute(inputs, ctx).await),
            }
        });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(err))) => Err(err.into_failure()),
                Ok(Err(limit)) => Err(StepFailure::new(
                    FailureKind::Timeout,
                    format!("tool '{tool_name}' did not finish within {}s", limit.as_secs_f64()),
                )),
                Err(err) if err.is_panic() => Err(StepFailure::new(
                    FailureKind::Panicked,
                    format!("tool '{tool_name}' panicked"),
                )),
                Err(_) => Err(ToolError::Cancelled.into_failure()),
            },
            _ = cancel.cancelled() => {
                handle.abort();
                tracing::debug!(tool = tool_name, "dispatch cancelled, aborting tool task");
                Err(ToolError::Cancelled.into_failure())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Required string input, or a validation error naming the key.
pub(crate) fn required_str<'a>(
    inputs: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ToolError> {
    match inputs.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) | None => {
            Err(ToolError::Validation(format!("missing required input '{key}'")))
        }
        Some(other) => Err(ToolError::Validation(format!(
            "input '{key}' must be a string, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted tools shared by the core test suites.

    use super::*;
    use std::sync::Mutex;

    /// Echoes `text` after sleeping `delay_ms`, or fails when `fail` is true.
    pub struct ScriptedTool {
        pub name: &'static str,
        pub calls: Arc<Mutex<Vec<Map<String, Value>>>>,
    }

    impl ScriptedTool {
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
            if inputs.get("panic_in_validate").and_then(Value::as_bool) == Some(true) {
                panic!("scripted validation panic");
            }
            if inputs.get("reject").and_then(Value::as_bool) == Some(true) {
                return Err(ToolError::Validation("rejected".into()));
            }
            Ok(())
        }

        async fn execute(
            &self,
            inputs: Map<String, Value>,
            ctx: ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push(inputs.clone());
            if let Some(ms) = inputs.get("delay_ms").and_then(Value::as_u64) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
                }
            }
            if inputs.get("panic").and_then(Value::as_bool) == Some(true) {
                panic!("scripted panic");
            }
            if inputs.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(ToolError::Execution("scripted failure".into()));
            }
            let text = inputs
                .get("text")
                .map(crate::template::value_to_string)
                .unwrap_or_default();
            Ok(ToolOutput::text(text))
        }
    }
}
