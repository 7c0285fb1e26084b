//! Workflow execution: definition loading and validation, the per-run
//! context, scrutiny gates, and the sequential executor.
//!
//! - `definition` -- YAML parsing, validation, filesystem discovery
//! - `context` -- `steps.*` layer accumulated across a run
//! - `gate` -- approval callbacks and gate waiting
//! - `executor` -- the step state machine

pub mod context;
pub mod definition;
pub mod executor;
pub mod gate;

pub use definition::WorkflowError;
pub use executor::WorkflowExecutor;
pub use gate::{ApproveWith, Approver, AutoApprove, AutoDeny};
