//! Workflow execution core for Stepwise.
//!
//! This crate defines the ports (memory store, secret providers, LLM
//! providers) that `stepwise-infra` implements, plus everything that runs a
//! workflow: template resolution, memory needs, the tool registry and the
//! executor. It never touches a database or the network directly.

pub mod engine;
pub mod llm;
pub mod memory;
pub mod secret;
pub mod template;
pub mod tool;
pub mod workflow;
