//! Shared domain types for Stepwise.
//!
//! This crate contains the domain types used across the workflow engine:
//! workflow definitions, runs and step results, memory slices, engine
//! configuration, LLM request/response shapes, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod run;
pub mod secret;
pub mod workflow;
