//! LLM provider ports used by the `model_call` tool.
//!
//! Concrete HTTP clients live in `stepwise-infra`; the core only sees the
//! [`LlmProvider`] trait, its boxed form, and a factory that builds a
//! provider for a given backend and API key.

pub mod box_provider;
pub mod provider;

pub use box_provider::BoxLlmProvider;
pub use provider::{LlmProvider, ProviderFactory};
