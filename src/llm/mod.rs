//! LLM collaborator used by the planner step

pub mod client;
pub mod error;

use async_trait::async_trait;

use crate::config::LlmConfig;

pub use client::HttpLlmClient;
pub use error::LlmError;

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single prompt and return the completion text
    async fn complete(&self, prompt: &str, config: &LlmConfig) -> Result<String, LlmError>;
}
