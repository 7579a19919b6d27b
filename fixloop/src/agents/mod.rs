//! The agent boundary: how typed input becomes a prompt and raw text becomes output.

use thiserror::Error;

use crate::core::parse::ParseFailure;
use crate::core::types::PromptRequest;

pub mod json;

/// Declarative agent supplied by calling code.
///
/// Both functions must be pure: the runtime may call `parse_response` several
/// times on different candidate texts for the same response.
pub trait AgentSpec: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &str;

    fn build_prompt(&self, input: &Self::Input) -> Result<PromptRequest, BuildError>;

    fn parse_response(&self, text: &str) -> Result<Self::Output, ParseFailure>;

    /// Human-readable description of the expected output, used in corrective
    /// follow-ups and coercion prompts.
    fn output_format(&self) -> String {
        String::new()
    }
}

/// Prompt construction failed. Never retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("render prompt template: {0}")]
    Template(#[from] minijinja::Error),
    #[error("invalid agent input: {0}")]
    InvalidInput(String),
}
