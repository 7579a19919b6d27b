//! Deterministic transports and agents for tests.
//!
//! Enabled for this crate's unit tests and, through the `test-support` feature,
//! for its integration tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;

use crate::agents::{AgentSpec, BuildError};
use crate::core::backoff::RetryPolicy;
use crate::core::parse::{ParseFailure, extract_code_block, extract_section, parse_json};
use crate::core::types::{PromptRequest, RawResponse, Usage};
use crate::execute::ExecutionConfig;
use crate::io::config::CoercionConfig;
use crate::io::transport::{Transport, TransportError, TransportErrorKind};

/// Policies with zero backoff so tests never sleep.
pub fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        transport: RetryPolicy::new(3, 0.0, 5),
        parse: RetryPolicy::new(3, 0.0, 5),
        repair: true,
        coercion: CoercionConfig {
            enabled: false,
            threshold: 0.9,
        },
    }
}

/// [`fast_config`] with coercion switched on.
pub fn coercing_config(threshold: f64) -> ExecutionConfig {
    ExecutionConfig {
        coercion: CoercionConfig {
            enabled: true,
            threshold,
        },
        ..fast_config()
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Result<String, TransportErrorKind>>,
    requests: Vec<PromptRequest>,
}

/// Transport that replays a fixed script of replies and records every request.
///
/// Once the script runs out every call fails with `Unavailable`.
#[derive(Debug)]
pub struct ScriptedTransport {
    id: String,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    pub fn error(self, kind: TransportErrorKind) -> Self {
        self.push(Err(kind))
    }

    pub fn push(self, reply: Result<String, TransportErrorKind>) -> Self {
        self.lock().replies.push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<PromptRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        let reply = {
            let mut script = self.lock();
            script.requests.push(request.clone());
            script.replies.pop_front()
        };
        match reply {
            Some(Ok(text)) => {
                let usage = Usage::estimate(request.char_count(), text.chars().count());
                Ok(RawResponse::new(text, &self.id).with_usage(usage))
            }
            Some(Err(kind)) => Err(TransportError::new(kind, &self.id, "scripted failure")),
            None => Err(TransportError::new(
                TransportErrorKind::Unavailable,
                &self.id,
                "script exhausted",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Answer {
    value: i64,
}

/// Asks for `{"value": <integer>}` and returns the integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerAgent;

impl AgentSpec for AnswerAgent {
    type Input = ();
    type Output = i64;

    fn name(&self) -> &str {
        "answer"
    }

    fn build_prompt(&self, _input: &()) -> Result<PromptRequest, BuildError> {
        Ok(PromptRequest::new("Respond with JSON only.").user("What is six times seven?"))
    }

    fn parse_response(&self, text: &str) -> Result<i64, ParseFailure> {
        parse_json::<Answer>(text).map(|answer| answer.value)
    }

    fn output_format(&self) -> String {
        "{\"value\": <integer>}".to_string()
    }
}

/// Doubles its integer input: asks for `{"value": <2 * input>}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleAgent;

impl AgentSpec for DoubleAgent {
    type Input = i64;
    type Output = i64;

    fn name(&self) -> &str {
        "double"
    }

    fn build_prompt(&self, input: &i64) -> Result<PromptRequest, BuildError> {
        Ok(PromptRequest::new("Respond with JSON only.")
            .user(format!("Double {input}. Reply as {{\"value\": n}}.")))
    }

    fn parse_response(&self, text: &str) -> Result<i64, ParseFailure> {
        parse_json::<Answer>(text).map(|answer| answer.value)
    }

    fn output_format(&self) -> String {
        "{\"value\": <integer>}".to_string()
    }
}

/// Expects a `CODE:` section holding a fenced block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionAgent;

impl AgentSpec for SectionAgent {
    type Input = String;
    type Output = String;

    fn name(&self) -> &str {
        "section"
    }

    fn build_prompt(&self, input: &String) -> Result<PromptRequest, BuildError> {
        if input.trim().is_empty() {
            return Err(BuildError::InvalidInput("task must not be empty".to_string()));
        }
        Ok(PromptRequest::new("Write code.").user(input.clone()))
    }

    fn parse_response(&self, text: &str) -> Result<String, ParseFailure> {
        let section = extract_section(text, "CODE")?;
        extract_code_block(section, None)
    }

    fn output_format(&self) -> String {
        "CODE:\n```\n<code>\n```".to_string()
    }
}
