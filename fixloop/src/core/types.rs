//! Shared value types for the execution runtime.
//!
//! These types define stable contracts between the agent boundary, the
//! transports and the orchestrator. They carry no behavior beyond small
//! constructors and must stay free of I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::classifier::ErrorClassification;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Structured prompt handed to a transport.
///
/// Built once by an agent; the orchestrator only ever appends turns to a
/// private copy when it asks for a corrected reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// System instruction text.
    pub system: String,
    /// Ordered conversation turns.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum number of output tokens the backend may produce.
    pub max_tokens: u32,
    /// Free-form metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PromptRequest {
    pub const DEFAULT_TEMPERATURE: f32 = 0.0;
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;

    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            metadata: BTreeMap::new(),
        }
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    pub fn assistant(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::assistant(content));
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Flatten the request into a single transcript for text-only backends.
    pub fn render_transcript(&self) -> String {
        let mut out = String::new();
        if !self.system.trim().is_empty() {
            out.push_str(self.system.trim());
            out.push_str("\n\n");
        }
        for (idx, message) in self.messages.iter().enumerate() {
            if idx > 0 {
                out.push_str("\n\n");
            }
            // A lone user turn needs no speaker label.
            if self.messages.len() == 1 && message.role == Role::User {
                out.push_str(&message.content);
                continue;
            }
            let label = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&message.content);
        }
        out
    }

    /// Total characters across system and turns (used for usage estimates).
    pub fn char_count(&self) -> usize {
        self.system.chars().count()
            + self
                .messages
                .iter()
                .map(|message| message.content.chars().count())
                .sum::<usize>()
    }
}

/// Best-effort usage counters reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Roughly four characters per token.
    const CHARS_PER_TOKEN: usize = 4;

    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Estimate usage from character counts when a backend reports none.
    pub fn estimate(input_chars: usize, output_chars: usize) -> Self {
        Self::new(
            input_chars.div_ceil(Self::CHARS_PER_TOKEN) as u64,
            output_chars.div_ceil(Self::CHARS_PER_TOKEN) as u64,
        )
    }

    pub fn add(self, other: Usage) -> Usage {
        Usage::new(
            self.input_tokens + other.input_tokens,
            self.output_tokens + other.output_tokens,
        )
    }
}

/// Why the backend stopped producing output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ContentFilter,
    #[default]
    Unknown,
}

impl FinishReason {
    /// Map a provider `stop_reason` / `finish_reason` tag.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "stop" | "end_turn" | "stop_sequence" | "success" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::MaxTokens,
            "content_filter" | "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }
}

/// Raw text produced by exactly one backend call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    pub text: String,
    /// Backend identifier, e.g. `gateway-http:gpt-4o`.
    pub backend: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl RawResponse {
    pub fn new(text: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            backend: backend.into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = finish_reason;
        self
    }
}

/// Transport-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportErrorKind {
    RateLimited,
    Timeout,
    Auth,
    MalformedRequest,
    Network,
    Overloaded,
    ContentFiltered,
    /// The backend cannot be used at all (missing executable or credential).
    Unavailable,
    Unknown,
}

impl TransportErrorKind {
    /// Whether another attempt could plausibly succeed.
    ///
    /// `Unknown` counts as transient.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::RateLimited
                | TransportErrorKind::Timeout
                | TransportErrorKind::Network
                | TransportErrorKind::Overloaded
                | TransportErrorKind::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::RateLimited => "rate-limited",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::MalformedRequest => "malformed-request",
            TransportErrorKind::Network => "network",
            TransportErrorKind::Overloaded => "overloaded",
            TransportErrorKind::ContentFiltered => "content-filtered",
            TransportErrorKind::Unavailable => "unavailable",
            TransportErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a final, unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layer", content = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The transport never produced a response.
    Transport(TransportErrorKind),
    /// Responses arrived but none could be parsed.
    Parse(ErrorClassification),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport(kind) => write!(f, "transport/{kind}"),
            FailureKind::Parse(classification) => write!(f, "parse/{classification}"),
        }
    }
}

/// Details of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Backend that produced the last response, or the one that failed to.
    pub backend: String,
    /// Summed over every backend call made by the execution.
    pub usage: Usage,
    /// Last response received from the backend, if any.
    pub last_raw: Option<RawResponse>,
    /// Parse-level attempts consumed before giving up.
    pub attempts: u32,
}

/// The only value returned to callers of the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult<O> {
    Success {
        output: O,
        raw: RawResponse,
        attempts: u32,
        /// Summed over every backend call, including rejected attempts and
        /// coercion. `raw.usage` covers the accepted call only.
        usage: Usage,
    },
    Failure(ExecutionFailure),
}

impl<O> ExecutionResult<O> {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn output(&self) -> Option<&O> {
        match self {
            ExecutionResult::Success { output, .. } => Some(output),
            ExecutionResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match self {
            ExecutionResult::Success { .. } => None,
            ExecutionResult::Failure(failure) => Some(failure),
        }
    }

    /// Raw response attached to the result (accepted text or last received).
    pub fn raw(&self) -> Option<&RawResponse> {
        match self {
            ExecutionResult::Success { raw, .. } => Some(raw),
            ExecutionResult::Failure(failure) => failure.last_raw.as_ref(),
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            ExecutionResult::Success { usage, .. } => *usage,
            ExecutionResult::Failure(failure) => failure.usage,
        }
    }

    pub fn into_output(self) -> Option<O> {
        match self {
            ExecutionResult::Success { output, .. } => Some(output),
            ExecutionResult::Failure(_) => None,
        }
    }
}
