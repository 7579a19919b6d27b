//! Agent execution: build, send, parse, repair, retry, coerce.
//!
//! `Runtime::execute` walks one execution through
//! `Building → Sending → Parsing → (Repairing | Retrying | Coercing) → Done`.
//! Only prompt building errors surface as `Err`; every other failure is folded
//! into a typed [`ExecutionResult::Failure`].

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentSpec, BuildError};
use crate::core::backoff::RetryPolicy;
use crate::core::classifier::ErrorClassification;
use crate::core::followup::corrective_message;
use crate::core::parse::ParseFailure;
use crate::core::repair::{extract_balanced_span, repair};
use crate::core::types::{
    ExecutionFailure, ExecutionResult, FailureKind, Message, PromptRequest, RawResponse, Usage,
};
use crate::fix::{Attempted, FixLoop};
use crate::io::config::{CoercionConfig, RuntimeConfig};
use crate::io::transport::{Transport, TransportError};

/// Slack on top of the attempt timeout before the runtime abandons a call
/// that its backend failed to bound.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Knobs for one runtime, usually derived from [`RuntimeConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionConfig {
    pub transport: RetryPolicy,
    pub parse: RetryPolicy,
    pub repair: bool,
    pub coercion: CoercionConfig,
}

impl From<&RuntimeConfig> for ExecutionConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            transport: config.transport,
            parse: config.parse,
            repair: config.repair,
            coercion: config.coercion,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// One transport plus the policies used to drive it. Holds no per-execution state,
/// so a single runtime can serve many concurrent executions.
#[derive(Debug)]
pub struct Runtime<T> {
    transport: T,
    config: ExecutionConfig,
}

/// Why one parse-level attempt did not produce output.
#[derive(Debug)]
enum AttemptError {
    /// The transport layer gave up; its own retries are already spent.
    Transport(TransportError),
    Parse {
        failure: ParseFailure,
        classification: ErrorClassification,
        raw: RawResponse,
    },
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(_) => false,
            AttemptError::Parse { classification, .. } => classification.is_retryable(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transport(err) => write!(f, "{err}"),
            AttemptError::Parse {
                failure,
                classification,
                ..
            } => write!(f, "{classification}: {failure}"),
        }
    }
}

/// Conversation for one execution, grown by corrective follow-ups.
struct Conversation {
    request: PromptRequest,
    last_raw: Option<RawResponse>,
    usage: Usage,
}

fn lock(conversation: &Mutex<Conversation>) -> MutexGuard<'_, Conversation> {
    conversation.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Runtime<T> {
    pub fn new(transport: T, config: ExecutionConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// One backend call bounded by the attempt timeout, without retries.
    pub(crate) async fn send_once(
        &self,
        request: &PromptRequest,
    ) -> Result<RawResponse, TransportError> {
        let limit = self.config.transport.attempt_timeout() + TIMEOUT_GRACE;
        match tokio::time::timeout(limit, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "backend call abandoned");
                Err(TransportError::timeout(self.transport.id(), limit))
            }
        }
    }

    /// Send with transport-level retries.
    pub async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        FixLoop::new(self.config.transport, "transport")
            .run(
                |_| self.send_once(request),
                TransportError::is_transient,
            )
            .await
            .map(|sent| sent.value)
            .map_err(|failed| failed.value)
    }

    /// Execute `agent` on `input`.
    ///
    /// Returns `Err` only when the agent cannot build its prompt.
    #[instrument(skip_all, fields(agent = agent.name(), backend = self.transport.id()))]
    pub async fn execute<A: AgentSpec>(
        &self,
        agent: &A,
        input: &A::Input,
    ) -> Result<ExecutionResult<A::Output>, BuildError> {
        let request = agent.build_prompt(input)?;
        info!(turns = request.messages.len(), "execution started");

        let conversation = Mutex::new(Conversation {
            request,
            last_raw: None,
            usage: Usage::default(),
        });
        let conversation = &conversation;

        let outcome = FixLoop::new(self.config.parse, "parse")
            .run(
                |attempt| async move {
                    let request = lock(conversation).request.clone();
                    debug!(attempt, turns = request.messages.len(), "sending");
                    let raw = match self.send(&request).await {
                        Ok(raw) => raw,
                        Err(err) => return Err(AttemptError::Transport(err)),
                    };
                    {
                        let mut conversation = lock(conversation);
                        conversation.usage = conversation.usage.add(raw.usage);
                        conversation.last_raw = Some(raw.clone());
                    }

                    let failure = match parse_with_repair(agent, &raw, self.config.repair) {
                        Ok(accepted) => return Ok(accepted),
                        Err(failure) => failure,
                    };
                    let classification = failure.classify(&raw.text);
                    debug!(%classification, kind = %failure.kind, "response rejected");
                    if classification.is_retryable() {
                        let follow_up = corrective_message(&failure, &agent.output_format());
                        let mut conversation = lock(conversation);
                        conversation
                            .request
                            .messages
                            .push(Message::assistant(raw.text.clone()));
                        conversation.request.messages.push(Message::user(follow_up));
                    }
                    Err(AttemptError::Parse {
                        failure,
                        classification,
                        raw,
                    })
                },
                AttemptError::is_retryable,
            )
            .await;

        let (last_raw, usage) = {
            let mut conversation = lock(conversation);
            (conversation.last_raw.take(), conversation.usage)
        };
        let result = match outcome {
            Ok(Attempted {
                value: (output, raw),
                attempts,
            }) => ExecutionResult::Success {
                output,
                raw,
                attempts,
                usage,
            },
            Err(Attempted {
                value: AttemptError::Transport(err),
                attempts,
            }) => ExecutionResult::Failure(ExecutionFailure {
                kind: FailureKind::Transport(err.kind),
                message: err.to_string(),
                backend: err.backend,
                usage,
                last_raw,
                attempts,
            }),
            Err(Attempted {
                value:
                    AttemptError::Parse {
                        failure,
                        classification,
                        raw,
                    },
                attempts,
            }) => {
                self.finish_parse_failure(agent, failure, classification, raw, attempts, usage)
                    .await
            }
        };

        match &result {
            ExecutionResult::Success {
                raw,
                attempts,
                usage,
                ..
            } => {
                info!(
                    attempts,
                    backend = %raw.backend,
                    total_tokens = usage.total_tokens,
                    "execution succeeded"
                );
            }
            ExecutionResult::Failure(failure) => {
                warn!(
                    attempts = failure.attempts,
                    kind = %failure.kind,
                    backend = %failure.backend,
                    "execution failed"
                );
            }
        }
        Ok(result)
    }

    /// Last chance for a rejected response: coerce it when enabled, otherwise
    /// report the parse failure.
    ///
    /// Once coercion has failed there is nothing left to retry, so the
    /// reported classification is settled to a permanent one.
    async fn finish_parse_failure<A: AgentSpec>(
        &self,
        agent: &A,
        failure: ParseFailure,
        mut classification: ErrorClassification,
        raw: RawResponse,
        attempts: u32,
        mut usage: Usage,
    ) -> ExecutionResult<A::Output> {
        if self.config.coercion.enabled {
            match self.coerce(agent, &raw, &failure, &mut usage).await {
                Ok((output, coerced)) => {
                    return ExecutionResult::Success {
                        output,
                        raw: coerced,
                        attempts,
                        usage,
                    };
                }
                Err(err) => {
                    warn!(err = %err, "coercion failed");
                    classification = classification.settle(&raw.text);
                }
            }
        }
        ExecutionResult::Failure(ExecutionFailure {
            kind: FailureKind::Parse(classification),
            message: failure.to_string(),
            backend: raw.backend.clone(),
            usage,
            last_raw: Some(raw),
            attempts,
        })
    }
}

/// Parse `raw` with the agent's parser, falling back to repaired candidates for
/// structural failures.
///
/// The accepted response carries the text the parser actually accepted. The
/// original failure is returned when no candidate parses.
pub fn parse_with_repair<A: AgentSpec>(
    agent: &A,
    raw: &RawResponse,
    repair_enabled: bool,
) -> Result<(A::Output, RawResponse), ParseFailure> {
    let failure = match agent.parse_response(&raw.text) {
        Ok(output) => return Ok((output, raw.clone())),
        Err(failure) => failure,
    };
    if !repair_enabled || !failure.is_structural() {
        return Err(failure);
    }

    let repaired = repair(&raw.text);
    let span = extract_balanced_span(&raw.text);
    let span_candidates = span
        .into_iter()
        .flat_map(|span| [span.to_string(), repair(span)]);
    let candidates = std::iter::once(repaired).chain(span_candidates);
    for candidate in candidates {
        if candidate == raw.text {
            continue;
        }
        if let Ok(output) = agent.parse_response(&candidate) {
            debug!(kind = %failure.kind, "response accepted after repair");
            let accepted = RawResponse {
                text: candidate,
                ..raw.clone()
            };
            return Ok((output, accepted));
        }
    }
    Err(failure)
}
