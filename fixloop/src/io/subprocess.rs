//! Backend that shells out to a locally authenticated model CLI.
//!
//! Each `send` spawns exactly one child with the flattened prompt as its last
//! argument and reaps it before returning, including on timeout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::{FinishReason, PromptRequest, RawResponse, Usage};
use crate::io::config::{OutputFormat, SubprocessConfig};
use crate::io::process::run_command_with_timeout;
use crate::io::transport::{Transport, TransportError, TransportErrorKind};

/// Exit codes some CLIs use for temporary conditions (EX_TEMPFAIL, ECONNRESET,
/// ETIMEDOUT, ECONNREFUSED).
const TRANSIENT_EXIT_CODES: [i32; 4] = [75, 104, 110, 111];

#[derive(Debug)]
pub struct SubprocessBackend {
    id: String,
    config: SubprocessConfig,
    timeout: Duration,
    executable: OnceLock<Result<PathBuf, String>>,
}

/// JSON envelope printed by CLIs in JSON output mode.
#[derive(Deserialize)]
struct Envelope {
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct EnvelopeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig, timeout: Duration) -> Self {
        let id = match &config.model {
            Some(model) => format!("subprocess-cli:{}:{model}", config.program),
            None => format!("subprocess-cli:{}", config.program),
        };
        Self {
            id,
            config,
            timeout,
            executable: OnceLock::new(),
        }
    }

    /// Resolve the program on `PATH` once; later calls reuse the first answer.
    fn executable(&self) -> Result<&PathBuf, TransportError> {
        self.executable
            .get_or_init(|| {
                which::which(&self.config.program).map_err(|err| {
                    warn!(program = %self.config.program, err = %err, "executable not found");
                    format!("cannot resolve {}: {err}", self.config.program)
                })
            })
            .as_ref()
            .map_err(|message| {
                TransportError::new(TransportErrorKind::Unavailable, &self.id, message.clone())
            })
    }

    fn command(&self, program: &Path, request: &PromptRequest) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.config.args);
        if let Some(model) = &self.config.model {
            cmd.arg(&self.config.model_flag).arg(model);
        }
        cmd.arg(request.render_transcript());
        cmd
    }

    fn decode(&self, stdout: &str, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        if self.config.output_format == OutputFormat::Json
            && let Ok(envelope) = serde_json::from_str::<Envelope>(stdout.trim())
            && let Some(result) = envelope.result
        {
            if envelope.is_error {
                return Err(TransportError::new(
                    classify_cli_failure(&result),
                    &self.id,
                    result,
                ));
            }
            let usage = envelope
                .usage
                .map(|usage| Usage::new(usage.input_tokens, usage.output_tokens))
                .unwrap_or_else(|| {
                    Usage::estimate(request.char_count(), result.chars().count())
                });
            let finish_reason = envelope
                .stop_reason
                .as_deref()
                .map(FinishReason::from_tag)
                .unwrap_or(FinishReason::Stop);
            return Ok(RawResponse::new(result, &self.id)
                .with_usage(usage)
                .with_finish_reason(finish_reason));
        }

        let text = stdout.trim_end().to_string();
        let usage = Usage::estimate(request.char_count(), text.chars().count());
        Ok(RawResponse::new(text, &self.id).with_usage(usage))
    }
}

/// Map CLI error text onto the transport taxonomy.
pub fn classify_cli_failure(text: &str) -> TransportErrorKind {
    let text = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));
    if has(&["rate limit", "rate_limit", "429", "too many requests"]) {
        TransportErrorKind::RateLimited
    } else if has(&["overloaded", "529", "503", "service unavailable"]) {
        TransportErrorKind::Overloaded
    } else if has(&[
        "unauthorized",
        "401",
        "403",
        "not logged in",
        "please log in",
        "invalid api key",
        "authentication",
    ]) {
        TransportErrorKind::Auth
    } else if has(&["timed out", "timeout"]) {
        TransportErrorKind::Timeout
    } else if has(&[
        "network",
        "connection",
        "dns",
        "econnreset",
        "econnrefused",
        "getaddrinfo",
    ]) {
        TransportErrorKind::Network
    } else if has(&["content filter", "content_filter", "refus"]) {
        TransportErrorKind::ContentFiltered
    } else {
        TransportErrorKind::Unknown
    }
}

fn classify_spawn_error(err: &anyhow::Error) -> TransportErrorKind {
    match err.downcast_ref::<std::io::Error>().map(std::io::Error::kind) {
        Some(ErrorKind::NotFound | ErrorKind::PermissionDenied) => TransportErrorKind::Unavailable,
        _ => TransportErrorKind::Unknown,
    }
}

#[async_trait]
impl Transport for SubprocessBackend {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(backend = %self.id, timeout_secs = self.timeout.as_secs()))]
    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        let program = self.executable()?;
        let cmd = self.command(program, request);

        let output = run_command_with_timeout(cmd, self.timeout, self.config.output_limit_bytes)
            .await
            .map_err(|err| {
                TransportError::new(classify_spawn_error(&err), &self.id, format!("{err:#}"))
            })?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "cli call timed out");
            return Err(TransportError::timeout(&self.id, self.timeout));
        }

        let stdout = output.stdout_lossy();
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            let mut kind = classify_cli_failure(detail);
            if kind == TransportErrorKind::Unknown
                && output
                    .status
                    .code()
                    .is_some_and(|code| TRANSIENT_EXIT_CODES.contains(&code))
            {
                kind = TransportErrorKind::Network;
            }
            warn!(exit_code = ?output.status.code(), %kind, "cli call failed");
            return Err(TransportError::new(
                kind,
                &self.id,
                format!("exit {:?}: {detail}", output.status.code()),
            ));
        }

        if stdout.trim().is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Unknown,
                &self.id,
                "cli produced no output",
            ));
        }

        debug!(bytes = output.stdout.len(), "cli call completed");
        self.decode(&stdout, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(format: OutputFormat) -> SubprocessBackend {
        SubprocessBackend::new(
            SubprocessConfig {
                output_format: format,
                ..SubprocessConfig::default()
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn cli_failures_are_classified() {
        assert_eq!(
            classify_cli_failure("Error: 429 Too Many Requests"),
            TransportErrorKind::RateLimited
        );
        assert_eq!(
            classify_cli_failure("Invalid API key · Please run /login"),
            TransportErrorKind::Auth
        );
        assert_eq!(
            classify_cli_failure("API Error: Overloaded"),
            TransportErrorKind::Overloaded
        );
        assert_eq!(
            classify_cli_failure("getaddrinfo ENOTFOUND api.example.com"),
            TransportErrorKind::Network
        );
        assert_eq!(classify_cli_failure("boom"), TransportErrorKind::Unknown);
    }

    #[test]
    fn json_envelope_supplies_text_and_usage() {
        let raw = backend(OutputFormat::Json)
            .decode(
                r#"{"type":"result","is_error":false,"result":"{\"value\": 1}","usage":{"input_tokens":7,"output_tokens":3}}"#,
                &PromptRequest::new("").user("q"),
            )
            .expect("decode");
        assert_eq!(raw.text, "{\"value\": 1}");
        assert_eq!(raw.usage, Usage::new(7, 3));
    }

    #[test]
    fn json_envelope_errors_are_classified() {
        let err = backend(OutputFormat::Json)
            .decode(
                r#"{"is_error":true,"result":"rate limit reached"}"#,
                &PromptRequest::new("").user("q"),
            )
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::RateLimited);
    }

    #[test]
    fn json_mode_falls_back_to_text() {
        let raw = backend(OutputFormat::Json)
            .decode("plain answer\n", &PromptRequest::new("").user("question"))
            .expect("decode");
        assert_eq!(raw.text, "plain answer");
        assert_eq!(raw.usage, Usage::estimate(8, 12));
    }

    #[test]
    fn model_flag_precedes_prompt() {
        let sub = SubprocessBackend::new(
            SubprocessConfig {
                model: Some("small".into()),
                ..SubprocessConfig::default()
            },
            Duration::from_secs(1),
        );
        assert_eq!(sub.id(), "subprocess-cli:claude:small");
        let cmd = sub.command(&PathBuf::from("claude"), &PromptRequest::new("").user("hi"));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-p", "--model", "small", "hi"]);
    }

    #[tokio::test]
    async fn unresolvable_program_is_unavailable() {
        let sub = SubprocessBackend::new(
            SubprocessConfig {
                program: "definitely-not-a-real-model-cli".into(),
                ..SubprocessConfig::default()
            },
            Duration::from_secs(1),
        );
        let err = sub
            .send(&PromptRequest::new("").user("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unavailable);
        assert!(!err.is_transient());
    }
}
