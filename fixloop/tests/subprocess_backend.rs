//! Subprocess CLI backend against real `sh` children.
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use fixloop::core::backoff::RetryPolicy;
use fixloop::core::types::{FailureKind, PromptRequest};
use fixloop::execute::{ExecutionConfig, Runtime};
use fixloop::io::config::{OutputFormat, SubprocessConfig};
use fixloop::io::subprocess::SubprocessBackend;
use fixloop::io::transport::{Transport, TransportErrorKind};
use fixloop::test_support::{AnswerAgent, fast_config};

/// `sh -c <script> fixloop-cli <prompt>`: the prompt lands in `$1`.
fn sh_backend(script: &str, timeout: Duration) -> SubprocessBackend {
    SubprocessBackend::new(
        SubprocessConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "fixloop-cli".to_string(),
            ],
            ..SubprocessConfig::default()
        },
        timeout,
    )
}

fn runtime_for(backend: SubprocessBackend, timeout_secs: u64) -> Runtime<SubprocessBackend> {
    Runtime::new(
        backend,
        ExecutionConfig {
            transport: RetryPolicy::new(3, 0.0, timeout_secs),
            ..fast_config()
        },
    )
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn stdout_becomes_the_response_with_estimated_usage() {
    let backend = sh_backend(r#"printf '{"value": 42}'"#, Duration::from_secs(5));
    let runtime = runtime_for(backend, 5);

    let result = runtime.execute(&AnswerAgent, &()).await.expect("build");

    assert_eq!(result.output(), Some(&42));
    let raw = result.raw().expect("raw response");
    assert_eq!(raw.backend, "subprocess-cli:sh");
    assert!(raw.usage.input_tokens > 0);
    assert!(raw.usage.output_tokens > 0);
}

#[tokio::test]
async fn prompt_is_passed_as_the_last_argument() {
    let backend = sh_backend(r#"printf '%s' "$1""#, Duration::from_secs(5));
    let request = PromptRequest::new("").user("echo me back");

    let raw = backend.send(&request).await.expect("send");

    assert_eq!(raw.text, "echo me back");
}

#[tokio::test]
async fn json_envelope_supplies_text_and_usage() {
    let temp = tempfile::tempdir().expect("tempdir");
    let envelope = temp.path().join("envelope.json");
    fs::write(
        &envelope,
        r#"{"result": "{\"value\": 7}", "usage": {"input_tokens": 11, "output_tokens": 3}, "stop_reason": "end_turn"}"#,
    )
    .expect("write envelope");

    let backend = SubprocessBackend::new(
        SubprocessConfig {
            program: "cat".to_string(),
            args: vec![envelope.display().to_string()],
            output_format: OutputFormat::Json,
            ..SubprocessConfig::default()
        },
        Duration::from_secs(5),
    );
    // `cat` also receives the prompt as a file argument; make it a readable path.
    let request = PromptRequest::new("").user("/dev/null");

    let raw = backend.send(&request).await.expect("send");

    assert_eq!(raw.text, "{\"value\": 7}");
    assert_eq!(raw.usage.input_tokens, 11);
    assert_eq!(raw.usage.output_tokens, 3);
    assert_eq!(raw.usage.total_tokens, 14);
}

#[tokio::test]
async fn timed_out_children_are_killed_and_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pidfile = temp.path().join("pids");
    let script = format!("echo $$ >> '{}'; exec sleep 10", pidfile.display());
    let runtime = runtime_for(sh_backend(&script, Duration::from_secs(1)), 1);

    let started = Instant::now();
    let result = runtime.execute(&AnswerAgent, &()).await.expect("build");
    let elapsed = started.elapsed();

    let failure = result.failure().expect("failure");
    assert_eq!(
        failure.kind,
        FailureKind::Transport(TransportErrorKind::Timeout)
    );
    assert!(
        elapsed < Duration::from_secs(9),
        "three 1s attempts took {elapsed:?}"
    );

    let pids = read_pids(&pidfile);
    assert_eq!(pids.len(), 3, "one child per attempt");
    for pid in &pids {
        assert!(!process_alive(pid), "child {pid} still running");
    }
}

#[tokio::test]
async fn transient_exit_is_retried_then_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pidfile = temp.path().join("pids");
    let script = format!(
        "echo $$ >> '{}'; echo 'Error: rate limit exceeded' >&2; exit 1",
        pidfile.display()
    );
    let runtime = runtime_for(sh_backend(&script, Duration::from_secs(5)), 5);

    let result = runtime.execute(&AnswerAgent, &()).await.expect("build");

    assert_eq!(
        result.failure().map(|failure| failure.kind),
        Some(FailureKind::Transport(TransportErrorKind::RateLimited))
    );
    assert_eq!(read_pids(&pidfile).len(), 3);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pidfile = temp.path().join("pids");
    let script = format!(
        "echo $$ >> '{}'; echo 'Invalid API key. Please run /login' >&2; exit 1",
        pidfile.display()
    );
    let runtime = runtime_for(sh_backend(&script, Duration::from_secs(5)), 5);

    let result = runtime.execute(&AnswerAgent, &()).await.expect("build");

    assert_eq!(
        result.failure().map(|failure| failure.kind),
        Some(FailureKind::Transport(TransportErrorKind::Auth))
    );
    assert_eq!(read_pids(&pidfile).len(), 1);
}

#[tokio::test]
async fn missing_program_is_unavailable() {
    let backend = SubprocessBackend::new(
        SubprocessConfig {
            program: "fixloop-definitely-not-installed".to_string(),
            ..SubprocessConfig::default()
        },
        Duration::from_secs(1),
    );

    let err = backend
        .send(&PromptRequest::new("").user("hi"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, TransportErrorKind::Unavailable);
    assert!(!err.is_transient());
}

fn read_pids(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
