//! Command-line front end for the fixloop runtime.
//!
//! Runs one JSON agent against the configured backend, streams from a gateway,
//! repairs malformed JSON offline and prints the effective configuration.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Value, json};

use fixloop::agents::json::JsonAgent;
use fixloop::core::repair::repair;
use fixloop::core::types::{ExecutionResult, PromptRequest};
use fixloop::execute::{ExecutionConfig, Runtime};
use fixloop::exit_codes;
use fixloop::io::config::{DEFAULT_CONFIG_FILE, RuntimeConfig, load_effective_config};
use fixloop::io::gateway::StreamEvent;
use fixloop::io::transport::{Backend, Transport};
use fixloop::logging;

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Resilient execution runtime for LLM-backed agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a JSON agent and print a JSON report.
    Run {
        /// User prompt (a minijinja template rendered with `--input`).
        #[arg(long)]
        prompt: String,
        /// System instruction.
        #[arg(long, default_value = "")]
        system: String,
        /// JSON object used as the prompt template context.
        #[arg(long)]
        input: Option<String>,
        /// JSON Schema file the output must satisfy.
        #[arg(long)]
        schema: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Stream a reply from a gateway backend, printing increments as they arrive.
    Stream {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        system: String,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Print the structurally repaired form of a file (or stdin).
    Repair {
        file: Option<PathBuf>,
    },
    /// Print the effective configuration (file plus environment overrides).
    Config {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            prompt,
            system,
            input,
            schema,
            config,
        } => cmd_run(&prompt, &system, input.as_deref(), schema.as_deref(), &config).await,
        Command::Stream {
            prompt,
            system,
            config,
        } => cmd_stream(&prompt, &system, &config).await,
        Command::Repair { file } => cmd_repair(file.as_deref()),
        Command::Config { config } => cmd_config(&config),
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn load(config: &Path) -> Result<RuntimeConfig> {
    load_effective_config(config, env_var).with_context(|| format!("load {}", config.display()))
}

async fn cmd_run(
    prompt: &str,
    system: &str,
    input: Option<&str>,
    schema: Option<&Path>,
    config: &Path,
) -> Result<i32> {
    let cfg = load(config)?;
    let backend = Backend::from_config(&cfg, env_var).context("construct backend")?;

    let mut agent = JsonAgent::new("cli", system, prompt);
    if let Some(path) = schema {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let schema: Value =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        agent = agent.with_schema(schema)?;
    }
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("parse --input json")?,
        None => Value::Null,
    };

    let runtime = Runtime::new(backend, ExecutionConfig::from(&cfg));
    let result = runtime.execute(&agent, &input).await?;
    let (report, code) = match &result {
        ExecutionResult::Success {
            output,
            raw,
            attempts,
            usage,
        } => (
            json!({
                "status": "success",
                "output": output,
                "backend": raw.backend,
                "attempts": attempts,
                "usage": usage,
                "finish_reason": raw.finish_reason,
            }),
            exit_codes::OK,
        ),
        ExecutionResult::Failure(failure) => (
            json!({
                "status": "failure",
                "failure": failure,
                "backend": failure.backend,
                "attempts": failure.attempts,
                "usage": failure.usage,
            }),
            exit_codes::EXECUTION_FAILED,
        ),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(code)
}

async fn cmd_stream(prompt: &str, system: &str, config: &Path) -> Result<i32> {
    let cfg = load(config)?;
    let backend = Backend::from_config(&cfg, env_var).context("construct backend")?;
    let Some(gateway) = backend.as_gateway() else {
        bail!(
            "streaming requires a gateway_http backend (configured: {})",
            backend.id()
        );
    };

    let request = PromptRequest::new(system).user(prompt);
    let mut stream = gateway.stream(&request);
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            Ok(StreamEvent::Delta(text)) => {
                stdout.write_all(text.as_bytes()).context("write stdout")?;
                stdout.flush().context("flush stdout")?;
            }
            Ok(StreamEvent::Done(summary)) => {
                println!();
                let report = json!({
                    "usage": summary.usage,
                    "finish_reason": summary.finish_reason,
                });
                println!("{report}");
                return Ok(exit_codes::OK);
            }
            Err(err) => {
                println!();
                eprintln!("{err}");
                return Ok(exit_codes::EXECUTION_FAILED);
            }
        }
    }
    eprintln!("stream ended without a usage summary");
    Ok(exit_codes::EXECUTION_FAILED)
}

fn cmd_repair(file: Option<&Path>) -> Result<i32> {
    let text = match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    println!("{}", repair(&text));
    Ok(exit_codes::OK)
}

fn cmd_config(config: &Path) -> Result<i32> {
    let cfg = load(config)?;
    let rendered = toml::to_string_pretty(&cfg).context("serialize config toml")?;
    print!("{rendered}");
    Ok(exit_codes::OK)
}
