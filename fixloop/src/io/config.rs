//! Runtime configuration stored in `fixloop.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "fixloop.toml";

/// Runtime configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// out of the box with a locally authenticated CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Retry budget for backend calls.
    pub transport: RetryPolicy,

    /// Retry budget for rejected responses (corrective follow-ups).
    pub parse: RetryPolicy,

    /// Run structural repair on malformed JSON before classifying it.
    pub repair: bool,

    pub coercion: CoercionConfig,

    pub backend: BackendConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transport: RetryPolicy::default(),
            parse: RetryPolicy::new(3, 1.0, 120),
            repair: true,
            coercion: CoercionConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoercionConfig {
    pub enabled: bool,
    /// Minimum self-reported confidence, in `[0, 1]`.
    pub threshold: f64,
}

impl Default for CoercionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.9,
        }
    }
}

/// Which backend to talk to, with its variant-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    HostedApi(HostedApiConfig),
    SubprocessCli(SubprocessConfig),
    GatewayHttp(GatewayConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::SubprocessCli(SubprocessConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostedApiConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding an API key (sent as `x-api-key`).
    pub api_key_env: String,
    /// Environment variable holding a delegated bearer token.
    pub auth_token_env: String,
    pub api_version: String,
}

impl Default for HostedApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            auth_token_env: "ANTHROPIC_AUTH_TOKEN".to_string(),
            api_version: "2023-06-01".to_string(),
        }
    }
}

/// How the subprocess reports its answer on stdout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Stdout is the reply text.
    #[default]
    Text,
    /// Stdout is a JSON envelope with `result` and optional `usage`.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubprocessConfig {
    /// Executable name or path, resolved on `PATH` on first use.
    pub program: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    pub model: Option<String>,
    /// Flag used to pass `model` (e.g. `--model`).
    pub model_flag: String,
    pub output_format: OutputFormat,
    /// Keep at most this many bytes of stdout/stderr.
    pub output_limit_bytes: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: None,
            model_flag: "--model".to_string(),
            output_format: OutputFormat::Text,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL; `/v1/chat/completions` is appended.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding an optional bearer token.
    pub token_env: String,
    /// Use the streamed mode for `send` as well.
    pub stream: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            model: "gpt-4o-mini".to_string(),
            token_env: "FIXLOOP_GATEWAY_TOKEN".to_string(),
            stream: false,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        self.transport.validate().context("transport")?;
        self.parse.validate().context("parse")?;
        let threshold = self.coercion.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "coercion.threshold must be within [0, 1] (got {threshold})"
            ));
        }
        match &self.backend {
            BackendConfig::HostedApi(cfg) => {
                require_non_empty("backend.endpoint", &cfg.endpoint)?;
                require_non_empty("backend.model", &cfg.model)?;
            }
            BackendConfig::SubprocessCli(cfg) => {
                require_non_empty("backend.program", &cfg.program)?;
                if cfg.output_limit_bytes == 0 {
                    return Err(anyhow!("backend.output_limit_bytes must be > 0"));
                }
            }
            BackendConfig::GatewayHttp(cfg) => {
                require_non_empty("backend.endpoint", &cfg.endpoint)?;
                require_non_empty("backend.model", &cfg.model)?;
            }
        }
        Ok(())
    }

    /// Apply `FIXLOOP_*` overrides looked up through `env`.
    ///
    /// Attempt, backoff and timeout overrides apply to both retry layers.
    /// `FIXLOOP_ENDPOINT` is ignored by the subprocess backend.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = env("FIXLOOP_MAX_ATTEMPTS") {
            let attempts: u32 = parse_env("FIXLOOP_MAX_ATTEMPTS", &value)?;
            self.transport.max_attempts = attempts;
            self.parse.max_attempts = attempts;
        }
        if let Some(value) = env("FIXLOOP_BACKOFF_BASE") {
            let base: f64 = parse_env("FIXLOOP_BACKOFF_BASE", &value)?;
            self.transport.backoff_base_secs = base;
            self.parse.backoff_base_secs = base;
        }
        if let Some(value) = env("FIXLOOP_TIMEOUT_SECS") {
            let secs: u64 = parse_env("FIXLOOP_TIMEOUT_SECS", &value)?;
            self.transport.attempt_timeout_secs = secs;
            self.parse.attempt_timeout_secs = secs;
        }
        if let Some(value) = env("FIXLOOP_COERCION") {
            self.coercion.enabled = parse_flag("FIXLOOP_COERCION", &value)?;
        }
        if let Some(value) = env("FIXLOOP_COERCION_THRESHOLD") {
            self.coercion.threshold = parse_env("FIXLOOP_COERCION_THRESHOLD", &value)?;
        }
        if let Some(model) = env("FIXLOOP_MODEL") {
            match &mut self.backend {
                BackendConfig::HostedApi(cfg) => cfg.model = model,
                BackendConfig::SubprocessCli(cfg) => cfg.model = Some(model),
                BackendConfig::GatewayHttp(cfg) => cfg.model = model,
            }
        }
        if let Some(endpoint) = env("FIXLOOP_ENDPOINT") {
            match &mut self.backend {
                BackendConfig::HostedApi(cfg) => cfg.endpoint = endpoint,
                BackendConfig::GatewayHttp(cfg) => cfg.endpoint = endpoint,
                BackendConfig::SubprocessCli(_) => {}
            }
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field} must be non-empty"));
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("parse {name}={value:?}"))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("parse {name}={other:?}: expected a boolean")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RuntimeConfig::default()`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        let cfg = RuntimeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the file, apply environment overrides, then validate the result.
pub fn load_effective_config(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env(env)?;
    cfg.validate().context("config after environment overrides")?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        let cfg = RuntimeConfig {
            backend: BackendConfig::GatewayHttp(GatewayConfig::default()),
            ..RuntimeConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        fs::write(
            &path,
            "repair = false\n\n[parse]\nmax_attempts = 5\n\n[backend]\nkind = \"gateway_http\"\nmodel = \"local\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(!cfg.repair);
        assert_eq!(cfg.parse.max_attempts, 5);
        assert_eq!(cfg.parse.backoff_base_secs, 2.0);
        let BackendConfig::GatewayHttp(gateway) = cfg.backend else {
            panic!("expected gateway backend");
        };
        assert_eq!(gateway.model, "local");
        assert_eq!(gateway.endpoint, GatewayConfig::default().endpoint);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        fs::write(&path, "[coercion]\nthreshold = 1.5\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("coercion.threshold"));
    }

    #[test]
    fn env_overrides_apply_to_both_layers() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(env_from(&[
            ("FIXLOOP_MAX_ATTEMPTS", "7"),
            ("FIXLOOP_BACKOFF_BASE", "0"),
            ("FIXLOOP_TIMEOUT_SECS", "9"),
            ("FIXLOOP_COERCION", "yes"),
            ("FIXLOOP_COERCION_THRESHOLD", "0.5"),
            ("FIXLOOP_MODEL", "small"),
        ]))
        .expect("apply");
        assert_eq!(cfg.transport.max_attempts, 7);
        assert_eq!(cfg.parse.max_attempts, 7);
        assert_eq!(cfg.parse.backoff_base_secs, 0.0);
        assert_eq!(cfg.transport.attempt_timeout_secs, 9);
        assert!(cfg.coercion.enabled);
        assert_eq!(cfg.coercion.threshold, 0.5);
        let BackendConfig::SubprocessCli(sub) = cfg.backend else {
            panic!("expected subprocess backend");
        };
        assert_eq!(sub.model.as_deref(), Some("small"));
    }

    #[test]
    fn env_override_errors_name_the_variable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_effective_config(
            &temp.path().join("missing.toml"),
            env_from(&[("FIXLOOP_MAX_ATTEMPTS", "many")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("FIXLOOP_MAX_ATTEMPTS"));
    }

    #[test]
    fn env_overrides_are_validated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_effective_config(
            &temp.path().join("missing.toml"),
            env_from(&[("FIXLOOP_MAX_ATTEMPTS", "0")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }
}
