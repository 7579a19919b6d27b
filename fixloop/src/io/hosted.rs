//! Hosted API backend speaking the Messages wire format.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{FinishReason, PromptRequest, RawResponse, Usage};
use crate::io::config::HostedApiConfig;
use crate::io::http::{build_client, join_url, send_json};
use crate::io::transport::{Transport, TransportError, TransportErrorKind};

const MESSAGES_PATH: &str = "/v1/messages";
const OAUTH_BETA: &str = "oauth-2025-04-20";

#[derive(Clone)]
enum Credential {
    ApiKey(String),
    /// Delegated token from a signed-in session.
    Token(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(..)"),
            Credential::Token(_) => f.write_str("Token(..)"),
        }
    }
}

/// Client for a hosted model API. One HTTP request per `send`.
#[derive(Debug)]
pub struct HostedApiBackend {
    id: String,
    model: String,
    url: String,
    api_version: String,
    credential: Option<Credential>,
    credential_hint: String,
    client: Client,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl HostedApiBackend {
    /// Build the client. An API key wins over a delegated token when both are set;
    /// a backend without either fails every call with `unavailable`.
    pub fn new(
        cfg: &HostedApiConfig,
        timeout: Duration,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let non_empty = |name: &str| env(name).filter(|value| !value.trim().is_empty());
        let credential = non_empty(&cfg.api_key_env)
            .map(Credential::ApiKey)
            .or_else(|| non_empty(&cfg.auth_token_env).map(Credential::Token));
        Ok(Self {
            id: format!("hosted-api:{}", cfg.model),
            model: cfg.model.clone(),
            url: join_url(&cfg.endpoint, MESSAGES_PATH),
            api_version: cfg.api_version.clone(),
            credential,
            credential_hint: format!("set {} or {}", cfg.api_key_env, cfg.auth_token_env),
            client: build_client(timeout)?,
        })
    }

    /// `prompt_chars` feeds the usage estimate when the body reports none.
    fn decode(
        &self,
        body: serde_json::Value,
        prompt_chars: usize,
    ) -> Result<RawResponse, TransportError> {
        let response: MessagesResponse = serde_json::from_value(body).map_err(|err| {
            TransportError::new(
                TransportErrorKind::Unknown,
                &self.id,
                format!("unexpected response shape: {err}"),
            )
        })?;
        let text: String = response
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        let finish_reason = response
            .stop_reason
            .as_deref()
            .map(FinishReason::from_tag)
            .unwrap_or_default();
        if finish_reason == FinishReason::ContentFilter && text.trim().is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::ContentFiltered,
                &self.id,
                "model refused to answer",
            ));
        }
        let usage = response
            .usage
            .map(|usage| Usage::new(usage.input_tokens, usage.output_tokens))
            .unwrap_or_else(|| Usage::estimate(prompt_chars, text.chars().count()));
        Ok(RawResponse::new(text, &self.id)
            .with_usage(usage)
            .with_finish_reason(finish_reason))
    }
}

#[async_trait]
impl Transport for HostedApiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(backend = %self.id, turns = request.messages.len()))]
    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        let Some(credential) = &self.credential else {
            return Err(TransportError::new(
                TransportErrorKind::Unavailable,
                &self.id,
                format!("no credential configured ({})", self.credential_hint),
            ));
        };

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.trim(),
            messages: request
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .header("anthropic-version", &self.api_version)
            .json(&body);
        builder = match credential {
            Credential::ApiKey(key) => builder.header("x-api-key", key),
            Credential::Token(token) => builder
                .bearer_auth(token)
                .header("anthropic-beta", OAUTH_BETA),
        };

        debug!(url = %self.url, "posting messages request");
        let json = send_json(&self.id, builder).await?;
        self.decode(json, request.char_count())
    }
}
