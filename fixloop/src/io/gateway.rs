//! HTTP gateway backend using the chat-completion wire shape.
//!
//! Supports a single-shot mode and a streamed mode. A stream yields text
//! increments followed by exactly one [`StreamEvent::Done`] carrying usage;
//! any error ends the stream.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource, retry};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, instrument, warn};

use crate::core::types::{FinishReason, PromptRequest, RawResponse, Usage};
use crate::io::config::GatewayConfig;
use crate::io::http::{build_client, join_url, request_error, send_json, status_error};
use crate::io::transport::{Transport, TransportError, TransportErrorKind};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DONE_SENTINEL: &str = "[DONE]";

/// One item of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done(StreamSummary),
}

/// Final item of every successful stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

pub type ResponseStream = BoxStream<'static, Result<StreamEvent, TransportError>>;

#[derive(Debug)]
pub struct GatewayBackend {
    id: String,
    model: String,
    url: String,
    token: Option<String>,
    stream_send: bool,
    client: Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

impl GatewayBackend {
    pub fn new(
        cfg: &GatewayConfig,
        timeout: Duration,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: format!("gateway-http:{}", cfg.model),
            model: cfg.model.clone(),
            url: join_url(&cfg.endpoint, COMPLETIONS_PATH),
            token: env(&cfg.token_env).filter(|token| !token.trim().is_empty()),
            stream_send: cfg.stream,
            client: build_client(timeout)?,
        })
    }

    fn request(&self, request: &PromptRequest, stream: bool) -> RequestBuilder {
        let system = request.system.trim();
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|message| ChatMessage {
            role: message.role.as_str(),
            content: &message.content,
        }));
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };
        let builder = self.client.post(&self.url).json(&body);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_single(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        let json = send_json(&self.id, self.request(request, false)).await?;
        let response: ChatResponse = serde_json::from_value(json).map_err(|err| {
            TransportError::new(
                TransportErrorKind::Unknown,
                &self.id,
                format!("unexpected response shape: {err}"),
            )
        })?;
        let Some(choice) = response.choices.into_iter().next() else {
            return Err(TransportError::new(
                TransportErrorKind::Unknown,
                &self.id,
                "response has no choices",
            ));
        };
        let text = choice
            .message
            .and_then(|message| message.content)
            .unwrap_or_default();
        let finish_reason = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_tag)
            .unwrap_or_default();
        if finish_reason == FinishReason::ContentFilter && text.trim().is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::ContentFiltered,
                &self.id,
                "response withheld by content filter",
            ));
        }
        let usage = response
            .usage
            .map(Usage::from)
            .unwrap_or_else(|| Usage::estimate(request.char_count(), text.chars().count()));
        Ok(RawResponse::new(text, &self.id)
            .with_usage(usage)
            .with_finish_reason(finish_reason))
    }

    /// Open a streamed completion.
    ///
    /// Usage is estimated from character counts when the gateway sends none.
    /// Events logged while the stream is polled belong to a `gateway_stream` span.
    pub fn stream(&self, request: &PromptRequest) -> ResponseStream {
        let builder = self.request(request, true);
        let backend = self.id.clone();
        let prompt_chars = request.char_count();
        let span = debug_span!("gateway_stream", backend = %self.id);

        Box::pin(async_stream::stream! {
            let mut source = match EventSource::new(builder) {
                Ok(source) => source,
                Err(err) => {
                    yield Err(TransportError::new(
                        TransportErrorKind::MalformedRequest,
                        &backend,
                        err.to_string(),
                    ));
                    return;
                }
            };
            source.set_retry_policy(Box::new(retry::Never));

            let mut output_chars = 0usize;
            let mut usage = None;
            let mut finish_reason = FinishReason::Unknown;

            while let Some(event) = source.next().await {
                let message = match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => message,
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        source.close();
                        let body = response.text().await.unwrap_or_default();
                        warn!(parent: &span, %status, "gateway stream rejected");
                        yield Err(status_error(&backend, status, &body));
                        return;
                    }
                    Err(reqwest_eventsource::Error::Transport(err)) => {
                        source.close();
                        yield Err(request_error(&backend, &err));
                        return;
                    }
                    Err(err) => {
                        source.close();
                        yield Err(TransportError::new(
                            TransportErrorKind::Unknown,
                            &backend,
                            err.to_string(),
                        ));
                        return;
                    }
                };

                if message.data.trim() == DONE_SENTINEL {
                    break;
                }
                let chunk: ChatResponse = match serde_json::from_str(&message.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        source.close();
                        yield Err(TransportError::new(
                            TransportErrorKind::Unknown,
                            &backend,
                            format!("undecodable stream chunk: {err}"),
                        ));
                        return;
                    }
                };
                if let Some(wire) = chunk.usage {
                    usage = Some(Usage::from(wire));
                }
                for choice in chunk.choices {
                    if let Some(tag) = choice.finish_reason.as_deref() {
                        finish_reason = FinishReason::from_tag(tag);
                    }
                    let delta = choice.delta.and_then(|delta| delta.content);
                    if let Some(text) = delta.filter(|text| !text.is_empty()) {
                        output_chars += text.chars().count();
                        yield Ok(StreamEvent::Delta(text));
                    }
                }
            }
            source.close();

            let usage = usage.unwrap_or_else(|| Usage::estimate(prompt_chars, output_chars));
            debug!(parent: &span, output_chars, "gateway stream finished");
            yield Ok(StreamEvent::Done(StreamSummary { usage, finish_reason }));
        })
    }
}

/// Drain a stream into one response. Any error discards the increments seen so far.
pub async fn collect_stream(
    backend: &str,
    mut stream: ResponseStream,
) -> Result<RawResponse, TransportError> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Delta(delta) => text.push_str(&delta),
            StreamEvent::Done(summary) => {
                return Ok(RawResponse::new(text, backend)
                    .with_usage(summary.usage)
                    .with_finish_reason(summary.finish_reason));
            }
        }
    }
    Err(TransportError::new(
        TransportErrorKind::Network,
        backend,
        "stream ended without a usage summary",
    ))
}

#[async_trait]
impl Transport for GatewayBackend {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(backend = %self.id, streamed = self.stream_send))]
    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        if self.stream_send {
            collect_stream(&self.id, self.stream(request)).await
        } else {
            self.send_single(request).await
        }
    }
}
