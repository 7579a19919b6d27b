//! Transport abstraction for model backends.
//!
//! The [`Transport`] trait decouples execution from the actual model backend.
//! Production code dispatches through the closed [`Backend`] set; tests use
//! scripted transports that replay predetermined responses without any I/O.

use async_trait::async_trait;
use thiserror::Error;

pub use crate::core::types::TransportErrorKind;
use crate::core::types::{PromptRequest, RawResponse};
use crate::io::config::{BackendConfig, RuntimeConfig};
use crate::io::gateway::GatewayBackend;
use crate::io::hosted::HostedApiBackend;
use crate::io::subprocess::SubprocessBackend;

/// A backend call that produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{backend}: {kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub backend: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        backend: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn timeout(backend: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            backend,
            format!("no response within {:?}", after),
        )
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Abstraction over model backends: send one structured prompt, get raw text.
///
/// Implementations make exactly one backend call per `send` and never return
/// partial data on failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier reported in [`RawResponse::backend`].
    fn id(&self) -> &str;

    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError>;
}

/// The closed set of production backends.
#[derive(Debug)]
pub enum Backend {
    HostedApi(HostedApiBackend),
    SubprocessCli(SubprocessBackend),
    GatewayHttp(GatewayBackend),
}

impl Backend {
    /// Construct the backend described by `config.backend`.
    ///
    /// Credentials are looked up through `env` once, here. Each backend enforces
    /// the transport attempt timeout on its own calls.
    pub fn from_config(
        config: &RuntimeConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let timeout = config.transport.attempt_timeout();
        Ok(match &config.backend {
            BackendConfig::HostedApi(cfg) => {
                Backend::HostedApi(HostedApiBackend::new(cfg, timeout, env)?)
            }
            BackendConfig::SubprocessCli(cfg) => {
                Backend::SubprocessCli(SubprocessBackend::new(cfg.clone(), timeout))
            }
            BackendConfig::GatewayHttp(cfg) => {
                Backend::GatewayHttp(GatewayBackend::new(cfg, timeout, env)?)
            }
        })
    }

    pub fn as_gateway(&self) -> Option<&GatewayBackend> {
        match self {
            Backend::GatewayHttp(gateway) => Some(gateway),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for Backend {
    fn id(&self) -> &str {
        match self {
            Backend::HostedApi(backend) => backend.id(),
            Backend::SubprocessCli(backend) => backend.id(),
            Backend::GatewayHttp(backend) => backend.id(),
        }
    }

    async fn send(&self, request: &PromptRequest) -> Result<RawResponse, TransportError> {
        match self {
            Backend::HostedApi(backend) => backend.send(request).await,
            Backend::SubprocessCli(backend) => backend.send(request).await,
            Backend::GatewayHttp(backend) => backend.send(request).await,
        }
    }
}
