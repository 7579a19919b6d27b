//! Last-resort coercion: ask the backend to reformat a response it got wrong.
//!
//! Runs at most once per execution, after the parse budget is spent. The
//! reformatted text is only trusted when the model's self-reported confidence
//! reaches the configured threshold.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::agents::AgentSpec;
use crate::core::parse::{ParseFailure, extract_code_block};
use crate::core::types::{PromptRequest, RawResponse, Usage};
use crate::execute::{Runtime, parse_with_repair};
use crate::io::transport::{Transport, TransportError};

const COERCION_TEMPLATE: &str = include_str!("prompts/coercion.md");
const COERCION_SYSTEM: &str = "You repair the formatting of model replies. You never change their meaning.";

pub const REFORMATTED_LABEL: &str = "REFORMATTED";
pub const CONFIDENCE_LABEL: &str = "CONFIDENCE";

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("coercion", COERCION_TEMPLATE)
        .expect("coercion template should be valid");
    env
});

/// Reformatted text plus the model's confidence in it.
#[derive(Debug, Clone, PartialEq)]
pub struct CoercionOutcome {
    pub reformatted: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum CoercionError {
    #[error("coercion request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("coercion prompt: {0}")]
    Prompt(#[from] minijinja::Error),
    #[error("coercion reply unusable: {0}")]
    Malformed(ParseFailure),
    #[error("confidence {confidence} below threshold {threshold}")]
    BelowThreshold { confidence: f64, threshold: f64 },
    #[error("reformatted reply still rejected: {0}")]
    Reparse(ParseFailure),
}

/// Render the coercion request for a rejected response.
pub fn coercion_request(
    output_format: &str,
    failure: &ParseFailure,
    response: &str,
) -> Result<PromptRequest, minijinja::Error> {
    let template = TEMPLATES.get_template("coercion")?;
    let output_format = output_format.trim();
    let prompt = template.render(context! {
        output_format => if output_format.is_empty() { "(as originally requested)" } else { output_format },
        error => failure.to_string(),
        response => response.trim(),
    })?;
    Ok(PromptRequest::new(COERCION_SYSTEM).user(prompt))
}

static REFORMATTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#{0,3}[ \t]*REFORMATTED[ \t]*:[ \t]*")
        .expect("reformatted header regex should be valid")
});

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#{0,3}[ \t]*CONFIDENCE[ \t]*:[ \t]*(.*)$")
        .expect("confidence header regex should be valid")
});

/// Read the labeled sections out of a coercion reply.
///
/// The reformatted body runs up to the last `CONFIDENCE:` line, so it may itself
/// contain uppercase section headers. Confidence may be written as a fraction
/// (`0.95`) or a percentage (`95%`).
pub fn parse_coercion_reply(text: &str) -> Result<CoercionOutcome, ParseFailure> {
    let header = REFORMATTED_RE
        .find(text)
        .ok_or_else(|| ParseFailure::missing_section(REFORMATTED_LABEL))?;
    let confidence_line = CONFIDENCE_RE
        .captures_iter(&text[header.end()..])
        .last()
        .ok_or_else(|| ParseFailure::missing_section(CONFIDENCE_LABEL))?;

    let (Some(line), Some(value)) = (confidence_line.get(0), confidence_line.get(1)) else {
        return Err(ParseFailure::missing_section(CONFIDENCE_LABEL));
    };
    let body = text[header.end()..header.end() + line.start()].trim();
    if body.is_empty() {
        return Err(ParseFailure::missing_section(REFORMATTED_LABEL));
    }
    let reformatted = extract_code_block(body, None).unwrap_or_else(|_| body.to_string());

    let raw_confidence = value.as_str().trim();
    let token = raw_confidence.split_whitespace().next().unwrap_or_default();
    let (number, scale) = match token.strip_suffix('%') {
        Some(number) => (number, 100.0),
        None => (token, 1.0),
    };
    let confidence = number
        .parse::<f64>()
        .ok()
        .map(|value| value / scale)
        .filter(|value| (0.0..=1.0).contains(value))
        .ok_or_else(|| {
            ParseFailure::extraction(format!("confidence {raw_confidence:?} is not in [0, 1]"))
        })?;

    Ok(CoercionOutcome {
        reformatted,
        confidence,
    })
}

impl<T: Transport> Runtime<T> {
    /// Make one extra backend call asking for `raw` in the agent's format.
    ///
    /// On success the returned response carries the accepted text and a backend
    /// identifier suffixed with `+coerced`. The reply's usage is added to
    /// `usage` whenever a reply arrives, accepted or not.
    #[instrument(skip_all, fields(agent = agent.name()))]
    pub async fn coerce<A: AgentSpec>(
        &self,
        agent: &A,
        raw: &RawResponse,
        failure: &ParseFailure,
        usage: &mut Usage,
    ) -> Result<(A::Output, RawResponse), CoercionError> {
        let threshold = self.config().coercion.threshold;
        let request = coercion_request(&agent.output_format(), failure, &raw.text)?;
        let reply = self.send_once(&request).await?;
        *usage = usage.add(reply.usage);

        let outcome = parse_coercion_reply(&reply.text).map_err(CoercionError::Malformed)?;
        debug!(confidence = outcome.confidence, threshold, "coercion reply received");
        if outcome.confidence < threshold {
            return Err(CoercionError::BelowThreshold {
                confidence: outcome.confidence,
                threshold,
            });
        }

        let candidate = RawResponse {
            text: outcome.reformatted,
            backend: format!("{}+coerced", reply.backend),
            ..reply
        };
        let (output, accepted) = parse_with_repair(agent, &candidate, self.config().repair)
            .map_err(CoercionError::Reparse)?;
        info!(confidence = outcome.confidence, "coercion accepted");
        Ok((output, accepted))
    }
}
