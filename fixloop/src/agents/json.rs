//! Ready-made agent producing a JSON value, optionally checked against a JSON Schema.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use minijinja::Environment;
use regex::Regex;
use serde_json::Value;

use crate::agents::{AgentSpec, BuildError};
use crate::core::parse::{ParseFailure, parse_json};
use crate::core::types::PromptRequest;

static REQUIRED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^"([^"]+)" is a required property"#).expect("required regex should be valid")
});

/// Agent whose user prompt is a minijinja template rendered with the input value.
pub struct JsonAgent {
    name: String,
    system: String,
    template: String,
    schema: Option<Value>,
    validator: Option<Validator>,
    temperature: f32,
    max_tokens: u32,
}

impl JsonAgent {
    pub fn new(name: impl Into<String>, system: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
            template: template.into(),
            schema: None,
            validator: None,
            temperature: PromptRequest::DEFAULT_TEMPERATURE,
            max_tokens: PromptRequest::DEFAULT_MAX_TOKENS,
        }
    }

    /// Require outputs to validate against `schema`.
    pub fn with_schema(mut self, schema: Value) -> Result<Self> {
        let validator = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
        self.validator = Some(validator);
        self.schema = Some(schema);
        Ok(self)
    }

    pub fn with_limits(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn validate(&self, value: &Value) -> Result<(), ParseFailure> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let messages: Vec<String> = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        let Some(first) = messages.first() else {
            return Ok(());
        };
        let field = REQUIRED_RE
            .captures(first)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        Err(ParseFailure::schema_violation(
            field,
            format!("schema validation failed: {}", messages.join("; ")),
        ))
    }
}

impl AgentSpec for JsonAgent {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> &str {
        &self.name
    }

    fn build_prompt(&self, input: &Value) -> Result<PromptRequest, BuildError> {
        if !(input.is_object() || input.is_null()) {
            return Err(BuildError::InvalidInput(
                "template context must be a JSON object".to_string(),
            ));
        }
        let env = Environment::new();
        let user = env.render_str(&self.template, input)?;
        let mut system = self.system.trim().to_string();
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str("Respond with a single JSON value and nothing else.");
        Ok(PromptRequest::new(system)
            .user(user.trim())
            .temperature(self.temperature)
            .max_tokens(self.max_tokens))
    }

    fn parse_response(&self, text: &str) -> Result<Value, ParseFailure> {
        let value: Value = parse_json(text)?;
        self.validate(&value)?;
        Ok(value)
    }

    fn output_format(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "A single JSON value matching this JSON Schema:\n{}",
                serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
            ),
            None => "A single JSON value.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::parse::ParseFailureKind;

    fn answer_agent() -> JsonAgent {
        JsonAgent::new("answer", "Be exact.", "Return {{ number }} as {\"value\": n}.")
            .with_schema(json!({
                "type": "object",
                "required": ["value"],
                "properties": {"value": {"type": "integer"}}
            }))
            .expect("schema")
    }

    #[test]
    fn prompt_renders_template_with_input() {
        let request = answer_agent()
            .build_prompt(&json!({"number": 42}))
            .expect("prompt");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].content, "Return 42 as {\"value\": n}.");
        assert!(request.system.starts_with("Be exact."));
    }

    #[test]
    fn non_object_input_is_a_build_error() {
        let err = answer_agent().build_prompt(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, BuildError::InvalidInput(_)));
    }

    #[test]
    fn broken_template_is_a_build_error() {
        let agent = JsonAgent::new("bad", "", "{% if %}");
        let err = agent.build_prompt(&json!({})).unwrap_err();
        assert!(matches!(err, BuildError::Template(_)));
    }

    #[test]
    fn schema_violations_name_the_missing_field() {
        let err = answer_agent().parse_response("{\"other\": 1}").unwrap_err();
        assert_eq!(
            err.kind,
            ParseFailureKind::SchemaViolation(Some("value".to_string()))
        );
    }

    #[test]
    fn invalid_json_is_structural() {
        let err = answer_agent().parse_response("{\"value\": 4").unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn valid_output_is_returned() {
        let value = answer_agent().parse_response("{\"value\": 42}").expect("parse");
        assert_eq!(value, json!({"value": 42}));
        assert!(answer_agent().output_format().contains("\"required\""));
    }
}
