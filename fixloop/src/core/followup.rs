//! Corrective follow-up turns sent after a rejected response.

use crate::core::parse::{ParseFailure, ParseFailureKind};

/// Build the user turn asking the model to fix its previous reply.
///
/// `output_format` is the agent's own description of the expected output and
/// is appended when non-empty.
pub fn corrective_message(failure: &ParseFailure, output_format: &str) -> String {
    let problem = match &failure.kind {
        ParseFailureKind::MissingSection(name) => {
            format!("Your previous response was missing the {name} section.")
        }
        ParseFailureKind::InvalidJson => {
            "Your previous response did not contain valid JSON.".to_string()
        }
        ParseFailureKind::SchemaViolation(Some(field)) => {
            format!("Your previous response had an invalid or missing `{field}` field.")
        }
        ParseFailureKind::SchemaViolation(None) => {
            "Your previous response did not match the expected structure.".to_string()
        }
        ParseFailureKind::Extraction => {
            "The expected content could not be extracted from your previous response.".to_string()
        }
        ParseFailureKind::Timeout | ParseFailureKind::Other => {
            "Your previous response could not be used.".to_string()
        }
    };

    let mut message = format!("{problem}\nError: {}", failure.message.trim());
    let output_format = output_format.trim();
    if !output_format.is_empty() {
        message.push_str("\n\nExpected format:\n");
        message.push_str(output_format);
    }
    message.push_str("\n\nReply again with the complete answer in the expected format.");
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_names_the_section() {
        let message = corrective_message(&ParseFailure::missing_section("CODE"), "");
        assert!(message.starts_with("Your previous response was missing the CODE section."));
        assert!(!message.contains("Expected format"));
    }

    #[test]
    fn schema_violation_names_the_field_and_format() {
        let failure = ParseFailure::schema_violation(Some("value".into()), "missing field `value`");
        let message = corrective_message(&failure, "{\"value\": <integer>}");
        assert!(message.contains("`value` field"));
        assert!(message.contains("Expected format:\n{\"value\": <integer>}"));
    }
}
