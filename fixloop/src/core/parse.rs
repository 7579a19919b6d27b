//! Structured parse failures and extraction helpers for agent parsers.
//!
//! Parsers report *what* went wrong as a [`ParseFailureKind`] so that the
//! classifier and the follow-up builder work on data instead of matching
//! English phrases in error messages.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use thiserror::Error;

use crate::core::classifier::{ErrorClassification, classify_failure};

/// What a parser could not find or accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailureKind {
    /// A required labeled section or fenced block is absent.
    MissingSection(String),
    /// Text that should be JSON does not decode.
    InvalidJson,
    /// JSON decoded but does not have the expected shape.
    SchemaViolation(Option<String>),
    /// The expected content could not be pulled out of the text.
    Extraction,
    /// Validating the output exceeded a time limit.
    Timeout,
    Other,
}

impl fmt::Display for ParseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailureKind::MissingSection(name) => write!(f, "missing section {name}"),
            ParseFailureKind::InvalidJson => f.write_str("invalid json"),
            ParseFailureKind::SchemaViolation(Some(field)) => {
                write!(f, "schema violation at {field}")
            }
            ParseFailureKind::SchemaViolation(None) => f.write_str("schema violation"),
            ParseFailureKind::Extraction => f.write_str("extraction failed"),
            ParseFailureKind::Timeout => f.write_str("timeout"),
            ParseFailureKind::Other => f.write_str("parse failure"),
        }
    }
}

/// A parser's refusal of a raw response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub message: String,
}

impl ParseFailure {
    pub fn new(kind: ParseFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_section(name: impl Into<String>) -> Self {
        let name = name.into();
        let message = format!("response has no {name} section");
        Self::new(ParseFailureKind::MissingSection(name), message)
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::new(ParseFailureKind::InvalidJson, message)
    }

    pub fn schema_violation(field: Option<String>, message: impl Into<String>) -> Self {
        Self::new(ParseFailureKind::SchemaViolation(field), message)
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(ParseFailureKind::Extraction, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ParseFailureKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ParseFailureKind::Other, message)
    }

    /// Failures caused by broken structure rather than wrong content.
    ///
    /// Only these are worth running through structural repair.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            ParseFailureKind::InvalidJson | ParseFailureKind::Extraction
        )
    }

    /// Classify this failure against the response text that caused it.
    pub fn classify(&self, raw_text: &str) -> ErrorClassification {
        classify_failure(self, raw_text)
    }
}

/// Decode `text` as JSON of type `T`, mapping serde errors onto failure kinds.
///
/// Syntax and premature end of input become [`ParseFailureKind::InvalidJson`];
/// well-formed JSON of the wrong shape becomes
/// [`ParseFailureKind::SchemaViolation`] naming the offending field when serde
/// reports one.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ParseFailure> {
    serde_json::from_str(text.trim()).map_err(|err| match err.classify() {
        Category::Data => ParseFailure::schema_violation(field_from_serde(&err), err.to_string()),
        Category::Syntax | Category::Eof => ParseFailure::invalid_json(err.to_string()),
        Category::Io => ParseFailure::other(err.to_string()),
    })
}

fn field_from_serde(err: &serde_json::Error) -> Option<String> {
    static FIELD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"field `([^`]+)`").expect("field regex should be valid"));
    FIELD_RE
        .captures(&err.to_string())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

static SECTION_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#{0,3}[ \t]*([A-Z][A-Z0-9_]*(?: [A-Z0-9_]+)*)[ \t]*:[ \t]*")
        .expect("section header regex should be valid")
});

/// Whether `text` has at least one uppercase `LABEL:` header line.
pub fn has_section_header(text: &str) -> bool {
    SECTION_HEADER_RE.is_match(text)
}

/// Extract the body of an uppercase `LABEL:` section.
///
/// The body runs from the header to the next uppercase header or the end of
/// the text. Matching is exact on the label (callers pass uppercase labels).
pub fn extract_section<'a>(text: &'a str, label: &str) -> Result<&'a str, ParseFailure> {
    let headers: Vec<_> = SECTION_HEADER_RE.captures_iter(text).collect();
    for (idx, caps) in headers.iter().enumerate() {
        let (Some(name), Some(whole)) = (caps.get(1), caps.get(0)) else {
            continue;
        };
        if name.as_str() != label {
            continue;
        }
        let end = headers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(text.len());
        let body = text[whole.end()..end].trim();
        if body.is_empty() {
            return Err(ParseFailure::missing_section(label));
        }
        return Ok(body);
    }
    Err(ParseFailure::missing_section(label))
}

static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+.-]*)[ \t]*\r?\n(.*?)```")
        .expect("code block regex should be valid")
});

/// Extract the first fenced code block, optionally requiring a language tag.
pub fn extract_code_block(text: &str, lang: Option<&str>) -> Result<String, ParseFailure> {
    let found = CODE_BLOCK_RE.captures_iter(text).find_map(|caps| {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2)?.as_str();
        match lang {
            Some(wanted) if !tag.eq_ignore_ascii_case(wanted) => None,
            _ => Some(body.trim_end().to_string()),
        }
    });
    found.ok_or_else(|| match lang {
        Some(wanted) => ParseFailure::missing_section(format!("{wanted} code block")),
        None => ParseFailure::missing_section("code block"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: i64,
    }

    #[test]
    fn parse_json_accepts_surrounding_whitespace() {
        let answer: Answer = parse_json("  {\"value\": 42}\n").expect("parse");
        assert_eq!(answer, Answer { value: 42 });
    }

    #[test]
    fn parse_json_reports_syntax_errors_as_invalid_json() {
        let err = parse_json::<Answer>("{\"value\": 42,").unwrap_err();
        assert_eq!(err.kind, ParseFailureKind::InvalidJson);
        assert!(err.is_structural());
    }

    #[test]
    fn parse_json_reports_missing_field_as_schema_violation() {
        let err = parse_json::<Answer>("{\"other\": 1}").unwrap_err();
        assert_eq!(
            err.kind,
            ParseFailureKind::SchemaViolation(Some("value".to_string()))
        );
        assert!(!err.is_structural());
    }

    #[test]
    fn parse_json_reports_wrong_type_as_schema_violation() {
        let err = parse_json::<Answer>("{\"value\": \"42\"}").unwrap_err();
        assert!(matches!(err.kind, ParseFailureKind::SchemaViolation(_)));
    }

    #[test]
    fn extract_section_stops_at_next_header() {
        let text = "REFORMATTED:\n{\"value\": 1}\nCONFIDENCE: 0.9\n";
        assert_eq!(
            extract_section(text, "REFORMATTED").expect("section"),
            "{\"value\": 1}"
        );
        assert_eq!(extract_section(text, "CONFIDENCE").expect("section"), "0.9");
    }

    #[test]
    fn extract_section_reports_missing_label() {
        let err = extract_section("nothing here", "CODE").unwrap_err();
        assert_eq!(
            err.kind,
            ParseFailureKind::MissingSection("CODE".to_string())
        );
    }

    #[test]
    fn extract_section_treats_empty_body_as_missing() {
        let err = extract_section("CODE:\nNOTES: hi", "CODE").unwrap_err();
        assert!(matches!(err.kind, ParseFailureKind::MissingSection(_)));
    }

    #[test]
    fn extract_code_block_honors_language_tag() {
        let text = "intro\n```text\nnope\n```\n```python\nprint(1)\n```\n";
        assert_eq!(
            extract_code_block(text, Some("python")).expect("block"),
            "print(1)"
        );
        assert_eq!(extract_code_block(text, None).expect("block"), "nope");
    }

    #[test]
    fn extract_code_block_missing_names_the_language() {
        let err = extract_code_block("no fences", Some("rust")).unwrap_err();
        assert_eq!(
            err.kind,
            ParseFailureKind::MissingSection("rust code block".to_string())
        );
    }
}
