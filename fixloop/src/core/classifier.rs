//! Deterministic classification of parse failures.
//!
//! Applied only after a response has been received and rejected by the
//! agent's parser. Transport failures have their own transient/permanent
//! judgment in [`crate::io::transport`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::parse::{ParseFailure, ParseFailureKind, has_section_header};

/// Responses shorter than this are treated as "nothing was generated".
pub const SHORT_RESPONSE_CHARS: usize = 50;

/// Generic extraction failures are only retried above this length.
pub const EXTRACTION_RETRY_MIN_CHARS: usize = 100;

/// Parse-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClassification {
    /// Content is likely present but the formatting broke extraction.
    TransientFormat,
    /// Content is likely present but could not be pulled out cleanly.
    TransientExtraction,
    /// Output has the wrong shape; asking again will not fix it.
    PermanentSchema,
    /// Nothing usable was generated.
    PermanentMissing,
    Timeout,
    Unknown,
}

impl ErrorClassification {
    /// Whether an ordinary retry with a corrective follow-up is worthwhile.
    ///
    /// `Unknown` is retried: it is the conservative choice when nothing
    /// better is known.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClassification::TransientFormat
                | ErrorClassification::TransientExtraction
                | ErrorClassification::Unknown
        )
    }

    /// Final classification once coercion has also failed.
    ///
    /// Nothing is left to retry, so a retryable classification becomes
    /// `PermanentSchema` when the text has a brace pair or a section header
    /// and `PermanentMissing` when it has neither.
    pub fn settle(self, raw_text: &str) -> Self {
        if !self.is_retryable() {
            return self;
        }
        if has_brace_pair(raw_text) || has_section_header(raw_text) {
            ErrorClassification::PermanentSchema
        } else {
            ErrorClassification::PermanentMissing
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClassification::TransientFormat => "transient-format",
            ErrorClassification::TransientExtraction => "transient-extraction",
            ErrorClassification::PermanentSchema => "permanent-schema",
            ErrorClassification::PermanentMissing => "permanent-missing",
            ErrorClassification::Timeout => "timeout",
            ErrorClassification::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a free-text parse error message against the response it rejected.
///
/// Rules, first match wins:
/// 1. the message mentions a timeout → `Timeout`;
/// 2. an expected section/block is absent → `PermanentMissing` for short
///    responses, `TransientFormat` otherwise;
/// 3. JSON failed to decode → `TransientExtraction` when the text holds a
///    brace pair, `PermanentMissing` otherwise;
/// 4. schema/type/required-field violation → `PermanentSchema`;
/// 5. generic extraction/parse/format failure → `TransientExtraction` for
///    long responses, `PermanentMissing` otherwise;
/// 6. anything else → `Unknown`.
pub fn classify_message(message: &str, raw_text: &str) -> ErrorClassification {
    let msg = message.to_lowercase();

    if mentions_timeout(&msg) {
        return ErrorClassification::Timeout;
    }
    if mentions_absent_section(&msg) {
        return missing_section(raw_text);
    }
    if mentions_json_decode(&msg) {
        return invalid_json(raw_text);
    }
    if mentions_schema(&msg) {
        return ErrorClassification::PermanentSchema;
    }
    if ["extract", "parse", "format"]
        .iter()
        .any(|needle| msg.contains(needle))
    {
        return extraction(raw_text);
    }
    ErrorClassification::Unknown
}

/// Classify a structured parse failure with the same decision table.
pub fn classify_failure(failure: &ParseFailure, raw_text: &str) -> ErrorClassification {
    match &failure.kind {
        ParseFailureKind::Timeout => ErrorClassification::Timeout,
        ParseFailureKind::MissingSection(_) => missing_section(raw_text),
        ParseFailureKind::InvalidJson => invalid_json(raw_text),
        ParseFailureKind::SchemaViolation(_) => ErrorClassification::PermanentSchema,
        ParseFailureKind::Extraction => extraction(raw_text),
        ParseFailureKind::Other => classify_message(&failure.message, raw_text),
    }
}

fn missing_section(raw_text: &str) -> ErrorClassification {
    if text_len(raw_text) < SHORT_RESPONSE_CHARS {
        ErrorClassification::PermanentMissing
    } else {
        ErrorClassification::TransientFormat
    }
}

fn invalid_json(raw_text: &str) -> ErrorClassification {
    if has_brace_pair(raw_text) {
        ErrorClassification::TransientExtraction
    } else {
        ErrorClassification::PermanentMissing
    }
}

fn extraction(raw_text: &str) -> ErrorClassification {
    if text_len(raw_text) > EXTRACTION_RETRY_MIN_CHARS {
        ErrorClassification::TransientExtraction
    } else {
        ErrorClassification::PermanentMissing
    }
}

fn text_len(raw_text: &str) -> usize {
    raw_text.trim().chars().count()
}

/// An opening brace followed somewhere later by a closing one.
fn has_brace_pair(raw_text: &str) -> bool {
    match (raw_text.find('{'), raw_text.rfind('}')) {
        (Some(open), Some(close)) => open < close,
        _ => false,
    }
}

fn mentions_timeout(msg: &str) -> bool {
    msg.contains("timeout") || msg.contains("timed out")
}

fn mentions_absent_section(msg: &str) -> bool {
    let absent = ["missing", "no ", "not found", "absent", "without"]
        .iter()
        .any(|needle| msg.contains(needle));
    let section = ["section", "block"]
        .iter()
        .any(|needle| msg.contains(needle));
    absent && section
}

fn mentions_json_decode(msg: &str) -> bool {
    msg.contains("jsondecodeerror")
        || (msg.contains("json")
            && ["decode", "expecting", "invalid", "eof", "unterminated", "syntax"]
                .iter()
                .any(|needle| msg.contains(needle)))
}

fn mentions_schema(msg: &str) -> bool {
    [
        "schema",
        "invalid type",
        "type error",
        "required",
        "missing field",
        "validation",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: &str = "Here is the implementation you asked for, written carefully and \
                        explained step by step so that nothing is left out of the answer.";

    #[test]
    fn timeout_wins_over_everything_else() {
        assert_eq!(
            classify_message("JSON decode timed out while missing block", LONG),
            ErrorClassification::Timeout
        );
    }

    #[test]
    fn missing_section_depends_on_response_length() {
        assert_eq!(
            classify_message("Missing CODE section", "ok"),
            ErrorClassification::PermanentMissing
        );
        assert_eq!(
            classify_message("Missing CODE section", LONG),
            ErrorClassification::TransientFormat
        );
    }

    #[test]
    fn json_decode_depends_on_brace_pair() {
        assert_eq!(
            classify_message("JSON decode error: expecting value", "{\"a\": }"),
            ErrorClassification::TransientExtraction
        );
        assert_eq!(
            classify_message("JSON decode error: expecting value", "sorry, cannot help"),
            ErrorClassification::PermanentMissing
        );
        assert_eq!(
            classify_message("invalid json", "} backwards {"),
            ErrorClassification::PermanentMissing
        );
    }

    #[test]
    fn schema_violations_are_permanent() {
        assert_eq!(
            classify_message("required property 'value' is absent from object", LONG),
            ErrorClassification::PermanentSchema
        );
        assert_eq!(
            classify_message("missing field `value`", LONG),
            ErrorClassification::PermanentSchema
        );
    }

    #[test]
    fn generic_extraction_depends_on_length() {
        assert_eq!(
            classify_message("could not extract answer", LONG),
            ErrorClassification::TransientExtraction
        );
        assert_eq!(
            classify_message("could not extract answer", "short"),
            ErrorClassification::PermanentMissing
        );
    }

    #[test]
    fn unrecognized_messages_are_unknown_and_retryable() {
        let classification = classify_message("the moon is in the wrong phase", LONG);
        assert_eq!(classification, ErrorClassification::Unknown);
        assert!(classification.is_retryable());
    }

    #[test]
    fn classification_is_deterministic() {
        let inputs = [
            ("Missing CODE section", LONG),
            ("JSON decode error", "{}"),
            ("schema mismatch", ""),
            ("weird", "x"),
        ];
        for (msg, text) in inputs {
            assert_eq!(classify_message(msg, text), classify_message(msg, text));
        }
    }

    #[test]
    fn structured_failures_follow_the_same_table() {
        assert_eq!(
            ParseFailure::missing_section("CODE").classify("tiny"),
            ErrorClassification::PermanentMissing
        );
        assert_eq!(
            ParseFailure::missing_section("CODE").classify(LONG),
            ErrorClassification::TransientFormat
        );
        assert_eq!(
            ParseFailure::invalid_json("eof").classify("{\"value\": 42, }"),
            ErrorClassification::TransientExtraction
        );
        assert_eq!(
            ParseFailure::schema_violation(Some("value".into()), "bad").classify(LONG),
            ErrorClassification::PermanentSchema
        );
        assert_eq!(
            ParseFailure::timeout("validator hung").classify(LONG),
            ErrorClassification::Timeout
        );
        assert_eq!(
            ParseFailure::other("odd").classify(LONG),
            ErrorClassification::Unknown
        );
    }

    #[test]
    fn settled_classifications_are_never_retryable() {
        let braced = "I could not quite format this but the value is {value: 42} as asked.";
        assert_eq!(
            ErrorClassification::TransientExtraction.settle(braced),
            ErrorClassification::PermanentSchema
        );
        assert_eq!(
            ErrorClassification::TransientFormat.settle("SUMMARY: prints hello\nno code here"),
            ErrorClassification::PermanentSchema
        );
        assert_eq!(
            ErrorClassification::Unknown.settle(LONG),
            ErrorClassification::PermanentMissing
        );
        assert_eq!(
            ErrorClassification::Timeout.settle(braced),
            ErrorClassification::Timeout
        );
        assert_eq!(
            ErrorClassification::PermanentMissing.settle(braced),
            ErrorClassification::PermanentMissing
        );
    }

    #[test]
    fn only_transient_and_unknown_are_retryable() {
        assert!(ErrorClassification::TransientFormat.is_retryable());
        assert!(ErrorClassification::TransientExtraction.is_retryable());
        assert!(!ErrorClassification::PermanentSchema.is_retryable());
        assert!(!ErrorClassification::PermanentMissing.is_retryable());
        assert!(!ErrorClassification::Timeout.is_retryable());
    }
}
