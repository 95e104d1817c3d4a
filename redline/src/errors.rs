//! Error taxonomy and boundary sanitization.
//!
//! Every error is logged in full where it is caught; what crosses the system
//! boundary is the categorized, templated text from [`Error::user_message`].
//! Only `PaymentRequired` and `Validation` surface specific detail, since
//! those carry no secrets.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid request data; names the field that failed validation.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Authentication required but not provided.
    #[error("not authenticated")]
    Authentication,

    /// Caller lacks the privilege for the operation.
    #[error("not authorized")]
    Authorization,

    /// Requested resource does not exist (or is not visible to the caller).
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Insufficient credit balance at admission time.
    #[error("insufficient credits: need {required}, have {balance}")]
    PaymentRequired { required: i64, balance: i64 },

    /// Fixed-window rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimit { retry_after: Duration },

    /// Bad or unwhitelisted model in the stored tier configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The provider refused to produce a result. Retrying with the same
    /// input cannot resolve a refusal.
    #[error("model {model} refused the request")]
    ModelRefused { model: String },

    /// Generation was cut short by the output token limit.
    #[error("generation truncated by output token limit")]
    OutputTooLarge,

    /// The model response contained no parseable JSON object. Carries the
    /// raw text and model id as diagnostic payload; never surfaced to
    /// non-privileged callers.
    #[error("malformed result from model {model}")]
    MalformedResult { model: String, raw: String },

    /// The document yielded no extractable text (e.g. an image-only scan).
    #[error("document contains no extractable text")]
    EmptyDocument,

    /// Provider or network failure. The only retryable class; `timeout`
    /// distinguishes deadline expiry from other transport failures in logs.
    #[error("{}: {message}", if *timeout { "external service timeout" } else { "external service error" })]
    ExternalService { message: String, timeout: bool },

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Generic per-category message used whenever a raw message trips the
/// sensitive-content filter.
const GENERIC_SERVER_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

/// Hard cap on anything that passes through sanitization.
const MAX_BOUNDARY_MESSAGE_LEN: usize = 150;

/// Lowercased substrings that indicate sensitive content in a raw message.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "api key",
    "api_key",
    "apikey",
    "token",
    "credential",
    "private",
    "connection string",
    "database url",
    "hostname",
    "mongodb://",
    "postgresql://",
    "postgres://",
    "mysql://",
    "redis://",
    "stack trace",
    "backtrace",
    "column",
    "table",
    "schema",
    "sql",
    "syntax error",
];

impl Error {
    pub fn external(message: impl Into<String>) -> Self {
        Error::ExternalService {
            message: message.into(),
            timeout: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::ExternalService {
            message: message.into(),
            timeout: true,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the queue's backoff policy should retry this failure.
    ///
    /// Only genuinely transient classes qualify. Permanent classes still
    /// pass through the same retry budget when they occur mid-attempt, but
    /// are expected to fail identically every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExternalService { .. })
    }

    /// Classes that cannot meaningfully recur: dead-letter immediately
    /// instead of burning the retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Validation { .. }
                | Error::Authentication
                | Error::Authorization
                | Error::PaymentRequired { .. }
        )
    }

    /// The categorized, templated message that may cross the system
    /// boundary. No file paths, connection strings, hostnames, stack
    /// frames, or raw provider text.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { field, message } => {
                sanitize_message(&format!("Invalid {field}: {message}"))
            }
            Error::Authentication => "Authentication required. Please log in and try again.".into(),
            Error::Authorization => "You do not have permission to perform this action.".into(),
            Error::NotFound { resource } => format!("The requested {resource} was not found."),
            Error::PaymentRequired { required, balance } => format!(
                "Insufficient credits: this analysis costs {required} credit(s) but your balance is {balance}."
            ),
            Error::RateLimit { .. } => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            Error::Configuration { .. } => {
                "Invalid analysis model configuration. Please contact support.".into()
            }
            Error::ModelRefused { .. } => {
                "Unable to analyze the document. Please try again or contact support.".into()
            }
            Error::OutputTooLarge => {
                "The analysis exceeds the configured output limit. Try a shorter document or raise the limit."
                    .into()
            }
            Error::MalformedResult { .. } => {
                "Failed to parse the analysis results. Please try again.".into()
            }
            Error::EmptyDocument => {
                "Could not extract text from the document. It might be an image-only scan.".into()
            }
            Error::ExternalService { .. } => {
                "A service is temporarily unavailable. Please try again later.".into()
            }
            Error::Other(_) => GENERIC_SERVER_MESSAGE.into(),
        }
    }

    /// Diagnostic payload persisted under the record's `_debug` key when the
    /// job dead-letters. Admin-only by way of the debug gate.
    pub fn debug_payload(&self) -> Option<Value> {
        match self {
            Error::MalformedResult { model, raw } => Some(json!({
                "errorType": "INVALID_JSON",
                "model_used": model,
                "raw": raw,
            })),
            Error::ModelRefused { model } => Some(json!({
                "errorType": "REFUSAL",
                "model_used": model,
            })),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Other(anyhow::Error::new(e).context("database operation failed"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let timeout = e.is_timeout();
        Error::ExternalService {
            message: e.to_string(),
            timeout,
        }
    }
}

/// Sanitize a raw message for the system boundary.
///
/// If any sensitive pattern matches, the whole message is replaced by the
/// generic server message. Otherwise parenthesized technical detail and
/// path-like tokens are stripped and the result is length-capped.
pub fn sanitize_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p)) || contains_ip_address(raw) {
        return GENERIC_SERVER_MESSAGE.to_string();
    }

    let without_parens = strip_parenthesized(raw);
    let mut sanitized = without_parens
        .split_whitespace()
        .map(|tok| {
            if tok.matches('/').count() >= 2 || tok.matches('\\').count() >= 2 {
                "[path]"
            } else {
                tok
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.len() > MAX_BOUNDARY_MESSAGE_LEN {
        let mut cut = MAX_BOUNDARY_MESSAGE_LEN - 3;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("...");
    }

    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        GENERIC_SERVER_MESSAGE.to_string()
    } else {
        trimmed.to_string()
    }
}

fn strip_parenthesized(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Detect dotted-quad IPv4 addresses without pulling in a regex engine.
fn contains_ip_address(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            let mut groups = 0;
            let mut j = i;
            loop {
                let digit_start = j;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j == digit_start || j - digit_start > 3 {
                    break;
                }
                groups += 1;
                if groups == 4 {
                    return true;
                }
                if j < bytes.len() && bytes[j] == b'.' {
                    j += 1;
                } else {
                    break;
                }
            }
            i = start + (j - start).max(1);
        } else {
            i += 1;
        }
    }
    false
}

/// Type alias for pipeline operation results.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_patterns_replaced_with_generic_message() {
        for raw in [
            "failed to connect to postgresql://user:pass@db/main",
            "invalid api key provided",
            "SQL syntax error near SELECT",
            "could not reach host 10.0.0.12 on network",
        ] {
            assert_eq!(sanitize_message(raw), GENERIC_SERVER_MESSAGE);
        }
    }

    #[test]
    fn paths_are_masked() {
        let out = sanitize_message("failed to read /var/lib/contracts/file.pdf from disk");
        assert!(out.contains("[path]"), "{out}");
        assert!(!out.contains("/var/lib"));
    }

    #[test]
    fn parenthesized_detail_is_stripped() {
        let out = sanitize_message("download failed (os error 2)");
        assert_eq!(out, "download failed");
    }

    #[test]
    fn long_messages_are_capped() {
        let raw = "x".repeat(500);
        let out = sanitize_message(&raw);
        assert!(out.len() <= MAX_BOUNDARY_MESSAGE_LEN);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn payment_required_surfaces_specific_detail() {
        let err = Error::PaymentRequired {
            required: 5,
            balance: 2,
        };
        let msg = err.user_message();
        assert!(msg.contains('5'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn malformed_result_never_leaks_raw_text_in_user_message() {
        let err = Error::MalformedResult {
            model: "gpt-4o".into(),
            raw: "secret provider output".into(),
        };
        assert!(!err.user_message().contains("secret"));
        let debug = err.debug_payload().unwrap();
        assert_eq!(debug["errorType"], "INVALID_JSON");
        assert_eq!(debug["raw"], "secret provider output");
    }

    #[test]
    fn only_external_service_is_retryable() {
        assert!(Error::external("503 from provider").is_retryable());
        assert!(Error::timeout("deadline exceeded").is_retryable());
        assert!(!Error::EmptyDocument.is_retryable());
        assert!(!Error::configuration("bad model").is_retryable());
        assert!(!Error::ModelRefused { model: "m".into() }.is_retryable());
    }

    #[test]
    fn timeouts_are_distinguishable_in_logs() {
        assert!(Error::timeout("deadline exceeded")
            .to_string()
            .contains("timeout"));
        assert!(!Error::external("503 from provider")
            .to_string()
            .contains("timeout"));
    }

    #[test]
    fn not_found_is_permanent() {
        assert!(Error::not_found("document").is_permanent());
        assert!(!Error::EmptyDocument.is_permanent());
        assert!(!Error::external("x").is_permanent());
    }

    #[test]
    fn ip_detection() {
        assert!(contains_ip_address("ping 192.168.1.1 failed"));
        assert!(!contains_ip_address("version 1.2.3 released"));
        assert!(!contains_ip_address("no numbers here"));
    }
}
