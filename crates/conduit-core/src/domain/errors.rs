//! 失敗の分類 - task、stream、status 表示で共有

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failure, as surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Stale attempt or lease; the caller abandons the attempt.
    Fencing,
    /// Infrastructure hiccup; retried with backoff by the owning loop.
    Transient,
    /// Attempts exhausted; no further automatic action.
    TerminalFailure,
    /// Same version identity, different content.
    PublicationDivergence,
    /// Wrong output cardinality or cross-field mismatch.
    MalformedCompletion,
    /// Worker presumed dead after its lease ran out.
    LeaseExpired,
    /// The operator reported a failure.
    OperatorFailure,
    Canceled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Fencing => "fencing",
            ErrorCategory::Transient => "transient",
            ErrorCategory::TerminalFailure => "terminal_failure",
            ErrorCategory::PublicationDivergence => "publication_divergence",
            ErrorCategory::MalformedCompletion => "malformed_completion",
            ErrorCategory::LeaseExpired => "lease_expired",
            ErrorCategory::OperatorFailure => "operator_failure",
            ErrorCategory::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Error recorded on a task or stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub detail: String,
}

impl ErrorInfo {
    pub fn new(category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }

    /// Copy safe to put on a status surface.
    pub fn redacted(&self) -> Self {
        Self {
            category: self.category,
            detail: redact_detail(&self.detail),
        }
    }
}

const MAX_DETAIL_CHARS: usize = 256;

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "credential",
    "authorization",
    "signature",
    "sig",
];

fn is_sensitive_key(key: &str) -> bool {
    let key = key
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .to_ascii_lowercase();
    SENSITIVE_KEYS
        .iter()
        .any(|needle| key == *needle || key.ends_with(&format!("_{needle}")))
}

/// Mask values of secret-looking `key=value` / `key: value` pairs and bound the length.
///
/// Intended for operator-facing output only; the stored detail is left intact.
pub fn redact_detail(detail: &str) -> String {
    let mut out = String::with_capacity(detail.len().min(MAX_DETAIL_CHARS + 16));
    let mut mask_next = false;

    for (index, word) in detail.split(' ').enumerate() {
        if index > 0 {
            out.push(' ');
        }

        if mask_next && !word.is_empty() {
            out.push_str("REDACTED");
            mask_next = false;
            continue;
        }

        if let Some((key, _)) = word.split_once('=')
            && is_sensitive_key(key)
        {
            out.push_str(key);
            out.push_str("=REDACTED");
            continue;
        }

        if let Some(key) = word.strip_suffix(':')
            && is_sensitive_key(key)
        {
            mask_next = true;
        }
        out.push_str(word);
    }

    if out.chars().count() > MAX_DETAIL_CHARS {
        let truncated: String = out.chars().take(MAX_DETAIL_CHARS).collect();
        return format!("{truncated}...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("connect failed password=hunter2", "connect failed password=REDACTED")]
    #[case("upload sig=abc&x=1 rejected", "upload sig=REDACTED rejected")]
    #[case("db_password=p host=db", "db_password=REDACTED host=db")]
    #[case("token: abc123 expired", "token: REDACTED expired")]
    #[case("plain failure", "plain failure")]
    fn redacts_secret_pairs(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(redact_detail(input), expected);
    }

    #[test]
    fn bounds_length() {
        let long = "x".repeat(1000);
        let redacted = redact_detail(&long);
        assert!(redacted.ends_with("..."));
        assert_eq!(redacted.chars().count(), MAX_DETAIL_CHARS + 3);
    }

    #[test]
    fn redacted_keeps_category() {
        let info = ErrorInfo::new(ErrorCategory::Transient, "apikey=zzz");
        let shown = info.redacted();
        assert_eq!(shown.category, ErrorCategory::Transient);
        assert_eq!(shown.detail, "apikey=REDACTED");
        assert_eq!(ErrorCategory::LeaseExpired.to_string(), "lease_expired");
    }
}
