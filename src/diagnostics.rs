use crate::types::FailureCategory;

/// Classify a worker failure from its summary, falling back to the exit code.
#[must_use]
pub fn classify_failure(summary: &str, exit_code: Option<i32>) -> FailureCategory {
    let lowered = summary.to_ascii_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        FailureCategory::Timeout
    } else if ["rate limit", "429", "quota", "rejected", "overloaded"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        FailureCategory::ProviderRejected
    } else if exit_code.is_some_and(|code| code != 0) {
        FailureCategory::ProcessError
    } else {
        FailureCategory::Unknown
    }
}

/// Redact sensitive tokens (API keys, passwords, etc.) from a message.
#[must_use]
pub fn redact_sensitive(message: &str) -> String {
    message
        .split_whitespace()
        .map(redact_token)
        .collect::<Vec<_>>()
        .join(" ")
}

#[must_use]
fn redact_token(token: &str) -> String {
    token.split_once('=').map_or_else(
        || token.to_string(),
        |(key, _)| {
            let normalized = key.to_ascii_lowercase();
            if ["token", "password", "secret", "api_key", "database_url"]
                .iter()
                .any(|sensitive| normalized.contains(sensitive))
            {
                format!("{key}=<redacted>")
            } else {
                token.to_string()
            }
        },
    )
}
