use crate::diagnostics::redact_sensitive;

const MAX_SUMMARY_CHARS: usize = 2_000;

/// Redact credential-looking `key=value` tokens and cap the stored length.
pub(crate) fn sanitize_summary(message: &str) -> String {
    let redacted = redact_sensitive(message);
    if redacted.chars().count() <= MAX_SUMMARY_CHARS {
        return redacted;
    }
    redacted.chars().take(MAX_SUMMARY_CHARS).collect()
}
