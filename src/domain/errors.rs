use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("rate limited (429): {0}")]
    RateLimited(String),
    #[error("server error (5xx): {0}")]
    ServerError(String),
    #[error("maximum retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Classifies an error chain as retryable or fatal. Typed rate-limit and
/// server-error variants are always retryable; everything else is judged by
/// the message text, matching what the upstream tools actually emit.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    if err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DomainError>(),
            Some(DomainError::RateLimited(_)) | Some(DomainError::ServerError(_))
        )
    }) {
        return ErrorClass::Retryable;
    }

    let msg = format!("{err:#}").to_ascii_lowercase();
    let retryable_hints = [
        "429",
        "rate limit",
        "too many requests",
        "overloaded",
        "capacity",
        "500",
        "502",
        "503",
        "504",
        "server error",
        "timeout",
        "timed out",
        "deadline exceeded",
        "connection refused",
        "connection reset",
        "no such host",
        "network is unreachable",
    ];

    if retryable_hints.iter().any(|h| msg.contains(h)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DomainError>(),
            Some(DomainError::Cancelled)
        )
    })
}
