//! Terminal failure kinds produced by the generation pipeline.

use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;

use crate::rate_limit::PolicyKind;

/// Machine-readable failure kind, surfaced as `code` in error responses and
/// used as the `kind` label in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    ValidationError,
    BudgetExceeded,
    ProviderError,
    MalformedOutput,
    InternalError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::RateLimited,
        ErrorKind::ValidationError,
        ErrorKind::BudgetExceeded,
        ErrorKind::ProviderError,
        ErrorKind::MalformedOutput,
        ErrorKind::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::MalformedOutput => "malformed_output",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("rate limit exceeded for {policy:?} caller ({limit} requests per {window:?})")]
    RateLimited {
        policy: PolicyKind,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },
    #[error("{0}")]
    Validation(String),
    #[error("Estimated prompt size of {estimated} tokens exceeds the limit of {ceiling} tokens")]
    BudgetExceeded { estimated: usize, ceiling: usize },
    #[error("completion service error (status {status:?}): {body}")]
    Provider { status: Option<u16>, body: String },
    #[error("malformed model output: {reason} (preview: {preview:?})")]
    MalformedOutput { reason: String, preview: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::RateLimited { .. } => ErrorKind::RateLimited,
            GenerationError::Validation(_) => ErrorKind::ValidationError,
            GenerationError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            GenerationError::Provider { .. } => ErrorKind::ProviderError,
            GenerationError::MalformedOutput { .. } => ErrorKind::MalformedOutput,
            GenerationError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ValidationError | ErrorKind::BudgetExceeded => StatusCode::BAD_REQUEST,
            ErrorKind::ProviderError | ErrorKind::MalformedOutput | ErrorKind::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to the caller.  Provider bodies and model output stay
    /// out of it; they go to logs and the audit record instead.
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::RateLimited {
                policy: PolicyKind::Anonymous,
                limit,
                ..
            } => format!(
                "You have used all {} free generations for today. Sign in to keep generating.",
                limit
            ),
            GenerationError::RateLimited {
                policy: PolicyKind::Authenticated,
                limit,
                window,
                retry_after,
            } => format!(
                "Rate limit exceeded: {} requests per {} minutes. Try again in {} minutes.",
                limit,
                window.as_secs() / 60,
                retry_after.as_secs().div_ceil(60).max(1)
            ),
            GenerationError::Validation(msg) => msg.clone(),
            GenerationError::BudgetExceeded { .. } => self.to_string(),
            GenerationError::Provider { status, .. } => match status {
                Some(code) => format!(
                    "The completion service returned an error (status {}). Please try again.",
                    code
                ),
                None => "The completion service could not be reached. Please try again.".into(),
            },
            GenerationError::MalformedOutput { .. } => {
                "The completion service returned an unreadable response. Please try again.".into()
            }
            GenerationError::Internal(_) => "Internal error. Please try again.".into(),
        }
    }

    /// Seconds until a rate-limited caller may retry.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GenerationError::RateLimited { retry_after, .. } => {
                Some(retry_after.as_secs().max(1))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_message_cites_both_numbers() {
        let err = GenerationError::BudgetExceeded {
            estimated: 5123,
            ceiling: 4000,
        };
        let msg = err.user_message();
        assert!(msg.contains("5123") && msg.contains("4000"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rate_limit_messages_differ_by_policy() {
        let anon = GenerationError::RateLimited {
            policy: PolicyKind::Anonymous,
            limit: 3,
            window: Duration::from_secs(86_400),
            retry_after: Duration::from_secs(600),
        };
        let user = GenerationError::RateLimited {
            policy: PolicyKind::Authenticated,
            limit: 50,
            window: Duration::from_secs(3_600),
            retry_after: Duration::from_secs(125),
        };
        assert!(anon.user_message().contains("Sign in"));
        assert!(user.user_message().contains("Try again in 3 minutes"));
        assert_eq!(user.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(user.retry_after_secs(), Some(125));
    }

    #[test]
    fn provider_message_hides_body() {
        let err = GenerationError::Provider {
            status: Some(502),
            body: "upstream secret detail".into(),
        };
        assert!(!err.user_message().contains("secret"));
        assert!(err.to_string().contains("secret"));
        assert_eq!(err.kind().as_str(), "provider_error");
    }
}
