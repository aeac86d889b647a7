use thiserror::Error;

/// Failures surfaced by the model boundary.
///
/// `Timeout` and `Transient` are retried by [`crate::Client`]; once the
/// attempt cap is spent they surface as `Unavailable`. `Auth` and
/// `InvalidRequest` are returned on first sight.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("model request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("model credentials rejected: {0}")]
    Auth(String),

    #[error("transient model failure: {message}")]
    Transient {
        message: String,
        status: Option<u16>,
        retry_after_ms: Option<u64>,
    },

    #[error("model unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("model rejected request: {0}")]
    InvalidRequest(String),

    #[error("model client misconfigured: {0}")]
    Configuration(String),
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Transient { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Maps an HTTP status code onto the error taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth(format!("status {status}: {body}")),
            408 | 429 | 500..=599 => Self::Transient {
                message: format!("status {status}: {body}"),
                status: Some(status),
                retry_after_ms,
            },
            _ => Self::InvalidRequest(format!("status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_classifies_auth_transient_and_invalid() {
        assert!(matches!(ModelError::from_status(401, "nope", None), ModelError::Auth(_)));
        assert!(matches!(ModelError::from_status(403, "nope", None), ModelError::Auth(_)));
        assert!(ModelError::from_status(429, "slow down", Some(1_000)).is_retryable());
        assert!(ModelError::from_status(503, "busy", None).is_retryable());
        assert!(matches!(
            ModelError::from_status(400, "bad", None),
            ModelError::InvalidRequest(_)
        ));
    }

    #[test]
    fn retry_after_hint_is_only_reported_for_transient_errors() {
        let error = ModelError::from_status(429, "slow down", Some(750));
        assert_eq!(error.retry_after_ms(), Some(750));
        assert_eq!(ModelError::Timeout { timeout_ms: 5 }.retry_after_ms(), None);
    }
}
