use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("upstream error ({status}): {message}")]
    UpstreamStatus {
        status: u16,
        message: String,
        error_type: Option<String>,
        code: Option<String>,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("insufficient quota: needed={needed} remaining={remaining}")]
    InsufficientQuota { needed: i64, remaining: i64 },
    #[error("no available channel for model {model} under group {group}")]
    ChannelNotFound { group: String, model: String },
    #[error("internal panic: {0}")]
    InternalPanic(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::UpstreamProtocol(err.to_string());
        }
        Self::UpstreamTransport(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::UpstreamTransport(err.to_string())
    }
}

impl RelayError {
    /// Whether another channel may be tried for the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTransport(_) | Self::UpstreamProtocol(_) | Self::Json(_) => true,
            Self::UpstreamStatus { status, .. } => {
                matches!(status, 401 | 403 | 408 | 429) || *status >= 500
            }
            Self::Config(_) => true,
            Self::InvalidRequest(_)
            | Self::Unauthorized(_)
            | Self::InsufficientQuota { .. }
            | Self::ChannelNotFound { .. }
            | Self::InternalPanic(_)
            | Self::Cancelled(_)
            | Self::Storage(_) => false,
        }
    }

    /// Machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "channel_config_error",
            Self::UpstreamTransport(_) => "upstream_unavailable",
            Self::UpstreamProtocol(_) | Self::Json(_) => "bad_upstream_response",
            Self::UpstreamStatus { status: 429, .. } => "upstream_rate_limited",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "invalid_api_key",
            Self::InsufficientQuota { .. } => "insufficient_quota",
            Self::ChannelNotFound { .. } => "model_not_available",
            Self::InternalPanic(_) => "internal_error",
            Self::Cancelled(_) => "request_cancelled",
            Self::Storage(_) => "internal_error",
        }
    }

    /// Generic text for callers; never carries upstream bodies or credentials.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(reason) => reason.clone(),
            Self::Unauthorized(reason) => reason.clone(),
            Self::InsufficientQuota { .. } => "quota is not enough for this request".to_string(),
            Self::ChannelNotFound { group, model } => {
                format!("no available channel for model {model} under group {group}")
            }
            Self::UpstreamStatus { status: 429, .. } => {
                "upstream is rate limited, please retry later".to_string()
            }
            Self::Cancelled(_) => "request cancelled".to_string(),
            Self::Config(_)
            | Self::UpstreamTransport(_)
            | Self::UpstreamProtocol(_)
            | Self::UpstreamStatus { .. }
            | Self::Json(_) => "upstream request failed, please retry later".to_string(),
            Self::InternalPanic(_) | Self::Storage(_) => "internal server error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(RelayError::UpstreamTransport("reset".to_string()).is_retryable());
        assert!(RelayError::UpstreamProtocol("bad json".to_string()).is_retryable());
        assert!(
            RelayError::UpstreamStatus {
                status: 429,
                message: "slow down".to_string(),
                error_type: None,
                code: None,
            }
            .is_retryable()
        );
        assert!(
            !RelayError::UpstreamStatus {
                status: 400,
                message: "bad".to_string(),
                error_type: None,
                code: None,
            }
            .is_retryable()
        );
        assert!(
            !RelayError::InsufficientQuota {
                needed: 10,
                remaining: 1
            }
            .is_retryable()
        );
        assert!(
            !RelayError::ChannelNotFound {
                group: "default".to_string(),
                model: "gpt-4o".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn public_message_hides_upstream_details() {
        let err = RelayError::UpstreamStatus {
            status: 500,
            message: "secret stack trace at sk-abc".to_string(),
            error_type: None,
            code: None,
        };
        assert!(!err.public_message().contains("sk-abc"));
        assert_eq!(err.code(), "upstream_error");
    }
}
