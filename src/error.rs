// Error types shared by the upstream client, the config layer and the orchestrator

use thiserror::Error;

// Failures of a single call against the upstream venue service.
// Every network or parse failure is converted into one of these at the call boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}s")]
    Timeout(u64),

    #[error("Rate limited by upstream (HTTP 429)")]
    RateLimited,

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("API error: {status_code} - {message}")]
    HttpStatus { status_code: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Application error: code {code} - {message}")]
    Application { code: String, message: String },
}

impl ApiError {
    // Transport-level failures say nothing about availability; they feed the breaker.
    pub fn is_transport(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) | ApiError::RateLimited => true,
            ApiError::HttpStatus { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(timeout_secs)
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid time window '{0}', expected HH:MM-HH:MM")]
    InvalidWindow(String),

    #[error("Duplicate time window '{0}'")]
    DuplicateWindow(String),

    #[error("Invalid target date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// Reasons a start request is refused. Nothing is queued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("A booking run is already in progress")]
    AlreadyRunning,

    #[error("Credentials expired, refresh the session cookie and retry")]
    AuthExpired,

    #[error("Configuration rejected: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No cookie pairs found in input")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ApiError::Network("reset".into()).is_transport());
        assert!(ApiError::Timeout(10).is_transport());
        assert!(ApiError::RateLimited.is_transport());
        assert!(ApiError::HttpStatus {
            status_code: 502,
            message: "bad gateway".into()
        }
        .is_transport());

        assert!(!ApiError::HttpStatus {
            status_code: 404,
            message: "missing".into()
        }
        .is_transport());
        assert!(!ApiError::SessionExpired("login page".into()).is_transport());
        assert!(!ApiError::MalformedResponse("eof".into()).is_transport());
    }

    #[test]
    fn test_start_error_messages_are_user_facing() {
        assert_eq!(
            StartError::AuthExpired.to_string(),
            "Credentials expired, refresh the session cookie and retry"
        );
        assert_eq!(
            StartError::AlreadyRunning.to_string(),
            "A booking run is already in progress"
        );
    }
}
