//! Crate error types

use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum TvError {
    // Misuse of the live feed API
    #[error("{0} not listed in TradingView")]
    NotListed(String),

    #[error("No such Seis: {0}")]
    NoSuchSeis(String),

    #[error("Missing update datetime for new interval group {0}")]
    MissingUpdateTime(String),

    #[error("Consumer {0} does not exist in Seis")]
    ConsumerNotFound(String),

    #[error("TvDatafeedLive reference not provided for {0}")]
    CoordinatorNotProvided(String),

    #[error("Cannot overwrite TvDatafeedLive reference of {0}")]
    CannotOverwrite(String),

    #[error("Consumer {0} already started")]
    AlreadyStarted(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // TradingView client
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("CAPTCHA required, sign in through a browser first")]
    Captcha,

    #[error("Two-factor authentication required: {0}")]
    TwoFactorRequired(String),

    #[error("Invalid {field} '{value}': {reason}")]
    Validation {
        field: String,
        value: String,
        reason: String,
    },

    #[error("No data found: {0}")]
    DataNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TvError {
    pub fn validation(field: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        TvError::Validation {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TvError::NotListed(_) => "NOT_LISTED",
            TvError::NoSuchSeis(_) => "NO_SUCH_SEIS",
            TvError::MissingUpdateTime(_) => "MISSING_UPDATE_TIME",
            TvError::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            TvError::CoordinatorNotProvided(_) => "COORDINATOR_NOT_PROVIDED",
            TvError::CannotOverwrite(_) => "CANNOT_OVERWRITE",
            TvError::AlreadyStarted(_) => "ALREADY_STARTED",
            TvError::NotImplemented(_) => "NOT_IMPLEMENTED",
            TvError::Auth(_) => "AUTH_ERROR",
            TvError::Captcha => "CAPTCHA_REQUIRED",
            TvError::TwoFactorRequired(_) => "TWO_FACTOR_REQUIRED",
            TvError::Validation { .. } => "VALIDATION_ERROR",
            TvError::DataNotFound(_) => "DATA_NOT_FOUND",
            TvError::Timeout(_) => "TIMEOUT",
            TvError::Connection(_) => "CONNECTION_ERROR",
            TvError::Protocol(_) => "PROTOCOL_ERROR",
            TvError::WebSocket(_) => "WEBSOCKET_ERROR",
            TvError::Http(_) => "HTTP_ERROR",
            TvError::Serialization(_) => "SERIALIZATION_ERROR",
            TvError::Config(_) => "CONFIG_ERROR",
            TvError::Io(_) => "IO_ERROR",
            TvError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TvError::Timeout(_)
                | TvError::Connection(_)
                | TvError::WebSocket(_)
                | TvError::Http(_)
                | TvError::Io(_)
        )
    }
}

/// Serializable error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&TvError> for ErrorResponse {
    fn from(err: &TvError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = TvError::NotListed("BINANCE:NOPE".to_string());
        assert_eq!(err.code(), "NOT_LISTED");
        assert!(err.to_string().contains("not listed"));

        let response = ErrorResponse::from(&TvError::Captcha);
        assert_eq!(response.code, "CAPTCHA_REQUIRED");
    }

    #[test]
    fn test_validation_message() {
        let err = TvError::validation("n_bars", 0, "must be between 1 and 5000");
        assert_eq!(err.to_string(), "Invalid n_bars '0': must be between 1 and 5000");
        assert!(!err.is_transient());
        assert!(TvError::Timeout("recv".into()).is_transient());
    }
}
