use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// How the scheduler should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credential rejected by the broker. Stops the module and triggers a reconnect.
    Authorization,
    /// Anything else. Delivered to the caller, the module keeps running.
    Transient,
}

/// Outcome of a single broker call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("access token renewal failed: {0}")]
    RenewFailed(String),

    #[error("{operation} failed to complete: {message}")]
    ConnectionFailed { operation: String, message: String },

    #[error("{operation} returned HTTP {status}")]
    Status { operation: String, status: u16 },

    #[error("failed to decode {operation} response: {message}")]
    Decode { operation: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("consumer key or secret is not configured")]
    MissingConsumerCredentials,
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Unauthorized(_) => ErrorClass::Authorization,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_authorization(&self) -> bool {
        self.class() == ErrorClass::Authorization
    }

    pub fn connection_failed(operation: &str, err: impl std::fmt::Display) -> Self {
        ApiError::ConnectionFailed {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    pub fn decode(operation: &str, err: impl std::fmt::Display) -> Self {
        ApiError::Decode {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}
