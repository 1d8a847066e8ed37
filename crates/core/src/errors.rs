use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Stable wire codes shared by HTTP bodies and terminal stream events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotReady,
    NotFound,
    SessionBusy,
    StoreError,
    AppError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotReady => "NOT_READY",
            Self::NotFound => "NOT_FOUND",
            Self::SessionBusy => "SESSION_BUSY",
            Self::StoreError => "STORE_ERROR",
            Self::AppError => "APP_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::SessionBusy => 409,
            Self::NotReady => 503,
            Self::StoreError | Self::AppError | Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct InterfaceError {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), correlation_id: "unassigned".to_owned() }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn user_message(&self) -> &'static str {
        match self.code {
            ErrorCode::InvalidRequest => {
                "The request could not be processed. Check inputs and try again."
            }
            ErrorCode::NotReady => "The service is temporarily unavailable. Please retry shortly.",
            ErrorCode::NotFound => "The requested session does not exist.",
            ErrorCode::SessionBusy => "The session is busy with another request.",
            ErrorCode::StoreError | ErrorCode::AppError | ErrorCode::Internal => {
                "An unexpected internal error occurred."
            }
        }
    }

    /// `{"error": {"code": ..., "message": ...}}`
    pub fn to_body(&self) -> Value {
        json!({ "error": { "code": self.code.as_str(), "message": self.message } })
    }
}
