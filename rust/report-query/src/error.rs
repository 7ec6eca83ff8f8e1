use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Unauthenticated,

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported data source '{0}'")]
    UnsupportedSource(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{data_source} backend timed out after {timeout_ms}ms")]
    BackendTimeout { data_source: String, timeout_ms: u64 },

    /// `message` carries the backend's own error text. It is logged and kept in
    /// execution history but never rendered to API clients.
    #[error("{data_source} backend request failed")]
    Backend {
        data_source: String,
        message: String,
    },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn backend(data_source: impl ToString, message: impl ToString) -> Self {
        Self::Backend {
            data_source: data_source.to_string(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Config(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::Authorization(_) => StatusCode::FORBIDDEN,
            ServiceError::Validation(_) | ServiceError::UnsupportedSource(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BackendTimeout { .. } | ServiceError::Backend { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "CONFIG_ERROR",
            ServiceError::Unauthenticated => "UNAUTHENTICATED",
            ServiceError::Authorization(_) => "FORBIDDEN",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::UnsupportedSource(_) => "UNSUPPORTED_SOURCE",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::BackendTimeout { .. } => "BACKEND_TIMEOUT",
            ServiceError::Backend { .. } => "BACKEND_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text suitable for execution history: includes backend detail that the
    /// HTTP response withholds.
    pub fn detail(&self) -> String {
        match self {
            ServiceError::Backend {
                data_source,
                message,
            } => format!("{data_source} backend request failed: {message}"),
            ServiceError::Internal(err) => format!("internal error: {err:#}"),
            other => other.to_string(),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(format!("invalid request body: {}", rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ServiceError::Backend {
                data_source,
                message,
            } => {
                error!(data_source = %data_source, error = %message, "backend request failed");
            }
            ServiceError::Internal(err) => error!(error = ?err, "request failed"),
            ServiceError::Config(_) | ServiceError::BackendTimeout { .. } => {
                error!(error = %self, "request failed");
            }
            _ => {}
        }

        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
