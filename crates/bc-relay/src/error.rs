use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;

pub const DOWNSTREAM_ERROR: &str = "Failed to fetch from Business Central";

/// Body of every error the relay answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub details: Value,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to acquire access token")]
    AuthAcquisition(#[source] bc_auth::Error),

    #[error("Failed to fetch from Business Central")]
    Downstream { status: StatusCode, details: Value },

    #[error("Not allowed by CORS")]
    CorsRejection { origin: String },

    #[error("Method not allowed")]
    MethodNotAllowed { method: Method },

    #[error("Resource not allowed")]
    ResourceNotAllowed { resource: String },

    #[error("Invalid resource path")]
    InvalidResourcePath { path: String },
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AuthAcquisition(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Downstream { status, .. } => *status,
            RelayError::CorsRejection { .. } | RelayError::ResourceNotAllowed { .. } => {
                StatusCode::FORBIDDEN
            }
            RelayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::InvalidResourcePath { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            RelayError::AuthAcquisition(e) => Value::String(e.to_string()),
            RelayError::Downstream { details, .. } => details.clone(),
            RelayError::CorsRejection { origin } => Value::String(origin.clone()),
            RelayError::MethodNotAllowed { method } => Value::String(method.to_string()),
            RelayError::ResourceNotAllowed { resource } => Value::String(resource.clone()),
            RelayError::InvalidResourcePath { path } => Value::String(path.clone()),
        };

        ErrorEnvelope {
            error: self.to_string(),
            details,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}

/// Failures that stop the relay from starting or serving.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to set up token provider: {0}")]
    Auth(#[from] bc_auth::Error),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_downstream_error_envelope() {
        let err = RelayError::Downstream {
            status: StatusCode::NOT_FOUND,
            details: json!({"error": {"code": "BadRequest_NotFound"}}),
        };

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let envelope: ErrorEnvelope = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            envelope,
            ErrorEnvelope {
                error: DOWNSTREAM_ERROR.to_string(),
                details: json!({"error": {"code": "BadRequest_NotFound"}}),
            }
        );
    }

    #[test]
    fn test_auth_failure_is_internal_error() {
        let err = RelayError::AuthAcquisition(bc_auth::Error::OAuth2RequestFailed(
            "invalid_client".to_string(),
        ));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.envelope().details,
            Value::String("Request to fetch token failed: invalid_client".to_string())
        );
    }
}
