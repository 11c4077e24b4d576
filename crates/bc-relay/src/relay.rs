use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method, StatusCode, Uri,
    },
    response::Response,
};
use bc_auth::{Authorizer, HttpClient};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    config::RelayConfig,
    error::RelayError,
    target::{build_target_url, has_dot_segment, resource_name, resource_path},
};

/// Forwards inbound `/api/*` requests to Business Central.
///
/// Every request obtains its bearer token from the `Authorizer` before anything is sent
/// downstream; a request that cannot be authorized never reaches Business Central.
#[derive(Debug)]
pub struct Relay<A: Authorizer> {
    client: HttpClient<A>,
    config: Arc<RelayConfig>,
}

/// Only these methods carry a body downstream.
fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Downstream error bodies are JSON when Business Central produced them, but
/// gateways in front of it answer with plain text.
fn error_details(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

impl<A: Authorizer> Relay<A> {
    pub fn new(client: HttpClient<A>, config: Arc<RelayConfig>) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &Arc<RelayConfig> {
        &self.config
    }

    fn check_allowed(&self, method: &Method, resource: &str) -> Result<(), RelayError> {
        if has_dot_segment(resource) {
            return Err(RelayError::InvalidResourcePath {
                path: resource.to_string(),
            });
        }

        let methods = &self.config.allowed_methods;
        if !methods.is_empty() && !methods.contains(method) {
            return Err(RelayError::MethodNotAllowed {
                method: method.clone(),
            });
        }

        let name = resource_name(resource);
        if !self.config.allowed_resources.is_empty()
            && !self.config.allowed_resources.iter().any(|r| r == name)
        {
            return Err(RelayError::ResourceNotAllowed {
                resource: name.to_string(),
            });
        }

        Ok(())
    }

    /// Relay one request.
    ///
    /// # Errors
    /// - `AuthAcquisition` if no token could be obtained.
    /// - `Downstream` if Business Central answered with a non-success status or could not be
    ///   reached.
    /// - `InvalidResourcePath` if the path has `.` or `..` segments.
    /// - `MethodNotAllowed` / `ResourceNotAllowed` if an allow-list is configured and does not
    ///   match.
    pub async fn handle(
        &self,
        method: Method,
        uri: &Uri,
        body: Bytes,
    ) -> Result<Response, RelayError> {
        let path = uri.path();
        let query = uri.query().unwrap_or_default();

        self.check_allowed(&method, resource_path(path))
            .inspect_err(|e| warn!("Rejected {method} {path}: {e}"))?;

        let authorization = self.client.authorization_header().await.map_err(|e| {
            error!("Failed to acquire access token: {e}");
            RelayError::AuthAcquisition(e)
        })?;

        let url = build_target_url(path, query, &self.config.target);

        let mut request = self
            .client
            .authorized(method.clone(), url.as_str(), authorization)
            .header(ACCEPT, "application/json");

        if carries_body(&method) && !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        if let Some(timeout) = self.config.upstream_timeout {
            request = request.timeout(timeout);
        }

        info!("Forwarding {method} {path} to Business Central");

        let response = request.send().await.map_err(|e| {
            warn!("Request to Business Central failed: {e}");
            RelayError::Downstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                details: Value::String(e.to_string()),
            }
        })?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let bytes = response.bytes().await.map_err(|e| {
            warn!("Failed to read Business Central response: {e}");
            RelayError::Downstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                details: Value::String(e.to_string()),
            }
        })?;

        if !status.is_success() {
            warn!("Business Central answered {method} {path} with {status}");
            if status == StatusCode::UNAUTHORIZED {
                self.client.authorizer().invalidate();
            }
            return Err(RelayError::Downstream {
                status,
                details: error_details(&bytes),
            });
        }

        let status = if self.config.flatten_success_status {
            StatusCode::OK
        } else {
            status
        };

        let mut builder = Response::builder().status(status);
        if !bytes.is_empty() {
            builder = builder.header(
                CONTENT_TYPE,
                content_type.unwrap_or(HeaderValue::from_static("application/json")),
            );
        }

        builder.body(Body::from(bytes)).map_err(|e| RelayError::Downstream {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            details: Value::String(e.to_string()),
        })
    }
}
