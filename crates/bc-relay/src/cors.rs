//! Origin allow-list.
//!
//! Browsers on an origin outside the list are refused before any relay logic runs; allowed
//! origins get the usual CORS headers from [`CorsLayer`].
use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::{header::ORIGIN, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::{config::RelayConfig, error::RelayError};

const DEFAULT_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

#[derive(Debug, Clone, Default)]
pub struct AllowedOrigins {
    origins: Vec<HeaderValue>,
}

impl AllowedOrigins {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins = origins
            .into_iter()
            .filter_map(|origin| {
                let origin = origin.as_ref().trim().trim_end_matches('/');
                HeaderValue::from_str(origin)
                    .inspect_err(|_| warn!("Ignoring invalid allowed origin `{origin}`"))
                    .ok()
            })
            .collect();

        Self { origins }
    }

    pub fn contains(&self, origin: &HeaderValue) -> bool {
        self.origins.iter().any(|o| o == origin)
    }

    /// CORS headers for allowed origins, preflight included.
    pub fn cors_layer(&self, config: &RelayConfig) -> CorsLayer {
        let methods = if config.allowed_methods.is_empty() {
            DEFAULT_METHODS.to_vec()
        } else {
            config.allowed_methods.clone()
        };

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(self.origins.clone()))
            .allow_methods(methods)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
            .max_age(Duration::from_secs(60 * 60))
    }
}

/// Refuses requests whose `Origin` header is not allowed. Requests without an `Origin`
/// (same-origin navigation, server-to-server calls) pass through.
pub async fn reject_disallowed_origin(
    State(origins): State<Arc<AllowedOrigins>>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    if let Some(origin) = request.headers().get(ORIGIN) {
        if !origins.contains(origin) {
            let origin = String::from_utf8_lossy(origin.as_bytes()).into_owned();
            warn!("Rejected request from origin `{origin}`");
            return Err(RelayError::CorsRejection { origin });
        }
    }

    Ok(next.run(request).await)
}
