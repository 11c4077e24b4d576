//! Fixed bearer token authorizer.
use std::sync::Arc;

use http::HeaderValue;

use super::{bearer_header, Authorizer};
use crate::error::Result;

/// Create a simple Authorizer that attaches a given token to any request
/// a client sends. The token is attached with the `Bearer` auth-scheme.
///
/// Useful for pointing the relay at a Business Central sandbox with a token obtained
/// out of band, and for tests.
#[derive(Clone, veil::Redact)]
pub struct BearerTokenAuthorizer {
    #[redact]
    authorization_header: Arc<HeaderValue>,
}

impl BearerTokenAuthorizer {
    /// Create a new authorizer with the given access token.
    /// Pass only the token, without the `Bearer` prefix.
    ///
    /// # Errors
    /// Fails if the token is empty or "Bearer {token}" is not a valid ASCII string.
    pub fn new(token: &str) -> Result<Self> {
        Ok(Self {
            authorization_header: Arc::new(bearer_header(token)?),
        })
    }
}

impl Authorizer for BearerTokenAuthorizer {
    async fn authorization_header(&self) -> Result<Arc<HeaderValue>> {
        Ok(self.authorization_header.clone())
    }
}
