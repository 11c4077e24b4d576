mod bearer_token;
mod client_credentials;

use std::{future::Future, sync::Arc};

pub use bearer_token::*;
pub use client_credentials::*;
use http::HeaderValue;

use crate::error::Error;

/// Main trait of this crate.
pub trait Authorizer: Send + Sync {
    /// Returns the authorization header to use for the next request.
    /// Implementations may contact the identity provider, so callers must not
    /// assume this completes immediately.
    ///
    /// # Errors
    /// Fails if a token is not available, for example because the identity provider
    /// rejected the credentials.
    fn authorization_header(&self) -> impl Future<Output = Result<Arc<HeaderValue>, Error>> + Send;

    /// Discard any cached token so the next call to
    /// [`authorization_header`](Self::authorization_header) obtains a fresh one.
    fn invalidate(&self) {}
}

/// Helper function to ensure that a string is ASCII.
///
/// # Errors
/// Fails with `InvalidHeaderValue` if the string is not ASCII.
pub(crate) fn require_ascii(s: &str) -> Result<(), Error> {
    if s.is_ascii() {
        Ok(())
    } else {
        Err(Error::InvalidHeaderValue)
    }
}

/// Builds a sensitive `Bearer {token}` header value.
///
/// # Errors
/// Fails with `EmptyToken` for a blank token and `InvalidHeaderValue` if the
/// token is not a valid header value.
pub(crate) fn bearer_header(token: &str) -> Result<HeaderValue, Error> {
    if token.trim().is_empty() {
        return Err(Error::EmptyToken);
    }
    require_ascii(token)?;
    let mut header =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_e| Error::InvalidHeaderValue)?;
    header.set_sensitive(true);
    Ok(header)
}
