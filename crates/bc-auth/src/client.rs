use std::sync::Arc;

use http::{header::AUTHORIZATION, HeaderValue};
use reqwest::IntoUrl;

use crate::{error::Result, Authorizer};

/// Wrapper around `reqwest::Client` that automatically adds the authorization header,
/// obtaining it from an `Authorizer` for every request.
#[derive(Debug, Clone)]
pub struct HttpClient<A: Authorizer> {
    authorizer: A,
    client: reqwest::Client,
}

impl<A: Authorizer> HttpClient<A> {
    /// Creates a new `HttpClient` with the given `Authorizer`.
    pub fn new(authorizer: A) -> Self {
        Self {
            authorizer,
            client: reqwest::Client::new(),
        }
    }

    /// Set a custom `reqwest::Client`.
    #[must_use]
    pub fn set_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// The `Authorizer` used by this client.
    pub fn authorizer(&self) -> &A {
        &self.authorizer
    }

    /// Obtain the authorization header for the next request.
    ///
    /// # Errors
    /// Returns an error if the authorizer fails to provide a token.
    pub async fn authorization_header(&self) -> Result<Arc<HeaderValue>> {
        self.authorizer.authorization_header().await
    }

    /// Start building a `Request` with an authorization header the caller already obtained
    /// through [`authorization_header`](Self::authorization_header).
    pub fn authorized<U: IntoUrl>(
        &self,
        method: reqwest::Method,
        url: U,
        header: Arc<HeaderValue>,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, Arc::unwrap_or_clone(header))
    }
}
