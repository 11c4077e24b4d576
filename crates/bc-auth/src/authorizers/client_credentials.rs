use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use http::HeaderValue;
use oauth2::{
    basic::BasicClient, AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
    ErrorResponse, RequestTokenError, Scope, TokenResponse, TokenUrl,
};

use super::{bearer_header, Authorizer};
use crate::error::Error;

/// Default scope granting application access to the Business Central API.
pub const BUSINESS_CENTRAL_SCOPE: &str = "https://api.businesscentral.dynamics.com/.default";

type TokenClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

impl<TE: ErrorResponse> From<RequestTokenError<oauth2::HttpClientError<reqwest::Error>, TE>>
    for Error
{
    fn from(value: RequestTokenError<oauth2::HttpClientError<reqwest::Error>, TE>) -> Self {
        match value {
            RequestTokenError::Request(e) => Error::OAuth2RequestFailed(e.to_string()),
            RequestTokenError::Parse(e, _) => Error::OAuth2ParseError(e.to_string()),
            RequestTokenError::ServerResponse(e) => Error::OAuth2RequestFailed(e.to_string()),
            RequestTokenError::Other(e) => Error::OAuth2RequestFailed(e.to_string()),
        }
    }
}

/// Token endpoint of a Microsoft Entra ID (Azure AD) tenant,
/// `{authority_host}/{tenant_id}/oauth2/v2.0/token`.
///
/// # Errors
/// Fails with `InvalidTokenUrl` if the result is not a valid URL.
pub fn azure_ad_token_url(authority_host: &str, tenant_id: &str) -> Result<url::Url, Error> {
    let authority_host = authority_host.trim().trim_end_matches('/');
    let tenant_id = tenant_id.trim();
    format!("{authority_host}/{tenant_id}/oauth2/v2.0/token")
        .parse()
        .map_err(|e: url::ParseError| Error::InvalidTokenUrl(e.to_string()))
}

#[derive(Debug, Clone)]
/// Authenticate with an `OAuth2` server using client credentials.
///
/// Tokens are fetched lazily from the token endpoint of the Identity Provider and cached per
/// scope set. A cached token is served until `refresh_tolerance` before it expires; after that
/// the next caller fetches a new one. If the server token response does not contain the
/// `expires_in` field, the token is assumed to be valid indefinitely.
///
/// Concurrent callers that miss the cache for the same scope set wait for a single token
/// request instead of each contacting the Identity Provider.
///
/// Uses `Arc` internally for cheap cloning.
pub struct ClientCredentialAuthorizer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    oauth2_client: TokenClient,
    http_client: reqwest::Client,
    max_retries: u32,
    retry_interval: Duration,
    scopes: Vec<Scope>,
    tolerance: Duration,
    cache: TokenCache,
}

#[derive(veil::Redact, Clone)]
struct Token {
    #[redact]
    header: Arc<HeaderValue>,
    expiry: Option<Instant>,
}

impl Token {
    fn try_from_tr<TR: TokenResponse>(tr: &TR) -> Result<Self, Error> {
        bearer_header(tr.access_token().secret()).map(|header| Token {
            header: Arc::new(header),
            expiry: tr.expires_in().map(|e| Instant::now() + e),
        })
    }

    fn is_fresh(&self, tolerance: Duration) -> bool {
        self.expiry
            .map_or(true, |expiry| Instant::now() + tolerance < expiry)
    }
}

/// Tokens keyed by their space separated scope set, plus one async lock per key
/// that serializes fetches for that key.
#[derive(Debug, Default)]
struct TokenCache {
    tokens: RwLock<HashMap<String, Token>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    fn fresh(&self, key: &str, tolerance: Duration) -> Option<Arc<HeaderValue>> {
        // Unwrap RWLock to propagate poison (writer panicked)
        let tokens = self.tokens.read().expect("Non-poisoned lock");
        tokens
            .get(key)
            .filter(|t| t.is_fresh(tolerance))
            .map(|t| t.header.clone())
    }

    fn flight(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().expect("Non-poisoned lock");
        in_flight.entry(key.to_string()).or_default().clone()
    }

    /// Give back a lock obtained from [`flight`](Self::flight), removing it from the map
    /// once no other caller holds it. Clones are only made and dropped under the map lock,
    /// so the last holder always sees a count of two.
    fn land(&self, key: &str, flight: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().expect("Non-poisoned lock");
        let idle = Arc::strong_count(&flight) == 2
            && in_flight.get(key).is_some_and(|f| Arc::ptr_eq(f, &flight));
        drop(flight);
        if idle {
            in_flight.remove(key);
        }
    }

    fn store(&self, key: String, token: Token) {
        let mut tokens = self.tokens.write().expect("Non-poisoned lock");
        tokens.insert(key, token);
    }

    fn clear(&self) {
        let mut tokens = self.tokens.write().expect("Non-poisoned lock");
        tokens.clear();
    }
}

fn scope_key(scopes: &[Scope]) -> String {
    scopes
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builder for [`ClientCredentialAuthorizer`].
///
/// The following configurations are available:
/// * `max_retries`: Number of consecutive retries for token requests. Default is 0.
/// * `retry_interval`: Interval between consecutive retries. Default is 10ms.
/// * `http_client`: Custom `reqwest::Client` to use for token requests. Default is a client with redirects disabled.
/// * `scopes`: Scopes to request in the token. Empty by default.
/// * `refresh_tolerance`: How long before expiry a cached token is considered stale. Default is 30 seconds.
///
/// Client credentials are sent in the request body, as Entra ID expects.
#[derive(Debug, Clone)]
pub struct ClientCredentialAuthorizerBuilder {
    oauth2_client: TokenClient,
    max_retries: Option<u32>,
    retry_interval: Option<Duration>,
    http_client: Option<reqwest::Client>,
    scopes: Vec<Scope>,
    refresh_tolerance: Option<Duration>,
}

impl ClientCredentialAuthorizerBuilder {
    /// Create a new builder from a client id, client secret and token url.
    #[must_use]
    pub fn new(client_id: &str, client_secret: &str, token_url: url::Url) -> Self {
        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.to_string()))
            .set_auth_type(AuthType::RequestBody)
            .set_token_uri(TokenUrl::from_url(token_url));

        Self {
            oauth2_client: client,
            max_retries: None,
            retry_interval: None,
            http_client: None,
            scopes: Vec::new(),
            refresh_tolerance: None,
        }
    }

    /// Optionally specify the `reqwest::Client` to use for token requests.
    /// When setting a custom client, please make sure to set the `redirect` policy to `Policy::none()`
    /// to prevent SSRF vulnerabilities.
    ///
    /// If not set, a default async client is created with redirects disabled.
    #[must_use]
    pub fn set_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Optionally set the maximum number of retries when fetching a new token.
    /// The default is 0.
    #[must_use]
    pub fn set_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Optionally set the retry interval when fetching a new token.
    /// The default is 10ms.
    #[must_use]
    pub fn set_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    /// Add a scope to the token request.
    #[must_use]
    pub fn add_scope(mut self, scope: &str) -> Self {
        self.scopes.push(Scope::new(scope.to_string()));
        self
    }

    /// Add multiple scopes to the token request.
    #[must_use]
    pub fn add_scopes<I>(mut self, scopes: &[I]) -> Self
    where
        I: AsRef<str>,
    {
        self.scopes
            .extend(scopes.iter().map(|s| Scope::new(s.as_ref().to_string())));
        self
    }

    /// Set the refresh tolerance.
    /// Cached tokens are replaced `tolerance` before expiry.
    /// Default is 30 seconds.
    #[must_use]
    pub fn refresh_tolerance(mut self, tolerance: Duration) -> Self {
        self.refresh_tolerance = Some(tolerance);
        self
    }

    /// Build the [`ClientCredentialAuthorizer`].
    /// No token is fetched until the first call to
    /// [`Authorizer::authorization_header`].
    ///
    /// # Errors
    ///
    /// Fails if [`Self::set_http_client`] was not called and the default client cannot be built.
    pub fn build(self) -> Result<ClientCredentialAuthorizer, Error> {
        let http_client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(Arc::new)?,
        };

        let inner = Inner {
            oauth2_client: self.oauth2_client,
            http_client,
            max_retries: self.max_retries.unwrap_or(0),
            retry_interval: self
                .retry_interval
                .unwrap_or_else(|| Duration::from_millis(10)),
            scopes: self.scopes,
            tolerance: self.refresh_tolerance.unwrap_or(Duration::from_secs(30)),
            cache: TokenCache::default(),
        };

        tracing::debug!(
            "Created client credential authorizer for client `{}`",
            inner.oauth2_client.client_id().as_str()
        );

        Ok(ClientCredentialAuthorizer {
            inner: Arc::new(inner),
        })
    }
}

impl ClientCredentialAuthorizer {
    /// Create a new [`ClientCredentialAuthorizerBuilder`].
    #[must_use]
    pub fn builder(
        client_id: &str,
        client_secret: &str,
        token_url: url::Url,
    ) -> ClientCredentialAuthorizerBuilder {
        ClientCredentialAuthorizerBuilder::new(client_id, client_secret, token_url)
    }

    /// Obtain an authorization header for an explicit set of scopes, bypassing the
    /// scopes configured on the builder. Shares the cache with
    /// [`Authorizer::authorization_header`].
    ///
    /// # Errors
    /// Fails if the Identity Provider does not issue a usable token.
    pub async fn authorization_header_for<I>(
        &self,
        scopes: &[I],
    ) -> Result<Arc<HeaderValue>, Error>
    where
        I: AsRef<str>,
    {
        let scopes = scopes
            .iter()
            .map(|s| Scope::new(s.as_ref().to_string()))
            .collect::<Vec<_>>();
        self.inner.token(&scopes).await
    }
}

async fn request_new_token(
    oauth2_client: &TokenClient,
    scopes: &[Scope],
    http_client: &reqwest::Client,
    max_retries: u32,
    retry_interval: Duration,
) -> Result<oauth2::basic::BasicTokenResponse, Error> {
    let mut counter = 0;

    let token = loop {
        counter += 1;

        let mut request = oauth2_client.exchange_client_credentials();

        for scope in scopes {
            request = request.add_scope(scope.clone());
        }

        let auth_response = request.request_async(http_client).await;

        match auth_response {
            Ok(auth_response) => {
                tracing::debug!(
                    "Successfully fetched token for client `{}`",
                    oauth2_client.client_id().as_str(),
                );
                break auth_response;
            }
            Err(e) => {
                if counter > max_retries {
                    tracing::error!("Failed to fetch token after {} attempts: {e}", counter);
                    return Err(e.into());
                };
                tracing::debug!(
                    "Failed to fetch token: {e}. Retrying in {}ms",
                    retry_interval.as_millis()
                );
                tokio::time::sleep(retry_interval).await;
            }
        }
    };

    Ok(token)
}

impl Inner {
    async fn token(&self, scopes: &[Scope]) -> Result<Arc<HeaderValue>, Error> {
        let key = scope_key(scopes);

        if let Some(header) = self.cache.fresh(&key, self.tolerance) {
            tracing::trace!("Serving cached token for scopes `{key}`");
            return Ok(header);
        }

        let flight = self.cache.flight(&key);
        let result = self.fetch(key.clone(), scopes, &flight).await;
        self.cache.land(&key, flight);
        result
    }

    async fn fetch(
        &self,
        key: String,
        scopes: &[Scope],
        flight: &tokio::sync::Mutex<()>,
    ) -> Result<Arc<HeaderValue>, Error> {
        let _guard = flight.lock().await;

        // Another caller may have refreshed the token while we waited.
        if let Some(header) = self.cache.fresh(&key, self.tolerance) {
            tracing::trace!("Token for scopes `{key}` was fetched concurrently");
            return Ok(header);
        }

        let tr = request_new_token(
            &self.oauth2_client,
            scopes,
            &self.http_client,
            self.max_retries,
            self.retry_interval,
        )
        .await?;

        let token = Token::try_from_tr(&tr).inspect_err(|e| {
            tracing::error!("Identity provider issued an unusable token: {e}");
        })?;

        if let Some(expires_in) = tr.expires_in() {
            if expires_in <= self.tolerance {
                tracing::warn!(
                    "Token expires in {}s, within the refresh tolerance of {}s. It will not be reused.",
                    expires_in.as_secs(),
                    self.tolerance.as_secs()
                );
            }
        }

        let header = token.header.clone();
        self.cache.store(key, token);
        Ok(header)
    }
}

impl Authorizer for ClientCredentialAuthorizer {
    async fn authorization_header(&self) -> Result<Arc<HeaderValue>, Error> {
        self.inner.token(&self.inner.scopes).await
    }

    fn invalidate(&self) {
        tracing::debug!(
            "Invalidating cached tokens for client `{}`",
            self.inner.oauth2_client.client_id().as_str()
        );
        self.inner.cache.clear();
    }
}

#[cfg(test)]
mod test {
    use http::header::CONTENT_TYPE;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    fn token_body(expires_in: Option<u64>) -> String {
        let mut body = serde_json::json!({
            "access_token": "my-issued-token",
            "token_type": "Bearer",
        });
        if let Some(expires_in) = expires_in {
            body["expires_in"] = expires_in.into();
        }
        body.to_string()
    }

    async fn token_mock(
        server: &mut mockito::Server,
        body: String,
        expect: usize,
    ) -> mockito::Mock {
        server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("grant_type=client_credentials".to_string()),
                mockito::Matcher::Regex("scope=my-scope\\+my-other-scope".to_string()),
                mockito::Matcher::Regex("client_id=my-client".to_string()),
                mockito::Matcher::Regex("client_secret=my-secret".to_string()),
            ]))
            .match_header("accept", "application/json")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .with_status(200)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(body)
            .expect(expect)
            .create_async()
            .await
    }

    fn in_flight_len(authorizer: &ClientCredentialAuthorizer) -> usize {
        authorizer.inner.cache.in_flight.lock().unwrap().len()
    }

    fn builder(url: &str) -> ClientCredentialAuthorizerBuilder {
        ClientCredentialAuthorizer::builder(
            "my-client",
            "my-secret",
            azure_ad_token_url(url, "my-tenant").unwrap(),
        )
        .add_scope("my-scope")
        .add_scope("my-other-scope")
    }

    #[test]
    fn test_azure_ad_token_url() {
        let url = azure_ad_token_url("https://login.microsoftonline.com/", " my-tenant\n").unwrap();
        assert_eq!(
            url.as_str(),
            "https://login.microsoftonline.com/my-tenant/oauth2/v2.0/token"
        );
        assert!(azure_ad_token_url("not a url", "tenant").is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_client_credentials() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(3600)), 1).await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        let token = authorizer.authorization_header().await.unwrap();
        assert_eq!(token.to_str().unwrap(), "Bearer my-issued-token");

        // Served from the cache.
        let token = authorizer.authorization_header().await.unwrap();
        assert_eq!(token.to_str().unwrap(), "Bearer my-issued-token");

        mock.assert_async().await;
        assert!(logs_contain("Successfully fetched token for client `my-client`"));
    }

    #[tokio::test]
    async fn test_no_token_fetched_before_first_use() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(3600)), 0).await;

        let _authorizer = builder(&oauth_server.url()).build().unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_without_expiry_is_reused() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(None), 1).await;

        let authorizer = builder(&oauth_server.url())
            .refresh_tolerance(Duration::from_secs(3600))
            .build()
            .unwrap();

        for _ in 0..3 {
            authorizer.authorization_header().await.unwrap();
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_refetched() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(1)), 2).await;

        let authorizer = builder(&oauth_server.url())
            .refresh_tolerance(Duration::from_secs(0))
            .build()
            .unwrap();

        authorizer.authorization_header().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        authorizer.authorization_header().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_within_tolerance_is_refetched() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(10)), 2).await;

        let authorizer = builder(&oauth_server.url())
            .refresh_tolerance(Duration::from_secs(30))
            .build()
            .unwrap();

        authorizer.authorization_header().await.unwrap();
        authorizer.authorization_header().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_fetch_once() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(3600)), 1).await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        let handles = (0..16)
            .map(|_| {
                let authorizer = authorizer.clone();
                tokio::spawn(async move { authorizer.authorization_header().await })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.to_str().unwrap(), "Bearer my-issued-token");
        }

        mock.assert_async().await;
        assert_eq!(in_flight_len(&authorizer), 0);
    }

    #[tokio::test]
    async fn test_fetch_locks_are_released_per_scope() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .with_status(200)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(token_body(Some(3600)))
            .expect(3)
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        for scope in ["reporting", "archive", "audit"] {
            authorizer.authorization_header_for(&[scope]).await.unwrap();
            assert_eq!(in_flight_len(&authorizer), 0);
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_its_lock() {
        let mut oauth_server = mockito::Server::new_async().await;
        let _mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .with_status(500)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        assert!(authorizer.authorization_header().await.is_err());
        assert_eq!(in_flight_len(&authorizer), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = token_mock(&mut oauth_server, token_body(Some(3600)), 2).await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        authorizer.authorization_header().await.unwrap();
        authorizer.invalidate();
        authorizer.authorization_header().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cache_is_keyed_by_scope() {
        let mut oauth_server = mockito::Server::new_async().await;
        let default_mock = token_mock(&mut oauth_server, token_body(Some(3600)), 1).await;
        let other_mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .match_body(mockito::Matcher::Regex("scope=reporting".to_string()))
            .with_status(200)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(
                serde_json::json!({
                    "access_token": "reporting-token",
                    "token_type": "Bearer",
                    "expires_in": 3600
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        let default_token = authorizer.authorization_header().await.unwrap();
        let reporting_token = authorizer
            .authorization_header_for(&["reporting"])
            .await
            .unwrap();
        let reporting_again = authorizer
            .authorization_header_for(&["reporting"])
            .await
            .unwrap();

        assert_eq!(default_token.to_str().unwrap(), "Bearer my-issued-token");
        assert_eq!(reporting_token.to_str().unwrap(), "Bearer reporting-token");
        assert_eq!(reporting_again, reporting_token);

        default_mock.assert_async().await;
        other_mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_credentials_are_not_cached() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .with_status(401)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(
                serde_json::json!({
                    "error": "invalid_client",
                    "error_description": "Invalid client secret provided."
                })
                .to_string(),
            )
            .expect(2)
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        for _ in 0..2 {
            let err = authorizer.authorization_header().await.unwrap_err();
            assert!(matches!(err, Error::OAuth2RequestFailed(_)), "{err:?}");
        }

        mock.assert_async().await;
        assert!(logs_contain("Failed to fetch token after 1 attempts"));
    }

    #[tokio::test]
    async fn test_retries_until_max_retries() {
        let mut oauth_server = mockito::Server::new_async().await;
        let mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .with_status(500)
            .with_body("upstream unavailable")
            .expect(3)
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url())
            .set_max_retries(2)
            .set_retry_interval(Duration::from_millis(1))
            .build()
            .unwrap();

        assert!(authorizer.authorization_header().await.is_err());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_access_token_is_rejected() {
        let mut oauth_server = mockito::Server::new_async().await;
        let _mock = oauth_server
            .mock("POST", "/my-tenant/oauth2/v2.0/token")
            .with_status(200)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(
                serde_json::json!({
                    "access_token": "",
                    "token_type": "Bearer",
                    "expires_in": 3600
                })
                .to_string(),
            )
            .create_async()
            .await;

        let authorizer = builder(&oauth_server.url()).build().unwrap();

        assert!(matches!(
            authorizer.authorization_header().await,
            Err(Error::EmptyToken)
        ));
    }
}
