//! Relay between the Academy frontend and the Business Central OData API.
//!
//! Every `/api/*` request is forwarded to
//! `{BC_BASE_URL}/v2.0/{tenant}/{environment}/api/alletec/learning/{version}/companies({company})/...`
//! with a client-credentials bearer token obtained from Entra ID. Failures are answered with
//! a JSON envelope `{ "error": ..., "details": ... }`.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bc_auth::{azure_ad_token_url, Authorizer, ClientCredentialAuthorizer, HttpClient};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod config;
pub mod cors;
pub mod error;
pub mod relay;
pub mod target;

use config::RelayConfig;
use cors::{reject_disallowed_origin, AllowedOrigins};
use error::{RelayError, StartupError};
use relay::Relay;
use target::sanitize;

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn proxy<A: Authorizer + 'static>(
    State(relay): State<Arc<Relay<A>>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, RelayError> {
    relay.handle(method, &uri, body).await
}

/// Assemble the relay's routes and middleware.
pub fn router<A: Authorizer + 'static>(relay: Relay<A>) -> Router {
    let config = relay.config().clone();
    let origins = Arc::new(AllowedOrigins::new(&config.allowed_origins));
    let cors = origins.cors_layer(&config);

    Router::new()
        .route("/health", get(health))
        .route("/api", any(proxy::<A>))
        .route("/api/", any(proxy::<A>))
        .route("/api/{*resource}", any(proxy::<A>))
        .with_state(Arc::new(relay))
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            origins,
            reject_disallowed_origin,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Build the Business Central client from `config`.
///
/// # Errors
/// Fails if the token endpoint URL or the HTTP clients cannot be built.
pub fn business_central_client(
    config: &RelayConfig,
) -> Result<HttpClient<ClientCredentialAuthorizer>, StartupError> {
    let token_url = azure_ad_token_url(
        &sanitize(&config.authority_host),
        &sanitize(&config.credentials.tenant_id),
    )?;

    let authorizer = ClientCredentialAuthorizer::builder(
        &sanitize(&config.credentials.client_id),
        &config.credentials.client_secret,
        token_url,
    )
    .add_scope(&config.scope)
    .set_max_retries(config.token_max_retries)
    .build()?;

    let client = reqwest::Client::builder().build()?;

    Ok(HttpClient::new(authorizer).set_client(client))
}

/// Serve the relay until Ctrl+C or SIGTERM.
///
/// # Errors
/// Fails if the client cannot be built or the listener cannot be bound.
pub async fn start_server(config: RelayConfig) -> Result<(), StartupError> {
    let config = Arc::new(config);
    let client = business_central_client(&config)?;
    let app = router(Relay::new(client, config.clone()));

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Binding to {address}");

    let listener = TcpListener::bind(address).await?;
    info!("Relay running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install terminate handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
