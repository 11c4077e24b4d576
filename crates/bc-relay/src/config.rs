//! Relay configuration, read once at startup.
//!
//! Missing variables fall back to an empty string or a default and are logged; values that
//! are present but cannot be parsed are a startup error.
use std::{fmt::Display, str::FromStr, time::Duration};

use bc_auth::BUSINESS_CENTRAL_SCOPE;
use http::Method;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Identity provider application credentials.
#[derive(Clone, TypedBuilder, veil::Redact)]
pub struct Credentials {
    #[builder(setter(into))]
    pub client_id: String,
    #[builder(setter(into))]
    pub tenant_id: String,
    #[redact]
    #[builder(setter(into))]
    pub client_secret: String,
}

/// The five values addressing a Business Central company.
#[derive(Debug, Clone, TypedBuilder)]
pub struct BcTarget {
    #[builder(setter(into))]
    pub base_url: String,
    #[builder(setter(into))]
    pub tenant_id: String,
    #[builder(setter(into))]
    pub environment: String,
    #[builder(setter(into))]
    pub api_version: String,
    #[builder(setter(into))]
    pub company_id: String,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RelayConfig {
    #[builder(default = DEFAULT_PORT)]
    pub port: u16,
    pub credentials: Credentials,
    pub target: BcTarget,
    #[builder(default = DEFAULT_AUTHORITY_HOST.to_string(), setter(into))]
    pub authority_host: String,
    #[builder(default = BUSINESS_CENTRAL_SCOPE.to_string(), setter(into))]
    pub scope: String,
    #[builder(default)]
    pub token_max_retries: u32,
    #[builder(default = vec![DEFAULT_ALLOWED_ORIGIN.to_string()])]
    pub allowed_origins: Vec<String>,
    /// Empty means any method.
    #[builder(default)]
    pub allowed_methods: Vec<Method>,
    /// Entity set names; empty means any resource.
    #[builder(default)]
    pub allowed_resources: Vec<String>,
    /// Answer every successful relay with 200 instead of the upstream status.
    #[builder(default)]
    pub flatten_success_status: bool,
    #[builder(default, setter(strip_option))]
    pub upstream_timeout: Option<Duration>,
}

impl RelayConfig {
    /// Load the configuration from the process environment.
    ///
    /// # Errors
    /// Fails if a variable is set to a value that cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    /// Fails if a variable is set to a value that cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = Credentials {
            client_id: required(&lookup, "BC_CLIENT_ID"),
            tenant_id: required(&lookup, "BC_TENANT_ID"),
            client_secret: required(&lookup, "BC_CLIENT_SECRET"),
        };

        let target = BcTarget {
            base_url: required(&lookup, "BC_BASE_URL"),
            tenant_id: credentials.tenant_id.clone(),
            environment: required(&lookup, "BC_ENVIRONMENT"),
            api_version: required(&lookup, "BC_API_VERSION"),
            company_id: required(&lookup, "BC_COMPANY_ID"),
        };

        let allowed_methods = list(&lookup, "RELAY_ALLOWED_METHODS")
            .into_iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|e| {
                    ConfigError::Invalid {
                        key: "RELAY_ALLOWED_METHODS",
                        value: m.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let upstream_timeout = lookup("RELAY_UPSTREAM_TIMEOUT_SECS")
            .map(|value| parse::<u64>("RELAY_UPSTREAM_TIMEOUT_SECS", &value))
            .transpose()?
            .map(Duration::from_secs);

        let allowed_origins = lookup("CORS_ALLOWED_ORIGINS").map_or_else(
            || vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            |value| split_list(&value),
        );

        Ok(Self {
            port: optional(&lookup, "PORT", DEFAULT_PORT)?,
            credentials,
            target,
            authority_host: lookup("BC_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
            scope: lookup("BC_SCOPE").unwrap_or_else(|| BUSINESS_CENTRAL_SCOPE.to_string()),
            token_max_retries: optional(&lookup, "BC_TOKEN_MAX_RETRIES", 0)?,
            allowed_origins,
            allowed_methods,
            allowed_resources: list(&lookup, "RELAY_ALLOWED_RESOURCES"),
            flatten_success_status: optional(&lookup, "RELAY_FLATTEN_SUCCESS_STATUS", false)?,
            upstream_timeout,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| {
        warn!("Environment variable {key} not set, using an empty value");
        String::new()
    })
}

fn optional<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => parse(key, &value),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn list<F>(lookup: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| split_list(&v)).unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
