//! Bearer token acquisition
//!
//! The firehose authenticates with a bearer token. [`UaaTokenFetcher`]
//! obtains one from a UAA server with the client-credentials grant;
//! [`StaticToken`] wraps a token the caller already has.

use crate::error::{NozzleError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Rendered in place of a secret in logs and `Debug` output
pub const MASKED: &str = "**** (masked)";

/// Number of leading characters of a long secret kept visible
const VISIBLE_PREFIX: usize = 10;

/// Path of the UAA token endpoint
const TOKEN_PATH: &str = "/oauth/token";

/// Something that can produce the firehose `Authorization` value
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Return `"<token_type> <access_token>"`
    async fn fetch(&self) -> Result<String>;
}

/// A token supplied directly by the caller
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&mask_secret(&self.0)).finish()
    }
}

#[async_trait]
impl TokenFetcher for StaticToken {
    async fn fetch(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(NozzleError::Config("token must not be empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Fetches a token from UAA with the client-credentials grant
#[derive(Clone)]
pub struct UaaTokenFetcher {
    uaa_addr: String,
    username: String,
    password: String,
    insecure: bool,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for UaaTokenFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaaTokenFetcher")
            .field("uaa_addr", &self.uaa_addr)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl UaaTokenFetcher {
    pub fn new(
        uaa_addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uaa_addr: uaa_addr.into(),
            username: username.into(),
            password: password.into(),
            insecure: false,
            timeout: None,
        }
    }

    /// Bound the whole exchange; a zero duration disables the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Skip TLS certificate verification
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Check required fields without touching the network
    pub fn validate(&self) -> Result<()> {
        if self.uaa_addr.trim().is_empty() {
            return Err(NozzleError::Config("UAA address must not be empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(NozzleError::Config("username must not be empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(NozzleError::Config("password must not be empty".to_string()));
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.uaa_addr.trim_end_matches('/'), TOKEN_PATH)
    }

    async fn exchange(&self, endpoint: &str) -> Result<String> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .map_err(|e| NozzleError::Http(format!("failed to build HTTP client: {}", e)))?;

        let response = client
            .post(endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[
                ("client_id", self.username.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| request_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NozzleError::Auth {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| NozzleError::AuthResponse {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

        if body.access_token.is_empty() {
            return Err(NozzleError::AuthResponse {
                endpoint: endpoint.to_string(),
                reason: "empty access_token".to_string(),
            });
        }

        tracing::debug!(
            token_type = %body.token_type,
            expires_in = ?body.expires_in,
            "Access token received"
        );

        Ok(format!("{} {}", body.token_type, body.access_token))
    }
}

#[async_trait]
impl TokenFetcher for UaaTokenFetcher {
    async fn fetch(&self) -> Result<String> {
        self.validate()?;

        let endpoint = self.endpoint();
        tracing::info!(
            uaa = %endpoint,
            username = %self.username,
            password = %mask_secret(&self.password),
            timeout = ?self.timeout,
            "Fetching access token"
        );

        let Some(limit) = self.timeout else {
            return self.exchange(&endpoint).await;
        };

        let started = Instant::now();
        match tokio::time::timeout(limit, self.exchange(&endpoint)).await {
            Err(_) => Err(timeout_error(&endpoint, limit)),
            // A transport failure that surfaces past the deadline is the deadline's doing.
            Ok(Err(NozzleError::Http(_))) if started.elapsed() >= limit => {
                Err(timeout_error(&endpoint, limit))
            }
            Ok(result) => result,
        }
    }
}

fn request_error(endpoint: &str, err: reqwest::Error) -> NozzleError {
    if err.is_timeout() {
        NozzleError::Timeout(format!("{}: {}", endpoint, err))
    } else {
        NozzleError::Http(format!("{}: {}", endpoint, err))
    }
}

fn timeout_error(endpoint: &str, limit: Duration) -> NozzleError {
    NozzleError::Timeout(format!("no token from {} within {:?}", endpoint, limit))
}

/// Render a secret for logging
///
/// Secrets of up to 10 characters are fully replaced by [`MASKED`]; longer
/// ones keep their first 10 characters.
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= VISIBLE_PREFIX {
        return MASKED.to_string();
    }
    let prefix: String = secret.chars().take(VISIBLE_PREFIX).collect();
    format!("{}{}", prefix, MASKED)
}
