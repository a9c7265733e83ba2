//! Consumer configuration

use crate::error::{NozzleError, Result};
use crate::token::{mask_secret, StaticToken, TokenFetcher, UaaTokenFetcher};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_auth_timeout_ms() -> u64 {
    60_000
}

fn default_channel_capacity() -> usize {
    64
}

/// Settings for connecting a [`Consumer`](crate::Consumer) to the firehose
///
/// Exactly one credential path is required: a direct `token`, or
/// `uaa_addr` + `username` + `password`. When both are present the direct
/// token wins.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Doppler websocket address (e.g. `wss://doppler.example.com:443`)
    pub doppler_addr: String,

    /// Bearer token, including its type (e.g. `bearer eyJ...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// UAA address used to fetch a token when `token` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uaa_addr: Option<String>,

    /// UAA client id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// UAA client secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Identifies this consumer's share of a load-balanced firehose
    pub subscription_id: String,

    /// Skip TLS verification for both UAA and Doppler
    #[serde(default)]
    pub insecure: bool,

    /// Deadline for the token fetch in milliseconds; 0 disables it
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Capacity of each pipeline channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Logger sink for the pipeline's tasks; `None` uses the caller's
    /// current dispatcher
    #[serde(skip)]
    pub dispatch: Option<tracing::Dispatch>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            doppler_addr: String::new(),
            token: None,
            uaa_addr: None,
            username: None,
            password: None,
            subscription_id: String::new(),
            insecure: false,
            auth_timeout_ms: default_auth_timeout_ms(),
            channel_capacity: default_channel_capacity(),
            dispatch: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("doppler_addr", &self.doppler_addr)
            .field("token", &self.token.as_deref().map(mask_secret))
            .field("uaa_addr", &self.uaa_addr)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(mask_secret))
            .field("subscription_id", &self.subscription_id)
            .field("insecure", &self.insecure)
            .field("auth_timeout_ms", &self.auth_timeout_ms)
            .field("channel_capacity", &self.channel_capacity)
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl Config {
    pub fn new(doppler_addr: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            doppler_addr: doppler_addr.into(),
            subscription_id: subscription_id.into(),
            ..Default::default()
        }
    }

    /// Authenticate with an existing token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate by fetching a token from UAA
    pub fn with_uaa(
        mut self,
        uaa_addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.uaa_addr = Some(uaa_addr.into());
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Bound the token fetch; a zero duration disables the deadline
    ///
    /// Non-zero durations below one millisecond round up to 1ms so a short
    /// deadline never turns into no deadline.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.auth_timeout_ms = if millis == 0 && !timeout.is_zero() {
            1
        } else {
            millis
        };
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Route the pipeline's logs to `dispatch`
    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    fn has_uaa_credentials(&self) -> bool {
        present(&self.uaa_addr) && present(&self.username) && present(&self.password)
    }

    /// Check every field the pipeline needs
    pub fn validate(&self) -> Result<()> {
        if self.doppler_addr.trim().is_empty() {
            return Err(NozzleError::Config("doppler address must not be empty".to_string()));
        }
        if self.subscription_id.trim().is_empty() {
            return Err(NozzleError::Config("subscription id must not be empty".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(NozzleError::Config("channel capacity must be positive".to_string()));
        }
        if !present(&self.token) && !self.has_uaa_credentials() {
            return Err(NozzleError::Config(
                "either a token or UAA address, username and password are required".to_string(),
            ));
        }
        Ok(())
    }

    /// Token source implied by the credentials; direct token first
    pub fn token_fetcher(&self) -> Result<Box<dyn TokenFetcher>> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(Box::new(StaticToken::new(token)));
        }

        match (&self.uaa_addr, &self.username, &self.password) {
            (Some(uaa), Some(username), Some(password)) if self.has_uaa_credentials() => {
                Ok(Box::new(
                    UaaTokenFetcher::new(uaa, username, password)
                        .with_insecure(self.insecure)
                        .with_timeout(self.auth_timeout()),
                ))
            }
            _ => Err(NozzleError::Config(
                "no credential configured: set a token or UAA credentials".to_string(),
            )),
        }
    }
}
