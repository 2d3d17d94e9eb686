//! Configuration for the chat client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ChatError, ChatResult};

/// Environment variable for the backend base URL.
pub const API_URL_ENV: &str = "MATERNAL_CHAT_API_URL";
/// Environment variable for the bearer token.
pub const TOKEN_ENV: &str = "MATERNAL_CHAT_TOKEN";
/// Environment variable for the retrieval depth.
pub const TOP_K_ENV: &str = "MATERNAL_CHAT_TOP_K";
/// Environment variable for the primary stall window, in milliseconds.
pub const PRIMARY_TIMEOUT_ENV: &str = "MATERNAL_CHAT_PRIMARY_TIMEOUT_MS";
/// Environment variable for the secondary stall window, in milliseconds.
pub const SECONDARY_TIMEOUT_ENV: &str = "MATERNAL_CHAT_SECONDARY_TIMEOUT_MS";

/// Default backend base URL.
const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Configuration for the chat client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend base URL, without the `/api` prefix.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Number of retrieved passages the backend should use.
    pub top_k: u32,
    /// Stall window before any data arrives.
    #[serde(with = "duration_serde")]
    pub primary_timeout: Duration,
    /// Stall window after `sources`/`ready` but before the first token.
    #[serde(with = "duration_serde")]
    pub secondary_timeout: Duration,
    /// Connection timeout.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Whole-request timeout for non-streaming calls.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            top_k: 4,
            primary_timeout: Duration::from_secs(5),
            secondary_timeout: Duration::from_secs(7),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    /// Create a new config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `MATERNAL_CHAT_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default value.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(API_URL_ENV) {
            config.base_url = url;
        }
        config.token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty());
        if let Some(top_k) = env_parse::<u32>(TOP_K_ENV) {
            config.top_k = top_k;
        }
        if let Some(ms) = env_parse::<u64>(PRIMARY_TIMEOUT_ENV) {
            config.primary_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(SECONDARY_TIMEOUT_ENV) {
            config.secondary_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// Set the backend base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the retrieval depth.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set both stall windows.
    #[must_use]
    pub const fn with_stall_timeouts(mut self, primary: Duration, secondary: Duration) -> Self {
        self.primary_timeout = primary;
        self.secondary_timeout = secondary;
        self
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse or a value is out of range.
    pub fn validate(&self) -> ChatResult<()> {
        let url = Url::parse(&self.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ChatError::Config(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.top_k == 0 {
            return Err(ChatError::Config("top_k must be > 0".to_string()));
        }

        if self.primary_timeout.is_zero() || self.secondary_timeout.is_zero() {
            return Err(ChatError::Config(
                "stall timeouts must be > 0".to_string(),
            ));
        }

        if self.secondary_timeout < self.primary_timeout {
            tracing::warn!(
                primary_ms = self.primary_timeout.as_millis(),
                secondary_ms = self.secondary_timeout.as_millis(),
                "secondary stall window is shorter than the primary one"
            );
        }

        Ok(())
    }

    /// Join an API path (e.g. `chats/abc/messages`) onto the base URL.
    ///
    /// # Errors
    /// Returns an error if the resulting URL is invalid.
    pub fn endpoint(&self, path: &str) -> ChatResult<Url> {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/api/{path}"))?)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde module for Duration serialization, in milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
