use std::time::Duration;

use crate::errors::ClientError;

/// Default Jarvis API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://jarvis-online.vercel.app/api";
/// Default timeout for non-streaming requests and stream connects.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`crate::JarvisClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL every endpoint path is appended to.
    pub base_url: String,
    /// API key, sent as the `key` query parameter of stream URLs and as a
    /// bearer token on other requests.
    pub api_key: Option<String>,
    /// Hard timeout for non-streaming requests and stream connects.
    pub timeout: Duration,
    /// Identifier of this client on the realtime channel.
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            client_id: None,
        }
    }
}

impl ClientConfig {
    /// Creates a config with defaults and the provided API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `JARVIS_API_KEY`: API key (optional).
    /// - `JARVIS_BASE_URL`: base URL override.
    /// - `JARVIS_TIMEOUT_MS`: timeout in milliseconds.
    /// - `JARVIS_CLIENT_ID`: realtime client id.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = Self::default();
        if let Some(key) = non_empty_env("JARVIS_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(url) = non_empty_env("JARVIS_BASE_URL") {
            config.base_url = url;
        }
        if let Some(raw) = non_empty_env("JARVIS_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                ClientError::Config(format!("JARVIS_TIMEOUT_MS must be an integer, got {raw:?}"))
            })?;
            config.timeout = Duration::from_millis(ms);
        }
        config.client_id = non_empty_env("JARVIS_CLIENT_ID");
        Ok(config)
    }

    /// Overrides the API base URL (for proxies or local servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Joins the base URL and an endpoint path with exactly one `/`.
    pub(crate) fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        reqwest::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Config(format!("invalid base URL {:?}: {e}", self.base_url)))?;
        if self.timeout.is_zero() {
            return Err(ClientError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Partial update merged into the current config by
/// [`crate::JarvisClient::update_config`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Option<Duration>,
    pub client_id: Option<String>,
}

impl ConfigUpdate {
    pub(crate) fn apply_to(self, config: &mut ClientConfig) {
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        if let Some(api_key) = self.api_key {
            config.api_key = Some(api_key);
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(client_id) = self.client_id {
            config.client_id = Some(client_id);
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
