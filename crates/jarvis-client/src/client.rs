use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::auth::{TokenCache, TokenSource, resolve_bearer};
use crate::config::{ClientConfig, ConfigUpdate};
use crate::errors::ClientError;
use crate::request::{
    JARVIS_STREAM_ENDPOINT, JarvisStreamOptions, StreamRequests, build_stream_url, merge_payload,
    options_map,
};
use crate::transport::{HttpFetcher, StreamFetcher};

pub use reqwest::Method;

/// Decoded JSON body of a successful request.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
}

/// Result of [`JarvisClient::gen_tts`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsResponse {
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Inline audio as returned by the server (typically base64).
    #[serde(default)]
    pub audio_data: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of [`JarvisClient::request_nlu`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NluResponse {
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub entities: Option<Map<String, Value>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Entry point for requests and streaming sessions against the Jarvis API.
///
/// ```no_run
/// use jarvis_client::{ClientConfig, JarvisClient};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), jarvis_client::ClientError> {
/// let client = JarvisClient::new(ClientConfig::from_env()?)?;
/// let nlu = client.request_nlu("what's the weather").await?;
/// println!("{:?}", nlu.intent);
/// # Ok(())
/// # }
/// ```
pub struct JarvisClient {
    config: ClientConfig,
    http: reqwest::Client,
    fetcher: Arc<dyn StreamFetcher>,
    custom_fetcher: bool,
    token_source: Option<Arc<dyn TokenSource>>,
    token_cache: Arc<TokenCache>,
}

impl JarvisClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        let fetcher = HttpFetcher::new(config.timeout)?;
        Ok(Self {
            config,
            http,
            fetcher: Arc::new(fetcher),
            custom_fetcher: false,
            token_source: None,
            token_cache: Arc::new(TokenCache::default()),
        })
    }

    /// Creates a client from [`ClientConfig::from_env`].
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Replaces the fetcher used by streaming sessions.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn StreamFetcher>) -> Self {
        self.fetcher = fetcher;
        self.custom_fetcher = true;
        self
    }

    /// Supplies bearer tokens for requests when no API key is configured.
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>, cache: Arc<TokenCache>) -> Self {
        self.token_source = Some(source);
        self.token_cache = cache;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Merges `update` into the current config. The config is left untouched
    /// when the merged result is invalid.
    pub fn update_config(&mut self, update: ConfigUpdate) -> Result<(), ClientError> {
        let mut next = self.config.clone();
        update.apply_to(&mut next);
        next.validate()?;
        if !self.custom_fetcher && next.timeout != self.config.timeout {
            self.fetcher = Arc::new(HttpFetcher::new(next.timeout)?);
        }
        self.config = next;
        debug!(base_url = %self.config.base_url, "client config updated");
        Ok(())
    }

    /// Streaming entry points.
    pub fn stream(&self) -> StreamRequests<'_> {
        StreamRequests::new(&self.config, self.fetcher.clone())
    }

    pub fn build_stream_url(
        &self,
        endpoint: &str,
        payload: &Map<String, Value>,
    ) -> Result<String, ClientError> {
        build_stream_url(&self.config, endpoint, payload)
    }

    /// Sends `data` as JSON to `endpoint` and decodes the JSON response.
    pub async fn api_request(
        &self,
        endpoint: &str,
        data: Option<&Value>,
        method: Method,
    ) -> Result<ApiResponse, ClientError> {
        self.make_request(method, endpoint, data).await
    }

    /// Generates WAV speech for `text`.
    pub async fn gen_tts(&self, text: &str) -> Result<TtsResponse, ClientError> {
        let body = json!({"text": text, "format": "wav"});
        let response = self.make_request(Method::POST, "/tts", Some(&body)).await?;
        decode_data(response.data)
    }

    /// Runs intent and entity extraction on `query`.
    pub async fn request_nlu(&self, query: &str) -> Result<NluResponse, ClientError> {
        let body = json!({"query": query, "includeEntities": true});
        let response = self.make_request(Method::POST, "/nlu", Some(&body)).await?;
        decode_data(response.data)
    }

    /// Runs a Jarvis turn without streaming: `{input, ...options}`.
    pub async fn jarvis(
        &self,
        input: &str,
        options: &JarvisStreamOptions,
    ) -> Result<ApiResponse, ClientError> {
        let mut lead = Map::new();
        lead.insert("input".into(), Value::String(input.to_string()));
        let body = Value::Object(merge_payload([lead, options_map(options)?]));
        self.make_request(Method::POST, JARVIS_STREAM_ENDPOINT, Some(&body))
            .await
    }

    async fn bearer(&self) -> Result<Option<String>, ClientError> {
        resolve_bearer(
            self.config.api_key.as_deref(),
            self.token_source.as_deref(),
            &self.token_cache,
        )
        .await
    }

    async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        data: Option<&Value>,
    ) -> Result<ApiResponse, ClientError> {
        let url = self.config.endpoint_url(endpoint);
        let timeout_ms = self.config.timeout_ms();
        debug!(%method, %url, "sending request");

        let mut req = self
            .http
            .request(method, &url)
            .timeout(self.config.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = self.bearer().await? {
            req = req.bearer_auth(token);
        }
        if let Some(data) = data {
            req = req.json(data);
        }

        let response = req
            .send()
            .await
            .map_err(|e| request_error(&e, timeout_ms))?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), %url, "request failed");
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        let data = response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout { ms: timeout_ms }
            } else {
                ClientError::Decode(e.to_string())
            }
        })?;
        Ok(ApiResponse {
            status: status.as_u16(),
            data,
        })
    }
}

fn request_error(err: &reqwest::Error, timeout_ms: u64) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout { ms: timeout_ms }
    } else {
        ClientError::Transport(err.to_string())
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_rejects_invalid_base_url() {
        let err = JarvisClient::new(ClientConfig::new("k").base_url("::nope"))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn invalid_update_keeps_previous_config() {
        let mut client = JarvisClient::new(ClientConfig::new("k")).unwrap();
        let err = client
            .update_config(ConfigUpdate {
                base_url: Some("not a url".into()),
                ..ConfigUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert_eq!(client.config().base_url, crate::config::DEFAULT_BASE_URL);
    }

    #[test]
    fn updated_key_flows_into_stream_urls() {
        let mut client =
            JarvisClient::new(ClientConfig::new("old").base_url("http://localhost/api")).unwrap();
        client
            .update_config(ConfigUpdate {
                api_key: Some("new".into()),
                timeout: Some(Duration::from_secs(2)),
                ..ConfigUpdate::default()
            })
            .unwrap();
        let session = client
            .stream()
            .jarvis("hi", JarvisStreamOptions::default())
            .unwrap();
        assert!(session.url().starts_with("http://localhost/api/new-jarvis-stream?key=new&"));
        assert_eq!(client.config().timeout, Duration::from_secs(2));
    }

    #[test]
    fn tts_response_reads_camel_case_fields() {
        let parsed: TtsResponse =
            decode_data(json!({"audioUrl": "https://cdn/x.wav", "message": "ok"})).unwrap();
        assert_eq!(parsed.audio_url.as_deref(), Some("https://cdn/x.wav"));
        assert_eq!(parsed.audio_data, None);
        assert_eq!(parsed.message.as_deref(), Some("ok"));
    }
}
