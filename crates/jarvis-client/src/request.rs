//! Streaming request options and the `client.stream()` entry points.

use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::session::StreamSession;
use crate::transport::{StreamFetcher, StreamMethod, StreamRequest};

pub const JARVIS_STREAM_ENDPOINT: &str = "/new-jarvis-stream";
pub const TTS_STREAM_ENDPOINT: &str = "/tts/stream";
pub const NLU_STREAM_ENDPOINT: &str = "/nlu/stream";

/// Options for a Jarvis conversation turn.
///
/// Unset fields are omitted from the payload. Unknown server options go in
/// `extra` and are merged after the typed ones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JarvisStreamOptions {
    /// Emit interim fragments (server default: true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrim: Option<bool>,
    /// Generate speech alongside the text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<bool>,
    /// Force a model instead of the user's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// `true`/`false` or a mode string selecting full or incremental
    /// conversation snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convo_updates: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save: Option<bool>,
    /// Force the message to be proactive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pa: Option<bool>,
    /// Route the message through NLU first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlu_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Comma-separated media URLs for vision models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    /// Client time as a Unix timestamp in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JarvisStreamOptions {
    pub fn interim(mut self, enabled: bool) -> Self {
        self.interrim = Some(enabled);
        self
    }

    pub fn speech(mut self, enabled: bool) -> Self {
        self.speech = Some(enabled);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn convo_updates(mut self, mode: impl Into<Value>) -> Self {
        self.convo_updates = Some(mode.into());
        self
    }

    pub fn save(mut self, save: bool) -> Self {
        self.save = Some(save);
        self
    }

    pub fn proactive(mut self, pa: bool) -> Self {
        self.pa = Some(pa);
        self
    }

    pub fn nlu(mut self, enabled: bool) -> Self {
        self.nlu = Some(enabled);
        self
    }

    pub fn nlu_config(mut self, config: Value) -> Self {
        self.nlu_config = Some(config);
        self
    }

    /// Sets the caller location.
    pub fn location(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    /// Joins media URLs with commas.
    pub fn media<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = urls.into_iter().map(|u| u.as_ref().to_string()).collect();
        self.media = Some(joined.join(","));
        self
    }

    pub fn dt(mut self, unix_seconds: f64) -> Self {
        self.dt = Some(unix_seconds);
        self
    }

    /// Adds an option the typed fields do not cover.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Options for streaming text-to-speech.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsStreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TtsStreamOptions {
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Options for streaming NLU.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NluStreamOptions {
    #[serde(rename = "includeEntities", skip_serializing_if = "Option::is_none")]
    pub include_entities: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NluStreamOptions {
    pub fn include_entities(mut self, include: bool) -> Self {
        self.include_entities = Some(include);
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Serializes an options struct into a JSON object.
pub(crate) fn options_map<T: Serialize>(options: &T) -> Result<Map<String, Value>, ClientError> {
    match serde_json::to_value(options) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ClientError::Validation(format!(
            "options must serialize to an object, got {other}"
        ))),
        Err(e) => Err(ClientError::Validation(format!("invalid options: {e}"))),
    }
}

/// Merges `layers` left to right. A later key overwrites the value but keeps
/// the position where the key first appeared.
pub(crate) fn merge_payload<I>(layers: I) -> Map<String, Value>
where
    I: IntoIterator<Item = Map<String, Value>>,
{
    let mut payload = Map::new();
    for layer in layers {
        for (key, value) in layer {
            payload.insert(key, value);
        }
    }
    payload
}

fn single(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value.into());
    map
}

/// Characters `encodeURIComponent` leaves unescaped besides ASCII
/// alphanumerics.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Builds `{base_url}{endpoint}?key={api_key}&k=v...`.
///
/// Keys and values are percent-encoded as URI components. Strings are sent
/// as-is, objects and arrays JSON-encoded, nulls skipped.
pub fn build_stream_url(
    config: &ClientConfig,
    endpoint: &str,
    payload: &Map<String, Value>,
) -> Result<String, ClientError> {
    let base = reqwest::Url::parse(&config.endpoint_url(endpoint))
        .map_err(|e| ClientError::Config(format!("invalid stream URL for {endpoint}: {e}")))?;
    let mut url = String::from(base);
    url.push_str("?key=");
    url.extend(utf8_percent_encode(
        config.api_key.as_deref().unwrap_or(""),
        QUERY_COMPONENT,
    ));
    for (key, value) in payload {
        if let Some(value) = query_value(value) {
            url.push('&');
            url.extend(utf8_percent_encode(key, QUERY_COMPONENT));
            url.push('=');
            url.extend(utf8_percent_encode(&value, QUERY_COMPONENT));
        }
    }
    debug!(endpoint, "built stream URL");
    Ok(url)
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(number_text(n)),
        other => Some(other.to_string()),
    }
}

/// Whole floats print without a fractional part (`40.0` -> `40`).
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => {
            if f == 0.0 {
                "0".to_string()
            } else {
                format!("{f:.0}")
            }
        }
        _ => n.to_string(),
    }
}

/// Streaming entry points returned by [`crate::JarvisClient::stream`].
///
/// Sessions are built with the request resolved up front; nothing is sent
/// until [`StreamSession::start`].
pub struct StreamRequests<'a> {
    config: &'a ClientConfig,
    fetcher: Arc<dyn StreamFetcher>,
    method: StreamMethod,
}

impl<'a> StreamRequests<'a> {
    pub(crate) fn new(config: &'a ClientConfig, fetcher: Arc<dyn StreamFetcher>) -> Self {
        Self {
            config,
            fetcher,
            method: StreamMethod::Get,
        }
    }

    /// Sends the payload as a JSON POST body with a bearer header instead of
    /// query parameters.
    pub fn post(mut self) -> Self {
        self.method = StreamMethod::Post;
        self
    }

    /// Streams a Jarvis turn: `{input, ...options, stream: true}`.
    pub fn jarvis(
        &self,
        input: &str,
        options: JarvisStreamOptions,
    ) -> Result<StreamSession, ClientError> {
        if input.trim().is_empty() {
            return Err(ClientError::Validation("input must not be empty".into()));
        }
        let payload = merge_payload([
            single("input", input),
            options_map(&options)?,
            single("stream", true),
        ]);
        self.session(JARVIS_STREAM_ENDPOINT, payload)
    }

    /// Streams synthesized speech: `{text, stream: true, ...options}`.
    pub fn tts(&self, text: &str, options: TtsStreamOptions) -> Result<StreamSession, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::Validation("text must not be empty".into()));
        }
        let payload = merge_payload([
            single("text", text),
            single("stream", true),
            options_map(&options)?,
        ]);
        self.session(TTS_STREAM_ENDPOINT, payload)
    }

    /// Streams NLU results: `{query, stream: true, ...options}`.
    pub fn nlu(&self, query: &str, options: NluStreamOptions) -> Result<StreamSession, ClientError> {
        if query.trim().is_empty() {
            return Err(ClientError::Validation("query must not be empty".into()));
        }
        let payload = merge_payload([
            single("query", query),
            single("stream", true),
            options_map(&options)?,
        ]);
        self.session(NLU_STREAM_ENDPOINT, payload)
    }

    fn session(
        &self,
        endpoint: &str,
        payload: Map<String, Value>,
    ) -> Result<StreamSession, ClientError> {
        let request = match self.method {
            StreamMethod::Get => StreamRequest {
                url: build_stream_url(self.config, endpoint, &payload)?,
                method: StreamMethod::Get,
                body: None,
                bearer: None,
            },
            StreamMethod::Post => StreamRequest {
                url: self.config.endpoint_url(endpoint),
                method: StreamMethod::Post,
                body: Some(Value::Object(payload.clone())),
                bearer: self.config.api_key.clone().filter(|k| !k.is_empty()),
            },
        };
        Ok(StreamSession::new(request, payload, self.fetcher.clone()))
    }
}
