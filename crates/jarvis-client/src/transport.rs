use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use tracing::debug;

use crate::errors::TransportError;

/// Raw body chunks of an open stream.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send + 'static>>;

/// HTTP method used to open a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMethod {
    /// Payload travels in the query string.
    #[default]
    Get,
    /// Payload travels as a JSON body.
    Post,
}

/// Fully resolved description of one outbound stream call.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub url: String,
    pub method: StreamMethod,
    /// JSON body, sent only for `Post`.
    pub body: Option<serde_json::Value>,
    /// Bearer token for the `Authorization` header.
    pub bearer: Option<String>,
}

/// Opens event streams. Implemented over `reqwest` by [`HttpFetcher`]; tests
/// substitute in-memory fakes.
#[async_trait::async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Issues the request and returns the body stream on a 2xx status.
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;
}

/// `reqwest`-backed fetcher.
///
/// The timeout bounds connecting and waiting for the response headers; an
/// open stream may stay idle for as long as the server keeps it alive.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpFetcher {
    /// `connect_timeout` bounds everything up to the response headers.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }
}

#[async_trait::async_trait]
impl StreamFetcher for HttpFetcher {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let timeout_ms = u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut http_req = match request.method {
            StreamMethod::Get => self.client.get(&request.url),
            StreamMethod::Post => {
                let req = self.client.post(&request.url);
                match &request.body {
                    Some(body) => req.json(body),
                    None => req,
                }
            }
        }
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(token) = &request.bearer {
            http_req = http_req.bearer_auth(token);
        }

        debug!(method = ?request.method, "opening event stream");
        let response = tokio::time::timeout(self.connect_timeout, http_req.send())
            .await
            .map_err(|_| TransportError::Timeout { ms: timeout_ms })?
            .map_err(|e| TransportError::from_reqwest(&e, timeout_ms))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| TransportError::from_reqwest(&e, timeout_ms)));
        Ok(Box::pin(stream))
    }
}
