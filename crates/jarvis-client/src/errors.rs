/// Errors produced by a `StreamFetcher` while opening or reading a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Server answered with a non-2xx status.
    #[error("HTTP {status}: {reason} - {body}")]
    Status {
        status: u16,
        reason: String,
        body: String,
    },
    /// Connection, DNS, or mid-stream read failure.
    #[error("network error: {0}")]
    Network(String),
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },
    /// The response carried no readable body.
    #[error("no response body available for streaming")]
    MissingBody,
}

impl TransportError {
    /// Creates a network-level error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Returns the HTTP status code when the error came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout { ms: timeout_ms }
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Failure delivered to `on_error` observers through `StreamEvent::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamFailure {
    /// The server reported an `error` inside a well-formed payload.
    ///
    /// Does not end the session.
    #[error("{message}")]
    Application { message: String },
    /// Opening or reading the stream failed. The session is terminated.
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        status_code: Option<u16>,
    },
}

impl StreamFailure {
    /// Creates an application-level failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this failure.
    pub fn message(&self) -> &str {
        match self {
            Self::Application { message } | Self::Transport { message, .. } => message,
        }
    }

    /// Returns true when this failure ended the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<&TransportError> for StreamFailure {
    fn from(err: &TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
            status_code: err.status_code(),
        }
    }
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration (base URL, timeout, HTTP client setup).
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Server answered a request with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Network failure outside of a running stream.
    #[error("transport error: {0}")]
    Transport(String),
    /// Request exceeded the configured timeout.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },
    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The stream could not be consumed (for example, no response body).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Token acquisition failed.
    #[error("auth error: {0}")]
    Auth(String),
    /// Broadcast channel send/subscribe failed.
    #[error("broadcast error: {0}")]
    Broadcast(String),
    /// `start()` was called while the session was already running.
    #[error("stream is already active")]
    AlreadyRunning,
    /// `start()` was called on a session that already terminated.
    #[error("stream session already finished")]
    SessionFinished,
}

impl ClientError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns the HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Status {
                status,
                reason,
                body,
            } => ClientError::Http {
                status,
                message: if body.is_empty() {
                    reason
                } else {
                    format!("{reason} - {body}")
                },
            },
            TransportError::Network(message) => ClientError::Transport(message),
            TransportError::Timeout { ms } => ClientError::Timeout { ms },
            TransportError::MissingBody => {
                ClientError::protocol_msg("no response body available for streaming")
            }
        }
    }
}
