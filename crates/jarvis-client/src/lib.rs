//! Async client for the Jarvis conversational API.
//!
//! Streaming calls return a [`StreamSession`]: register observers with the
//! fluent `on_*` methods, then `start()` it. The session decodes the
//! server-sent event stream, classifies each payload into [`StreamEvent`]s and
//! dispatches them until the server signals total completion, the stream
//! ends, it fails, or [`StreamSession::stop`] is called.
//!
//! ```no_run
//! use jarvis_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = JarvisClient::new(ClientConfig::new("api-key"))?;
//! let session = client
//!     .stream()
//!     .jarvis("What's on my calendar?", JarvisStreamOptions::default().speech(false))?
//!     .on_response(|text, meta| {
//!         if meta.is_final {
//!             println!("{text}");
//!         }
//!     })
//!     .on_error(|err| eprintln!("{err}"));
//!
//! session.start().await?;
//! # Ok(())
//! # }
//! ```

/// Bearer credentials and the token cache.
pub mod auth;
/// Payload classification rules.
pub mod classify;
/// `JarvisClient` and the non-streaming requests.
pub mod client;
/// Client configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// Global `tracing` subscriber setup.
pub mod observability;
/// Observer lists and dispatch.
pub mod observers;
/// Common imports for typical usage.
pub mod prelude;
/// Broadcast channel presence and message routing.
pub mod realtime;
/// Stream options and the streaming entry points.
pub mod request;
/// Stream session lifecycle.
pub mod session;
/// Server-sent event framing.
pub mod sse;
/// Classified stream events.
pub mod stream;
/// Stream fetchers.
pub mod transport;

pub use auth::{Clock, IssuedToken, SystemClock, TokenCache, TokenSource};
pub use client::{ApiResponse, JarvisClient, Method, NluResponse, TtsResponse};
pub use config::{ClientConfig, ConfigUpdate};
pub use errors::{ClientError, StreamFailure, TransportError};
pub use observability::init_observability;
pub use observers::EventMeta;
pub use realtime::{
    BroadcastChannel, BroadcastMessage, LocalBroadcastChannel, Realtime, RealtimeHandler,
};
pub use request::{JarvisStreamOptions, NluStreamOptions, StreamRequests, TtsStreamOptions};
pub use session::{SessionState, StopHandle, StreamOutcome, StreamSession};
pub use stream::{DoneEvent, EventCategory, StreamEvent};
pub use transport::{HttpFetcher, StreamFetcher, StreamMethod, StreamRequest};
