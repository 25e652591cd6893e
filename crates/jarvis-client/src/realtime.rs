//! Out-of-band client notifications over a broadcast channel.
//!
//! Each client listens on one channel. Messages addressed to it use the
//! events `client-<id>` and `webhook-init-client-<id>`; webhook messages whose
//! payload has `type: "response_initiator"` ask the client to start a turn.

use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{JarvisClient, Method};
use crate::errors::ClientError;

pub const BROADCAST_TYPE: &str = "broadcast";
pub const RESPONSE_INITIATOR: &str = "response_initiator";
const STATUS_ENDPOINT: &str = "clients";

/// Envelope carried on a broadcast channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: BROADCAST_TYPE.to_string(),
            event: event.into(),
            payload,
        }
    }

    pub fn is_response_initiator(&self) -> bool {
        self.payload.get("type").and_then(Value::as_str) == Some(RESPONSE_INITIATOR)
    }
}

pub fn client_event(client_id: &str) -> String {
    format!("client-{client_id}")
}

pub fn webhook_event(client_id: &str) -> String {
    format!("webhook-init-client-{client_id}")
}

pub type BroadcastStream = Pin<Box<dyn futures::Stream<Item = BroadcastMessage> + Send + 'static>>;

/// A named pub/sub channel.
#[async_trait::async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: BroadcastMessage) -> Result<(), ClientError>;

    /// Returns every message sent after the call.
    fn subscribe(&self) -> Result<BroadcastStream, ClientError>;
}

/// In-process channel over `tokio::sync::broadcast`.
///
/// Slow subscribers that fall behind by more than `capacity` messages skip
/// the oldest ones.
#[derive(Clone, Debug)]
pub struct LocalBroadcastChannel {
    name: String,
    sender: broadcast::Sender<BroadcastMessage>,
}

impl LocalBroadcastChannel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait::async_trait]
impl BroadcastChannel for LocalBroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: BroadcastMessage) -> Result<(), ClientError> {
        if self.sender.send(message).is_err() {
            debug!(channel = %self.name, "broadcast dropped, no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<BroadcastStream, ClientError> {
        let name = self.name.clone();
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold((rx, name), |(mut rx, name)| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, (rx, name))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "broadcast subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

pub type MessageObserver = Box<dyn FnMut(&BroadcastMessage) + Send>;

/// Routes inbound broadcast messages to observers.
pub struct RealtimeHandler {
    client_id: String,
    on_message: Vec<MessageObserver>,
    on_client_message: Vec<MessageObserver>,
    on_webhook: Vec<MessageObserver>,
    on_response_initiator: Vec<MessageObserver>,
}

impl RealtimeHandler {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            on_message: Vec::new(),
            on_client_message: Vec::new(),
            on_webhook: Vec::new(),
            on_response_initiator: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Called for every message on the channel.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: FnMut(&BroadcastMessage) + Send + 'static,
    {
        self.on_message.push(Box::new(f));
        self
    }

    pub fn on_client_message<F>(mut self, f: F) -> Self
    where
        F: FnMut(&BroadcastMessage) + Send + 'static,
    {
        self.on_client_message.push(Box::new(f));
        self
    }

    pub fn on_webhook<F>(mut self, f: F) -> Self
    where
        F: FnMut(&BroadcastMessage) + Send + 'static,
    {
        self.on_webhook.push(Box::new(f));
        self
    }

    pub fn on_response_initiator<F>(mut self, f: F) -> Self
    where
        F: FnMut(&BroadcastMessage) + Send + 'static,
    {
        self.on_response_initiator.push(Box::new(f));
        self
    }

    pub fn handle(&mut self, message: &BroadcastMessage) {
        debug!(event = %message.event, "realtime message");
        for f in &mut self.on_message {
            f(message);
        }
        if message.event == client_event(&self.client_id) {
            for f in &mut self.on_client_message {
                f(message);
            }
        }
        if message.event == webhook_event(&self.client_id) {
            for f in &mut self.on_webhook {
                f(message);
            }
            if message.is_response_initiator() {
                for f in &mut self.on_response_initiator {
                    f(message);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Presence and listener for one client on its broadcast channel.
pub struct Realtime {
    client: Arc<JarvisClient>,
    channel: Arc<dyn BroadcastChannel>,
    status: ConnectionStatus,
    listener: Option<JoinHandle<()>>,
}

impl Realtime {
    pub fn new(client: Arc<JarvisClient>, channel: Arc<dyn BroadcastChannel>) -> Self {
        Self {
            client,
            channel,
            status: ConnectionStatus::Offline,
            listener: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Creates a handler bound to the configured client id.
    pub fn handler(&self) -> Result<RealtimeHandler, ClientError> {
        Ok(RealtimeHandler::new(self.client_id()?))
    }

    /// Reports the client online and starts routing channel messages to
    /// `handler`. A previous listener is replaced.
    pub async fn connect(&mut self, mut handler: RealtimeHandler) -> Result<(), ClientError> {
        self.update_status(ConnectionStatus::Online).await?;
        let mut messages = self.channel.subscribe()?;
        if let Some(previous) = self.listener.take() {
            previous.abort();
        }
        let channel = self.channel.name().to_string();
        self.listener = Some(tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                handler.handle(&message);
            }
            debug!(%channel, "realtime listener finished");
        }));
        info!(channel = %self.channel.name(), "realtime connected");
        Ok(())
    }

    /// Reports the client offline and stops the listener.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.update_status(ConnectionStatus::Offline).await?;
        info!(channel = %self.channel.name(), "realtime disconnected");
        Ok(())
    }

    pub async fn send_message(&self, message: BroadcastMessage) -> Result<(), ClientError> {
        self.channel.send(message).await
    }

    /// Publishes a response-initiator webhook message to `client`, or to this
    /// client when `None`.
    pub async fn test_webhook_trigger(&self, client: Option<&str>) -> Result<(), ClientError> {
        let target = match client {
            Some(id) => id.to_string(),
            None => self.client_id()?,
        };
        self.send_message(BroadcastMessage::new(
            webhook_event(&target),
            json!({"type": RESPONSE_INITIATOR, "message": "This is a test webhook message."}),
        ))
        .await
    }

    async fn update_status(&mut self, status: ConnectionStatus) -> Result<(), ClientError> {
        let body = json!({
            "op": "update",
            "client_id": self.client_id()?,
            "status": status.as_str(),
        });
        self.client
            .api_request(STATUS_ENDPOINT, Some(&body), Method::POST)
            .await?;
        self.status = status;
        Ok(())
    }

    fn client_id(&self) -> Result<String, ClientError> {
        self.client
            .config()
            .client_id
            .clone()
            .ok_or_else(|| ClientError::Config("client_id is required for realtime".into()))
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
