use async_trait::async_trait;
use thiserror::Error;

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("connect timed out")]
    Timeout,
}

/// One event observed on an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Frame(String),
    /// The transport closed; `code` is the close code when one was seen.
    Closed { code: Option<u16>, reason: String },
}

/// A single live connection. Handles are owned exclusively by one session
/// and replaced wholesale on reconnect, never reused across attempts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;
    /// Next event from the peer; `None` once the stream has ended.
    async fn recv(&self) -> Option<TransportEvent>;
    fn is_connected(&self) -> bool;
    /// Initiate closure with the given close code.
    async fn close(&self, code: u16, reason: &str);
}

/// Produces a fresh transport per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
