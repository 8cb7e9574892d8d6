use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    #[error("session is shutting down")]
    SessionClosed,
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
