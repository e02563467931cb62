use std::time::Duration;

use thiserror::Error;

/// Failures of a correlated request to the canvas peer.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No canvas peer is connected")]
    NotConnected,

    #[error("Canvas request {id} timed out after {}s", timeout.as_secs_f32())]
    RequestTimeout { id: String, timeout: Duration },

    #[error("Canvas peer reported an error: {0}")]
    Peer(String),

    #[error("Canvas connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Unexpected reply from canvas peer: {0}")]
    UnexpectedReply(String),

    #[error("Failed to encode canvas request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active canvas session. Use /open <name> first.")]
    NoActiveSession,

    #[error("Invalid canvas name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Canvas store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Canvas transport failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Failed to save canvas '{name}': {source}")]
    Save {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}
