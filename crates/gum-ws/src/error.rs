//! Transport error types.

use gum_core::GumError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("No active context, connect first")]
    NoActiveContext,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid transport config: {0}")]
    InvalidConfig(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}, clean={clean}")]
    ConnectionClosed {
        code: u16,
        reason: String,
        clean: bool,
    },

    #[error("Leader disconnected")]
    LeaderDisconnected,

    #[error("Broadcast bus closed")]
    BusClosed,

    #[error("Server reported error: {0}")]
    Server(String),

    #[error(transparent)]
    Codec(#[from] GumError),
}

pub type WsResult<T> = Result<T, WsError>;
