use thiserror::Error;

use crate::codec::RespValue;

/// Errors produced by the RESP codec and connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RespError {
    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent bytes that are not valid RESP2
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server answered with an error reply (`-ERR ...`)
    #[error("Server error: {0}")]
    Server(String),

    /// Server answered with a well-formed reply of the wrong shape
    #[error("Unexpected reply to {command}: {reply:?}")]
    UnexpectedReply {
        command: &'static str,
        reply: RespValue,
    },

    /// Peer closed the stream before replying
    #[error("Connection closed by peer")]
    ConnectionClosed,
}

impl RespError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
