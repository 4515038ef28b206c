use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::{Command, RespCodec, RespValue};
use crate::error::RespError;

/// A RESP connection bound to exactly one stream.
///
/// Requests are strictly sequential: each call writes one command and waits
/// for its reply before returning. Server error replies (`-ERR ...`) surface
/// as [`RespError::Server`] and leave the connection usable; I/O and protocol
/// failures poison it for every later request.
pub struct RespConnection<S> {
    framed: Framed<S, RespCodec>,
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, RespCodec),
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// # Errors
    /// Returns [`RespError::Server`] for error replies, [`RespError::ConnectionClosed`]
    /// if the peer hung up, or the underlying I/O / protocol error.
    pub async fn request(&mut self, command: Command) -> Result<RespValue, RespError> {
        let name = command.name();
        tracing::trace!(command = name, "sending RESP command");
        self.framed.send(command.into_value()).await?;

        match self.framed.next().await {
            Some(Ok(RespValue::Error(message))) => Err(RespError::Server(message)),
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(e),
            None => Err(RespError::ConnectionClosed),
        }
    }

    /// `PING`, expecting `PONG`.
    ///
    /// # Errors
    /// Any request failure, or [`RespError::UnexpectedReply`] for a non-`PONG` answer.
    pub async fn ping(&mut self) -> Result<(), RespError> {
        match self.request(Command::new("PING")).await? {
            reply if reply.as_text() == Some("PONG") => Ok(()),
            reply => Err(RespError::UnexpectedReply {
                command: "PING",
                reply,
            }),
        }
    }

    /// `INCRBY key delta`, returning the new value stored at `key`.
    ///
    /// # Errors
    /// Any request failure, or [`RespError::UnexpectedReply`] when the reply is
    /// not an integer.
    pub async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, RespError> {
        let command = Command::new("INCRBY").arg(key).arg_int(delta);
        match self.request(command).await? {
            RespValue::Integer(value) => Ok(value),
            reply => Err(RespError::UnexpectedReply {
                command: "INCRBY",
                reply,
            }),
        }
    }
}
