#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

//! RESP2 client for a single, caller-owned connection.
//!
//! The client never opens sockets on its own: it is handed an already
//! established stream (plain TCP, TLS, an in-memory duplex) and speaks the
//! Redis serialization protocol over exactly that stream. There is no pool and
//! no reconnect; when the stream dies every subsequent request fails.
//!
//! # Example
//!
//! ```ignore
//! use resp_client::RespConnection;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:6379").await?;
//! let mut conn = RespConnection::new(stream);
//! conn.ping().await?;
//! let balance = conn.incr_by("balance-001", 7).await?;
//! ```

pub mod codec;
mod connection;
mod error;

pub use codec::{Command, RespCodec, RespValue};
pub use connection::RespConnection;
pub use error::RespError;
