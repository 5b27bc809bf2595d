//! Error taxonomy of the engine.
//!
//! Transport-level failures never surface through this type across the
//! event loop: they are translated into connection state transitions
//! and callbacks at the point of failure. `NetError` covers everything
//! else — configuration rejects, resource exhaustion, and I/O errors
//! reported from synchronous setup paths (socket creation, bind,
//! listen).

use std::io;
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// Invalid or incomplete startup configuration. Fatal: reported
    /// before any core starts.
    #[error("config error: {0}")]
    Config(String),

    /// The local address/port pool has no endpoints left.
    #[error("address pool exhausted")]
    AddrPoolExhausted,

    /// The sharded service instance is missing on the given core.
    #[error("sharded instance does not exist on core {0}")]
    NoShardInstance(usize),

    /// Address family or address shape the engine does not handle.
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    pub fn config(msg: impl Into<String>) -> Self {
        NetError::Config(msg.into())
    }
}
