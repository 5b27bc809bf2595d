//! # flowgen-core
//!
//! Platform-agnostic building blocks shared by the flowgen engine:
//!
//! - [`buffer::Buffer`] — the growable byte window used for inbound
//!   accumulation and outbound staging on every connection
//! - [`state::ConnState`] — the connection state machine vocabulary
//! - [`error::NetError`] — the error taxonomy of the runtime
//! - [`env`] — environment variable parsing helpers for the cmd tools

pub mod buffer;
pub mod env;
pub mod error;
pub mod state;

pub use buffer::Buffer;
pub use error::{NetError, NetResult};
pub use state::ConnState;

/// Logical core index. Core 0 is the control/aggregation core.
pub type CoreId = usize;
