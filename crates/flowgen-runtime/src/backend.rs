//! Readiness multiplexer abstraction.
//!
//! Two implementations exist with identical observable behavior: the
//! kernel epoll backend and the user-space stack backend. Both follow
//! the same delivery discipline per `poll` call:
//!
//! 1. a fired event is delivered at most once per interest bit, and
//!    only if that bit is in `requested`
//! 2. delivered bits are cleared from `requested` (one-shot; consumers
//!    re-arm explicitly)
//! 3. bits that fired without being requested are disarmed from the
//!    multiplexer before any callback runs, so a callback re-arming
//!    the same bit is never clobbered
//!
//! Callbacks themselves are invoked by the reactor after `poll`
//! returns, writable before readable.

use flowgen_core::NetResult;

use crate::poll::{Interest, PollRegistry, PollState, PollToken};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub token: PollToken,
    pub interest: Interest,
}

pub(crate) trait Backend {
    /// Arm interest for a descriptor. Re-arming an already-armed bit
    /// is a no-op.
    fn update(&mut self, token: PollToken, state: &mut PollState, interest: Interest)
        -> NetResult<()>;

    /// Collect ready descriptors into `out`, applying the delivery
    /// discipline above. Blocks up to `timeout_ms` (0 = non-blocking).
    /// Returns whether anything fired.
    fn poll(
        &mut self,
        timeout_ms: i32,
        registry: &mut PollRegistry,
        out: &mut Vec<ReadyEvent>,
    ) -> NetResult<bool>;

    /// Unconditionally remove a descriptor from the multiplexer.
    fn forget(&mut self, token: PollToken, state: &mut PollState);
}
