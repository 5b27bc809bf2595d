//! Kernel readiness backend over epoll.
//!
//! Level-triggered. The epoll user data is the poll token, so a fired
//! event finds its slot in O(1); a stale token (descriptor forgotten
//! while its event sat in the kernel batch) is dropped by the
//! generation check.

use std::io;

use tracing::{error, trace};

use flowgen_core::{NetError, NetResult};

use crate::backend::{Backend, ReadyEvent};
use crate::poll::{Interest, PollRegistry, PollState, PollToken};

const EVENT_BATCH: usize = 128;

pub(crate) struct EpollBackend {
    epfd: i32,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> NetResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: i32, armed: Interest, token: PollToken) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(armed),
            u64: token.as_u64(),
        };
        let evp = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, evp) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn to_epoll(interest: Interest) -> u32 {
    let mut ev = 0;
    if interest.readable() {
        ev |= libc::EPOLLIN as u32;
    }
    if interest.writable() {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

fn from_epoll(events: u32) -> Interest {
    let mut interest = Interest::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        interest = interest.union(Interest::READ);
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        interest = interest.union(Interest::WRITE);
    }
    interest
}

impl Backend for EpollBackend {
    fn update(
        &mut self,
        token: PollToken,
        state: &mut PollState,
        interest: Interest,
    ) -> NetResult<()> {
        state.requested = state.requested.union(interest);
        let missing = interest.without(state.armed);
        if missing.is_empty() {
            return Ok(());
        }
        let op = if state.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        state.armed = state.armed.union(interest);
        trace!(fd = state.pollid, ?interest, "arm interest");
        self.ctl(op, state.pollid, state.armed, token)
            .map_err(NetError::Io)
    }

    fn poll(
        &mut self,
        timeout_ms: i32,
        registry: &mut PollRegistry,
        out: &mut Vec<ReadyEvent>,
    ) -> NetResult<bool> {
        let nr = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if nr < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(NetError::Io(err));
        }

        for i in 0..nr as usize {
            let ev = self.events[i];
            let token = PollToken::from_u64(ev.u64);
            let state = match registry.get_mut(token) {
                Some(s) => s,
                None => continue,
            };
            let fired = from_epoll(ev.events);
            let deliver = fired.intersect(state.requested);
            let stale = fired.without(state.requested);

            if !stale.is_empty() {
                // armed but no longer wanted: drop the interest before
                // any callback gets a chance to re-arm it
                state.armed = state.armed.without(stale);
                trace!(fd = state.pollid, ?stale, "disarm interest");
                let op = if state.armed.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if let Err(e) = self.ctl(op, state.pollid, state.armed, token) {
                    error!(fd = state.pollid, "epoll_ctl disarm failed: {e}");
                }
            }

            if !deliver.is_empty() {
                state.requested = state.requested.without(deliver);
                out.push(ReadyEvent {
                    token,
                    interest: deliver,
                });
            }
        }
        Ok(nr > 0)
    }

    fn forget(&mut self, token: PollToken, state: &mut PollState) {
        if !state.armed.is_empty() {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, state.pollid, Interest::NONE, token) {
                trace!(fd = state.pollid, "epoll_ctl del failed: {e}");
            }
            state.armed = Interest::NONE;
        }
    }
}
