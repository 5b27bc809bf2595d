//! User-space network stack and its readiness backend.
//!
//! An in-process stream stack: sockets live in a slab, connected pairs
//! exchange bytes through bounded receive buffers, and handshakes
//! resolve asynchronously on the next stack tick. It stands where a
//! DPDK-backed stack would in production and gives the connection
//! state machine a deterministic transport for tests: refused
//! connects, partial writes, EOF propagation and backpressure all
//! behave like their kernel counterparts.
//!
//! `UstackBackend` implements the readiness contract over this stack
//! with the same delivery discipline as the epoll backend. Connection
//! code cannot tell the two apart.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddrV4;
use std::rc::Rc;

use slab::Slab;
use tracing::trace;

use flowgen_core::NetResult;

use crate::backend::{Backend, ReadyEvent};
use crate::poll::{Interest, PollRegistry, PollToken};
use crate::transport::Transport;

pub(crate) type SockId = i32;

const DEFAULT_RX_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    /// Handshake staged, resolves on the next `advance`
    SynSent,
    Listening,
    Established,
    /// Handshake failed; the error waits in `pending_error`
    Refused,
}

struct USock {
    state: SockState,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    peer: Option<SockId>,
    rx: VecDeque<u8>,
    rx_cap: usize,
    pending_error: Option<i32>,
    backlog: VecDeque<SockId>,
    peer_eof: bool,
}

/// The stack proper. Shared between the reactor (backend), the
/// connector and every attached transport on the same core; never
/// crosses a core boundary.
pub(crate) struct Stack {
    socks: Slab<USock>,
    listeners: HashMap<SocketAddrV4, SockId>,
    handshakes: Vec<SockId>,
    rx_cap: usize,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            socks: Slab::new(),
            listeners: HashMap::new(),
            handshakes: Vec::new(),
            rx_cap: DEFAULT_RX_CAP,
        }
    }

    /// Receive-buffer size applied to sockets created afterwards.
    #[cfg(test)]
    pub fn set_rx_cap(&mut self, cap: usize) {
        self.rx_cap = cap;
    }

    fn new_sock(&mut self, state: SockState, local: SocketAddrV4, remote: SocketAddrV4) -> SockId {
        let cap = self.rx_cap;
        self.socks.insert(USock {
            state,
            local,
            remote,
            peer: None,
            rx: VecDeque::new(),
            rx_cap: cap,
            pending_error: None,
            backlog: VecDeque::new(),
            peer_eof: false,
        }) as SockId
    }

    pub fn listen(&mut self, addr: SocketAddrV4) -> io::Result<SockId> {
        if self.listeners.contains_key(&addr) {
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }
        let id = self.new_sock(SockState::Listening, addr, SocketAddrV4::new(0.into(), 0));
        self.listeners.insert(addr, id);
        trace!(sock = id, %addr, "ustack listening");
        Ok(id)
    }

    /// Stage a connect. The handshake outcome lands on the next tick.
    pub fn connect(&mut self, local: SocketAddrV4, remote: SocketAddrV4) -> SockId {
        let id = self.new_sock(SockState::SynSent, local, remote);
        self.handshakes.push(id);
        trace!(sock = id, %local, %remote, "ustack connect staged");
        id
    }

    /// Resolve staged handshakes. Called once per backend poll.
    pub fn advance(&mut self) -> bool {
        if self.handshakes.is_empty() {
            return false;
        }
        let staged = std::mem::take(&mut self.handshakes);
        for id in staged {
            let (local, remote) = match self.socks.get(id as usize) {
                Some(s) if s.state == SockState::SynSent => (s.local, s.remote),
                _ => continue,
            };
            match self.listeners.get(&remote).copied() {
                Some(lid) => {
                    let peer = self.new_sock(SockState::Established, remote, local);
                    self.socks[peer as usize].peer = Some(id);
                    let sock = &mut self.socks[id as usize];
                    sock.state = SockState::Established;
                    sock.peer = Some(peer);
                    self.socks[lid as usize].backlog.push_back(peer);
                    trace!(sock = id, peer, "ustack handshake established");
                }
                None => {
                    let sock = &mut self.socks[id as usize];
                    sock.state = SockState::Refused;
                    sock.pending_error = Some(libc::ECONNREFUSED);
                    trace!(sock = id, %remote, "ustack handshake refused");
                }
            }
        }
        true
    }

    pub fn accept(&mut self, lid: SockId) -> Option<SockId> {
        self.socks.get_mut(lid as usize)?.backlog.pop_front()
    }

    pub fn read(&mut self, id: SockId, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self
            .socks
            .get_mut(id as usize)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        if sock.rx.is_empty() {
            if sock.peer_eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(sock.rx.len());
        for (i, b) in sock.rx.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    /// Append into the peer's receive buffer; partial when the buffer
    /// is nearly full, WouldBlock when it is.
    pub fn write(&mut self, id: SockId, data: &[u8]) -> io::Result<usize> {
        let (state, peer, peer_eof) = {
            let sock = self
                .socks
                .get(id as usize)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
            (sock.state, sock.peer, sock.peer_eof)
        };
        if state != SockState::Established {
            return Err(io::Error::from_raw_os_error(libc::ENOTCONN));
        }
        let peer = match (peer, peer_eof) {
            (Some(p), false) => p,
            _ => return Err(io::Error::from_raw_os_error(libc::EPIPE)),
        };
        let psock = &mut self.socks[peer as usize];
        let space = psock.rx_cap.saturating_sub(psock.rx.len());
        if space == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = space.min(data.len());
        psock.rx.extend(data[..n].iter().copied());
        Ok(n)
    }

    pub fn take_error(&mut self, id: SockId) -> Option<io::Error> {
        self.socks
            .get_mut(id as usize)?
            .pending_error
            .take()
            .map(io::Error::from_raw_os_error)
    }

    pub fn close(&mut self, id: SockId) {
        let sock = match self.socks.try_remove(id as usize) {
            Some(s) => s,
            None => return,
        };
        trace!(sock = id, "ustack close");
        if sock.state == SockState::Listening {
            self.listeners.remove(&sock.local);
            for pending in sock.backlog {
                self.close(pending);
            }
        }
        if let Some(peer) = sock.peer {
            if let Some(psock) = self.socks.get_mut(peer as usize) {
                psock.peer_eof = true;
                psock.peer = None;
            }
        }
    }

    pub fn local_addr(&self, id: SockId) -> Option<SocketAddrV4> {
        self.socks.get(id as usize).map(|s| s.local)
    }

    pub fn remote_addr(&self, id: SockId) -> Option<SocketAddrV4> {
        self.socks.get(id as usize).map(|s| s.remote)
    }

    /// Current readiness of a socket, epoll-equivalent semantics.
    fn readiness(&self, id: SockId) -> Interest {
        let sock = match self.socks.get(id as usize) {
            Some(s) => s,
            None => return Interest::NONE,
        };
        let mut ready = Interest::NONE;
        match sock.state {
            SockState::Listening => {
                if !sock.backlog.is_empty() {
                    ready = ready.union(Interest::READ);
                }
            }
            SockState::SynSent => {}
            SockState::Refused => {
                // a failed connect reports both edges, like
                // EPOLLOUT|EPOLLERR|EPOLLHUP
                ready = Interest::READ.union(Interest::WRITE);
            }
            SockState::Established => {
                if !sock.rx.is_empty() || sock.peer_eof || sock.pending_error.is_some() {
                    ready = ready.union(Interest::READ);
                }
                let writable = match sock.peer {
                    Some(p) => self
                        .socks
                        .get(p as usize)
                        .map(|ps| ps.rx.len() < ps.rx_cap)
                        .unwrap_or(false),
                    None => false,
                };
                if writable || sock.peer_eof {
                    ready = ready.union(Interest::WRITE);
                }
            }
        }
        ready
    }
}

// ── Readiness backend over the stack ─────────────────────────────────

pub(crate) struct UstackBackend {
    stack: Rc<RefCell<Stack>>,
}

impl UstackBackend {
    pub fn new(stack: Rc<RefCell<Stack>>) -> Self {
        Self { stack }
    }
}

impl Backend for UstackBackend {
    fn update(
        &mut self,
        _token: PollToken,
        state: &mut crate::poll::PollState,
        interest: Interest,
    ) -> NetResult<()> {
        state.requested = state.requested.union(interest);
        // arming is pure bookkeeping here; the stack is scanned on poll
        state.armed = state.armed.union(interest);
        Ok(())
    }

    fn poll(
        &mut self,
        _timeout_ms: i32,
        registry: &mut PollRegistry,
        out: &mut Vec<ReadyEvent>,
    ) -> NetResult<bool> {
        let mut stack = self.stack.borrow_mut();
        stack.advance();
        for (token, state) in registry.iter_mut() {
            if state.armed.is_empty() {
                continue;
            }
            let fired = stack.readiness(state.pollid).intersect(state.armed);
            if fired.is_empty() {
                continue;
            }
            let deliver = fired.intersect(state.requested);
            let stale = fired.without(state.requested);
            if !stale.is_empty() {
                state.armed = state.armed.without(stale);
            }
            if !deliver.is_empty() {
                state.requested = state.requested.without(deliver);
                out.push(ReadyEvent {
                    token,
                    interest: deliver,
                });
            }
        }
        Ok(!out.is_empty())
    }

    fn forget(&mut self, _token: PollToken, state: &mut crate::poll::PollState) {
        state.armed = Interest::NONE;
    }
}

// ── Transport over the stack ─────────────────────────────────────────

pub(crate) struct UstackTransport {
    stack: Rc<RefCell<Stack>>,
    id: SockId,
}

impl UstackTransport {
    pub fn new(stack: Rc<RefCell<Stack>>, id: SockId) -> Self {
        Self { stack, id }
    }
}

impl Transport for UstackTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stack.borrow_mut().read(self.id, buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stack.borrow_mut().write(self.id, data)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(self.stack.borrow_mut().take_error(self.id))
    }

    fn pollid(&self) -> i32 {
        self.id
    }
}

impl Drop for UstackTransport {
    fn drop(&mut self) {
        self.stack.borrow_mut().close(self.id);
    }
}
