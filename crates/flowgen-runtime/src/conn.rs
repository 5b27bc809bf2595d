//! Connection object and its state machine.
//!
//! One `TcpConn` wraps one transport endpoint. The object is
//! reference-counted and survives its descriptor: `Failed`,
//! `Disconnect` and `Closed` end the current descriptor only, and a
//! reconnect attaches a fresh one while every registered callback
//! stays in place. The readiness closures hold weak references back to
//! the connection; the reactor's connection list is the owning side,
//! so dropping the loop drops the connection.
//!
//! State machine:
//!
//! ```text
//! invalid -> connecting -> { connected | failed }
//! connected -> { disconnect | closed }
//! any terminal --reconnect--> connecting
//! ```
//!
//! Transport errors never escape as `Err` past the event loop; they
//! become a `Disconnect` transition plus a callback.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use tracing::{error, trace, warn};

use flowgen_core::{Buffer, ConnState};

use crate::crypto::Sealer;
use crate::poll::{Interest, PollToken};
use crate::reactor::Reactor;
use crate::transport::Transport;

pub type ConnPtr = Rc<TcpConn>;
pub(crate) type ConnCb = Box<dyn FnMut(&Reactor, &ConnPtr)>;
pub(crate) type MsgCb = Box<dyn FnMut(&Reactor, &ConnPtr, &[u8])>;
pub(crate) type ClosedCb = Box<dyn FnMut(&Reactor)>;

static NR_CONNS: AtomicU64 = AtomicU64::new(0);

/// Per-descriptor traffic counters, reset on every attach.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub pkts_in: u64,
    pub pkts_out: u64,
}

pub struct TcpConn {
    id: u64,
    owner: ThreadId,
    state: Cell<ConnState>,
    local: Cell<SocketAddrV4>,
    peer: Cell<SocketAddrV4>,
    born: Cell<Instant>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    stats: RefCell<ConnStats>,
    transport: RefCell<Option<Box<dyn Transport>>>,
    token: Cell<Option<PollToken>>,
    sealer: RefCell<Option<Arc<dyn Sealer>>>,
    on_ready: RefCell<Option<ConnCb>>,
    on_failed: RefCell<Option<ConnCb>>,
    on_recved: RefCell<Option<ConnCb>>,
    on_disconnect: RefCell<Option<ConnCb>>,
    on_msg: RefCell<Option<MsgCb>>,
    on_closed: RefCell<Option<ClosedCb>>,
}

/// Run a stored callback without holding its slot borrowed, so the
/// callback itself may register a replacement.
fn fire(cell: &RefCell<Option<ConnCb>>, r: &Reactor, conn: &ConnPtr) {
    let cb = cell.borrow_mut().take();
    if let Some(mut f) = cb {
        f(r, conn);
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(f);
        }
    }
}

impl TcpConn {
    pub(crate) fn new() -> ConnPtr {
        let id = NR_CONNS.fetch_add(1, Ordering::Relaxed) + 1;
        let unspec = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Rc::new(Self {
            id,
            owner: thread::current().id(),
            state: Cell::new(ConnState::Invalid),
            local: Cell::new(unspec),
            peer: Cell::new(unspec),
            born: Cell::new(Instant::now()),
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            stats: RefCell::new(ConnStats::default()),
            transport: RefCell::new(None),
            token: Cell::new(None),
            sealer: RefCell::new(None),
            on_ready: RefCell::new(None),
            on_failed: RefCell::new(None),
            on_recved: RefCell::new(None),
            on_disconnect: RefCell::new(None),
            on_msg: RefCell::new(None),
            on_closed: RefCell::new(None),
        })
    }

    // ── Identity and introspection ───────────────────────────────────

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local.get()
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer.get()
    }

    pub fn stats(&self) -> ConnStats {
        *self.stats.borrow()
    }

    /// Age of the current descriptor.
    pub fn alive_time(&self) -> std::time::Duration {
        self.born.get().elapsed()
    }

    /// Thread that owns this connection. Instrumentation hook for the
    /// single-core ownership rule.
    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    pub fn input_len(&self) -> usize {
        self.input.borrow().len()
    }

    /// Release bytes the application has finished with. `on_message`
    /// never consumes on its own.
    pub fn consume_input(&self, n: usize) {
        self.input.borrow_mut().consume(n);
    }

    #[inline]
    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "connection touched from a foreign core"
        );
    }

    // ── Callback registration (survives reconnects) ──────────────────

    pub fn when_ready(&self, f: impl FnMut(&Reactor, &ConnPtr) + 'static) {
        *self.on_ready.borrow_mut() = Some(Box::new(f));
    }

    pub fn when_failed(&self, f: impl FnMut(&Reactor, &ConnPtr) + 'static) {
        *self.on_failed.borrow_mut() = Some(Box::new(f));
    }

    /// Fires after every successfully drained read chunk.
    pub fn when_recved(&self, f: impl FnMut(&Reactor, &ConnPtr) + 'static) {
        *self.on_recved.borrow_mut() = Some(Box::new(f));
    }

    pub fn when_disconnect(&self, f: impl FnMut(&Reactor, &ConnPtr) + 'static) {
        *self.on_disconnect.borrow_mut() = Some(Box::new(f));
    }

    /// Fires with the assembled inbound bytes once the transport runs
    /// dry. The window is not consumed; call `consume_input`.
    pub fn on_message(&self, f: impl FnMut(&Reactor, &ConnPtr, &[u8]) + 'static) {
        *self.on_msg.borrow_mut() = Some(Box::new(f));
    }

    pub fn when_closed(&self, f: impl FnMut(&Reactor) + 'static) {
        *self.on_closed.borrow_mut() = Some(Box::new(f));
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bind a fresh descriptor and start the handshake. Resets the
    /// per-descriptor counters and buffers; registered callbacks are
    /// untouched.
    pub(crate) fn attach(
        self: &Rc<Self>,
        r: &Reactor,
        transport: Box<dyn Transport>,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) {
        if self.transport.borrow().is_some() {
            // descriptor left over from a failed handshake
            self.detach(r);
        }
        self.state.set(ConnState::Connecting);
        self.local.set(local);
        self.peer.set(peer);
        self.born.set(Instant::now());
        *self.stats.borrow_mut() = ConnStats::default();
        self.input.borrow_mut().clear();
        self.output.borrow_mut().clear();
        *self.sealer.borrow_mut() = r.sealer();

        let pollid = transport.pollid();
        let read_weak = Rc::downgrade(self);
        let write_weak = Rc::downgrade(self);
        let token = r.register_poll(
            pollid,
            Box::new(move |r| {
                if let Some(c) = read_weak.upgrade() {
                    c.handle_read(r);
                }
            }),
            Box::new(move |r| {
                if let Some(c) = write_weak.upgrade() {
                    c.handle_write(r);
                }
            }),
        );
        *self.transport.borrow_mut() = Some(transport);
        self.token.set(Some(token));
        trace!(conn = self.id, %local, %peer, "attached");
        r.update_poll(token, Interest::READ.union(Interest::WRITE));
    }

    /// Active close. Lenient on misuse: closing twice, or closing a
    /// connection the peer already tore down, logs and does nothing.
    pub fn close(&self, r: &Reactor) {
        self.assert_owner();
        let s = self.state.get();
        if s == ConnState::Closed || s == ConnState::Disconnect {
            warn!(conn = self.id, "multiple close op detected, ignoring");
            return;
        }
        trace!(conn = self.id, "closing");
        self.state.set(ConnState::Closed);
        self.detach(r);
        let cb = self.on_closed.borrow_mut().take();
        if let Some(mut f) = cb {
            f(r);
            let mut slot = self.on_closed.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    /// Ask the owning connector for a fresh descriptor against the
    /// same peer. Callbacks registered on this object keep working.
    pub fn reconnect(self: &Rc<Self>, r: &Reactor) {
        trace!(conn = self.id, "reconnecting");
        r.reconnect_conn(self);
    }

    fn detach(&self, r: &Reactor) {
        if let Some(token) = self.token.take() {
            r.forget_poll(token);
        }
        // dropping the transport closes the descriptor
        self.transport.borrow_mut().take();
    }

    /// Peer close or transport error: same transition either way.
    fn cleanup(&self, r: &Reactor, conn: &ConnPtr) {
        trace!(conn = self.id, "descriptor torn down by peer or error");
        self.state.set(ConnState::Disconnect);
        self.detach(r);
        fire(&self.on_disconnect, r, conn);
    }

    // ── Data path ────────────────────────────────────────────────────

    /// Queue a payload for delivery. Bytes the transport does not
    /// accept immediately are staged in the output buffer and flushed
    /// on the next writable event. Returns false only when the
    /// connection is unusable.
    pub fn send_packet(self: &Rc<Self>, r: &Reactor, data: &[u8]) -> bool {
        self.assert_owner();
        if self.state.get() != ConnState::Connected {
            error!(
                conn = self.id,
                state = %self.state.get(),
                "trying to send packet via broken connection"
            );
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let sealer = self.sealer.borrow().clone();
        let sealed_buf;
        let payload: &[u8] = match &sealer {
            Some(s) => {
                sealed_buf = s.seal(data);
                &sealed_buf
            }
            None => data,
        };
        self.stats.borrow_mut().pkts_out += 1;

        if !self.output.borrow().is_empty() {
            // earlier bytes are still queued; stage behind them
            self.output.borrow_mut().append(payload);
            self.enable_write(r);
            self.enable_read(r);
            return true;
        }

        let res = {
            let mut tr = self.transport.borrow_mut();
            tr.as_mut().map(|t| t.write(payload))
        };
        let res = match res {
            Some(res) => res,
            None => {
                error!(conn = self.id, "send on detached transport");
                return false;
            }
        };
        match res {
            Ok(n) => {
                self.stats.borrow_mut().bytes_out += n as u64;
                trace!(conn = self.id, n, "sent bytes");
                if n < payload.len() {
                    trace!(
                        conn = self.id,
                        queued = payload.len() - n,
                        "send buffer full, staging remainder"
                    );
                    self.output.borrow_mut().append(&payload[n..]);
                    self.enable_write(r);
                }
                // watch the descriptor to catch a passive close
                self.enable_read(r);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(conn = self.id, "send buffer full, staging whole payload");
                self.output.borrow_mut().append(payload);
                self.enable_write(r);
                self.enable_read(r);
                true
            }
            Err(e) => {
                warn!(conn = self.id, "send data error: {e}");
                let conn = self.clone();
                self.cleanup(r, &conn);
                false
            }
        }
    }

    // ── Event handlers (invoked by the readiness backend) ────────────

    pub(crate) fn handle_write(self: &Rc<Self>, r: &Reactor) {
        self.assert_owner();
        let conn = self.clone();
        match self.state.get() {
            ConnState::Connecting => {
                self.handle_handshake(r, &conn);
            }
            ConnState::Connected => self.flush_output(r, &conn),
            s => trace!(conn = self.id, state = %s, "writable event ignored"),
        }
    }

    pub(crate) fn handle_read(self: &Rc<Self>, r: &Reactor) {
        self.assert_owner();
        let conn = self.clone();
        if self.state.get() == ConnState::Connecting && self.handle_handshake(r, &conn) {
            return;
        }
        while self.state.get() == ConnState::Connected {
            let res = {
                let mut input = self.input.borrow_mut();
                input.reserve_suggested();
                let mut tr = self.transport.borrow_mut();
                tr.as_mut().map(|t| t.read(input.writable()))
            };
            let res = match res {
                Some(res) => res,
                None => break,
            };
            match res {
                Ok(0) => {
                    trace!(conn = self.id, "closed by peer");
                    self.cleanup(r, &conn);
                    break;
                }
                Ok(n) => {
                    self.input.borrow_mut().add_size(n);
                    {
                        let mut st = self.stats.borrow_mut();
                        st.bytes_in += n as u64;
                        st.pkts_in += 1;
                    }
                    trace!(conn = self.id, n, "read bytes");
                    // keep watching for the next chunk or a close
                    self.enable_read(r);
                    fire(&self.on_recved, r, &conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.deliver_message(r, &conn);
                    break;
                }
                Err(e) => {
                    error!(conn = self.id, "read error: {e}");
                    self.cleanup(r, &conn);
                    break;
                }
            }
        }
    }

    /// Resolve the async connect on the first readiness event while
    /// `Connecting`. A pending descriptor error decides failure.
    fn handle_handshake(self: &Rc<Self>, r: &Reactor, conn: &ConnPtr) -> bool {
        if self.state.get() != ConnState::Connecting {
            error!(
                conn = self.id,
                state = %self.state.get(),
                "handshake outside connecting state"
            );
        }
        let pending = {
            let mut tr = self.transport.borrow_mut();
            match tr.as_mut() {
                Some(t) => t.take_error(),
                None => return false,
            }
        };
        match pending {
            Ok(None) => {
                self.state.set(ConnState::Connected);
                trace!(conn = self.id, "connected");
                fire(&self.on_ready, r, conn);
                true
            }
            Ok(Some(err)) => {
                warn!(conn = self.id, "connect failed: {err}");
                self.state.set(ConnState::Failed);
                fire(&self.on_failed, r, conn);
                false
            }
            Err(e) => {
                warn!(conn = self.id, "handshake probe failed: {e}");
                self.state.set(ConnState::Failed);
                fire(&self.on_failed, r, conn);
                false
            }
        }
    }

    fn flush_output(&self, r: &Reactor, conn: &ConnPtr) {
        let res = {
            let output = self.output.borrow();
            if output.is_empty() {
                return;
            }
            let mut tr = self.transport.borrow_mut();
            tr.as_mut().map(|t| t.write(output.data()))
        };
        let res = match res {
            Some(res) => res,
            None => return,
        };
        match res {
            Ok(n) => {
                self.stats.borrow_mut().bytes_out += n as u64;
                let remaining = {
                    let mut output = self.output.borrow_mut();
                    output.consume(n);
                    output.len()
                };
                trace!(conn = self.id, n, remaining, "flushed output");
                if remaining > 0 {
                    self.enable_write(r);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enable_write(r);
            }
            Err(e) => {
                warn!(conn = self.id, "send data error: {e}");
                self.cleanup(r, conn);
            }
        }
    }

    /// Hand the assembled input window to `on_message`, unsealing it
    /// first when a transform is installed.
    fn deliver_message(&self, r: &Reactor, conn: &ConnPtr) {
        if self.on_msg.borrow().is_none() {
            return;
        }
        let msg: Option<Vec<u8>> = {
            let input = self.input.borrow();
            if input.is_empty() {
                None
            } else {
                let sealer = self.sealer.borrow().clone();
                match sealer {
                    // record still incomplete: wait for more bytes
                    Some(s) => s.open(input.data()),
                    None => Some(input.data().to_vec()),
                }
            }
        };
        if let Some(msg) = msg {
            trace!(conn = self.id, len = msg.len(), "message assembled");
            let cb = self.on_msg.borrow_mut().take();
            if let Some(mut f) = cb {
                f(r, conn, &msg);
                let mut slot = self.on_msg.borrow_mut();
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }

    fn enable_read(&self, r: &Reactor) {
        if let Some(token) = self.token.get() {
            r.update_poll(token, Interest::READ);
        }
    }

    fn enable_write(&self, r: &Reactor) {
        if let Some(token) = self.token.get() {
            r.update_poll(token, Interest::WRITE);
        }
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        // the transport field closes the descriptor; the owning
        // reactor reclaims the registry slot
        trace!(conn = self.id, "connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetConfig, StackKind};
    use crate::server::TcpServer;

    fn test_reactor() -> Rc<Reactor> {
        let cfg = NetConfig::new()
            .stack(StackKind::Ustack)
            .pin_threads(false);
        Reactor::standalone(cfg).unwrap()
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 99, 1, 1), port)
    }

    fn drive(r: &Rc<Reactor>, n: usize) {
        for _ in 0..n {
            r.run_once();
        }
    }

    #[test]
    fn test_connect_reaches_connected_before_data_callbacks() {
        let r = test_reactor();
        let srv = TcpServer::bind(&r, addr(80)).unwrap();
        srv.on_message(|_r, c, m| c.consume_input(m.len()));

        let conn = r.connect(addr(80)).unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);

        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = log.clone();
        conn.when_ready(move |r, c| {
            l1.borrow_mut().push("ready");
            c.send_packet(r, b"x");
        });
        let l2 = log.clone();
        conn.when_recved(move |_r, _c| l2.borrow_mut().push("recved"));

        drive(&r, 10);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(log.borrow().first(), Some(&"ready"));
    }

    #[test]
    fn test_refused_connect_fires_on_failed() {
        let r = test_reactor();
        let failed = Rc::new(Cell::new(false));
        let probe = failed.clone();

        // nobody listens on this address
        let conn = r.connect(addr(4444)).unwrap();
        conn.when_failed(move |_r, _c| probe.set(true));

        drive(&r, 10);
        assert!(failed.get());
        assert_eq!(conn.state(), ConnState::Failed);
    }

    #[test]
    fn test_partial_write_stages_remainder_and_flushes() {
        let r = test_reactor();
        r.ustack().unwrap().borrow_mut().set_rx_cap(8);

        let srv = TcpServer::bind(&r, addr(81)).unwrap();
        let received = Rc::new(RefCell::new(0usize));
        let rx = received.clone();
        srv.on_message(move |_r, c, m| {
            *rx.borrow_mut() += m.len();
            c.consume_input(m.len());
        });

        let conn = r.connect(addr(81)).unwrap();
        conn.when_ready(|r, c| {
            assert!(c.send_packet(r, &[0x42; 20]));
        });

        drive(&r, 40);
        assert_eq!(*received.borrow(), 20);
        assert_eq!(conn.stats().bytes_out, 20);
        assert!(conn.input_len() == 0);
    }

    #[test]
    fn test_peer_close_disconnects_and_double_close_is_lenient() {
        let r = test_reactor();
        let srv = TcpServer::bind(&r, addr(82)).unwrap();
        // server side hangs up as soon as it is up
        srv.when_ready(|r, c| c.close(r));

        let disconnected = Rc::new(Cell::new(0u32));
        let probe = disconnected.clone();
        let conn = r.connect(addr(82)).unwrap();
        conn.when_disconnect(move |_r, _c| probe.set(probe.get() + 1));

        drive(&r, 10);
        assert_eq!(conn.state(), ConnState::Disconnect);
        assert_eq!(disconnected.get(), 1);

        // closing a torn-down connection is logged and ignored
        conn.close(&r);
        assert_eq!(conn.state(), ConnState::Disconnect);
        assert_eq!(disconnected.get(), 1);
    }

    #[test]
    fn test_send_on_broken_connection_is_rejected() {
        let r = test_reactor();
        let conn = r.connect(addr(4445)).unwrap();
        drive(&r, 5);
        assert_eq!(conn.state(), ConnState::Failed);
        assert!(!conn.send_packet(&r, b"nope"));
    }

    #[test]
    fn test_owner_thread_is_creation_thread() {
        let r = test_reactor();
        let conn = r.connect(addr(4446)).unwrap();
        assert_eq!(conn.owner_thread(), std::thread::current().id());
    }
}
