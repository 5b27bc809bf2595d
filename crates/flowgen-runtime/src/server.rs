//! Inbound connection endpoint.
//!
//! Binds a listening socket on the reactor's configured stack and
//! accepts in a loop whenever the listener turns readable. Accepted
//! connections run the same state machine as outbound ones: they
//! start in `Connecting` and reach `Connected` on their first
//! readiness event. Callbacks registered on the server are copied to
//! every accepted connection.

use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use tracing::{error, info, trace};

use flowgen_core::NetResult;

use crate::config::StackKind;
use crate::conn::{ConnPtr, TcpConn};
use crate::fd::FileDesc;
use crate::poll::{Interest, PollToken};
use crate::reactor::Reactor;
use crate::transport::{KernelTransport, Transport};
use crate::ustack::{SockId, UstackTransport};

type SrvConnCb = Rc<dyn Fn(&Reactor, &ConnPtr)>;
type SrvMsgCb = Rc<dyn Fn(&Reactor, &ConnPtr, &[u8])>;
type SrvClosedCb = Rc<dyn Fn(&Reactor)>;

enum ListenSock {
    Kernel(FileDesc),
    Ustack(SockId),
}

const LISTEN_BACKLOG: i32 = 1024;

pub struct TcpServer {
    local: SocketAddrV4,
    token: Cell<Option<PollToken>>,
    sock: RefCell<Option<ListenSock>>,
    on_ready: RefCell<Option<SrvConnCb>>,
    on_failed: RefCell<Option<SrvConnCb>>,
    on_recved: RefCell<Option<SrvConnCb>>,
    on_disconnect: RefCell<Option<SrvConnCb>>,
    on_msg: RefCell<Option<SrvMsgCb>>,
    on_closed: RefCell<Option<SrvClosedCb>>,
}

impl TcpServer {
    /// Bind and listen on `addr` with the reactor's stack.
    pub fn bind(r: &Reactor, addr: SocketAddrV4) -> NetResult<Rc<TcpServer>> {
        let (sock, local, pollid) = match r.stack_kind() {
            StackKind::Kernel => {
                let fd = FileDesc::socket_stream()?;
                fd.set_reuse()?;
                fd.bind(addr)?;
                fd.listen(LISTEN_BACKLOG)?;
                let local = fd.local_addr().unwrap_or(addr);
                let pollid = fd.raw();
                (ListenSock::Kernel(fd), local, pollid)
            }
            StackKind::Ustack => {
                let stack = r.ustack().expect("user-space reactor without a stack");
                let id = stack.borrow_mut().listen(addr)?;
                (ListenSock::Ustack(id), addr, id)
            }
        };

        let srv = Rc::new(Self {
            local,
            token: Cell::new(None),
            sock: RefCell::new(Some(sock)),
            on_ready: RefCell::new(None),
            on_failed: RefCell::new(None),
            on_recved: RefCell::new(None),
            on_disconnect: RefCell::new(None),
            on_msg: RefCell::new(None),
            on_closed: RefCell::new(None),
        });

        let weak = Rc::downgrade(&srv);
        let token = r.register_poll(
            pollid,
            Box::new(move |r| {
                if let Some(s) = weak.upgrade() {
                    s.handle_accept(r);
                }
            }),
            Box::new(|_| {}),
        );
        srv.token.set(Some(token));
        r.update_poll(token, Interest::READ);
        info!(%local, "server listening");
        Ok(srv)
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    // ── Callbacks copied onto every accepted connection ──────────────

    pub fn when_ready(&self, f: impl Fn(&Reactor, &ConnPtr) + 'static) {
        *self.on_ready.borrow_mut() = Some(Rc::new(f));
    }

    pub fn when_failed(&self, f: impl Fn(&Reactor, &ConnPtr) + 'static) {
        *self.on_failed.borrow_mut() = Some(Rc::new(f));
    }

    pub fn when_recved(&self, f: impl Fn(&Reactor, &ConnPtr) + 'static) {
        *self.on_recved.borrow_mut() = Some(Rc::new(f));
    }

    pub fn when_disconnect(&self, f: impl Fn(&Reactor, &ConnPtr) + 'static) {
        *self.on_disconnect.borrow_mut() = Some(Rc::new(f));
    }

    pub fn on_message(&self, f: impl Fn(&Reactor, &ConnPtr, &[u8]) + 'static) {
        *self.on_msg.borrow_mut() = Some(Rc::new(f));
    }

    pub fn when_closed(&self, f: impl Fn(&Reactor) + 'static) {
        *self.on_closed.borrow_mut() = Some(Rc::new(f));
    }

    /// Stop listening. Established connections are unaffected.
    pub fn close(&self, r: &Reactor) {
        if let Some(token) = self.token.take() {
            r.forget_poll(token);
        }
        if let Some(ListenSock::Ustack(id)) = self.sock.borrow_mut().take() {
            if let Some(stack) = r.ustack() {
                stack.borrow_mut().close(id);
            }
        }
        trace!(local = %self.local, "server closed");
    }

    fn handle_accept(self: &Rc<Self>, r: &Reactor) {
        loop {
            let accepted = self.accept_one(r);
            let (transport, local, peer) = match accepted {
                Some(x) => x,
                None => break,
            };
            trace!(%peer, "connection accepted");
            let conn = TcpConn::new();
            self.wire_callbacks(&conn);
            r.track_conn(&conn);
            conn.attach(r, transport, local, peer);
        }
        // keep accepting
        if let Some(token) = self.token.get() {
            r.update_poll(token, Interest::READ);
        }
    }

    fn accept_one(&self, r: &Reactor) -> Option<(Box<dyn Transport>, SocketAddrV4, SocketAddrV4)> {
        let sock = self.sock.borrow();
        match &*sock {
            Some(ListenSock::Kernel(fd)) => match fd.accept() {
                Ok(Some((cfd, local, peer))) => {
                    Some((Box::new(KernelTransport::new(cfd)), local, peer))
                }
                Ok(None) => None,
                Err(e) => {
                    error!("accept error: {e}");
                    None
                }
            },
            Some(ListenSock::Ustack(lid)) => {
                let stack = r.ustack().expect("user-space reactor without a stack");
                let id = stack.borrow_mut().accept(*lid)?;
                let unspec = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
                let local = stack.borrow().local_addr(id).unwrap_or(self.local);
                let peer = stack.borrow().remote_addr(id).unwrap_or(unspec);
                Some((Box::new(UstackTransport::new(stack, id)), local, peer))
            }
            None => None,
        }
    }

    fn wire_callbacks(&self, conn: &ConnPtr) {
        if let Some(cb) = self.on_ready.borrow().clone() {
            conn.when_ready(move |r, c| cb(r, c));
        }
        if let Some(cb) = self.on_failed.borrow().clone() {
            conn.when_failed(move |r, c| cb(r, c));
        }
        if let Some(cb) = self.on_recved.borrow().clone() {
            conn.when_recved(move |r, c| cb(r, c));
        }
        if let Some(cb) = self.on_disconnect.borrow().clone() {
            conn.when_disconnect(move |r, c| cb(r, c));
        }
        if let Some(cb) = self.on_msg.borrow().clone() {
            conn.on_message(move |r, c, m| cb(r, c, m));
        }
        if let Some(cb) = self.on_closed.borrow().clone() {
            conn.when_closed(move |r| cb(r));
        }
    }
}
