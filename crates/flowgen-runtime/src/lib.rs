//! # flowgen-runtime
//!
//! Thread-per-core network engine. Each core runs an independent
//! event loop (a [`Reactor`]) owning its own connections, timers and
//! readiness multiplexer; cores cooperate only through the lock-free
//! cross-core fabric. On top of that sit the [`Distributor`] for
//! sharded services with map-reduce aggregation, and [`TcpServer`]
//! for the inbound path.
//!
//! Two transport stacks are available behind one connection state
//! machine: kernel sockets multiplexed with epoll, and an in-process
//! user-space stack.
//!
//! ```ignore
//! let config = NetConfig::new().cores(4).device("eth0");
//! let smp = Smp::configure(config)?;
//! smp.run(|r| {
//!     let conn = r.connect("192.168.1.1:1080".parse()?)?;
//!     conn.when_ready(|r, c| { c.send_packet(r, b"hello"); });
//!     conn.on_message(|r, c, msg| { c.consume_input(msg.len()); c.close(r); });
//! });
//! ```

mod backend;
mod config;
mod conn;
mod connector;
mod crypto;
mod distributor;
mod fd;
mod poll;
mod reactor;
mod server;
mod smp;
mod timer;
mod transport;
mod ustack;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
    }
}

pub use config::{NetConfig, StackKind};
pub use conn::{ConnPtr, ConnStats, TcpConn};
pub use crypto::{Sealer, FRAME_HEADER_LEN, FRAME_OVERHEAD, FRAME_TAG_LEN};
pub use distributor::{Adder, Distributor, Service, ShardRef};
pub use reactor::Reactor;
pub use server::TcpServer;
pub use smp::Smp;
pub use timer::{Repeat, TimerId};

// common vocabulary re-exported for applications
pub use flowgen_core::{Buffer, ConnState, CoreId, NetError, NetResult};
pub use nix::sys::signal::Signal;
