//! Outbound connection factory.
//!
//! Creates and re-creates connections against the configured stack,
//! allocating local endpoints from an address pool so a single host
//! can open many concurrent flows to one peer. Kernel mode enumerates
//! the device's IPv4 addresses; user-space mode synthesizes a
//! configurable number of local IPs. Ports rotate through the
//! configured range, rolling over to the next IP when a range is used
//! up.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use tracing::{error, trace, warn};

use flowgen_core::{NetError, NetResult};

use crate::config::{NetConfig, StackKind};
use crate::conn::{ConnPtr, TcpConn};
use crate::fd::FileDesc;
use crate::reactor::Reactor;
use crate::transport::KernelTransport;
use crate::ustack::{Stack, UstackTransport};

pub(crate) struct AddrPool {
    ips: Vec<Ipv4Addr>,
    ip_index: usize,
    port_index: u16,
    range: (u16, u16),
}

impl AddrPool {
    fn new(ips: Vec<Ipv4Addr>, range: (u16, u16)) -> Self {
        Self {
            ips,
            ip_index: 0,
            port_index: range.0,
            range,
        }
    }

    /// IPv4 addresses of every interface matching the device name.
    fn for_device(dev: &str, range: (u16, u16)) -> Self {
        let mut ips = Vec::new();
        match nix::ifaddrs::getifaddrs() {
            Ok(iter) => {
                for ifa in iter {
                    if !ifa.interface_name.contains(dev) {
                        continue;
                    }
                    if let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                        ips.push(sin.ip());
                    }
                }
            }
            Err(e) => warn!("getifaddrs failed: {e}"),
        }
        trace!(dev, count = ips.len(), "local ip addresses");
        Self::new(ips, range)
    }

    /// Synthetic 10.200.0.0/16 addresses for the user-space stack.
    fn synthetic(count: usize, range: (u16, u16)) -> Self {
        let ips = (0..count)
            .map(|i| Ipv4Addr::new(10, 200, (i / 250) as u8, (i % 250 + 1) as u8))
            .collect();
        Self::new(ips, range)
    }

    /// Next local endpoint. With no pool addresses the stack picks
    /// (wildcard bind).
    fn get(&mut self) -> NetResult<SocketAddrV4> {
        if self.ips.is_empty() {
            return Ok(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        }
        if self.port_index >= self.range.1 {
            // ports used up on the current ip
            self.ip_index += 1;
            self.port_index = self.range.0;
        }
        if self.ip_index >= self.ips.len() {
            error!("local address pool running out");
            return Err(NetError::AddrPoolExhausted);
        }
        let port = self.port_index;
        self.port_index += 1;
        Ok(SocketAddrV4::new(self.ips[self.ip_index], port))
    }
}

pub(crate) struct Connector {
    kind: StackKind,
    pool: AddrPool,
    no_delay: bool,
    stack: Option<Rc<RefCell<Stack>>>,
}

impl Connector {
    pub fn configure(config: &NetConfig, stack: Option<Rc<RefCell<Stack>>>) -> Self {
        let pool = match config.stack {
            StackKind::Kernel => match &config.device {
                Some(dev) => {
                    let pool = AddrPool::for_device(dev, config.port_range);
                    if pool.ips.is_empty() {
                        warn!(%dev, "no usable IPv4 address on device");
                    }
                    pool
                }
                None => {
                    warn!("no network device specified");
                    AddrPool::new(Vec::new(), config.port_range)
                }
            },
            StackKind::Ustack => AddrPool::synthetic(config.ip_count, config.port_range),
        };
        Self {
            kind: config.stack,
            pool,
            no_delay: config.no_delay,
            stack,
        }
    }

    pub fn connect(
        &mut self,
        r: &Reactor,
        peer: SocketAddrV4,
        local: Option<SocketAddrV4>,
    ) -> NetResult<ConnPtr> {
        let conn = TcpConn::new();
        self.attach_fresh(r, &conn, peer, local)?;
        Ok(conn)
    }

    /// New descriptor, new local endpoint, same connection object.
    pub fn reconnect(&mut self, r: &Reactor, conn: &ConnPtr) -> NetResult<()> {
        self.attach_fresh(r, conn, conn.peer(), None)
    }

    fn attach_fresh(
        &mut self,
        r: &Reactor,
        conn: &ConnPtr,
        peer: SocketAddrV4,
        local: Option<SocketAddrV4>,
    ) -> NetResult<()> {
        match self.kind {
            StackKind::Kernel => {
                let (fd, bound) = self.kernel_socket(local)?;
                fd.connect(peer)?;
                trace!(%peer, %bound, "connecting");
                conn.attach(r, Box::new(KernelTransport::new(fd)), bound, peer);
            }
            StackKind::Ustack => {
                let bound = match local {
                    Some(l) => l,
                    None => self.pool.get()?,
                };
                let stack = self
                    .stack
                    .clone()
                    .expect("user-space connector configured without a stack");
                let id = stack.borrow_mut().connect(bound, peer);
                trace!(%peer, %bound, "connecting");
                conn.attach(r, Box::new(UstackTransport::new(stack, id)), bound, peer);
            }
        }
        Ok(())
    }

    /// Create and bind a kernel socket, rotating through the pool on
    /// bind collisions.
    fn kernel_socket(&mut self, local: Option<SocketAddrV4>) -> NetResult<(FileDesc, SocketAddrV4)> {
        if let Some(l) = local {
            let fd = self.fresh_fd()?;
            fd.bind(l)?;
            let bound = if l.port() == 0 { fd.local_addr()? } else { l };
            return Ok((fd, bound));
        }
        loop {
            let l = self.pool.get()?;
            let fd = self.fresh_fd()?;
            match fd.bind(l) {
                Ok(()) => {
                    let bound = if l.port() == 0 { fd.local_addr()? } else { l };
                    return Ok((fd, bound));
                }
                Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                    trace!(%l, "bind collision, rotating to next address");
                    continue;
                }
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }

    fn fresh_fd(&self) -> NetResult<FileDesc> {
        let fd = FileDesc::socket_stream()?;
        if self.no_delay {
            if let Err(e) = fd.set_no_delay(true) {
                warn!("TCP_NODELAY failed: {e}");
            }
        }
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_rotates_ports_then_ips() {
        let mut pool = AddrPool::new(
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            (1025, 1027),
        );
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(a, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1025));
        assert_eq!(b, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1026));
        // range [1025, 1027) exhausted: next ip
        let c = pool.get().unwrap();
        assert_eq!(c, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1025));
    }

    #[test]
    fn test_pool_exhaustion_is_an_error() {
        let mut pool = AddrPool::new(vec![Ipv4Addr::new(10, 0, 0, 1)], (1025, 1026));
        pool.get().unwrap();
        assert!(matches!(pool.get(), Err(NetError::AddrPoolExhausted)));
        // and stays exhausted
        assert!(matches!(pool.get(), Err(NetError::AddrPoolExhausted)));
    }

    #[test]
    fn test_empty_pool_yields_wildcard() {
        let mut pool = AddrPool::new(Vec::new(), (1025, 65530));
        let a = pool.get().unwrap();
        assert_eq!(a, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    }

    #[test]
    fn test_synthetic_pool_shape() {
        let pool = AddrPool::synthetic(300, (1025, 65530));
        assert_eq!(pool.ips.len(), 300);
        assert_eq!(pool.ips[0], Ipv4Addr::new(10, 200, 0, 1));
        assert_eq!(pool.ips[250], Ipv4Addr::new(10, 200, 1, 1));
    }
}
