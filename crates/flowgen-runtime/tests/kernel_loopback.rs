//! Kernel-stack integration over the loopback device. Ignored by
//! default: needs a configured `lo` interface and free ports in the
//! pool range.
//!
//! Run with: cargo test -p flowgen-runtime -- --ignored

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::time::{Duration, Instant};

use flowgen_runtime::{ConnState, NetConfig, Reactor, TcpServer};

#[test]
#[ignore = "exercises real kernel sockets over the loopback device"]
fn test_kernel_echo_roundtrip() {
    let cfg = NetConfig::new().device("lo").pin_threads(false);
    let r = Reactor::standalone(cfg).unwrap();

    // port 0: let the kernel pick
    let srv = TcpServer::bind(&r, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    srv.on_message(|r, c, msg| {
        let reply = msg.to_vec();
        c.consume_input(msg.len());
        c.send_packet(r, &reply);
    });

    let got = Rc::new(RefCell::new(Vec::new()));
    let conn = r.connect(srv.local()).unwrap();
    conn.when_ready(|r, c| {
        c.send_packet(r, b"over the wire");
    });
    let probe = got.clone();
    conn.on_message(move |r, c, msg| {
        probe.borrow_mut().extend_from_slice(msg);
        c.consume_input(msg.len());
        c.close(r);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.state() != ConnState::Closed && Instant::now() < deadline {
        r.run_once();
    }
    assert_eq!(got.borrow().as_slice(), b"over the wire");
    assert_eq!(conn.state(), ConnState::Closed);
}
