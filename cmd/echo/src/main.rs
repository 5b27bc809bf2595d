//! Echo client
//!
//! Connects to a TCP echo endpoint over the kernel stack, sends one
//! payload a second after the handshake, waits for the echo, then
//! closes and reconnects, a configurable number of rounds.
//!
//! Configuration (environment):
//!     FLOWGEN_DEST     destination ip:port       (default 127.0.0.1:1080)
//!     FLOWGEN_DEV      local device for the pool (default lo)
//!     FLOWGEN_ROUNDS   reconnect rounds          (default 3)
//!     FLOWGEN_NODELAY  disable Nagle             (default false)
//!     FLOWGEN_PIN      pin the engine thread     (default true)
//!     RUST_LOG         tracing filter            (default info)
//!
//! Pair it with any echo server, e.g.:
//!     ncat -l -k -e /bin/cat 1080

use std::cell::Cell;
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{info, trace};

use flowgen_core::env::{env_get, env_get_bool};
use flowgen_runtime::{NetConfig, Reactor};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dest: String = env_get("FLOWGEN_DEST", "127.0.0.1:1080".to_string());
    let dest: SocketAddrV4 = match dest.parse() {
        Ok(d) => d,
        Err(_) => {
            eprintln!("FLOWGEN_DEST must be an ipv4 ip:port, got {dest}");
            std::process::exit(2);
        }
    };
    let rounds: u32 = env_get("FLOWGEN_ROUNDS", 3);

    let config = NetConfig::new()
        .device(env_get("FLOWGEN_DEV", "lo".to_string()))
        .no_delay(env_get_bool("FLOWGEN_NODELAY", false))
        .pin_threads(env_get_bool("FLOWGEN_PIN", true));

    let r = match Reactor::standalone(config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("could not initialize engine: {e}");
            std::process::exit(1);
        }
    };

    let done = Rc::new(Cell::new(0u32));
    let start = Instant::now();

    let conn = match r.connect(dest) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("connect to {dest} failed: {e}");
            std::process::exit(1);
        }
    };

    conn.when_ready(|r, c| {
        let c = c.clone();
        r.add_oneshot_task_after(Duration::from_secs(1), move |r| {
            c.send_packet(r, b"hello");
        });
    });

    let counter = done.clone();
    conn.on_message(move |r, c, msg| {
        trace!("message assembled");
        counter.set(counter.get() + 1);
        c.consume_input(msg.len());
        c.close(r);
    });

    let weak = Rc::downgrade(&conn);
    let progress = done.clone();
    conn.when_closed(move |r| {
        info!("connection closed");
        if progress.get() < rounds {
            if let Some(c) = weak.upgrade() {
                info!("connection reconnecting");
                c.reconnect(r);
            }
        } else {
            r.stop();
        }
    });

    conn.when_failed(|r, c| {
        info!(conn = c.id(), "connect failed, giving up");
        r.stop();
    });

    r.run();
    println!("done: {}\ncost: {}ms", done.get(), start.elapsed().as_millis());
}
