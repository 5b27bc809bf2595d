//! Engine smoke tool
//!
//! Brings up a multi-core engine group over the user-space stack and
//! exercises the cross-core paths: fire-and-forget submits, a
//! completion signal, a typed value continuation, and a periodic
//! timer that shuts the whole group down.
//!
//! Configuration (environment):
//!     FLOWGEN_SMP   number of cores           (default 3)
//!     FLOWGEN_PIN   pin engine threads        (default true)
//!     RUST_LOG      tracing filter            (default info)

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tracing::info;

use flowgen_core::env::{env_get, env_get_bool};
use flowgen_runtime::{NetConfig, Repeat, Smp, StackKind};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = NetConfig::new()
        .stack(StackKind::Ustack)
        .cores(env_get("FLOWGEN_SMP", 3))
        .pin_threads(env_get_bool("FLOWGEN_PIN", true));

    let smp = match Smp::configure(config) {
        Ok(smp) => smp,
        Err(e) => {
            eprintln!("could not initialize engine group: {e}");
            std::process::exit(1);
        }
    };

    smp.run(|r| {
        // self-submission runs inline
        r.submit_to(0, |r| info!(core = r.id(), "hello from the control core"));

        for core in 1..r.cores() {
            r.submit_to(core, |r| info!(core = r.id(), "hello from worker core"));
        }

        if r.cores() > 1 {
            r.submit_to_then(
                1,
                |r| info!(core = r.id(), "doing remote work"),
                |_r| info!("remote work acknowledged back on core 0"),
            );

            let last = r.cores() - 1;
            r.submit_to_map(
                last,
                |r| r.id() as u64,
                |_r, id: u64| info!(id, "typed value returned from the last core"),
            );
        }

        let ticks = Rc::new(Cell::new(0u32));
        r.add_periodic_task_after(
            Duration::from_millis(500),
            Duration::from_millis(500),
            Repeat::Infinite,
            move |r| {
                ticks.set(ticks.get() + 1);
                info!(tick = ticks.get(), "timer tick");
                if ticks.get() >= 4 {
                    r.stop();
                }
            },
        );
    });

    info!("engine group stopped cleanly");
}
