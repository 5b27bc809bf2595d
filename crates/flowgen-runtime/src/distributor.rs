//! Sharded services across the engine group.
//!
//! One instance of an application service runs on every core except
//! core 0, which coordinates. Instances live in their own core's
//! local store and are only ever touched there; the distributor hands
//! work to them through the fabric and folds numeric results back on
//! the control core, where the single-threaded completion callbacks
//! make the accumulator race-free by construction.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, trace};

use flowgen_core::CoreId;

use crate::reactor::Reactor;

/// An application service shardable across cores.
pub trait Service: 'static {
    /// Called by `Distributor::stop` before the instance is dropped.
    fn stop(&mut self, _r: &Reactor) {}
}

/// Summing reducer for `map_reduce`.
#[derive(Debug, Default)]
pub struct Adder {
    result: u64,
}

impl Adder {
    pub fn new(initial: u64) -> Self {
        Self { result: initial }
    }

    pub fn add(&mut self, value: u64) -> u64 {
        self.result += value;
        self.result
    }

    pub fn result(&self) -> u64 {
        self.result
    }

    pub fn reset(&mut self) {
        self.result = 0;
    }
}

/// Process-wide local-store slot allocator. A slot is just an id;
/// each core's store is its own.
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

/// Handle a shard instance gets at construction; lets it report
/// completion back to the control core.
#[derive(Debug, Clone, Copy)]
pub struct ShardRef {
    slot: usize,
    core: CoreId,
    shards: usize,
}

impl ShardRef {
    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Report this shard finished. Once every shard has reported, the
    /// distributor's `on_done` fires on core 0, exactly once.
    pub fn end_game(&self, r: &Reactor) {
        let slot = self.slot;
        r.submit_to(0, move |r| finish_one(r, slot));
    }
}

struct DistControl {
    finished: usize,
    total: usize,
    on_done: Option<Box<dyn FnOnce(&Reactor)>>,
}

fn finish_one(r: &Reactor, slot: usize) {
    let fire = match r.local_take(slot) {
        Some(boxed) => match boxed.downcast::<DistControl>() {
            Ok(mut ctl) => {
                ctl.finished += 1;
                let fire = if ctl.finished >= ctl.total {
                    ctl.on_done.take()
                } else {
                    None
                };
                r.local_insert(slot, ctl);
                fire
            }
            Err(other) => {
                r.local_insert(slot, other);
                error!("distributor control slot holds a foreign value");
                None
            }
        },
        None => {
            error!("shard finished but the control state is gone");
            None
        }
    };
    if let Some(cb) = fire {
        trace!("all services finished");
        cb(r);
    }
}

/// Take the local instance out, run `f`, put it back. The take/put
/// lets the service re-enter distributor APIs from inside `f`.
fn with_instance<S: 'static, F, R2>(r: &Reactor, slot: usize, f: F) -> Option<R2>
where
    F: FnOnce(&Reactor, &mut S) -> R2,
{
    match r.local_take(slot) {
        Some(boxed) => match boxed.downcast::<S>() {
            Ok(mut svc) => {
                let out = f(r, &mut svc);
                r.local_insert(slot, svc);
                Some(out)
            }
            Err(other) => {
                r.local_insert(slot, other);
                error!(core = r.id(), "local slot holds a foreign value");
                None
            }
        },
        None => {
            error!(core = r.id(), "sharded instance does not exist");
            None
        }
    }
}

pub struct Distributor<S: Service> {
    slot: usize,
    cores: usize,
    _marker: PhantomData<S>,
}

// a lightweight handle; instances stay on their shards
impl<S: Service> Clone for Distributor<S> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            cores: self.cores,
            _marker: PhantomData,
        }
    }
}

impl<S: Service> Distributor<S> {
    /// Create on the control core.
    pub fn new(r: &Reactor) -> Self {
        debug_assert_eq!(r.id(), 0, "distributor lives on the control core");
        let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        r.local_insert(
            slot,
            Box::new(DistControl {
                finished: 0,
                total: r.cores().saturating_sub(1),
                on_done: None,
            }),
        );
        Self {
            slot,
            cores: r.cores(),
            _marker: PhantomData,
        }
    }

    /// Construct one service instance on every shard core.
    pub fn start(&self, r: &Reactor, ctor: impl Fn(&Reactor, ShardRef) -> S + Send + Clone + 'static) {
        for core in 1..self.cores {
            let ctor = ctor.clone();
            let slot = self.slot;
            let shards = self.cores;
            r.submit_to(core, move |r| {
                let shard = ShardRef {
                    slot,
                    core: r.id(),
                    shards,
                };
                let svc = ctor(r, shard);
                r.local_insert(slot, Box::new(svc));
            });
        }
    }

    /// Fan a call out to every shard instance.
    pub fn invoke_on_all(&self, r: &Reactor, f: impl Fn(&Reactor, &mut S) + Send + Clone + 'static) {
        for core in 1..self.cores {
            let f = f.clone();
            let slot = self.slot;
            r.submit_to(core, move |r| {
                with_instance::<S, _, _>(r, slot, |r, s| f(r, s));
            });
        }
    }

    /// Call into the instance on one designated shard.
    pub fn invoke_on(
        &self,
        r: &Reactor,
        core: CoreId,
        f: impl FnOnce(&Reactor, &mut S) + Send + 'static,
    ) {
        let slot = self.slot;
        r.submit_to(core, move |r| {
            with_instance::<S, _, _>(r, slot, f);
        });
    }

    /// Invoke a numeric method on every shard and fold each partial
    /// into the accumulator as its completion arrives on this core.
    pub fn map_reduce(
        &self,
        r: &Reactor,
        acc: &Rc<RefCell<Adder>>,
        f: impl Fn(&Reactor, &mut S) -> u64 + Send + Clone + 'static,
    ) {
        debug_assert_eq!(r.id(), 0, "map_reduce folds on the control core");
        for core in 1..self.cores {
            let f = f.clone();
            let slot = self.slot;
            let acc = acc.clone();
            r.submit_to_map(
                core,
                move |r| with_instance::<S, _, _>(r, slot, |r, s| f(r, s)).unwrap_or(0),
                move |_r, partial: u64| {
                    let total = acc.borrow_mut().add(partial);
                    trace!(total, partial, "reduce");
                },
            );
        }
    }

    /// Install the callback fired on core 0 when every shard has
    /// called `end_game`.
    pub fn when_done(&self, r: &Reactor, cb: impl FnOnce(&Reactor) + 'static) {
        debug_assert_eq!(r.id(), 0);
        match r.local_take(self.slot) {
            Some(boxed) => match boxed.downcast::<DistControl>() {
                Ok(mut ctl) => {
                    ctl.on_done = Some(Box::new(cb));
                    r.local_insert(self.slot, ctl);
                }
                Err(other) => {
                    r.local_insert(self.slot, other);
                    error!("distributor control slot holds a foreign value");
                }
            },
            None => error!("distributor control state missing"),
        }
    }

    /// Stop and destroy every shard instance.
    pub fn stop(&self, r: &Reactor) {
        for core in 1..self.cores {
            let slot = self.slot;
            r.submit_to(core, move |r| match r.local_take(slot) {
                Some(boxed) => match boxed.downcast::<S>() {
                    Ok(mut svc) => svc.stop(r),
                    Err(other) => {
                        r.local_insert(slot, other);
                        error!(core = r.id(), "local slot holds a foreign value");
                    }
                },
                None => {}
            });
        }
    }

    /// Access the shard instance owned by the calling core.
    pub fn with_local<R2>(
        &self,
        r: &Reactor,
        f: impl FnOnce(&Reactor, &mut S) -> R2,
    ) -> Option<R2> {
        with_instance::<S, _, _>(r, self.slot, f)
    }
}
