//! Cross-core message fabric and engine startup.
//!
//! Every ordered pair of cores owns two bounded lock-free rings: work
//! travels src→dst through `pending`, the same envelope returns
//! dst→src through `completed`. Only the source pushes pending and
//! pops completed; only the destination pops pending and pushes
//! completed, so no element is ever observed by two consumers.
//!
//! Submissions are staged in an unbounded per-pair FIFO and flushed
//! into the ring in batches; a full ring leaves the tail staged until
//! the consumer drains. Completion callbacks never enter the rings —
//! they wait on the originating core and are matched to their envelope
//! in FIFO order, which the pair discipline guarantees. That is also
//! why an accumulator folded in completion callbacks needs no
//! synchronization: only the originating core runs them.
//!
//! `Smp` spawns one pinned thread per core and joins them when core
//! 0's loop exits.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use tracing::{error, info};

use flowgen_core::{CoreId, NetResult};

use crate::config::NetConfig;
use crate::reactor::Reactor;

pub(crate) type ReplyValue = Box<dyn Any + Send>;
pub(crate) type WorkFn = Box<dyn FnOnce(&Reactor) -> Option<ReplyValue> + Send>;

/// A unit of cross-core work: the closure rides to the destination,
/// the result rides back in the same envelope.
pub(crate) struct Envelope {
    pub seq: u64,
    pub work: Option<WorkFn>,
    pub result: Option<ReplyValue>,
    pub wants_reply: bool,
}

/// Origin-side continuation, matched to its envelope by FIFO order.
pub(crate) enum Completion {
    Done(Box<dyn FnOnce(&Reactor)>),
    Value(Box<dyn FnOnce(&Reactor, ReplyValue)>),
}

struct PairQueue {
    pending: ArrayQueue<Envelope>,
    completed: ArrayQueue<Envelope>,
}

/// The full (dst, src) matrix of pair queues, shared by every core.
pub(crate) struct Fabric {
    cores: usize,
    pairs: Vec<PairQueue>,
    ready_engines: AtomicUsize,
}

impl Fabric {
    pub fn new(cores: usize, ring_capacity: usize) -> Self {
        let capacity = ring_capacity.next_power_of_two();
        let pairs = (0..cores * cores)
            .map(|_| PairQueue {
                pending: ArrayQueue::new(capacity),
                completed: ArrayQueue::new(capacity),
            })
            .collect();
        Self {
            cores,
            pairs,
            ready_engines: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn cores(&self) -> usize {
        self.cores
    }

    #[inline]
    fn pair(&self, dst: CoreId, src: CoreId) -> &PairQueue {
        &self.pairs[dst * self.cores + src]
    }

    pub fn engine_ready(&self) {
        self.ready_engines.fetch_add(1, Ordering::Release);
    }

    pub fn all_ready(&self) -> bool {
        self.ready_engines.load(Ordering::Acquire) >= self.cores
    }
}

/// Per-core half of the fabric: staging FIFOs and pending
/// continuations, owned by the reactor and untouched by other cores.
pub(crate) struct SmpState {
    pub fabric: Arc<Fabric>,
    /// Submissions staged toward each destination.
    out_staging: Vec<VecDeque<Envelope>>,
    /// Processed envelopes staged back toward each source.
    ack_staging: Vec<VecDeque<Envelope>>,
    /// Continuations awaiting a completion from each destination.
    replies: Vec<VecDeque<(u64, Completion)>>,
    next_seq: u64,
    batch: usize,
}

impl SmpState {
    pub fn new(fabric: Arc<Fabric>, batch: usize) -> Self {
        let cores = fabric.cores();
        Self {
            fabric,
            out_staging: (0..cores).map(|_| VecDeque::new()).collect(),
            ack_staging: (0..cores).map(|_| VecDeque::new()).collect(),
            replies: (0..cores).map(|_| VecDeque::new()).collect(),
            next_seq: 0,
            batch,
        }
    }
}

impl Reactor {
    /// Schedule `f` on `target`. Same-core submission runs inline,
    /// synchronously, before this returns.
    pub fn submit_to(&self, target: CoreId, f: impl FnOnce(&Reactor) + Send + 'static) {
        if target == self.id() {
            f(self);
            return;
        }
        self.stage_submission(
            target,
            Box::new(move |r| {
                f(r);
                None
            }),
            None,
        );
    }

    /// Like `submit_to`, plus a completion signal invoked on this core
    /// once the work has run on `target`.
    pub fn submit_to_then(
        &self,
        target: CoreId,
        f: impl FnOnce(&Reactor) + Send + 'static,
        done: impl FnOnce(&Reactor) + 'static,
    ) {
        if target == self.id() {
            f(self);
            done(self);
            return;
        }
        self.stage_submission(
            target,
            Box::new(move |r| {
                f(r);
                None
            }),
            Some(Completion::Done(Box::new(done))),
        );
    }

    /// Run a value-producing closure on `target` and hand the value to
    /// `cb` back on this core.
    pub fn submit_to_map<T: Send + 'static>(
        &self,
        target: CoreId,
        f: impl FnOnce(&Reactor) -> T + Send + 'static,
        cb: impl FnOnce(&Reactor, T) + 'static,
    ) {
        if target == self.id() {
            let v = f(self);
            cb(self, v);
            return;
        }
        self.stage_submission(
            target,
            Box::new(move |r| Some(Box::new(f(r)) as ReplyValue)),
            Some(Completion::Value(Box::new(move |r, any| {
                match any.downcast::<T>() {
                    Ok(v) => cb(r, *v),
                    Err(_) => error!("cross-core reply type mismatch"),
                }
            }))),
        );
    }

    fn stage_submission(&self, target: CoreId, work: WorkFn, completion: Option<Completion>) {
        let smp = match self.smp_state() {
            Some(smp) => smp,
            None => {
                error!(target, "cross-core submit without an smp context");
                return;
            }
        };
        let flush = {
            let mut s = smp.borrow_mut();
            if target >= s.fabric.cores() {
                error!(target, "cross-core submit to unknown core");
                return;
            }
            let seq = s.next_seq;
            s.next_seq += 1;
            let wants_reply = completion.is_some();
            if let Some(c) = completion {
                s.replies[target].push_back((seq, c));
            }
            s.out_staging[target].push_back(Envelope {
                seq,
                work: Some(work),
                result: None,
                wants_reply,
            });
            s.out_staging[target].len() >= s.batch
        };
        if flush {
            self.flush_out(target);
        }
    }

    /// Move staged submissions into the pending ring. A full ring
    /// keeps the tail staged for the next poll.
    pub(crate) fn flush_out(&self, target: CoreId) {
        let smp = match self.smp_state() {
            Some(smp) => smp,
            None => return,
        };
        let fabric = smp.borrow().fabric.clone();
        let pair = fabric.pair(target, self.id());
        loop {
            let env = match smp.borrow_mut().out_staging[target].pop_front() {
                Some(env) => env,
                None => break,
            };
            if let Err(env) = pair.pending.push(env) {
                smp.borrow_mut().out_staging[target].push_front(env);
                break;
            }
        }
    }

    pub(crate) fn flush_all_out(&self) {
        if self.smp_state().is_none() {
            return;
        }
        for target in 0..self.cores() {
            if target != self.id() {
                self.flush_out(target);
            }
        }
    }

    fn flush_ack(&self, src: CoreId) {
        let smp = match self.smp_state() {
            Some(smp) => smp,
            None => return,
        };
        let fabric = smp.borrow().fabric.clone();
        let pair = fabric.pair(self.id(), src);
        loop {
            let env = match smp.borrow_mut().ack_staging[src].pop_front() {
                Some(env) => env,
                None => break,
            };
            if let Err(env) = pair.completed.push(env) {
                smp.borrow_mut().ack_staging[src].push_front(env);
                break;
            }
        }
    }

    /// Execute work other cores queued for this core, acknowledging
    /// each envelope back to its source.
    fn process_incoming(&self, src: CoreId) -> usize {
        let smp = match self.smp_state() {
            Some(smp) => smp,
            None => return 0,
        };
        let fabric = smp.borrow().fabric.clone();
        let pair = fabric.pair(self.id(), src);
        let mut processed = 0;
        while let Some(mut env) = pair.pending.pop() {
            if let Some(work) = env.work.take() {
                env.result = work(self);
            }
            let flush = {
                let mut s = smp.borrow_mut();
                s.ack_staging[src].push_back(env);
                s.ack_staging[src].len() >= s.batch
            };
            if flush || self.is_stopping() {
                self.flush_ack(src);
            }
            processed += 1;
        }
        processed
    }

    /// Observe completed envelopes and run their continuations on
    /// this core.
    fn process_completions(&self, dst: CoreId) -> usize {
        let smp = match self.smp_state() {
            Some(smp) => smp,
            None => return 0,
        };
        let fabric = smp.borrow().fabric.clone();
        let pair = fabric.pair(dst, self.id());
        let mut processed = 0;
        while let Some(mut env) = pair.completed.pop() {
            if env.wants_reply {
                let next = smp.borrow_mut().replies[dst].pop_front();
                match next {
                    Some((seq, completion)) => {
                        debug_assert_eq!(seq, env.seq, "completion out of order");
                        match completion {
                            Completion::Done(f) => f(self),
                            Completion::Value(f) => match env.result.take() {
                                Some(v) => f(self, v),
                                None => error!("completed envelope lost its result"),
                            },
                        }
                    }
                    None => error!(dst, "completion without a registered continuation"),
                }
            }
            processed += 1;
        }
        processed
    }

    /// One fabric poll: flush staged traffic, run inbound work, run
    /// completions. Registered as the first poller on multi-core
    /// engines.
    pub(crate) fn poll_queues(&self) -> bool {
        let cores = self.cores();
        let me = self.id();
        let mut got = 0;
        for peer in 0..cores {
            if peer == me {
                continue;
            }
            self.flush_ack(peer);
            got += self.process_incoming(peer);
            self.flush_out(peer);
            got += self.process_completions(peer);
        }
        got != 0
    }
}

// ── Engine group ─────────────────────────────────────────────────────

/// The running engine group: one reactor per core, core 0 on the
/// calling thread.
pub struct Smp {
    threads: Vec<JoinHandle<()>>,
    reactor: std::rc::Rc<Reactor>,
}

impl Smp {
    /// Validate the configuration, build the fabric, spawn one engine
    /// thread per worker core and wait until every engine is ready.
    pub fn configure(config: NetConfig) -> NetResult<Self> {
        config.validate()?;
        let fabric = Arc::new(Fabric::new(config.cores, config.ring_capacity));
        let mut threads = Vec::new();
        for core in 1..config.cores {
            let fab = fabric.clone();
            let cfg = config.clone();
            let handle = thread::Builder::new()
                .name(format!("flowgen-core-{core}"))
                .spawn(move || match Reactor::with_fabric(core, cfg, fab.clone()) {
                    Ok(r) => {
                        fab.engine_ready();
                        r.run();
                    }
                    Err(e) => {
                        error!(core, "engine failed to start: {e}");
                        fab.engine_ready();
                    }
                })
                .map_err(flowgen_core::NetError::Io)?;
            threads.push(handle);
        }

        let reactor = Reactor::with_fabric(0, config, fabric.clone())?;
        fabric.engine_ready();
        while !fabric.all_ready() {
            std::hint::spin_loop();
        }
        Ok(Self { threads, reactor })
    }

    /// The control core's reactor.
    pub fn reactor(&self) -> &std::rc::Rc<Reactor> {
        &self.reactor
    }

    /// Run `setup` against core 0, enter its loop, and join every
    /// worker once it stops.
    pub fn run(self, setup: impl FnOnce(&Reactor)) {
        setup(&self.reactor);
        self.reactor.run();
        info!("engine 0 stopped, waiting for workers");
        for t in self.threads {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity_rounds_to_power_of_two() {
        let fabric = Fabric::new(2, 100);
        let pair = fabric.pair(1, 0);
        assert_eq!(pair.pending.capacity(), 128);
        assert_eq!(pair.completed.capacity(), 128);
    }

    #[test]
    fn test_pair_queues_are_fifo() {
        let fabric = Fabric::new(2, 8);
        let pair = fabric.pair(1, 0);
        for seq in 0..5u64 {
            pair.pending
                .push(Envelope {
                    seq,
                    work: None,
                    result: None,
                    wants_reply: false,
                })
                .ok()
                .unwrap();
        }
        for seq in 0..5u64 {
            assert_eq!(pair.pending.pop().unwrap().seq, seq);
        }
    }

    #[test]
    fn test_full_ring_rejects_push() {
        let fabric = Fabric::new(2, 2);
        let pair = fabric.pair(1, 0);
        for seq in 0..2u64 {
            pair.pending
                .push(Envelope {
                    seq,
                    work: None,
                    result: None,
                    wants_reply: false,
                })
                .ok()
                .unwrap();
        }
        assert!(pair
            .pending
            .push(Envelope {
                seq: 2,
                work: None,
                result: None,
                wants_reply: false,
            })
            .is_err());
    }
}
