//! Per-core event loop.
//!
//! One reactor per core, built on its own thread and never shared.
//! Each loop iteration ticks the timer manager, drains the task queue,
//! then runs every registered poller in order: the cross-core fabric
//! poller (multi-core engines), the signal poller, and the I/O poller,
//! which registers itself on the first descriptor registration. The
//! loop never sleeps; an idle iteration simply comes around again.
//!
//! There is no thread-local `engine()` lookup: every callback the
//! reactor invokes receives `&Reactor` as an argument, and anything a
//! callback schedules closes over nothing but what it needs.
//!
//! Execution is strictly cooperative. A callback runs to completion
//! and stalls this core's timers, I/O and cross-core mailbox while it
//! does; that is the contract, not a hazard to engineer away.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info, trace, warn};

use flowgen_core::{ConnState, CoreId, NetResult};

use crate::backend::{Backend, ReadyEvent};
use crate::config::{NetConfig, StackKind};
use crate::conn::ConnPtr;
use crate::connector::Connector;
use crate::crypto::Sealer;
use crate::poll::{EventCallback, Interest, PollRegistry, PollToken};
use crate::smp::{Fabric, SmpState};
use crate::timer::{Repeat, TimerId, TimerManager};
use crate::ustack::{Stack, UstackBackend};

type Task = Box<dyn FnOnce(&Reactor)>;
type SignalCb = Box<dyn FnMut(&Reactor)>;

/// Signal bits recorded by the async-signal handler, drained by the
/// signal poller of whichever core registered a handler.
static PENDING_SIGNALS: AtomicU64 = AtomicU64::new(0);

extern "C" fn record_signal(signo: libc::c_int) {
    PENDING_SIGNALS.fetch_or(1u64 << signo as u64, Ordering::Relaxed);
}

/// Work sources checked once per loop iteration, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PollerKind {
    Smp,
    Signal,
    Io,
}

pub struct Reactor {
    id: CoreId,
    config: NetConfig,
    stopping: Cell<bool>,
    timers: RefCell<TimerManager>,
    tasks: RefCell<VecDeque<Task>>,
    registry: RefCell<PollRegistry>,
    backend: RefCell<Box<dyn Backend>>,
    ready_buf: RefCell<Vec<ReadyEvent>>,
    pollers: RefCell<Vec<PollerKind>>,
    conns: RefCell<Vec<ConnPtr>>,
    connector: RefCell<Connector>,
    smp: Option<RefCell<SmpState>>,
    signals: RefCell<HashMap<i32, SignalCb>>,
    locals: RefCell<HashMap<usize, Box<dyn Any>>>,
    stack: Option<Rc<RefCell<Stack>>>,
}

impl Reactor {
    /// Single-core engine on the calling thread, no fabric.
    pub fn standalone(config: NetConfig) -> NetResult<Rc<Self>> {
        config.validate()?;
        if config.cores != 1 {
            return Err(flowgen_core::NetError::config(
                "standalone reactor is single-core; use Smp::configure",
            ));
        }
        Self::build(0, config, None)
    }

    pub(crate) fn with_fabric(
        id: CoreId,
        config: NetConfig,
        fabric: Arc<Fabric>,
    ) -> NetResult<Rc<Self>> {
        Self::build(id, config, Some(fabric))
    }

    fn build(id: CoreId, config: NetConfig, fabric: Option<Arc<Fabric>>) -> NetResult<Rc<Self>> {
        if config.pin_threads {
            pin_thread(id);
        }
        let (backend, stack): (Box<dyn Backend>, Option<Rc<RefCell<Stack>>>) = match config.stack {
            StackKind::Kernel => (kernel_backend()?, None),
            StackKind::Ustack => {
                let stack = Rc::new(RefCell::new(Stack::new()));
                (Box::new(UstackBackend::new(stack.clone())), Some(stack))
            }
        };
        let connector = Connector::configure(&config, stack.clone());
        let smp = fabric.map(|f| RefCell::new(SmpState::new(f, config.batch_size)));
        Ok(Rc::new(Self {
            id,
            config,
            stopping: Cell::new(false),
            timers: RefCell::new(TimerManager::new()),
            tasks: RefCell::new(VecDeque::new()),
            registry: RefCell::new(PollRegistry::new()),
            backend: RefCell::new(backend),
            ready_buf: RefCell::new(Vec::new()),
            pollers: RefCell::new(Vec::new()),
            conns: RefCell::new(Vec::new()),
            connector: RefCell::new(connector),
            smp,
            signals: RefCell::new(HashMap::new()),
            locals: RefCell::new(HashMap::new()),
            stack,
        }))
    }

    #[inline]
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Number of cores in the engine group.
    #[inline]
    pub fn cores(&self) -> usize {
        self.config.cores
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    pub(crate) fn sealer(&self) -> Option<Arc<dyn Sealer>> {
        self.config.sealer.clone()
    }

    pub(crate) fn smp_state(&self) -> Option<&RefCell<SmpState>> {
        self.smp.as_ref()
    }

    pub(crate) fn stack_kind(&self) -> StackKind {
        self.config.stack
    }

    pub(crate) fn ustack(&self) -> Option<Rc<RefCell<Stack>>> {
        self.stack.clone()
    }

    // ── Main loop ────────────────────────────────────────────────────

    /// Run until `stop` is observed, then close every tracked
    /// connection.
    pub fn run(&self) {
        info!(core = self.id, "engine running");
        if self.cores() > 1 && self.smp.is_some() {
            self.register_poller(PollerKind::Smp);
        }
        self.register_poller(PollerKind::Signal);
        if self.id == 0 {
            self.handle_signal_once(Signal::SIGINT, |r| {
                warn!("SIGINT signal fired");
                r.stop();
            });
            self.handle_signal_once(Signal::SIGTERM, |r| {
                warn!("SIGTERM signal fired");
                r.stop();
            });
        }

        while !self.stopping.get() {
            self.run_once();
        }

        // push anything still staged at the fabric so peers observe
        // the stop broadcast
        self.flush_all_out();

        let conns: Vec<ConnPtr> = self.conns.borrow().clone();
        for conn in conns {
            if conn.state() == ConnState::Connected {
                conn.close(self);
            }
        }
        info!(core = self.id, "engine stopped");
    }

    /// One loop iteration: timers, task drain, pollers. Returns
    /// whether any poller found work.
    pub fn run_once(&self) -> bool {
        self.tick_timers();
        if !self.tasks.borrow().is_empty() {
            self.execute_tasks();
        }
        let start = Instant::now();
        let kinds: Vec<PollerKind> = self.pollers.borrow().clone();
        let mut work = false;
        for kind in kinds {
            work |= match kind {
                PollerKind::Smp => self.poll_queues(),
                PollerKind::Signal => self.poll_signal(),
                PollerKind::Io => self.poll_io(0),
            };
        }
        if work {
            trace!(
                core = self.id,
                ns = start.elapsed().as_nanos() as u64,
                "poll and process"
            );
        }
        work
    }

    /// Idempotent. Core 0 broadcasts the stop to every other core
    /// through the fabric before stopping itself.
    pub fn stop(&self) {
        if self.stopping.get() {
            return;
        }
        if self.id == 0 {
            for core in 1..self.cores() {
                self.submit_to(core, |r| r.stop());
            }
        }
        self.stopping.set(true);
        info!(core = self.id, "engine stopping");
    }

    /// Queue a closure to run on this core's next iteration.
    pub fn add_task(&self, f: impl FnOnce(&Reactor) + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(f));
    }

    fn execute_tasks(&self) {
        loop {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(f) => f(self),
                None => break,
            }
        }
    }

    fn register_poller(&self, kind: PollerKind) {
        let mut pollers = self.pollers.borrow_mut();
        if pollers.contains(&kind) {
            return;
        }
        pollers.push(kind);
        pollers.sort();
        trace!(core = self.id, ?kind, "poller registered");
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Open an outbound connection; returns immediately in
    /// `Connecting` state. The reactor keeps an owning reference for
    /// shutdown cleanup.
    pub fn connect(&self, peer: SocketAddrV4) -> NetResult<ConnPtr> {
        self.connect_from(peer, None)
    }

    /// As `connect`, with a caller-chosen local endpoint instead of
    /// one from the pool.
    pub fn connect_from(
        &self,
        peer: SocketAddrV4,
        local: Option<SocketAddrV4>,
    ) -> NetResult<ConnPtr> {
        let conn = self.connector.borrow_mut().connect(self, peer, local)?;
        self.conns.borrow_mut().push(conn.clone());
        Ok(conn)
    }

    pub(crate) fn track_conn(&self, conn: &ConnPtr) {
        self.conns.borrow_mut().push(conn.clone());
    }

    pub(crate) fn reconnect_conn(&self, conn: &ConnPtr) {
        if let Err(e) = self.connector.borrow_mut().reconnect(self, conn) {
            error!(conn = conn.id(), "reconnect failed: {e}");
        }
    }

    // ── Readiness plumbing ───────────────────────────────────────────

    pub(crate) fn register_poll(
        &self,
        pollid: i32,
        on_readable: EventCallback,
        on_writable: EventCallback,
    ) -> PollToken {
        let token = self
            .registry
            .borrow_mut()
            .insert(pollid, on_readable, on_writable);
        // the I/O poller joins the rotation on first use
        self.register_poller(PollerKind::Io);
        token
    }

    pub(crate) fn update_poll(&self, token: PollToken, interest: Interest) {
        let mut registry = self.registry.borrow_mut();
        if let Some(state) = registry.get_mut(token) {
            if let Err(e) = self.backend.borrow_mut().update(token, state, interest) {
                error!(core = self.id, "backend update failed: {e}");
            }
        }
    }

    pub(crate) fn forget_poll(&self, token: PollToken) {
        let mut registry = self.registry.borrow_mut();
        if let Some(mut state) = registry.remove(token) {
            self.backend.borrow_mut().forget(token, &mut state);
        }
    }

    fn poll_io(&self, timeout_ms: i32) -> bool {
        let mut ready = std::mem::take(&mut *self.ready_buf.borrow_mut());
        ready.clear();
        {
            let mut backend = self.backend.borrow_mut();
            let mut registry = self.registry.borrow_mut();
            if let Err(e) = backend.poll(timeout_ms, &mut registry, &mut ready) {
                error!(core = self.id, "backend poll failed: {e}");
            }
        }
        let got = !ready.is_empty();
        for ev in ready.drain(..) {
            // writable first: a connect handshake resolves through the
            // writable edge before any data is read
            if ev.interest.writable() {
                self.fire_io(ev.token, true);
            }
            if ev.interest.readable() {
                self.fire_io(ev.token, false);
            }
        }
        *self.ready_buf.borrow_mut() = ready;
        got
    }

    /// Invoke one event closure with its slot released, so the
    /// closure may attach, close or re-register freely.
    fn fire_io(&self, token: PollToken, writable: bool) {
        let cb = {
            let mut registry = self.registry.borrow_mut();
            match registry.get_mut(token) {
                Some(state) => {
                    if writable {
                        state.on_writable.take()
                    } else {
                        state.on_readable.take()
                    }
                }
                None => None,
            }
        };
        if let Some(mut f) = cb {
            f(self);
            let mut registry = self.registry.borrow_mut();
            if let Some(state) = registry.get_mut(token) {
                let slot = if writable {
                    &mut state.on_writable
                } else {
                    &mut state.on_readable
                };
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    pub fn add_oneshot_task_at(
        &self,
        when: Instant,
        f: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        self.timers.borrow_mut().schedule_at(when, Box::new(f))
    }

    pub fn add_oneshot_task_after(
        &self,
        delay: Duration,
        f: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        self.add_oneshot_task_at(Instant::now() + delay, f)
    }

    pub fn add_periodic_task_at(
        &self,
        when: Instant,
        interval: Duration,
        repeat: Repeat,
        f: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        self.timers
            .borrow_mut()
            .schedule_at_with_repeat(when, interval, repeat, Box::new(f))
    }

    pub fn add_periodic_task_after(
        &self,
        delay: Duration,
        interval: Duration,
        repeat: Repeat,
        f: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        self.add_periodic_task_at(Instant::now() + delay, interval, repeat, f)
    }

    /// Remove a scheduled entry. True when it was still pending.
    pub fn cancel_timer(&self, id: &TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    /// Time until the next timer fires, if any is scheduled.
    pub fn next_timer_timeout(&self) -> Option<Duration> {
        self.timers.borrow().next_timeout(Instant::now())
    }

    fn tick_timers(&self) {
        while self.tick_one_timer(Instant::now()) {}
    }

    /// Drain every entry due at a fixed `now`; periodic entries
    /// re-arm at `previous_trigger + interval` and so catch up on a
    /// backlog within this single call.
    pub(crate) fn tick_timers_at(&self, now: Instant) {
        while self.tick_one_timer(now) {}
    }

    fn tick_one_timer(&self, now: Instant) -> bool {
        let due = self.timers.borrow_mut().pop_due(now);
        let (key, mut entry) = match due {
            Some(x) => x,
            None => return false,
        };
        if !entry.is_active() {
            // cancelled mid-flight; reclaim lazily
            return true;
        }
        (entry.cb)(self);
        let again = match entry.repeat {
            Repeat::Infinite => true,
            Repeat::Times(n) if n > 1 => {
                entry.repeat = Repeat::Times(n - 1);
                true
            }
            _ => {
                entry.finish();
                false
            }
        };
        // cancelled from inside its own callback: do not re-arm
        if again && entry.is_active() {
            self.timers
                .borrow_mut()
                .reinsert(key.when + entry.interval, key.seq, entry);
        }
        true
    }

    // ── Signals ──────────────────────────────────────────────────────

    /// Install a process signal handler whose callback runs on this
    /// core's loop.
    pub fn handle_signal(&self, signal: Signal, f: impl FnMut(&Reactor) + 'static) {
        let act = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        if let Err(e) = unsafe { sigaction(signal, &act) } {
            warn!(signal = %signal, "sigaction failed: {e}");
            return;
        }
        self.signals
            .borrow_mut()
            .insert(signal as i32, Box::new(f));
    }

    pub fn handle_signal_once(&self, signal: Signal, f: impl FnOnce(&Reactor) + 'static) {
        let mut f = Some(f);
        self.handle_signal(signal, move |r| {
            if let Some(f) = f.take() {
                f(r);
            }
        });
    }

    fn poll_signal(&self) -> bool {
        let pending = PENDING_SIGNALS.load(Ordering::Relaxed);
        if pending == 0 {
            return false;
        }
        // drain only the bits this core has handlers for
        let mask = self
            .signals
            .borrow()
            .keys()
            .fold(0u64, |m, s| m | 1u64 << *s as u64);
        let take = pending & mask;
        if take == 0 {
            return false;
        }
        PENDING_SIGNALS.fetch_and(!take, Ordering::Relaxed);
        for signo in 0..64i32 {
            if take & (1u64 << signo as u64) == 0 {
                continue;
            }
            let cb = self.signals.borrow_mut().remove(&signo);
            if let Some(mut f) = cb {
                f(self);
                self.signals.borrow_mut().entry(signo).or_insert(f);
            }
        }
        true
    }

    // ── Core-local storage (sharded services) ────────────────────────

    pub(crate) fn local_insert(&self, slot: usize, v: Box<dyn Any>) {
        self.locals.borrow_mut().insert(slot, v);
    }

    pub(crate) fn local_take(&self, slot: usize) -> Option<Box<dyn Any>> {
        self.locals.borrow_mut().remove(&slot)
    }
}

#[cfg(target_os = "linux")]
fn kernel_backend() -> NetResult<Box<dyn Backend>> {
    Ok(Box::new(crate::epoll::EpollBackend::new()?))
}

#[cfg(not(target_os = "linux"))]
fn kernel_backend() -> NetResult<Box<dyn Backend>> {
    Err(flowgen_core::NetError::config(
        "kernel stack backend requires linux",
    ))
}

fn pin_thread(core: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if core >= CpuSet::count() || set.set(core).is_err() {
        warn!(core, "cannot pin thread: cpu index out of range");
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!(core, "sched_setaffinity failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    fn test_reactor() -> Rc<Reactor> {
        let cfg = NetConfig::new()
            .stack(StackKind::Ustack)
            .pin_threads(false);
        Reactor::standalone(cfg).unwrap()
    }

    #[test]
    fn test_periodic_timer_catches_up_on_backlog() {
        let r = test_reactor();
        let t0 = Instant::now();
        let interval = Duration::from_millis(10);
        let fired = Rc::new(StdRefCell::new(Vec::new()));
        let probe = fired.clone();

        let id = r.add_periodic_task_at(t0 + interval, interval, Repeat::Infinite, move |_| {
            probe.borrow_mut().push(());
        });

        // advance the clock by 3 intervals in one tick: three firings,
        // not one
        r.tick_timers_at(t0 + 3 * interval);
        assert_eq!(fired.borrow().len(), 3);
        // re-armed at previous_trigger + interval each time
        assert_eq!(id.trigger_time(), t0 + 4 * interval);
        assert!(id.is_active());
    }

    #[test]
    fn test_bounded_repeat_stops_after_count() {
        let r = test_reactor();
        let t0 = Instant::now();
        let interval = Duration::from_millis(5);
        let fired = Rc::new(StdRefCell::new(0u32));
        let probe = fired.clone();

        let id = r.add_periodic_task_at(t0, interval, Repeat::Times(2), move |_| {
            *probe.borrow_mut() += 1;
        });

        r.tick_timers_at(t0 + 10 * interval);
        assert_eq!(*fired.borrow(), 2);
        assert!(!id.is_active());
    }

    #[test]
    fn test_due_timers_fire_in_time_order() {
        let r = test_reactor();
        let t0 = Instant::now();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        for (tag, offset_ms) in [(1u32, 30u64), (2, 10), (3, 20)] {
            let probe = order.clone();
            r.add_oneshot_task_at(t0 + Duration::from_millis(offset_ms), move |_| {
                probe.borrow_mut().push(tag);
            });
        }
        r.tick_timers_at(t0 + Duration::from_millis(100));
        assert_eq!(*order.borrow(), vec![2, 3, 1]);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let r = test_reactor();
        let t0 = Instant::now();
        let fired = Rc::new(StdRefCell::new(false));
        let probe = fired.clone();

        let id = r.add_oneshot_task_at(t0 + Duration::from_millis(1), move |_| {
            *probe.borrow_mut() = true;
        });
        assert!(r.cancel_timer(&id));
        assert!(!r.cancel_timer(&id));
        r.tick_timers_at(t0 + Duration::from_secs(1));
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_cancel_from_own_callback_stops_periodic() {
        let r = test_reactor();
        let t0 = Instant::now();
        let interval = Duration::from_millis(10);
        let count = Rc::new(StdRefCell::new(0u32));

        let id: Rc<StdRefCell<Option<TimerId>>> = Rc::new(StdRefCell::new(None));
        let id2 = id.clone();
        let probe = count.clone();
        let timer = r.add_periodic_task_at(t0, interval, Repeat::Infinite, move |r| {
            *probe.borrow_mut() += 1;
            if let Some(id) = id2.borrow().as_ref() {
                r.cancel_timer(id);
            }
        });
        *id.borrow_mut() = Some(timer);

        r.tick_timers_at(t0 + 10 * interval);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_tasks_drain_fifo_including_nested() {
        let r = test_reactor();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let o1 = order.clone();
        let o2 = order.clone();
        r.add_task(move |r| {
            o1.borrow_mut().push(1);
            let o3 = o1.clone();
            r.add_task(move |_| {
                o3.borrow_mut().push(3);
            });
        });
        r.add_task(move |_| {
            o2.borrow_mut().push(2);
        });

        r.run_once();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_self_submission_runs_synchronously() {
        let r = test_reactor();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        order.lock().unwrap().push("before");
        let probe = order.clone();
        r.submit_to(0, move |_| {
            probe.lock().unwrap().push("inline");
        });
        order.lock().unwrap().push("after");

        assert_eq!(*order.lock().unwrap(), vec!["before", "inline", "after"]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let r = test_reactor();
        r.stop();
        assert!(r.is_stopping());
        r.stop();
        assert!(r.is_stopping());
    }
}
