//! Timed event management.
//!
//! Entries are ordered by `(trigger, seq)` in a B-tree map; the
//! reactor drains every due entry once per loop iteration, in
//! increasing trigger order. A periodic entry re-arms at
//! `previous_trigger + interval`, not `now + interval`, so a late tick
//! catches up on every missed firing instead of skipping them.
//!
//! Cancellation is real: the id tracks its entry's current trigger
//! time, so `cancel` removes the entry in O(log n) and guarantees the
//! callback never fires afterwards.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::reactor::Reactor;

/// How many times a scheduled entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Infinite,
    Times(u32),
}

pub(crate) type TimerCb = Box<dyn FnMut(&Reactor)>;

/// Identity of a scheduled entry: trigger time plus a monotonically
/// increasing sequence number. Usable for cancellation; tracks the
/// entry as periodic re-arms move it.
#[derive(Clone)]
pub struct TimerId {
    handle: Rc<TimerHandle>,
}

impl TimerId {
    /// The entry's current (next) trigger time.
    pub fn trigger_time(&self) -> Instant {
        self.handle.when.get()
    }

    /// False once the entry fired for the last time or was cancelled.
    pub fn is_active(&self) -> bool {
        self.handle.active.get()
    }
}

pub(crate) struct TimerHandle {
    seq: u64,
    when: Cell<Instant>,
    active: Cell<bool>,
}

pub(crate) struct TimerEntry {
    pub cb: TimerCb,
    pub interval: Duration,
    pub repeat: Repeat,
    pub handle: Rc<TimerHandle>,
}

impl TimerEntry {
    /// False once cancelled.
    pub fn is_active(&self) -> bool {
        self.handle.active.get()
    }

    /// Mark the entry as having fired for the last time.
    pub fn finish(&self) {
        self.handle.active.set(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub when: Instant,
    pub seq: u64,
}

pub(crate) struct TimerManager {
    timers: BTreeMap<TimerKey, TimerEntry>,
    next_seq: u64,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn schedule_at(&mut self, when: Instant, cb: TimerCb) -> TimerId {
        self.schedule_at_with_repeat(when, Duration::ZERO, Repeat::Times(1), cb)
    }

    pub fn schedule_at_with_repeat(
        &mut self,
        when: Instant,
        interval: Duration,
        repeat: Repeat,
        cb: TimerCb,
    ) -> TimerId {
        debug_assert!(repeat != Repeat::Times(0), "timer count must be non-zero");
        let interval = interval.max(Duration::from_micros(1));
        let seq = self.next_seq;
        self.next_seq += 1;
        let handle = Rc::new(TimerHandle {
            seq,
            when: Cell::new(when),
            active: Cell::new(true),
        });
        self.timers.insert(
            TimerKey { when, seq },
            TimerEntry {
                cb,
                interval,
                repeat,
                handle: handle.clone(),
            },
        );
        TimerId { handle }
    }

    /// Remove and return the earliest entry due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerKey, TimerEntry)> {
        let key = *self.timers.keys().next()?;
        if key.when > now {
            return None;
        }
        let entry = self.timers.remove(&key)?;
        Some((key, entry))
    }

    /// Re-arm a periodic entry at its next trigger.
    pub fn reinsert(&mut self, when: Instant, seq: u64, entry: TimerEntry) {
        entry.handle.when.set(when);
        self.timers.insert(TimerKey { when, seq }, entry);
    }

    /// True when an entry was still pending and is now gone.
    pub fn cancel(&mut self, id: &TimerId) -> bool {
        if !id.handle.active.replace(false) {
            return false;
        }
        let key = TimerKey {
            when: id.handle.when.get(),
            seq: id.handle.seq,
        };
        // the entry is absent mid-fire; clearing `active` above is
        // enough to stop the re-arm in that case
        self.timers.remove(&key);
        true
    }

    /// Time until the next entry triggers. `Some(ZERO)` when overdue,
    /// `None` when nothing is scheduled.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .keys()
            .next()
            .map(|k| k.when.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCb {
        Box::new(|_| {})
    }

    #[test]
    fn test_pop_due_in_trigger_order() {
        let mut tm = TimerManager::new();
        let t0 = Instant::now();
        tm.schedule_at(t0 + Duration::from_millis(30), noop());
        tm.schedule_at(t0 + Duration::from_millis(10), noop());
        tm.schedule_at(t0 + Duration::from_millis(20), noop());

        let now = t0 + Duration::from_millis(100);
        let mut order = Vec::new();
        while let Some((key, _)) = tm.pop_due(now) {
            order.push(key.when);
        }
        assert_eq!(
            order,
            vec![
                t0 + Duration::from_millis(10),
                t0 + Duration::from_millis(20),
                t0 + Duration::from_millis(30),
            ]
        );
    }

    #[test]
    fn test_not_due_stays_put() {
        let mut tm = TimerManager::new();
        let t0 = Instant::now();
        tm.schedule_at(t0 + Duration::from_secs(60), noop());
        assert!(tm.pop_due(t0).is_none());
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mut tm = TimerManager::new();
        let t0 = Instant::now();
        let id = tm.schedule_at(t0 + Duration::from_secs(1), noop());
        assert!(id.is_active());
        assert!(tm.cancel(&id));
        assert!(!id.is_active());
        assert_eq!(tm.len(), 0);
        // second cancel reports nothing left to do
        assert!(!tm.cancel(&id));
        assert!(tm.pop_due(t0 + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn test_cancel_tracks_rearmed_trigger() {
        let mut tm = TimerManager::new();
        let t0 = Instant::now();
        let interval = Duration::from_millis(10);
        let id = tm.schedule_at_with_repeat(t0, interval, Repeat::Infinite, noop());

        let (key, entry) = tm.pop_due(t0).unwrap();
        tm.reinsert(key.when + interval, key.seq, entry);
        assert_eq!(id.trigger_time(), t0 + interval);
        assert!(tm.cancel(&id));
        assert_eq!(tm.len(), 0);
    }

    #[test]
    fn test_next_timeout() {
        let mut tm = TimerManager::new();
        let t0 = Instant::now();
        assert!(tm.next_timeout(t0).is_none());
        tm.schedule_at(t0 + Duration::from_millis(50), noop());
        assert_eq!(tm.next_timeout(t0), Some(Duration::from_millis(50)));
        assert_eq!(
            tm.next_timeout(t0 + Duration::from_millis(80)),
            Some(Duration::ZERO)
        );
    }
}
