//! Readiness interest tracking.
//!
//! Every pollable descriptor owns one `PollState` slot in the
//! reactor's registry. The slot carries the two event closures set at
//! attach time plus the interest bookkeeping shared by both backend
//! implementations: `requested` is what the consumer wants next,
//! `armed` is what the multiplexer currently watches. Tokens carry a
//! generation so a slot reused after `forget` cannot receive a stale
//! event.

use slab::Slab;

use crate::reactor::Reactor;

/// Readiness interest bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);

    #[inline]
    pub fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    #[inline]
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

/// Opaque descriptor-slot handle: slab key plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollToken {
    pub(crate) key: u32,
    pub(crate) gen: u32,
}

impl PollToken {
    #[inline]
    pub fn as_u64(self) -> u64 {
        (u64::from(self.gen) << 32) | u64::from(self.key)
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        Self {
            key: v as u32,
            gen: (v >> 32) as u32,
        }
    }
}

pub(crate) type EventCallback = Box<dyn FnMut(&Reactor)>;

pub(crate) struct PollState {
    /// Kernel fd or user-space socket id.
    pub(crate) pollid: i32,
    pub(crate) gen: u32,
    /// Interest the consumer asked for and has not yet received.
    pub(crate) requested: Interest,
    /// Interest currently armed in the multiplexer.
    pub(crate) armed: Interest,
    pub(crate) on_readable: Option<EventCallback>,
    pub(crate) on_writable: Option<EventCallback>,
}

pub(crate) struct PollRegistry {
    slots: Slab<PollState>,
    next_gen: u32,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_gen: 1,
        }
    }

    pub fn insert(
        &mut self,
        pollid: i32,
        on_readable: EventCallback,
        on_writable: EventCallback,
    ) -> PollToken {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);
        let key = self.slots.insert(PollState {
            pollid,
            gen,
            requested: Interest::NONE,
            armed: Interest::NONE,
            on_readable: Some(on_readable),
            on_writable: Some(on_writable),
        }) as u32;
        PollToken { key, gen }
    }

    /// Slot lookup, refusing stale generations.
    pub fn get_mut(&mut self, token: PollToken) -> Option<&mut PollState> {
        self.slots
            .get_mut(token.key as usize)
            .filter(|s| s.gen == token.gen)
    }

    pub fn remove(&mut self, token: PollToken) -> Option<PollState> {
        match self.slots.get(token.key as usize) {
            Some(s) if s.gen == token.gen => Some(self.slots.remove(token.key as usize)),
            _ => None,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PollToken, &mut PollState)> {
        self.slots.iter_mut().map(|(key, s)| {
            (
                PollToken {
                    key: key as u32,
                    gen: s.gen,
                },
                s,
            )
        })
    }
}
