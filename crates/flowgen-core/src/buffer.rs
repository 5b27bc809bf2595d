//! Growable byte window.
//!
//! One `Buffer` backs each direction of a connection: inbound bytes
//! accumulate at the tail until the application consumes them from the
//! head, and unsent outbound bytes are staged the same way. The live
//! window is `[b, e)` inside a heap block of `cap` bytes; consuming the
//! last byte releases the whole allocation.

const DEFAULT_SUGGEST: usize = 2048;

pub struct Buffer {
    buf: Vec<u8>,
    b: usize,
    e: usize,
    suggest: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            b: 0,
            e: 0,
            suggest: DEFAULT_SUGGEST,
        }
    }

    /// Number of live bytes in the window.
    #[inline]
    pub fn len(&self) -> usize {
        self.e - self.b
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.e == self.b
    }

    /// Current allocation size. Zero after the window has drained.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The live window.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.b..self.e]
    }

    /// Free bytes after the window.
    #[inline]
    pub fn space(&self) -> usize {
        self.buf.len() - self.e
    }

    /// Ensure at least `len` bytes of tail space: use existing trailing
    /// space if possible, shift the window to the front when more than
    /// half the allocation is a dead prefix, otherwise reallocate.
    pub fn make_room(&mut self, len: usize) {
        if self.e + len <= self.buf.len() {
            // enough trailing space already
        } else if self.len() + len < self.buf.len() / 2 {
            self.move_head();
        } else {
            self.expand(len);
        }
    }

    /// Ensure the suggested amount of tail space for a read.
    pub fn reserve_suggested(&mut self) {
        if self.space() < self.suggest {
            self.expand(0);
        }
    }

    /// Writable tail slice. Call `add_size` with the bytes actually
    /// written into it.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        let e = self.e;
        &mut self.buf[e..]
    }

    /// Extend the window over `len` bytes previously written into the
    /// tail slice.
    #[inline]
    pub fn add_size(&mut self, len: usize) {
        debug_assert!(self.e + len <= self.buf.len());
        self.e += len;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.make_room(data.len());
        let e = self.e;
        self.buf[e..e + data.len()].copy_from_slice(data);
        self.e += data.len();
    }

    /// Advance the head of the window. Draining the last byte releases
    /// the allocation.
    pub fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.len());
        self.b += len.min(self.len());
        if self.is_empty() {
            self.clear();
        }
    }

    /// Drop all contents and release the allocation.
    pub fn clear(&mut self) {
        self.buf = Vec::new();
        self.b = 0;
        self.e = 0;
    }

    /// Preferred read chunk size; also the floor for reallocations.
    pub fn set_suggest_size(&mut self, sz: usize) {
        self.suggest = sz;
    }

    fn move_head(&mut self) {
        self.buf.copy_within(self.b..self.e, 0);
        self.e -= self.b;
        self.b = 0;
    }

    fn expand(&mut self, len: usize) {
        let ncap = self
            .suggest
            .max(2 * self.buf.len())
            .max(self.len() + len);
        let mut next = vec![0u8; ncap];
        next[..self.len()].copy_from_slice(self.data());
        self.e -= self.b;
        self.b = 0;
        self.buf = next;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("cap", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_consume_accounting() {
        let mut buf = Buffer::new();
        let mut appended = 0usize;
        let mut consumed = 0usize;

        for round in 0..50 {
            let chunk = vec![round as u8; 17 + round];
            buf.append(&chunk);
            appended += chunk.len();
            assert_eq!(buf.len(), appended - consumed);

            let take = buf.len() / 3;
            buf.consume(take);
            consumed += take;
            assert_eq!(buf.len(), appended - consumed);
        }
    }

    #[test]
    fn test_empty_buffer_releases_storage() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert!(buf.capacity() > 0);

        buf.consume(buf.len());
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_window_contents_preserved_across_growth() {
        let mut buf = Buffer::new();
        buf.set_suggest_size(16);
        buf.append(b"abcdef");
        buf.consume(2);

        // force several reallocations
        for _ in 0..10 {
            buf.append(&[b'x'; 100]);
        }
        assert_eq!(&buf.data()[..4], b"cdef");
        assert_eq!(buf.len(), 4 + 1000);
    }

    #[test]
    fn test_move_head_reuses_allocation() {
        let mut buf = Buffer::new();
        buf.append(&[1u8; 4096]);
        buf.consume(4000);
        let cap = buf.capacity();

        // small window, large dead prefix: make_room shifts instead of
        // growing
        buf.make_room(1024);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.data(), &[1u8; 96][..]);
    }

    #[test]
    fn test_writable_tail_roundtrip() {
        let mut buf = Buffer::new();
        buf.reserve_suggested();
        let spare = buf.writable();
        assert!(spare.len() >= 2048);
        spare[..3].copy_from_slice(b"xyz");
        buf.add_size(3);
        assert_eq!(buf.data(), b"xyz");
    }
}
