//! Growable byte buffer shared between a pipe's two endpoints
//!
//! [`Buffer`] is a contiguous byte container with a movable head: `consume`
//! advances the head without reallocating, `reserve`/`commit` extend the
//! tail. [`LockingBuffer`] wraps it in a mutex and hands out RAII guards;
//! guards must not be held across `.await` points.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Contiguous growable byte buffer with head-offset consumption
///
/// Valid bytes live in `[head, tail)` of the backing storage. `consume`
/// moves the head forward; the storage is only compacted when an append
/// needs the room, so repeated consume/append cycles mostly avoid copies.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with pre-allocated storage
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    /// Number of valid (unconsumed) bytes
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Whether the buffer holds no valid bytes
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// View of the valid bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Append bytes at the tail
    pub fn append(&mut self, bytes: &[u8]) {
        self.compact_if_needed(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Reserve `n` writable bytes at the tail and return the span
    ///
    /// The span's contents are unspecified until written. Follow with
    /// [`commit`](Self::commit) to make written bytes valid.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        self.compact_if_needed(n);
        let tail = self.data.len();
        self.data.resize(tail + n, 0);
        &mut self.data[tail..]
    }

    /// Mark the first `n` reserved bytes as valid, discarding the rest
    ///
    /// Must follow a [`reserve`](Self::reserve) of at least `n` bytes.
    pub fn commit(&mut self, reserved: usize, n: usize) {
        debug_assert!(n <= reserved);
        let tail = self.data.len();
        debug_assert!(reserved <= tail - self.head);
        self.data.truncate(tail - (reserved - n));
    }

    /// Discard the first `n` valid bytes
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.head += n;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
    }

    /// Discard all contents
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    // Shift valid bytes to the front when the dead prefix would otherwise
    // force a reallocation for `incoming` more bytes.
    fn compact_if_needed(&mut self, incoming: usize) {
        if self.head > 0 && self.data.len() + incoming > self.data.capacity() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}

/// Mutex-guarded buffer shared between a pipe's endpoints
///
/// `lock()` yields exclusive access for the guard's lifetime. The pipe and
/// its endpoints take the lock for short, non-suspending critical sections
/// only.
#[derive(Debug, Clone, Default)]
pub struct LockingBuffer {
    inner: Arc<Mutex<Buffer>>,
}

impl LockingBuffer {
    /// Create an empty locking buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the buffer for exclusive access
    ///
    /// Never poisons: a panic while holding the guard surrenders the buffer
    /// in whatever state it was left, which is acceptable because the owning
    /// pipe tears the whole transfer down on panic anyway.
    pub fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of valid bytes, taking the lock briefly
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty, taking the lock briefly
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_consume() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.as_slice(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.len(), 5);
        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_all_resets_head() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.consume(3);
        // Head resets so the next append starts at offset zero.
        buf.append(b"xyz");
        assert_eq!(buf.as_slice(), b"xyz");
    }

    #[test]
    fn test_reserve_commit() {
        let mut buf = Buffer::new();
        buf.append(b"head");
        let span = buf.reserve(8);
        span[..3].copy_from_slice(b"tai");
        buf.commit(8, 3);
        assert_eq!(buf.as_slice(), b"headtai");
    }

    #[test]
    fn test_commit_zero_discards_reservation() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.reserve(16);
        buf.commit(16, 0);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn test_compaction_preserves_contents() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"0123456");
        buf.consume(5);
        // Appending beyond capacity forces compaction; contents survive.
        buf.append(b"abcdef");
        assert_eq!(buf.as_slice(), b"56abcdef");
    }

    #[test]
    fn test_locking_buffer_guard() {
        let buf = LockingBuffer::new();
        buf.lock().append(b"data");
        assert_eq!(buf.len(), 4);
        let cloned = buf.clone();
        cloned.lock().consume(2);
        assert_eq!(buf.lock().as_slice(), b"ta");
    }
}
