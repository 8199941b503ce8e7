use std::collections::VecDeque;

/// A bounded byte ring buffer with a peek/commit contract.
///
/// Bytes are appended at the back by [`RingBuffer::write`] and consumed from
/// the front in two steps: [`RingBuffer::peek`] returns a contiguous view of
/// up to `len` buffered bytes without removing them, and [`RingBuffer::commit`]
/// drops the first `len` bytes once the caller has finished with them. This
/// lets a parser look at a prefix of the buffer, decide it needs more bytes,
/// and come back on the next tick without losing its place.
///
/// Backed by a `VecDeque<u8>` so `peek` is a single `make_contiguous` call
/// rather than a copy; the deque is allowed to grow internal capacity beyond
/// `capacity` transiently during `make_contiguous`; `capacity` only bounds how
/// many bytes may be buffered at once, enforced by `write`.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.buf.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Appends `data` to the buffer. Fails as a unit (nothing is written) if
    /// `data` would not fit in the remaining capacity.
    #[must_use]
    pub fn write(&mut self, data: &[u8]) -> bool {
        if data.len() > self.available() {
            return false;
        }
        self.buf.extend(data);
        true
    }

    /// Returns a contiguous view of up to `len` buffered bytes, without
    /// consuming them. Returns `None` if fewer than `len` bytes are buffered.
    pub fn peek(&mut self, len: usize) -> Option<&[u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (front, _) = self.buf.as_slices();
        if front.len() >= len {
            return Some(&front[..len]);
        }
        // Straddles the wrap point; rotate to make the whole buffer
        // contiguous so callers can always slice it directly.
        Some(&self.buf.make_contiguous()[..len])
    }

    /// Returns a contiguous view of the entire buffered region.
    pub fn peek_all(&mut self) -> &[u8] {
        self.buf.make_contiguous()
    }

    /// Drops the first `len` bytes. Panics if `len` exceeds the buffered
    /// length; callers must only commit what they have peeked.
    pub fn commit(&mut self, len: usize) {
        assert!(len <= self.buf.len(), "commit past end of buffered data");
        self.buf.drain(..len);
    }
}
