//! Contiguous I/O buffer with producer/consumer offsets.
//!
//! Each connection carries one of these for incoming data and (optionally) one
//! for outgoing data. The buffer never reallocates: capacity is fixed at
//! construction and the readable region is tracked with two offsets,
//! `begin <= end <= capacity`. Reads land in the free tail (`space_mut`), the
//! reactor advances `end` with [`IoBuffer::produce`], and business code or the
//! write path advances `begin` with [`IoBuffer::consume`]. [`IoBuffer::crunch`]
//! moves the readable region back to offset zero when the tail runs short.

/// Fixed-capacity byte buffer for incoming and outgoing data.
#[derive(Clone)]
pub struct IoBuffer {
    data: Vec<u8>,
    begin: usize,
    end: usize,
}

impl IoBuffer {
    /// Create a buffer with the given capacity. A zero capacity is legal and
    /// produces a buffer that reports no space (used when a connection is
    /// configured without a dedicated write buffer).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            begin: 0,
            end: 0,
        }
    }

    /// Maximum number of bytes the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable (committed, unconsumed) bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    /// True when there are no readable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Number of bytes that can be produced at the tail.
    #[inline]
    pub fn space(&self) -> usize {
        self.capacity() - self.end
    }

    /// Reset both offsets to zero. Contents are left in place.
    #[inline]
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// The readable region.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    /// The writable tail. Bytes written here become readable after a matching
    /// [`IoBuffer::produce`].
    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.data[end..]
    }

    /// Mark `count` bytes at the front of the readable region as consumed.
    /// Consuming the final readable byte resets the buffer to empty so the
    /// full capacity becomes writable again.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the readable length.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consume past end of readable region");
        self.begin += count;
        if self.is_empty() {
            self.clear();
        }
    }

    /// Mark `count` bytes at the tail as produced (readable).
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the free space.
    pub fn produce(&mut self, count: usize) {
        assert!(count <= self.space(), "produce past end of buffer");
        self.end += count;
    }

    /// Copy `bytes` to the tail and mark them produced.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the free space.
    pub fn produce_slice(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.space(), "produce past end of buffer");
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Move the readable region to offset zero, reclaiming consumed space at
    /// the front for future produces.
    pub fn crunch(&mut self) {
        if self.begin == 0 {
            return;
        }
        if self.is_empty() {
            self.clear();
            return;
        }
        let len = self.len();
        self.data.copy_within(self.begin..self.end, 0);
        self.begin = 0;
        self.end = len;
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("capacity", &self.capacity())
            .finish()
    }
}
