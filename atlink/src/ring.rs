//! Fixed-capacity byte ring buffer shared by the receive loop and consumers.
//!
//! Every operation takes the single internal lock for its own duration only
//! and never waits for space or data. Callers that need to wait poll, see
//! [`crate::frame::PollConfig`].
//!
//! ```text
//!        tail                 head
//!         v                    v
//! +---+---+---+---+---+---+---+---+
//! |   | a | b | c | d | e |   |   |   count = 5
//! +---+---+---+---+---+---+---+---+
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default capacity used by sessions.
pub const DEFAULT_CAPACITY: usize = 8192;

struct Inner {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Live bytes as at most two contiguous slices, oldest first.
    fn slices(&self) -> (&[u8], &[u8]) {
        let cap = self.capacity();
        if self.tail + self.count <= cap {
            (&self.buf[self.tail..self.tail + self.count], &[])
        } else {
            let first = cap - self.tail;
            (&self.buf[self.tail..], &self.buf[..self.count - first])
        }
    }
}

/// Thread-safe circular FIFO of bytes.
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder cannot leave indices half-updated, so the data
        // is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Current occupancy. Advisory: may be stale as soon as it returns.
    pub fn available(&self) -> usize {
        self.lock().count
    }

    /// Whether the buffer currently holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Enqueue one byte. Returns `false` if the buffer is full.
    pub fn put(&self, byte: u8) -> bool {
        let mut rb = self.lock();
        if rb.count >= rb.capacity() {
            return false;
        }
        let head = rb.head;
        rb.buf[head] = byte;
        rb.head = (head + 1) % rb.capacity();
        rb.count += 1;
        true
    }

    /// Enqueue as many of `data` as fit and return how many were written.
    pub fn put_bulk(&self, data: &[u8]) -> usize {
        let mut rb = self.lock();
        let cap = rb.capacity();
        let n = data.len().min(cap - rb.count);
        if n == 0 {
            return 0;
        }

        let head = rb.head;
        let first = n.min(cap - head);
        rb.buf[head..head + first].copy_from_slice(&data[..first]);
        rb.buf[..n - first].copy_from_slice(&data[first..n]);

        rb.head = (head + n) % cap;
        rb.count += n;
        n
    }

    /// Dequeue one byte.
    pub fn get(&self) -> Option<u8> {
        let mut rb = self.lock();
        if rb.count == 0 {
            return None;
        }
        let byte = rb.buf[rb.tail];
        rb.tail = (rb.tail + 1) % rb.capacity();
        rb.count -= 1;
        Some(byte)
    }

    /// Dequeue up to `max_len` bytes.
    pub fn read_bulk(&self, max_len: usize) -> Vec<u8> {
        let mut rb = self.lock();
        let n = max_len.min(rb.count);
        let mut out = Vec::with_capacity(n);
        {
            let (a, b) = rb.slices();
            let from_a = n.min(a.len());
            out.extend_from_slice(&a[..from_a]);
            out.extend_from_slice(&b[..n - from_a]);
        }
        rb.tail = (rb.tail + n) % rb.capacity();
        rb.count -= n;
        out
    }

    /// Read the byte `index` positions after the tail without removing it.
    pub fn peek(&self, index: usize) -> Option<u8> {
        let rb = self.lock();
        if index >= rb.count {
            return None;
        }
        Some(rb.buf[(rb.tail + index) % rb.capacity()])
    }

    /// Logical offset of the first `target` byte, if any.
    pub fn find_byte(&self, target: u8) -> Option<usize> {
        let rb = self.lock();
        let (a, b) = rb.slices();
        a.iter()
            .position(|&c| c == target)
            .or_else(|| {
                b.iter()
                    .position(|&c| c == target)
                    .map(|i| a.len() + i)
            })
    }

    /// Copy every live byte without consuming anything.
    ///
    /// The copy is sized to the occupancy at the moment of the call.
    pub fn snapshot(&self) -> Vec<u8> {
        let rb = self.lock();
        let (a, b) = rb.slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Drop every buffered byte.
    pub fn clear(&self) {
        let mut rb = self.lock();
        rb.head = 0;
        rb.tail = 0;
        rb.count = 0;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rb = self.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &rb.capacity())
            .field("head", &rb.head)
            .field("tail", &rb.tail)
            .field("count", &rb.count)
            .finish()
    }
}
