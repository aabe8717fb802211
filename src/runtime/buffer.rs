//! Per-connection byte ring buffers.
//!
//! Each connection owns two rings: an inbound one filled by the poller with
//! `readv`, and an outbound one drained by the poller with `writev`. Memory is
//! a single contiguous allocation with head/length indices, so the readable
//! (or writable) region is at most two slices across the wraparound point.
//!
//! ## Growth
//!
//! A ring starts small and doubles on demand up to its ceiling. Once at the
//! ceiling an append that does not fit fails with [`BufferError::Full`]; the
//! caller decides whether that means blocking, failing, or pausing reads.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Initial capacity of a ring.
pub const DEFAULT_INITIAL_CAPACITY: usize = 4 * 1024;

/// Default capacity ceiling of a ring.
pub const DEFAULT_CEILING: usize = 64 * 1024 * 1024;

/// Free space below which `read_from` tries to grow the ring before reading.
const MIN_READ_SPACE: usize = 1024;

/// Error returned when the ring cannot take more bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The ring is at its ceiling and the bytes do not fit.
    Full,
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Full => write!(f, "ring buffer is full"),
        }
    }
}

impl std::error::Error for BufferError {}

impl From<BufferError> for io::Error {
    fn from(e: BufferError) -> Self {
        io::Error::new(io::ErrorKind::OutOfMemory, e)
    }
}

/// Contiguous circular byte buffer.
pub struct RingBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    initial: usize,
    ceiling: usize,
}

impl RingBuffer {
    /// Create a ring with the default initial capacity and ceiling.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY, DEFAULT_CEILING)
    }

    /// Create a ring that starts at `initial` bytes and may grow to `ceiling`.
    pub fn with_capacity(initial: usize, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        let initial = initial.clamp(1, ceiling);
        Self {
            buf: vec![0u8; initial],
            head: 0,
            len: 0,
            initial,
            ceiling,
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current allocation size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Maximum allocation size.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Free bytes in the current allocation.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// True when the ring holds `ceiling` bytes and cannot grow.
    pub fn is_full(&self) -> bool {
        self.len >= self.ceiling
    }

    /// Make room for `additional` more bytes, growing geometrically.
    pub fn reserve(&mut self, additional: usize) -> Result<(), BufferError> {
        let needed = self.len + additional;
        if needed <= self.buf.len() {
            return Ok(());
        }
        if needed > self.ceiling {
            return Err(BufferError::Full);
        }
        let mut cap = self.buf.len().max(1);
        while cap < needed {
            cap = cap.saturating_mul(2);
        }
        self.resize(cap.min(self.ceiling));
        Ok(())
    }

    /// Reallocate to `cap` bytes, moving the readable region to offset 0.
    fn resize(&mut self, cap: usize) {
        debug_assert!(cap >= self.len);
        let mut next = vec![0u8; cap];
        let (a, b) = self.peek(self.len);
        next[..a.len()].copy_from_slice(a);
        next[a.len()..a.len() + b.len()].copy_from_slice(b);
        self.buf = next;
        self.head = 0;
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.reserve(data.len())?;
        let cap = self.buf.len();
        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
        Ok(())
    }

    /// Append several segments as one unit; either all fit or none are written.
    pub fn append_vectored(&mut self, segments: &[&[u8]]) -> Result<usize, BufferError> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        self.reserve(total)?;
        for seg in segments {
            self.append(seg)?;
        }
        Ok(total)
    }

    /// View up to `n` readable bytes in place, as at most two slices.
    pub fn peek(&self, n: usize) -> (&[u8], &[u8]) {
        let n = n.min(self.len);
        let cap = self.buf.len();
        let first = n.min(cap - self.head);
        let a = &self.buf[self.head..self.head + first];
        let b = &self.buf[..n - first];
        (a, b)
    }

    /// Copy up to `dst.len()` readable bytes without consuming them.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let (a, b) = self.peek(dst.len());
        dst[..a.len()].copy_from_slice(a);
        dst[a.len()..a.len() + b.len()].copy_from_slice(b);
        a.len() + b.len()
    }

    /// Copy up to `dst.len()` bytes out and consume them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.copy_to(dst);
        self.consume(n);
        n
    }

    /// Drop `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        } else {
            self.head = (self.head + n) % self.buf.len();
        }
    }

    /// Free regions after the tail, as at most two mutable slices.
    fn free_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.buf.len();
        let tail = (self.head + self.len) % cap;
        let free = cap - self.len;
        if free == 0 {
            return (&mut [], &mut []);
        }
        if tail >= self.head {
            let (front, back) = self.buf.split_at_mut(tail);
            let wrap = self.head;
            (back, &mut front[..wrap])
        } else {
            (&mut self.buf[tail..self.head], &mut [])
        }
    }

    /// Mark `n` bytes written into the free region as readable.
    fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.len += n;
    }

    /// Fill free segments from `fd` with a single `readv`.
    ///
    /// Returns `Ok(0)` on end of stream. When the ring is at its ceiling and
    /// full, returns [`BufferError::Full`] converted into an `io::Error`.
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.free() < MIN_READ_SPACE && self.buf.len() < self.ceiling {
            let want = (self.buf.len() * 2).min(self.ceiling);
            self.resize(want);
        }
        if self.free() == 0 {
            return Err(BufferError::Full.into());
        }
        let n = {
            let (a, b) = self.free_slices();
            let mut iovs = [IoSliceMut::new(a), IoSliceMut::new(b)];
            let cnt = if iovs[1].is_empty() { 1 } else { 2 };
            readv(fd, &mut iovs[..cnt])?
        };
        self.commit(n);
        Ok(n)
    }

    /// Readable region as `IoSlice`s for a `writev`.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let (a, b) = self.peek(self.len);
        let mut slices = Vec::with_capacity(2);
        if !a.is_empty() {
            slices.push(IoSlice::new(a));
        }
        if !b.is_empty() {
            slices.push(IoSlice::new(b));
        }
        slices
    }

    /// Drain readable segments into `fd` with a single `writev`.
    ///
    /// Returns the number of bytes written and the number of segments handed
    /// to the syscall.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<(usize, usize)> {
        let n;
        let blocks;
        {
            let slices = self.io_slices();
            blocks = slices.len();
            if blocks == 0 {
                return Ok((0, 0));
            }
            n = writev(fd, &slices)?;
        }
        self.consume(n);
        Ok((n, blocks))
    }

    /// Return an empty ring to its initial allocation.
    pub fn shrink(&mut self) {
        if self.len == 0 && self.buf.len() > self.initial {
            self.buf = vec![0u8; self.initial];
            self.head = 0;
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

fn readv(fd: RawFd, iovs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    loop {
        // SAFETY: IoSliceMut is ABI compatible with iovec and every slice
        // borrows memory owned by the ring for the duration of the call.
        let n = unsafe {
            libc::readv(
                fd,
                iovs.as_mut_ptr() as *mut libc::iovec,
                iovs.len() as libc::c_int,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn writev(fd: RawFd, iovs: &[IoSlice<'_>]) -> io::Result<usize> {
    loop {
        // SAFETY: IoSlice is ABI compatible with iovec and the slices stay
        // borrowed for the duration of the call.
        let n = unsafe {
            libc::writev(
                fd,
                iovs.as_ptr() as *const libc::iovec,
                iovs.len() as libc::c_int,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn collect(ring: &RingBuffer) -> Vec<u8> {
        let (a, b) = ring.peek(ring.len());
        [a, b].concat()
    }

    #[test]
    fn test_append_and_read() {
        let mut ring = RingBuffer::with_capacity(8, 64);
        ring.append(b"hello").unwrap();
        assert_eq!(ring.len(), 5);

        let mut out = [0u8; 3];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(collect(&ring), b"lo");
    }

    #[test]
    fn test_wraparound_peek_two_slices() {
        let mut ring = RingBuffer::with_capacity(8, 8);
        ring.append(b"abcdef").unwrap();
        ring.consume(4);
        ring.append(b"ghijkl").unwrap();

        let (a, b) = ring.peek(ring.len());
        assert_eq!(a, b"efgh");
        assert_eq!(b, b"ijkl");
        assert_eq!(ring.io_slices().len(), 2);
    }

    #[test]
    fn test_geometric_growth_keeps_order() {
        let mut ring = RingBuffer::with_capacity(4, 1024);
        ring.append(b"abc").unwrap();
        ring.consume(2);
        ring.append(b"defghijk").unwrap();

        assert_eq!(ring.capacity(), 16);
        assert_eq!(collect(&ring), b"cdefghijk");
    }

    #[test]
    fn test_ceiling_rejects_append() {
        let mut ring = RingBuffer::with_capacity(4, 8);
        ring.append(b"12345678").unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.append(b"9"), Err(BufferError::Full));
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_append_vectored_is_all_or_nothing() {
        let mut ring = RingBuffer::with_capacity(4, 8);
        assert_eq!(ring.append_vectored(&[b"abc", b"de"]).unwrap(), 5);
        assert_eq!(ring.append_vectored(&[b"fg", b"hij"]), Err(BufferError::Full));
        assert_eq!(collect(&ring), b"abcde");
    }

    #[test]
    fn test_consume_to_empty_resets_head() {
        let mut ring = RingBuffer::with_capacity(8, 8);
        ring.append(b"abcdef").unwrap();
        ring.consume(6);
        assert!(ring.is_empty());
        ring.append(b"12345678").unwrap();
        let (a, b) = ring.peek(8);
        assert_eq!(a, b"12345678");
        assert!(b.is_empty());
    }

    #[test]
    fn test_shrink_returns_to_initial() {
        let mut ring = RingBuffer::with_capacity(4, 64);
        ring.append(&[7u8; 40]).unwrap();
        assert!(ring.capacity() >= 40);
        ring.consume(40);
        ring.shrink();
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn test_read_from_and_write_to_fd() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"ping over a socket").unwrap();

        let mut ring = RingBuffer::with_capacity(4, 1024);
        let n = ring.read_from(right.as_raw_fd()).unwrap();
        assert_eq!(n, 18);
        assert_eq!(collect(&ring), b"ping over a socket");

        let (written, blocks) = ring.write_to(right.as_raw_fd()).unwrap();
        assert_eq!(written, 18);
        assert!(blocks >= 1);
        assert!(ring.is_empty());

        let mut echoed = [0u8; 18];
        left.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping over a socket");
    }
}
