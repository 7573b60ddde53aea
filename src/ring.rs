//! Fixed capacity byte ring between the socket and the framer.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, ReadBuf};

/// Default ring capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Fixed-capacity byte ring.
///
/// Absorbs non-blocking socket reads and feeds the framer. The buffer is
/// created with the transport and reused for the connection's lifetime; it
/// is never resized.
pub struct RingBuf {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RingBuf {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non zero");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes queued and not yet read.
    pub fn available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn vacant(&self) -> usize {
        self.capacity() - self.len
    }

    /// Copy queued bytes into `dst`, up to `dst.len()`.
    ///
    /// Returns the number of bytes copied; zero when the ring is empty.
    /// Wrap-around is internal: reads crossing the wrap boundary are
    /// byte-equivalent to contiguous reads.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let cap = self.capacity();
        let n = dst.len().min(self.len);

        let first = n.min(cap - self.start);
        dst[..first].copy_from_slice(&self.buf[self.start..self.start + first]);

        let second = n - first;
        dst[first..n].copy_from_slice(&self.buf[..second]);

        self.start = (self.start + n) % cap;
        self.len -= n;
        n
    }

    /// Copy bytes into the vacant region, up to the free capacity.
    pub(crate) fn fill(&mut self, src: &[u8]) -> usize {
        let cap = self.capacity();
        let n = src.len().min(self.vacant());
        let wpos = (self.start + self.len) % cap;

        let first = n.min(cap - wpos);
        self.buf[wpos..wpos + first].copy_from_slice(&src[..first]);

        let second = n - first;
        self.buf[..second].copy_from_slice(&src[first..n]);

        self.len += n;
        n
    }

    /// Issue one read syscall into the vacant region.
    ///
    /// `Poll::Pending` is the non-blocking "no bytes available" signal;
    /// `Ok(0)` means either a full ring or end of stream.
    pub fn poll_read_from<R>(&mut self, reader: &mut R, cx: &mut Context<'_>) -> Poll<io::Result<usize>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.vacant() == 0 {
            return Poll::Ready(Ok(0));
        }

        let cap = self.capacity();
        let wpos = (self.start + self.len) % cap;
        let end = cap.min(wpos + self.vacant());

        let mut buf = ReadBuf::new(&mut self.buf[wpos..end]);
        ready!(Pin::new(reader).poll_read(cx, &mut buf)?);

        let n = buf.filled().len();
        self.len += n;
        Poll::Ready(Ok(n))
    }
}

impl Default for RingBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RingBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuf")
            .field("capacity", &self.capacity())
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_then_read() {
        let mut ring = RingBuf::with_capacity(16);
        assert_eq!(ring.fill(b"hello"), 5);
        assert_eq!(ring.available(), 5);

        let mut dst = [0u8; 8];
        assert_eq!(ring.read(&mut dst), 5);
        assert_eq!(&dst[..5], b"hello");
        assert!(ring.is_empty());
    }

    #[test]
    fn fill_stops_at_capacity() {
        let mut ring = RingBuf::with_capacity(4);
        assert_eq!(ring.fill(b"abcdef"), 4);
        assert_eq!(ring.fill(b"x"), 0);

        let mut dst = [0u8; 4];
        assert_eq!(ring.read(&mut dst), 4);
        assert_eq!(&dst, b"abcd");
    }

    #[test]
    fn wrap_boundary_is_contiguous() {
        let mut ring = RingBuf::with_capacity(8);
        assert_eq!(ring.fill(b"123456"), 6);

        let mut dst = [0u8; 4];
        assert_eq!(ring.read(&mut dst), 4);
        assert_eq!(&dst, b"1234");

        // write crosses the physical end of the buffer
        assert_eq!(ring.fill(b"abcdef"), 6);
        assert_eq!(ring.available(), 8);

        let mut dst = [0u8; 8];
        assert_eq!(ring.read(&mut dst), 8);
        assert_eq!(&dst, b"56abcdef");
    }

    #[test]
    fn empty_read_returns_zero() {
        let mut ring = RingBuf::with_capacity(8);
        let mut dst = [0u8; 4];
        assert_eq!(ring.read(&mut dst), 0);
    }
}
