//! Bounded circular queue of framed backend messages.
use bytes::Bytes;

/// Default queue capacity, matching the default row batch.
pub const DEFAULT_CAPACITY: usize = 100;

/// One framed backend message: a tag byte and its undecoded body.
///
/// Bodies are owned [`Bytes`]; a frame stays valid for as long as the
/// caller keeps it, regardless of later framer reads.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

/// Circular queue of framed `(tag, body)` pairs between the framer and the
/// rows cursor.
///
/// Single producer, single consumer by construction; the connection owns
/// the only handle.
pub struct RMsgs {
    slots: Vec<Frame>,
    rp: usize,
    wp: usize,
    readable: usize,
}

impl RMsgs {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "rmsgs capacity must be non zero");
        Self {
            slots: vec![Frame::default(); capacity],
            rp: 0,
            wp: 0,
            readable: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of queued messages not yet read.
    pub fn readable(&self) -> usize {
        self.readable
    }

    /// Remaining slots before the queue is full.
    pub fn write_capacity(&self) -> usize {
        self.capacity() - self.readable
    }

    /// Pop the oldest frame.
    ///
    /// The slot content is kept so an immediately following [`backward`][1]
    /// restores it.
    ///
    /// [1]: RMsgs::backward
    pub fn read(&mut self) -> Option<Frame> {
        if self.readable == 0 {
            return None;
        }
        let frame = self.slots[self.rp].clone();
        self.rp = (self.rp + 1) % self.capacity();
        self.readable -= 1;
        Some(frame)
    }

    /// Queue a frame. Returns `false` when the queue is full.
    pub fn write(&mut self, frame: Frame) -> bool {
        if self.write_capacity() == 0 {
            return false;
        }
        self.slots[self.wp] = frame;
        self.wp = (self.wp + 1) % self.capacity();
        self.readable += 1;
        true
    }

    /// The k-th readable frame, without advancing.
    pub fn peek(&self, k: usize) -> Option<&Frame> {
        if k >= self.readable {
            return None;
        }
        Some(&self.slots[(self.rp + k) % self.capacity()])
    }

    /// Undo one [`read`][1] if write capacity permits.
    ///
    /// Valid only while no write has happened since that read; the cursor
    /// uses it to un-consume a peeked CommandComplete.
    ///
    /// [1]: RMsgs::read
    pub fn backward(&mut self) -> bool {
        if self.write_capacity() == 0 {
            return false;
        }
        self.rp = (self.rp + self.capacity() - 1) % self.capacity();
        self.readable += 1;
        true
    }

    /// Skip one readable frame.
    pub fn forward(&mut self) -> bool {
        if self.readable == 0 {
            return false;
        }
        self.rp = (self.rp + 1) % self.capacity();
        self.readable -= 1;
        true
    }

    /// Grow or shrink the queue while preserving readable frames.
    ///
    /// When shrinking below the readable count, the oldest frames are
    /// dropped.
    pub fn set_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0, "rmsgs capacity must be non zero");
        if capacity == self.capacity() {
            return;
        }

        let mut keep: Vec<Frame> = std::iter::from_fn(|| self.read()).collect();
        if keep.len() > capacity {
            keep.drain(..keep.len() - capacity);
        }

        let readable = keep.len();
        keep.resize(capacity, Frame::default());
        self.slots = keep;
        self.rp = 0;
        self.wp = readable % capacity;
        self.readable = readable;
    }
}

impl Default for RMsgs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RMsgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMsgs")
            .field("capacity", &self.capacity())
            .field("rp", &self.rp)
            .field("wp", &self.wp)
            .field("readable", &self.readable)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(tag: u8, body: &'static [u8]) -> Frame {
        Frame { tag, body: Bytes::from_static(body) }
    }

    #[test]
    fn fifo_until_empty() {
        let mut q = RMsgs::with_capacity(3);
        assert!(q.write(frame(b'1', b"")));
        assert!(q.write(frame(b'D', b"one")));
        assert!(q.write(frame(b'C', b"SELECT 1\0")));
        assert!(!q.write(frame(b'Z', b"")), "queue is full");

        assert_eq!(q.read().unwrap().tag, b'1');
        let d = q.read().unwrap();
        assert_eq!((d.tag, &d.body[..]), (b'D', &b"one"[..]));
        assert_eq!(q.read().unwrap().tag, b'C');
        assert!(q.read().is_none());
    }

    #[test]
    fn backward_restores_read() {
        let mut q = RMsgs::with_capacity(2);
        q.write(frame(b'D', b"row"));
        q.write(frame(b'C', b""));

        let first = q.read().unwrap();
        assert!(q.backward());
        let again = q.read().unwrap();
        assert_eq!(first.tag, again.tag);
        assert_eq!(first.body, again.body);
        assert_eq!(q.readable(), 1);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut q = RMsgs::with_capacity(4);
        q.write(frame(b'T', b""));
        q.write(frame(b'D', b""));

        assert_eq!(q.peek(0).unwrap().tag, b'T');
        assert_eq!(q.peek(1).unwrap().tag, b'D');
        assert!(q.peek(2).is_none());
        assert_eq!(q.readable(), 2);
    }

    #[test]
    fn forward_skips() {
        let mut q = RMsgs::with_capacity(2);
        q.write(frame(b'N', b""));
        q.write(frame(b'Z', b""));
        assert!(q.forward());
        assert_eq!(q.read().unwrap().tag, b'Z');
        assert!(!q.forward());
    }

    #[test]
    fn grow_preserves_frames() {
        let mut q = RMsgs::with_capacity(2);
        q.write(frame(b'1', b""));
        q.write(frame(b'2', b""));
        q.set_capacity(4);
        assert_eq!(q.capacity(), 4);
        assert_eq!(q.readable(), 2);
        assert_eq!(q.write_capacity(), 2);
        assert_eq!(q.read().unwrap().tag, b'1');
        assert_eq!(q.read().unwrap().tag, b'2');
    }

    #[test]
    fn shrink_drops_oldest() {
        let mut q = RMsgs::with_capacity(4);
        for tag in [b'1', b'2', b'3'] {
            q.write(frame(tag, b""));
        }
        q.set_capacity(2);
        assert_eq!(q.readable(), 2);
        assert_eq!(q.read().unwrap().tag, b'2');
        assert_eq!(q.read().unwrap().tag, b'3');
    }

    #[test]
    fn wrapping_read_write() {
        let mut q = RMsgs::with_capacity(2);
        for round in 0..5u8 {
            assert!(q.write(frame(round, b"")));
            assert_eq!(q.read().unwrap().tag, round);
        }
        assert_eq!(q.readable(), 0);
    }
}
