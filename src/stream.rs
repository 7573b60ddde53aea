//! Buffered frontend transport: framing between the socket and [`RMsgs`].
use bytes::BytesMut;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Instant,
};

use crate::{
    Error, Result,
    net::Socket,
    postgres::{BackendMessage, ProtocolError, frontend},
    ring::RingBuf,
    rmsgs::{Frame, RMsgs},
};

const DEFAULT_WRITE_CAPACITY: usize = 1024;
const HEADER: usize = 5;

/// Frontend half of a connection.
///
/// Owns the socket, the ring buffer the socket drains into, the framer
/// state and the write buffer. Messages are framed as
/// `tag (1 byte) | length (u32 BE, includes itself) | body`.
pub struct Frontend {
    socket: Socket,
    ring: RingBuf,
    write_buf: BytesMut,

    // partial frame state
    header: [u8; HEADER],
    header_len: usize,
    body: BytesMut,
    body_len: usize,
    body_filled: usize,
}

impl Frontend {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            ring: RingBuf::new(),
            write_buf: BytesMut::with_capacity(DEFAULT_WRITE_CAPACITY),
            header: [0; HEADER],
            header_len: 0,
            body: BytesMut::new(),
            body_len: 0,
            body_filled: 0,
        }
    }

    /// Buffer a frontend message.
    ///
    /// Use [`flush`][Frontend::flush] to actually write to the socket.
    pub fn send<F: frontend::FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    /// Buffer the untagged Startup message.
    pub fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    /// Write all buffered messages to the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.socket.shutdown().await
    }

    /// Fill `rmsgs` with framed messages.
    ///
    /// On `Ready(Ok(()))` at least one message is readable, unless the
    /// queue had no write capacity to begin with. Framing stops when the
    /// queue is full or when the socket blocks with messages already
    /// queued; `Pending` is returned only while nothing is readable.
    pub fn poll_receive(&mut self, rmsgs: &mut RMsgs, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            // frame as much as the ring holds
            while rmsgs.write_capacity() > 0 {
                if !self.poll_frame_one(rmsgs)? {
                    break;
                }
            }
            if rmsgs.write_capacity() == 0 {
                return Poll::Ready(Ok(()));
            }

            // one read syscall per outer iteration
            match self.ring.poll_read_from(&mut self.socket, cx) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                }
                Poll::Ready(Ok(_)) => { }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                Poll::Pending => {
                    return match rmsgs.readable() {
                        0 => Poll::Pending,
                        _ => Poll::Ready(Ok(())),
                    };
                }
            }
        }
    }

    /// Try to complete one frame out of the ring buffer.
    ///
    /// Returns `Ok(true)` when a frame was queued, `Ok(false)` when the
    /// ring ran out of bytes first.
    fn poll_frame_one(&mut self, rmsgs: &mut RMsgs) -> Result<bool, Error> {
        if self.header_len < HEADER {
            self.header_len += self.ring.read(&mut self.header[self.header_len..]);
            if self.header_len < HEADER {
                return Ok(false);
            }

            let tag = self.header[0];
            if !BackendMessage::is_known(tag) {
                return Err(ProtocolError::unknown(tag).into());
            }

            let len = u32::from_be_bytes(self.header[1..HEADER].try_into().unwrap()) as usize;
            if len < 4 {
                return Err(ProtocolError::malformed("frame header").into());
            }
            self.body_len = len - 4;
            self.body_filled = 0;
            self.body.clear();
            self.body.resize(self.body_len, 0);
        }

        if self.body_filled < self.body_len {
            self.body_filled += self.ring.read(&mut self.body[self.body_filled..]);
            if self.body_filled < self.body_len {
                return Ok(false);
            }
        }

        let frame = Frame {
            tag: self.header[0],
            body: self.body.split().freeze(),
        };
        self.header_len = 0;
        self.body_len = 0;
        self.body_filled = 0;

        let queued = rmsgs.write(frame);
        debug_assert!(queued, "write capacity checked by caller");
        Ok(true)
    }

    /// Receive into `rmsgs`, optionally bounded by a deadline.
    pub fn receive<'a>(
        &'a mut self,
        rmsgs: &'a mut RMsgs,
        deadline: Option<Instant>,
    ) -> Receive<'a> {
        Receive {
            frontend: self,
            rmsgs,
            deadline: deadline.map(|at| tokio::time::sleep_until(at.into())),
        }
    }
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("socket", &self.socket)
            .field("ring", &self.ring)
            .field("write_buf", &self.write_buf.len())
            .finish()
    }
}

pin_project_lite::pin_project! {
    /// Future returned from [`Frontend::receive`].
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Receive<'a> {
        frontend: &'a mut Frontend,
        rmsgs: &'a mut RMsgs,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
    }
}

impl Future for Receive<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Some(deadline) = me.deadline.as_pin_mut() {
            if deadline.poll(cx).is_ready() {
                // a timeout is surfaced but does not kill the connection
                return Poll::Ready(Err(crate::ErrorKind::Timeout.into()));
            }
        }

        me.frontend.poll_receive(me.rmsgs, cx)
    }
}

fn poll_write_all<W, B>(writer: &mut W, buf: &mut B, cx: &mut Context<'_>) -> Poll<io::Result<()>>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
    B: bytes::Buf + ?Sized,
{
    use std::io::IoSlice;
    use std::pin::Pin;

    const MAX_VECTOR_ELEMENTS: usize = 64;

    while buf.has_remaining() {
        let n = if writer.is_write_vectored() {
            let mut slices = [IoSlice::new(&[]); MAX_VECTOR_ELEMENTS];
            let cnt = buf.chunks_vectored(&mut slices);
            ready!(Pin::new(&mut *writer).poll_write_vectored(cx, &slices[..cnt]))?
        } else {
            ready!(Pin::new(&mut *writer).poll_write(cx, buf.chunk())?)
        };
        buf.advance(n);
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
    }

    Poll::Ready(Ok(()))
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;
    use tokio::io::AsyncWriteExt;

    fn backend_msg(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(tag);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
        buf
    }

    fn pipe() -> (Frontend, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(256);
        (Frontend::new(Socket::pipe(client)), server)
    }

    #[tokio::test]
    async fn frames_single_message() {
        let (mut frontend, mut server) = pipe();
        let mut rmsgs = RMsgs::with_capacity(4);

        server.write_all(&backend_msg(b'Z', b"I")).await.unwrap();

        frontend.receive(&mut rmsgs, None).await.unwrap();
        assert_eq!(rmsgs.readable(), 1);
        let frame = rmsgs.read().unwrap();
        assert_eq!(frame.tag, b'Z');
        assert_eq!(&frame.body[..], b"I");
    }

    #[tokio::test]
    async fn body_split_across_reads_is_framed_once() {
        let (mut frontend, mut server) = pipe();
        let mut rmsgs = RMsgs::with_capacity(4);

        let msg = backend_msg(b'D', b"\x00\x01\x00\x00\x00\x03abc");
        let (first, second) = msg.split_at(7);

        server.write_all(first).await.unwrap();
        server.flush().await.unwrap();

        let recv = frontend.receive(&mut rmsgs, None);
        tokio::pin!(recv);
        assert!(
            futures_poll_once(recv.as_mut()).await.is_none(),
            "incomplete frame must not resolve",
        );

        server.write_all(second).await.unwrap();
        recv.await.unwrap();

        assert_eq!(rmsgs.readable(), 1);
        let frame = rmsgs.read().unwrap();
        assert_eq!(frame.tag, b'D');
        assert_eq!(&frame.body[..], b"\x00\x01\x00\x00\x00\x03abc");
    }

    #[tokio::test]
    async fn unknown_tag_is_protocol_error() {
        let (mut frontend, mut server) = pipe();
        let mut rmsgs = RMsgs::with_capacity(4);

        server.write_all(&backend_msg(b'x', b"")).await.unwrap();

        let err = frontend.receive(&mut rmsgs, None).await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn fills_to_write_capacity() {
        let (mut frontend, mut server) = pipe();
        let mut rmsgs = RMsgs::with_capacity(2);

        let mut bytes = Vec::new();
        for _ in 0..3 {
            bytes.extend_from_slice(&backend_msg(b'2', b""));
        }
        server.write_all(&bytes).await.unwrap();

        frontend.receive(&mut rmsgs, None).await.unwrap();
        assert_eq!(rmsgs.readable(), 2, "stops at write capacity");

        rmsgs.read().unwrap();
        rmsgs.read().unwrap();
        frontend.receive(&mut rmsgs, None).await.unwrap();
        assert_eq!(rmsgs.readable(), 1, "third message still framed");
    }

    #[tokio::test]
    async fn deadline_is_timeout_error() {
        let (mut frontend, _server) = pipe();
        let mut rmsgs = RMsgs::with_capacity(2);

        let deadline = Instant::now() + std::time::Duration::from_millis(5);
        let err = frontend.receive(&mut rmsgs, Some(deadline)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    async fn futures_poll_once<F: Future>(fut: Pin<&mut F>) -> Option<F::Output> {
        let mut fut = Some(fut);
        std::future::poll_fn(move |cx| {
            match fut.take().unwrap().poll(cx) {
                Poll::Ready(out) => Poll::Ready(Some(out)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }
}
