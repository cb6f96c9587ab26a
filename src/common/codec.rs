use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::poll_read_buf;

/// A framing/crypto layer applied to a byte stream.
///
/// `decode` consumes whatever complete units it finds at the head of `src`
/// and leaves partial ones in place for the next call.
pub trait Codec: Send + Sync {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()>;

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()>;

    /// Bytes the layer must send back after decoding (handshake replies).
    fn take_reply(&mut self, _dst: &mut BytesMut) {}
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        (**self).encode(src, dst)
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        (**self).decode(src, dst)
    }

    fn take_reply(&mut self, dst: &mut BytesMut) {
        (**self).take_reply(dst)
    }
}

/// Runs every write through `codec.encode` and every read through `codec.decode`.
pub struct CodecStream<S, C> {
    inner: S,
    codec: C,
    rbuf: BytesMut,
    decoded: BytesMut,
    wbuf: BytesMut,
    eof: bool,
}

impl<S, C> CodecStream<S, C> {
    pub fn new(inner: S, codec: C) -> Self {
        CodecStream {
            inner,
            codec,
            rbuf: BytesMut::with_capacity(8 * 1024),
            decoded: BytesMut::new(),
            wbuf: BytesMut::new(),
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<S: AsyncWrite + Unpin, C> CodecStream<S, C> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wbuf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wbuf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S, C> AsyncRead for CodecStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Codec + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded[..n]);
                this.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            if !this.rbuf.is_empty() {
                this.codec.decode(&mut this.rbuf, &mut this.decoded)?;
                this.codec.take_reply(&mut this.wbuf);
                if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
                    return Poll::Ready(Err(e));
                }
                if !this.decoded.is_empty() {
                    continue;
                }
            }
            this.rbuf.reserve(8 * 1024);
            let n = ready!(poll_read_buf(Pin::new(&mut this.inner), cx, &mut this.rbuf))?;
            if n == 0 {
                this.eof = true;
                if !this.rbuf.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed inside a frame",
                    )));
                }
            }
        }
    }
}

impl<S, C> AsyncWrite for CodecStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Codec + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.codec.encode(buf, &mut this.wbuf)?;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Length-prefixed frames with every byte xor'ed.
    struct XorFrames;

    impl Codec for XorFrames {
        fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
            dst.put_u8(src.len() as u8);
            dst.extend(src.iter().map(|b| b ^ 0x5a));
            Ok(())
        }

        fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
            while let Some(&len) = src.first() {
                let len = len as usize;
                if src.len() < len + 1 {
                    break;
                }
                let frame = src.split_to(len + 1);
                dst.extend(frame[1..].iter().map(|b| b ^ 0x5a));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn frames_survive_partial_reads() {
        let (a, b) = tokio::io::duplex(3);
        let mut left = CodecStream::new(a, XorFrames);
        let mut right = CodecStream::new(b, XorFrames);
        let writer = tokio::spawn(async move {
            left.write_all(b"hello").await.unwrap();
            left.write_all(b" world").await.unwrap();
            left.shutdown().await.unwrap();
        });
        let mut out = Vec::new();
        right.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
