use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Stream that can look ahead without consuming: peeked bytes are handed
/// out again by the next reads before the inner stream is touched.
pub struct RewindStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> RewindStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_prefix(inner, BytesMut::new())
    }

    /// Replays `prefix` before anything read from `inner`.
    pub fn with_prefix(inner: S, prefix: BytesMut) -> Self {
        RewindStream { inner, buf: prefix }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> RewindStream<S> {
    /// Buffers until `n` bytes are available (or EOF) and returns them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                break;
            }
        }
        let end = n.min(self.buf.len());
        Ok(&self.buf[..end])
    }

    /// Buffers at least one more chunk from the inner stream. Returns 0 on EOF.
    pub async fn fill_more(&mut self) -> io::Result<usize> {
        self.buf.reserve(4096);
        self.inner.read_buf(&mut self.buf).await
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
