use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use http::{HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{WebSocketStream, client_async};
use tungstenite::Message;
use tungstenite::client::IntoClientRequest;

/// Byte stream over binary websocket messages.
pub struct WsStreamWrapper<S> {
    ws: WebSocketStream<S>,
    read_buf: Bytes,
}

fn ws_err(e: tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<S> WsStreamWrapper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the HTTP upgrade over an already connected `stream`.
    pub async fn connect(
        stream: S,
        host: &str,
        path: &str,
        headers: &[(String, String)],
        tls: bool,
    ) -> io::Result<Self> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let url = format!("{}://{}{}", if tls { "wss" } else { "ws" }, host, path);
        let mut request = url.as_str().into_client_request().map_err(ws_err)?;
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            request.headers_mut().insert(name, value);
        }
        let (ws, response) = client_async(request, stream).await.map_err(ws_err)?;
        log::debug!("[WsWrapper] upgraded {} -> {}", url, response.status());
        Ok(WsStreamWrapper {
            ws,
            read_buf: Bytes::new(),
        })
    }
}

impl<S> AsyncRead for WsStreamWrapper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let to_read = buf.remaining().min(self.read_buf.len());
                buf.put_slice(&self.read_buf[..to_read]);
                self.read_buf.advance(to_read);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.read_buf = Bytes::from(data),
                Some(Ok(Message::Close(_))) | None => {
                    log::trace!("[WsWrapper] remote closed connection");
                    return Poll::Ready(Ok(()));
                }
                Some(Ok(other)) => {
                    log::trace!("[WsWrapper] ignored non-binary message: {:?}", other);
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStreamWrapper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.ws).poll_ready(cx)).map_err(ws_err)?;
        Pin::new(&mut self.ws)
            .start_send(Message::Binary(data.to_vec()))
            .map_err(ws_err)?;
        if let Poll::Ready(Err(e)) = Pin::new(&mut self.ws).poll_flush(cx) {
            return Poll::Ready(Err(ws_err(e)));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws).poll_close(cx).map_err(ws_err)
    }
}
