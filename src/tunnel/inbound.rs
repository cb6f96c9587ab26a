use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{InboundConn, Server, http, socks5};
use crate::common::rewind::RewindStream;
use crate::common::{ConnType, Metadata};
use crate::error::{Error, Result};
use crate::proxy::outbound::DEFAULT_TCP_TIMEOUT;

const ACCEPT_QUEUE: usize = 32;

/// Mixed SOCKS5/HTTP listener. The first byte of each connection picks the handshake.
pub struct InboundServer {
    local_addr: SocketAddr,
    conns: Mutex<mpsc::Receiver<InboundConn>>,
    cancel: CancellationToken,
}

impl InboundServer {
    pub async fn bind(addr: &str) -> Result<Arc<Self>> {
        Self::bind_with_timeout(addr, DEFAULT_TCP_TIMEOUT).await
    }

    /// Like [`bind`](Self::bind), dropping clients that do not finish the
    /// handshake within `handshake_timeout`.
    pub async fn bind_with_timeout(addr: &str, handshake_timeout: Duration) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let cancel = CancellationToken::new();
        log::info!("[Inbound] listening on {} (socks5/http)", local_addr);
        tokio::spawn(accept_loop(listener, tx, cancel.clone(), handshake_timeout));
        Ok(Arc::new(InboundServer {
            local_addr,
            conns: Mutex::new(rx),
            cancel,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<InboundConn>,
    cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("[Inbound] exiting");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Inbound] accept failed: {}", e);
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, sniff(stream, peer)).await {
                Ok(Ok(conn)) => {
                    let _ = tx.send(conn).await;
                }
                Ok(Err(e)) => log::warn!("[Inbound] handshake with {} failed: {}", peer, e),
                Err(_) => log::warn!(
                    "[Inbound] handshake with {} timed out after {:?}",
                    peer,
                    handshake_timeout
                ),
            }
        });
    }
}

async fn sniff(stream: TcpStream, peer: SocketAddr) -> Result<InboundConn> {
    let _ = stream.set_nodelay(true);
    let mut conn = RewindStream::new(stream);
    let first = match conn.peek(1).await?.first() {
        Some(b) => *b,
        None => return Err(Error::Protocol("connection closed before handshake".into())),
    };
    let (address, conn_type) = match first {
        socks5::VERSION => (socks5::handshake(&mut conn).await?, ConnType::Socks),
        4 => return Err(Error::Protocol("socks4 is not supported".into())),
        _ => http::handshake(&mut conn).await?,
    };
    log::debug!("[Inbound] {} {} -> {}", conn_type, peer, address);
    Ok(InboundConn {
        stream: Box::new(conn),
        metadata: Metadata::new(address, conn_type),
        peer: Some(peer),
    })
}

#[async_trait]
impl Server for InboundServer {
    async fn accept_conn(&self) -> Result<InboundConn> {
        let mut conns = self.conns.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Protocol("inbound server closed".into())),
            conn = conns.recv() => conn.ok_or_else(|| Error::Protocol("inbound server closed".into())),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn socks_and_http_share_the_port() {
        let server = InboundServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();

        let mut socks = TcpStream::connect(addr).await.unwrap();
        socks.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        socks.read_exact(&mut method).await.unwrap();
        socks
            .write_all(&[5, 1, 0, 1, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let conn = server.accept_conn().await.unwrap();
        assert_eq!(conn.metadata.conn_type, ConnType::Socks);
        assert_eq!(conn.metadata.remote_address(), "10.0.0.1:80");

        let mut http = TcpStream::connect(addr).await.unwrap();
        http.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let conn = server.accept_conn().await.unwrap();
        assert_eq!(conn.metadata.conn_type, ConnType::HttpConnect);

        server.close();
        assert!(server.accept_conn().await.is_err());
    }

    #[tokio::test]
    async fn silent_client_is_dropped() {
        let server = InboundServer::bind_with_timeout("127.0.0.1:0", Duration::from_millis(100))
            .await
            .unwrap();
        let mut conn = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.close();
    }
}
