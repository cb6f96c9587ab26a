use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::common::rewind::RewindStream;
use crate::common::{Address, ConnType, Network, find_bytes};
use crate::error::invalid_data;

const MAX_REQUEST_HEAD: usize = 16 * 1024;
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Reads one request head. `CONNECT` is answered and consumed; any other
/// request stays buffered so it reaches the upstream verbatim.
pub async fn handshake<S>(conn: &mut RewindStream<S>) -> io::Result<(Address, ConnType)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head_len = loop {
        if let Some(idx) = find_bytes(conn.buffered(), b"\r\n\r\n") {
            break idx + 4;
        }
        if conn.buffered().len() > MAX_REQUEST_HEAD {
            return Err(invalid_data("http request head too large"));
        }
        if conn.fill_more().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before sending a request",
            ));
        }
    };
    let head = String::from_utf8_lossy(&conn.buffered()[..head_len]).into_owned();
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m, t),
        _ => return Err(invalid_data(format!("bad request line {:?}", line))),
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let address = Address::from_host_port(Network::Tcp, target).map_err(io::Error::from)?;
        conn.consume(head_len);
        conn.write_all(CONNECT_ESTABLISHED).await?;
        conn.flush().await?;
        return Ok((address, ConnType::HttpConnect));
    }

    let url = Url::parse(target).map_err(|e| invalid_data(format!("{}: {}", target, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| invalid_data(format!("no host in {}", target)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid_data(format!("no port for {}", target)))?;
    let address = Address::parse(Network::Tcp, host, port).map_err(io::Error::from)?;
    Ok((address, ConnType::Http))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn connect_is_answered() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nTLS")
            .await
            .unwrap();
        let mut conn = RewindStream::new(server);
        let (addr, kind) = handshake(&mut conn).await.unwrap();
        assert_eq!(addr.to_string(), "example.com:443");
        assert_eq!(kind, ConnType::HttpConnect);
        let mut rest = [0u8; 3];
        conn.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"TLS");
        let mut answer = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer, CONNECT_ESTABLISHED);
    }

    #[tokio::test]
    async fn plain_request_is_replayed() {
        let (mut client, server) = duplex(1024);
        let request = b"GET http://example.org/index.html HTTP/1.1\r\nHost: example.org\r\n\r\n";
        client.write_all(request).await.unwrap();
        drop(client);
        let mut conn = RewindStream::new(server);
        let (addr, kind) = handshake(&mut conn).await.unwrap();
        assert_eq!(addr.to_string(), "example.org:80");
        assert_eq!(kind, ConnType::Http);
        let mut replay = Vec::new();
        conn.read_to_end(&mut replay).await.unwrap();
        assert_eq!(replay, request);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"hello\r\n\r\n").await.unwrap();
        let mut conn = RewindStream::new(server);
        assert!(handshake(&mut conn).await.is_err());
    }
}
