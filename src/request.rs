//! Latency probe: one `GET /generate_204` through a dialer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::common::{Address, ConnType, Metadata, Network, retry_with_backoff};
use crate::error::{Error, Result};
use crate::proxy::{Dialer, Registry};

pub const REMOTE_HOST: &str = "clients3.google.com";
pub const GENERATE_204: &str = "http://clients3.google.com/generate_204";
pub const TCP_TIMEOUT: Duration = Duration::from_millis(2200);

const HTTP_REQUEST: &[u8] = b"GET /generate_204 HTTP/1.1\r\nHost: clients3.google.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
Chrome/85.0.4183.121 Safari/537.36\r\n\r\n";

const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct PingOption {
    pub attempts: usize,
    pub timeout: Duration,
}

impl Default for PingOption {
    fn default() -> Self {
        PingOption {
            attempts: 2,
            timeout: TCP_TIMEOUT,
        }
    }
}

/// Checks the status line. Only 200 and 204 count as success.
pub fn parse_first_line(buf: &[u8]) -> Result<u16> {
    let end = buf
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::Protocol("need more data: cannot find trailing lf".into()))?;
    let line = String::from_utf8_lossy(&buf[..end]);
    let line = line.trim_end_matches('\r');
    let code = line
        .split_once(' ')
        .map(|(_, rest)| rest.split(' ').next().unwrap_or(""))
        .ok_or_else(|| Error::Protocol(format!("cannot find whitespace in {:?}", line)))?;
    let code: u16 = code
        .parse()
        .map_err(|_| Error::Protocol(format!("cannot parse status code in {:?}", line)))?;
    match code {
        200 | 204 => Ok(code),
        _ => Err(Error::Protocol("Wrong Status Code".into())),
    }
}

/// Round-trip time in milliseconds of one probe through `dialer`.
pub async fn ping(dialer: &dyn Dialer, timeout: Duration) -> Result<i64> {
    let probe = async {
        let metadata = Metadata::new(Address::parse(Network::Tcp, REMOTE_HOST, 80)?, ConnType::Test)
            .with_timeout(timeout);
        let mut conn = dialer.dial(&metadata).await?;
        let start = Instant::now();
        conn.write_all(HTTP_REQUEST).await?;
        conn.flush().await?;
        let mut buf = [0u8; 128];
        let mut n = 0;
        // a proxy may hand the head over in pieces
        while n < buf.len() && !buf[..n].contains(&b'\n') {
            let read = conn.read(&mut buf[n..]).await?;
            if read == 0 {
                break;
            }
            n += read;
        }
        parse_first_line(&buf[..n])?;
        Ok::<_, Error>(start.elapsed().as_millis() as i64)
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("ping via {} timed out", dialer.addr()))),
    }
}

/// Builds the dialer for `link` and pings through it, retrying with
/// exponential backoff. A link that cannot be turned into a dialer fails
/// without retrying.
pub async fn ping_link(registry: &Registry, link: &str, option: PingOption) -> Result<i64> {
    let dialer = registry.create(link)?;
    retry_with_backoff(option.attempts, BACKOFF_BASE, || ping(dialer.as_ref(), option.timeout)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::AnyStream;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};

    /// Sends every dial to a fixed local address.
    struct Loopback(SocketAddr);

    #[async_trait]
    impl Dialer for Loopback {
        fn protocol(&self) -> &'static str {
            "loopback"
        }

        fn addr(&self) -> String {
            self.0.to_string()
        }

        async fn dial(&self, _metadata: &Metadata) -> Result<AnyStream> {
            Ok(Box::new(TcpStream::connect(self.0).await?))
        }
    }

    async fn responder(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = conn.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /generate_204 HTTP/1.1\r\nHost: clients3.google.com"));
            conn.write_all(reply).await.unwrap();
        });
        addr
    }

    #[test]
    fn status_lines() {
        assert_eq!(parse_first_line(b"HTTP/1.1 204 No Content\r\n").unwrap(), 204);
        assert_eq!(parse_first_line(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert!(matches!(
            parse_first_line(b"HTTP/1.1 302 Found\r\n"),
            Err(Error::Protocol(m)) if m == "Wrong Status Code"
        ));
        assert!(parse_first_line(b"HTTP/1.1 204").is_err());
    }

    #[tokio::test]
    async fn ping_succeeds_on_204() {
        let addr = responder(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
        let elapsed = ping(&Loopback(addr), TCP_TIMEOUT).await.unwrap();
        assert!(elapsed >= 0);
    }

    #[tokio::test]
    async fn ping_rejects_other_status() {
        let addr = responder(b"HTTP/1.1 500 Oops\r\n\r\n").await;
        assert!(matches!(
            ping(&Loopback(addr), TCP_TIMEOUT).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn ping_link_fails_fast_on_bad_links() {
        let registry = Registry::with_defaults();
        assert!(matches!(
            ping_link(&registry, "vless://x@h:1", PingOption::default()).await,
            Err(Error::UnknownScheme(_))
        ));
    }
}
