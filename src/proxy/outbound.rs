use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::common::{Address, Metadata};
use crate::error::{Error, Result};

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

pub type AnyStream = Box<dyn AsyncStream>;

/// Datagram side of a dialer. Every packet carries its own target.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn write_to(&self, buf: &[u8], target: &Address) -> io::Result<usize>;

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Protocol name, e.g. `"trojan"`.
    fn protocol(&self) -> &'static str;

    /// `server:port` of the upstream, used in diagnostics.
    fn addr(&self) -> String;

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream>;

    async fn dial_udp(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        Err(Error::dial(
            self.addr(),
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} does not support udp", self.protocol()),
            ),
        ))
    }
}

/// Raw TCP connect bounded by the metadata deadline.
pub async fn connect_tcp(server: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let timeout = timeout.unwrap_or(DEFAULT_TCP_TIMEOUT);
    let stream = tokio::time::timeout(timeout, TcpStream::connect((server, port)))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect {}:{} timed out after {:?}", server, port, timeout),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub(crate) fn host_port(server: &str, port: u16) -> String {
    if server.contains(':') {
        format!("[{}]:{}", server, port)
    } else {
        format!("{}:{}", server, port)
    }
}
