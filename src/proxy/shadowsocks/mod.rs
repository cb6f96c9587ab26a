mod aead;
pub mod cipher;
pub mod stream;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

use crate::common::codec::CodecStream;
use crate::common::{Address, Metadata, Network};
use crate::error::{Error, Result, invalid_data};
use crate::proxy::outbound::{AnyStream, Dialer, PacketConn, connect_tcp, host_port};

pub use aead::{AeadCodec, MAX_PAYLOAD};
pub use cipher::{Cipher, CipherKind};

#[derive(Debug, Clone, Default)]
pub struct ShadowsocksOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub cipher: String,
    pub udp: bool,
}

pub struct ShadowsocksDialer {
    option: ShadowsocksOption,
    cipher: Cipher,
}

impl ShadowsocksDialer {
    pub fn new(option: ShadowsocksOption) -> Result<Self> {
        let addr = host_port(&option.server, option.port);
        let cipher = Cipher::new(&option.cipher, &option.password)
            .map_err(|e| Error::Config(format!("ss {} initialize error: {}", addr, e)))?;
        if cipher.kind() == CipherKind::Dummy {
            return Err(Error::Config(format!("ss {}: cipher none is ssr only", addr)));
        }
        Ok(ShadowsocksDialer { option, cipher })
    }

    async fn dial_stream(&self, metadata: &Metadata) -> io::Result<AnyStream> {
        let stream = connect_tcp(&self.option.server, self.option.port, metadata.timeout).await?;
        let mut conn = CodecStream::new(stream, self.cipher.stream_codec()?);
        conn.write_all(&metadata.encode_for_socks()).await?;
        conn.flush().await?;
        log::debug!(
            "[Shadowsocks] {} -> {} via {}",
            metadata.conn_type,
            metadata.remote_address(),
            self.addr()
        );
        Ok(Box::new(conn))
    }

    async fn dial_packet(&self) -> io::Result<SsPacketConn> {
        let server = tokio::net::lookup_host((self.option.server.as_str(), self.option.port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for server"))?;
        let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        Ok(SsPacketConn {
            socket,
            server,
            cipher: self.cipher.clone(),
        })
    }
}

#[async_trait]
impl Dialer for ShadowsocksDialer {
    fn protocol(&self) -> &'static str {
        "ss"
    }

    fn addr(&self) -> String {
        host_port(&self.option.server, self.option.port)
    }

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream> {
        self.dial_stream(metadata)
            .await
            .map_err(|e| Error::dial(self.addr(), e))
    }

    async fn dial_udp(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        if !self.option.udp {
            return Err(Error::dial(
                self.addr(),
                io::Error::new(io::ErrorKind::Unsupported, "udp disabled for this server"),
            ));
        }
        let pc = self
            .dial_packet()
            .await
            .map_err(|e| Error::dial(self.addr(), e))?;
        Ok(Box::new(pc))
    }
}

/// One encrypted `[address][payload]` per datagram.
pub struct SsPacketConn {
    socket: UdpSocket,
    server: SocketAddr,
    cipher: Cipher,
}

#[async_trait]
impl PacketConn for SsPacketConn {
    async fn write_to(&self, buf: &[u8], target: &Address) -> io::Result<usize> {
        let mut plain = target.socks_bytes();
        plain.extend_from_slice(buf);
        let packet = self.cipher.encrypt_packet(&plain)?;
        self.socket.send_to(&packet, self.server).await?;
        Ok(buf.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let mut packet = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = self.socket.recv_from(&mut packet).await?;
            if from != self.server {
                log::debug!("[Shadowsocks] dropped udp packet from {}", from);
                continue;
            }
            let plain = self.cipher.decrypt_packet(&packet[..n])?;
            let (addr, offset) = Address::decode_socks(&plain, Network::Udp)
                .map_err(|e| invalid_data(e.to_string()))?;
            let payload = &plain[offset..];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, addr));
        }
    }
}
