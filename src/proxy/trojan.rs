use std::io;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

use crate::common::{Address, Metadata, Network};
use crate::error::{Error, Result};
use crate::proxy::outbound::{AnyStream, Dialer, PacketConn, connect_tcp, host_port};
use crate::proxy::tls::{self, TlsSessionCache};
use crate::proxy::ws_wrapper::WsStreamWrapper;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Default)]
pub struct TrojanOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
    pub udp: bool,
    /// `""` for raw TLS, `"ws"` for websocket over TLS.
    pub network: String,
    pub ws_path: String,
    pub ws_headers: Vec<(String, String)>,
}

pub struct TrojanDialer {
    option: TrojanOption,
    connector: TlsConnector,
    hex_password: String,
}

impl TrojanDialer {
    pub fn new(option: TrojanOption, sessions: &TlsSessionCache) -> Result<Self> {
        if option.password.is_empty() {
            return Err(Error::Config(format!(
                "trojan {}: empty password",
                host_port(&option.server, option.port)
            )));
        }
        let connector = match option.network.as_str() {
            "" | "tcp" => sessions.connector(option.skip_cert_verify, &["h2", "http/1.1"]),
            "ws" => sessions.connector(option.skip_cert_verify, &["http/1.1"]),
            other => {
                return Err(Error::Config(format!("trojan network {} not supported", other)));
            }
        };
        let hex_password = hex::encode(Sha224::digest(option.password.as_bytes()));
        Ok(TrojanDialer {
            option,
            connector,
            hex_password,
        })
    }

    fn sni(&self) -> &str {
        self.option.sni.as_deref().unwrap_or(&self.option.server)
    }

    async fn connect(&self, metadata: &Metadata) -> io::Result<AnyStream> {
        let stream = connect_tcp(&self.option.server, self.option.port, metadata.timeout).await?;
        let tls_stream = tls::handshake(&self.connector, self.sni(), stream).await?;
        log::debug!("[Trojan] TLS handshake with {} successful", self.addr());
        if self.option.network != "ws" {
            return Ok(Box::new(tls_stream));
        }
        let host = self
            .option
            .ws_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.sni().to_string());
        let ws = WsStreamWrapper::connect(
            tls_stream,
            &host,
            &self.option.ws_path,
            &self.option.ws_headers,
            true,
        )
        .await?;
        Ok(Box::new(ws))
    }

    /// `hex(sha224(password)) CRLF cmd addr CRLF`
    pub fn header(&self, command: u8, address: &Address) -> BytesMut {
        let mut buf = BytesMut::with_capacity(56 + 4 + address.socks_len() + 2);
        buf.put_slice(self.hex_password.as_bytes());
        buf.put_slice(CRLF);
        buf.put_u8(command);
        address.write_socks(&mut buf);
        buf.put_slice(CRLF);
        buf
    }

    async fn dial_stream(&self, metadata: &Metadata, command: u8) -> io::Result<AnyStream> {
        let mut stream = self.connect(metadata).await?;
        stream
            .write_all(&self.header(command, &metadata.address))
            .await?;
        stream.flush().await?;
        log::debug!(
            "[Trojan] {} -> {} via {}",
            metadata.conn_type,
            metadata.remote_address(),
            self.addr()
        );
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TrojanDialer {
    fn protocol(&self) -> &'static str {
        "trojan"
    }

    fn addr(&self) -> String {
        host_port(&self.option.server, self.option.port)
    }

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream> {
        self.dial_stream(metadata, CMD_CONNECT)
            .await
            .map_err(|e| Error::dial(self.addr(), e))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        let stream = self
            .dial_stream(metadata, CMD_UDP_ASSOCIATE)
            .await
            .map_err(|e| Error::dial(self.addr(), e))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Box::new(TrojanPacketConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }))
    }
}

fn encode_packet(buf: &[u8], target: &Address) -> io::Result<BytesMut> {
    let len = u16::try_from(buf.len()).map_err(|_| {
        io::Error::from(Error::Protocol(format!(
            "trojan: udp payload of {} bytes exceeds 65535",
            buf.len()
        )))
    })?;
    let mut packet = BytesMut::with_capacity(target.socks_len() + 4 + buf.len());
    target.write_socks(&mut packet);
    packet.put_u16(len);
    packet.put_slice(CRLF);
    packet.put_slice(buf);
    Ok(packet)
}

/// UDP over the trojan stream: `addr len(be16) CRLF payload` per packet.
pub struct TrojanPacketConn {
    reader: Mutex<ReadHalf<AnyStream>>,
    writer: Mutex<WriteHalf<AnyStream>>,
}

#[async_trait]
impl PacketConn for TrojanPacketConn {
    async fn write_to(&self, buf: &[u8], target: &Address) -> io::Result<usize> {
        let packet = encode_packet(buf, target)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let mut reader = self.reader.lock().await;
        let addr = Address::read_socks(&mut *reader, Network::Udp)
            .await
            .map_err(io::Error::from)?;
        let len = reader.read_u16().await? as usize;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnType;

    fn option() -> TrojanOption {
        TrojanOption {
            server: "example.com".into(),
            port: 443,
            password: "password".into(),
            ..Default::default()
        }
    }

    #[test]
    fn header_layout() {
        let dialer = TrojanDialer::new(option(), &TlsSessionCache::default()).unwrap();
        let addr = Address::parse(Network::Tcp, "1.2.3.4", 80).unwrap();
        let header = dialer.header(CMD_CONNECT, &addr);
        let hex = hex::encode(Sha224::digest(b"password"));
        assert_eq!(&header[..56], hex.as_bytes());
        assert_eq!(&header[56..58], b"\r\n");
        assert_eq!(header[58], 1);
        assert_eq!(&header[59..66], &[1, 1, 2, 3, 4, 0, 80]);
        assert_eq!(&header[66..], b"\r\n");
    }

    #[tokio::test]
    async fn oversize_udp_payload_is_refused() {
        let (near, mut far) = tokio::io::duplex(1 << 17);
        let stream: AnyStream = Box::new(near);
        let (reader, writer) = tokio::io::split(stream);
        let conn = TrojanPacketConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        };
        let target = Address::parse(Network::Udp, "1.2.3.4", 53).unwrap();

        assert!(conn.write_to(&vec![0u8; 70_000], &target).await.is_err());
        assert_eq!(conn.write_to(b"dns", &target).await.unwrap(), 3);
        let mut frame = [0u8; 12];
        far.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, &[1, 1, 2, 3, 4, 0, 53, 0, 3, b'\r', b'\n', b'd']);
    }

    #[test]
    fn unsupported_network_is_config_error() {
        let mut opt = option();
        opt.network = "grpc".into();
        assert!(matches!(
            TrojanDialer::new(opt, &TlsSessionCache::default()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn closed_port_is_dial_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut opt = option();
        opt.server = "127.0.0.1".into();
        opt.port = port;
        let dialer = TrojanDialer::new(opt, &TlsSessionCache::default()).unwrap();
        let target = Address::parse(Network::Tcp, "example.com", 80).unwrap();
        let err = dialer
            .dial(&Metadata::new(target, ConnType::Test))
            .await
            .err()
            .unwrap();
        match err {
            Error::Dial { addr, .. } => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
