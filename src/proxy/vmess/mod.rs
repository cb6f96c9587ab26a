mod conn;
mod kdf;

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use uuid::Uuid;

use crate::common::codec::CodecStream;
use crate::common::{Address, Metadata};
use crate::error::{Error, Result};
use crate::proxy::outbound::{AnyStream, Dialer, PacketConn, connect_tcp, host_port};
use crate::proxy::tls::{self, TlsSessionCache};
use crate::proxy::ws_wrapper::WsStreamWrapper;

pub use conn::{CMD_TCP, CMD_UDP, HttpHeaderCodec, Security, VmessCodec, cmd_key};

#[derive(Debug, Clone, Default)]
pub struct VmessOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub alter_id: u16,
    /// Body security: `auto`, `aes-128-gcm`, `chacha20-poly1305` or `none`.
    pub cipher: String,
    pub tls: bool,
    pub udp: bool,
    /// `tcp` (or empty), `ws`, `http`.
    pub network: String,
    pub skip_cert_verify: bool,
    pub server_name: Option<String>,
    pub ws_path: String,
    pub ws_headers: Vec<(String, String)>,
    pub http_method: String,
    pub http_path: String,
    pub http_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    Ws,
    Http,
}

pub struct VmessDialer {
    option: VmessOption,
    uuid: Uuid,
    security: Security,
    transport: Transport,
    connector: Option<TlsConnector>,
}

impl VmessDialer {
    pub fn new(option: VmessOption, sessions: &TlsSessionCache) -> Result<Self> {
        let addr = host_port(&option.server, option.port);
        let uuid = Uuid::parse_str(&option.uuid)
            .map_err(|e| Error::Config(format!("vmess {}: invalid uuid: {}", addr, e)))?;
        let security = Security::from_name(&option.cipher).ok_or_else(|| {
            Error::Config(format!("vmess {}: unknown security {}", addr, option.cipher))
        })?;
        let transport = match option.network.as_str() {
            "" | "tcp" => Transport::Tcp,
            "ws" => Transport::Ws,
            "http" => Transport::Http,
            other => {
                return Err(Error::Config(format!(
                    "vmess {}: network {} not supported",
                    addr, other
                )));
            }
        };
        let connector = option
            .tls
            .then(|| sessions.connector(option.skip_cert_verify, &["http/1.1"]));
        Ok(VmessDialer {
            option,
            uuid,
            security,
            transport,
            connector,
        })
    }

    fn sni(&self) -> &str {
        self.option
            .server_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.option.server)
    }

    fn header_host<'a>(&'a self, headers: &'a [(String, String)]) -> &'a str {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| self.sni())
    }

    /// TCP, then TLS when enabled, then the ws/http transport.
    async fn transport(&self, metadata: &Metadata) -> io::Result<AnyStream> {
        let tcp = connect_tcp(&self.option.server, self.option.port, metadata.timeout).await?;
        let stream: AnyStream = match &self.connector {
            Some(connector) => Box::new(tls::handshake(connector, self.sni(), tcp).await?),
            None => Box::new(tcp),
        };
        Ok(match self.transport {
            Transport::Tcp => stream,
            Transport::Ws => {
                let host = self.header_host(&self.option.ws_headers);
                Box::new(
                    WsStreamWrapper::connect(
                        stream,
                        host,
                        &self.option.ws_path,
                        &self.option.ws_headers,
                        self.option.tls,
                    )
                    .await?,
                )
            }
            Transport::Http => {
                let codec = HttpHeaderCodec::new(
                    &self.option.http_method,
                    &self.option.server,
                    &self.option.http_path,
                    &self.option.http_headers,
                );
                Box::new(CodecStream::new(stream, codec))
            }
        })
    }

    async fn dial_stream(&self, metadata: &Metadata, command: u8) -> io::Result<AnyStream> {
        let mut stream = self.transport(metadata).await?;
        let mut codec = VmessCodec::new(
            &self.uuid,
            self.option.alter_id,
            self.security,
            command,
            &metadata.address,
        )?;
        // flushed at dial time for server-first protocols
        if let Some(header) = codec.take_header() {
            stream.write_all(&header).await?;
            stream.flush().await?;
        }
        log::debug!(
            "[Vmess] {} -> {} via {} ({})",
            metadata.conn_type,
            metadata.remote_address(),
            self.addr(),
            if self.option.alter_id == 0 { "aead" } else { "legacy" }
        );
        Ok(Box::new(CodecStream::new(stream, codec)))
    }
}

#[async_trait]
impl Dialer for VmessDialer {
    fn protocol(&self) -> &'static str {
        "vmess"
    }

    fn addr(&self) -> String {
        host_port(&self.option.server, self.option.port)
    }

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream> {
        self.dial_stream(metadata, CMD_TCP)
            .await
            .map_err(|e| Error::dial(self.addr(), e))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        let stream = self
            .dial_stream(metadata, CMD_UDP)
            .await
            .map_err(|e| Error::dial(self.addr(), e))?;
        Ok(Box::new(VmessPacketConn {
            stream: Mutex::new(stream),
            remote: metadata.address.clone(),
        }))
    }
}

/// Stream-oriented udp: every datagram goes to the address fixed at dial time.
pub struct VmessPacketConn {
    stream: Mutex<AnyStream>,
    remote: Address,
}

#[async_trait]
impl PacketConn for VmessPacketConn {
    async fn write_to(&self, buf: &[u8], _target: &Address) -> io::Result<usize> {
        let mut stream = self.stream.lock().await;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(buf.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let n = self.stream.lock().await.read(buf).await?;
        Ok((n, self.remote.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option() -> VmessOption {
        VmessOption {
            server: "example.com".into(),
            port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            cipher: "auto".into(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_bad_descriptors() {
        let sessions = TlsSessionCache::default();
        let mut opt = option();
        opt.uuid = "not-a-uuid".into();
        assert!(matches!(VmessDialer::new(opt, &sessions), Err(Error::Config(_))));

        let mut opt = option();
        opt.network = "grpc".into();
        assert!(matches!(VmessDialer::new(opt, &sessions), Err(Error::Config(_))));

        let mut opt = option();
        opt.cipher = "rc4".into();
        assert!(matches!(VmessDialer::new(opt, &sessions), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn request_header_is_sent_on_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            conn.read(&mut buf).await.unwrap()
        });

        let mut opt = option();
        opt.server = "127.0.0.1".into();
        opt.port = port;
        let dialer = VmessDialer::new(opt, &TlsSessionCache::default()).unwrap();
        let target = Address::parse(crate::common::Network::Tcp, "example.com", 80).unwrap();
        let _stream = dialer
            .dial(&Metadata::new(target, crate::common::ConnType::Tcp))
            .await
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        // auth id alone is 16 bytes
        assert!(received > 16);
    }

    #[test]
    fn sni_prefers_server_name() {
        let sessions = TlsSessionCache::default();
        let mut opt = option();
        opt.tls = true;
        opt.server_name = Some("cdn.example.org".into());
        let dialer = VmessDialer::new(opt, &sessions).unwrap();
        assert_eq!(dialer.sni(), "cdn.example.org");
        assert_eq!(dialer.addr(), "example.com:443");
        assert_eq!(dialer.protocol(), "vmess");
    }
}
