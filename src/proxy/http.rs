use std::io;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;

use crate::common::rewind::RewindStream;
use crate::common::{Metadata, encode_b64, find_bytes};
use crate::error::{Error, Result, invalid_data};
use crate::proxy::outbound::{AnyStream, Dialer, connect_tcp, host_port};
use crate::proxy::tls::{self, TlsSessionCache};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Default)]
pub struct HttpOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
}

/// Upstream HTTP proxy reached with `CONNECT`.
pub struct HttpDialer {
    option: HttpOption,
    connector: Option<TlsConnector>,
}

impl HttpDialer {
    pub fn new(option: HttpOption, sessions: &TlsSessionCache) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config("http: empty server".into()));
        }
        let connector = option
            .tls
            .then(|| sessions.connector(option.skip_cert_verify, &["http/1.1"]));
        Ok(HttpDialer { option, connector })
    }

    fn sni(&self) -> &str {
        self.option
            .sni
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.option.server)
    }

    pub fn connect_request(&self, metadata: &Metadata) -> String {
        let target = metadata.remote_address();
        let mut req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if !self.option.username.is_empty() || !self.option.password.is_empty() {
            let token = encode_b64(
                format!("{}:{}", self.option.username, self.option.password).as_bytes(),
            );
            req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        req.push_str("\r\n");
        req
    }

    async fn dial_stream(&self, metadata: &Metadata) -> io::Result<AnyStream> {
        let tcp = connect_tcp(&self.option.server, self.option.port, metadata.timeout).await?;
        let mut stream: AnyStream = match &self.connector {
            Some(connector) => Box::new(tls::handshake(connector, self.sni(), tcp).await?),
            None => Box::new(tcp),
        };
        stream
            .write_all(self.connect_request(metadata).as_bytes())
            .await?;
        stream.flush().await?;

        let mut stream = RewindStream::new(stream);
        let head_len = loop {
            if let Some(idx) = find_bytes(stream.buffered(), b"\r\n\r\n") {
                break idx + 4;
            }
            if stream.buffered().len() > MAX_RESPONSE_HEAD {
                return Err(invalid_data("http: response head too large"));
            }
            if stream.fill_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "http: proxy closed before responding",
                ));
            }
        };
        let status = parse_status(&stream.buffered()[..head_len])?;
        if status != 200 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("http: proxy answered {}", status),
            ));
        }
        stream.consume(head_len);
        log::debug!(
            "[Http] {} -> {} via {}",
            metadata.conn_type,
            metadata.remote_address(),
            self.addr()
        );
        Ok(Box::new(stream))
    }
}

fn parse_status(head: &[u8]) -> io::Result<u16> {
    let line = head
        .split(|b| *b == b'\n')
        .next()
        .ok_or_else(|| invalid_data("http: empty response"))?;
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| invalid_data(format!("http: bad status line {:?}", line.trim()))),
        _ => Err(invalid_data(format!("http: bad status line {:?}", line.trim()))),
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn addr(&self) -> String {
        host_port(&self.option.server, self.option.port)
    }

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream> {
        self.dial_stream(metadata)
            .await
            .map_err(|e| Error::dial(self.addr(), e))
    }
}
