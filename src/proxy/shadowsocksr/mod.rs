pub mod obfs;
pub mod protocol;

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::common::Metadata;
use crate::common::codec::{Codec, CodecStream};
use crate::common::crypto::random_fill;
use crate::error::{Error, Result};
use crate::proxy::outbound::{AnyStream, Dialer, connect_tcp, host_port};
use crate::proxy::shadowsocks::stream::StreamCodec;
use crate::proxy::shadowsocks::{Cipher, CipherKind};

use obfs::{ObfsBase, ObfsKind, PassThrough};
use protocol::{AuthData, ProtocolBase, ProtocolKind};

#[derive(Debug, Clone, Default)]
pub struct ShadowsocksROption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub cipher: String,
    pub obfs: String,
    pub obfs_param: String,
    pub protocol: String,
    pub protocol_param: String,
}

pub struct ShadowsocksRDialer {
    option: ShadowsocksROption,
    cipher: Cipher,
    obfs: ObfsKind,
    obfs_base: ObfsBase,
    protocol: ProtocolKind,
    client_id: [u8; 32],
    auth: Arc<Mutex<AuthData>>,
}

impl ShadowsocksRDialer {
    pub fn new(option: ShadowsocksROption) -> Result<Self> {
        let addr = host_port(&option.server, option.port);
        let method = if option.cipher == "none" { "dummy" } else { option.cipher.as_str() };
        let cipher = Cipher::new(method, &option.password)
            .map_err(|e| Error::Config(format!("ssr {} initialize error: {}", addr, e)))?;
        if let CipherKind::Aead(_) = cipher.kind() {
            return Err(Error::Config(format!(
                "{} is not dummy or a supported stream cipher in ssr",
                option.cipher
            )));
        }
        let obfs = ObfsKind::from_name(&option.obfs)?;
        let protocol = ProtocolKind::from_name(&option.protocol)?;
        let obfs_base = ObfsBase {
            host: option.server.clone(),
            port: option.port,
            key: cipher.key().to_vec(),
            iv_size: cipher.iv_size(),
            param: option.obfs_param.clone(),
        };
        let mut client_id = [0u8; 32];
        random_fill(&mut client_id);
        Ok(ShadowsocksRDialer {
            option,
            cipher,
            obfs,
            obfs_base,
            protocol,
            client_id,
            auth: Arc::new(Mutex::new(AuthData::default())),
        })
    }

    /// Stages for one connection, outermost (wire side) first.
    fn pipeline(&self) -> io::Result<SsrPipeline> {
        let obfs = self.obfs.build(&self.obfs_base, self.client_id);
        let (cipher, iv): (Box<dyn Codec>, Vec<u8>) = match self.cipher.kind() {
            CipherKind::Stream(kind) => {
                let codec = StreamCodec::new(kind, self.cipher.key().to_vec())?;
                let iv = codec.write_iv().to_vec();
                (Box::new(codec), iv)
            }
            _ => (Box::new(PassThrough), Vec::new()),
        };
        let protocol = self.protocol.build(
            ProtocolBase {
                key: self.cipher.key().to_vec(),
                iv,
                overhead: self.obfs.overhead(),
                param: self.option.protocol_param.clone(),
            },
            &self.auth,
        )?;
        Ok(SsrPipeline {
            obfs,
            cipher,
            protocol,
            obfs_out: BytesMut::new(),
            cipher_out: BytesMut::new(),
        })
    }

    async fn dial_stream(&self, metadata: &Metadata) -> io::Result<AnyStream> {
        let stream = connect_tcp(&self.option.server, self.option.port, metadata.timeout).await?;
        let mut conn = CodecStream::new(stream, self.pipeline()?);
        conn.write_all(&metadata.encode_for_socks()).await?;
        conn.flush().await?;
        log::debug!(
            "[ShadowsocksR] {} -> {} via {}",
            metadata.conn_type,
            metadata.remote_address(),
            self.addr()
        );
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Dialer for ShadowsocksRDialer {
    fn protocol(&self) -> &'static str {
        "ssr"
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

/// obfs <- cipher <- protocol on write, the reverse on read.
pub struct SsrPipeline {
    obfs: Box<dyn Codec>,
    cipher: Box<dyn Codec>,
    protocol: Box<dyn Codec>,
    obfs_out: BytesMut,
    cipher_out: BytesMut,
}

impl Codec for SsrPipeline {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let mut packed = BytesMut::with_capacity(src.len() + 64);
        self.protocol.encode(src, &mut packed)?;
        let mut encrypted = BytesMut::with_capacity(packed.len() + 32);
        self.cipher.encode(&packed, &mut encrypted)?;
        self.obfs.encode(&encrypted, dst)
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        self.obfs.decode(src, &mut self.obfs_out)?;
        self.cipher.decode(&mut self.obfs_out, &mut self.cipher_out)?;
        self.protocol.decode(&mut self.cipher_out, dst)
    }

    fn take_reply(&mut self, dst: &mut BytesMut) {
        self.obfs.take_reply(dst);
    }
}
