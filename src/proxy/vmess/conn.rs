use std::io;

use aes::Aes128;
use bytes::{Buf, BufMut, BytesMut};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::cipher::KeyIvInit;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::kdf;
use crate::common::codec::Codec;
use crate::common::crypto::{hmac_md5, md5, random_fill};
use crate::common::{Address, Host};
use crate::error::invalid_data;
use crate::proxy::shadowsocks::cipher::{AeadCipher, AeadKind, TAG_SIZE};

pub const VERSION: u8 = 1;
pub const OPTION_CHUNK_STREAM: u8 = 0x01;
pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

const CMD_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const MAX_CHUNK_SIZE: usize = 16 * 1024;
pub const MAX_PAYLOAD: usize = MAX_CHUNK_SIZE - TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Aes128Gcm,
    Chacha20Poly1305,
    None,
}

impl Security {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "auto" | "aes-128-gcm" => Some(Security::Aes128Gcm),
            "chacha20-poly1305" => Some(Security::Chacha20Poly1305),
            "none" => Some(Security::None),
            _ => None,
        }
    }

    fn byte(self) -> u8 {
        match self {
            Security::Aes128Gcm => 0x03,
            Security::Chacha20Poly1305 => 0x04,
            Security::None => 0x05,
        }
    }
}

pub fn cmd_key(uuid: &Uuid) -> [u8; 16] {
    let mut buf = uuid.as_bytes().to_vec();
    buf.extend_from_slice(CMD_KEY_SALT);
    md5(&buf)
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in data {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Plain request header. Encrypted by the caller with either header scheme.
pub fn request_header(
    req_iv: &[u8; 16],
    req_key: &[u8; 16],
    resp_v: u8,
    security: Security,
    command: u8,
    address: &Address,
) -> Vec<u8> {
    let padding = rand::thread_rng().gen_range(0..16u8);
    let mut buf = BytesMut::with_capacity(64 + address.socks_len());
    buf.put_u8(VERSION);
    buf.put_slice(req_iv);
    buf.put_slice(req_key);
    buf.put_u8(resp_v);
    buf.put_u8(OPTION_CHUNK_STREAM);
    buf.put_u8((padding << 4) | security.byte());
    buf.put_u8(0);
    buf.put_u8(command);
    buf.put_u16(address.port);
    match &address.host {
        Host::Ipv4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Host::Domain(d) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(d.len() as u8);
            buf.put_slice(d.as_bytes());
        }
        Host::Ipv6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    let mut pad = vec![0u8; padding as usize];
    random_fill(&mut pad);
    buf.put_slice(&pad);
    let checksum = fnv1a(&buf);
    buf.put_u32(checksum);
    buf.to_vec()
}

fn body_cipher(security: Security, key: &[u8; 16]) -> io::Result<Option<AeadCipher>> {
    match security {
        Security::Aes128Gcm => AeadCipher::new(AeadKind::Aes128Gcm, key).map(Some),
        Security::Chacha20Poly1305 => {
            let first = md5(key);
            let mut full = first.to_vec();
            full.extend_from_slice(&md5(&first));
            AeadCipher::new(AeadKind::Chacha20Poly1305, &full).map(Some)
        }
        Security::None => Ok(None),
    }
}

/// One direction of the chunk stream: `len(be16) | sealed payload`.
struct ChunkCipher {
    aead: Option<AeadCipher>,
    iv: [u8; 16],
    count: u16,
}

impl ChunkCipher {
    fn new(security: Security, key: &[u8; 16], iv: &[u8; 16]) -> io::Result<Self> {
        Ok(ChunkCipher {
            aead: body_cipher(security, key)?,
            iv: *iv,
            count: 0,
        })
    }

    fn seal(&mut self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let sealed = match &self.aead {
            Some(aead) => aead.seal(&chunk_nonce(&mut self.count, &self.iv), payload)?,
            None => payload.to_vec(),
        };
        dst.put_u16(sealed.len() as u16);
        dst.put_slice(&sealed);
        Ok(())
    }

    fn open(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match &self.aead {
            Some(aead) => aead.open(&chunk_nonce(&mut self.count, &self.iv), chunk),
            None => Ok(chunk.to_vec()),
        }
    }
}

/// `count(be16) | iv[2..12]`
fn chunk_nonce(count: &mut u16, iv: &[u8; 16]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..2].copy_from_slice(&count.to_be_bytes());
    nonce[2..].copy_from_slice(&iv[2..12]);
    *count = count.wrapping_add(1);
    nonce
}

enum Response {
    AeadLength,
    AeadHeader(usize),
    Legacy(BufDecryptor<Aes128>),
    LegacyCommand(BufDecryptor<Aes128>, usize),
    Body,
    Closed,
}

/// Client side of a vmess connection.
///
/// The sealed request header goes out with the first write unless the
/// caller sends it earlier through [`take_header`](Self::take_header). The response
/// header is checked before any body chunk is handed to the reader.
pub struct VmessCodec {
    header: Option<Vec<u8>>,
    writer: ChunkCipher,
    reader: ChunkCipher,
    response: Response,
    resp_key: [u8; 16],
    resp_iv: [u8; 16],
    resp_v: u8,
    chunk_len: Option<usize>,
}

impl VmessCodec {
    pub fn new(
        uuid: &Uuid,
        alter_id: u16,
        security: Security,
        command: u8,
        address: &Address,
    ) -> io::Result<Self> {
        let mut req_key = [0u8; 16];
        let mut req_iv = [0u8; 16];
        random_fill(&mut req_key);
        random_fill(&mut req_iv);
        let resp_v: u8 = rand::thread_rng().r#gen();
        let plain = request_header(&req_iv, &req_key, resp_v, security, command, address);
        let cmd_key = cmd_key(uuid);
        let now = chrono::Utc::now().timestamp();

        let (header, resp_key, resp_iv, response) = if alter_id == 0 {
            let header = kdf::seal_header(&cmd_key, &plain, now)?;
            let resp_key = first16(&Sha256::digest(req_key));
            let resp_iv = first16(&Sha256::digest(req_iv));
            (header, resp_key, resp_iv, Response::AeadLength)
        } else {
            let ts = (now + rand::thread_rng().gen_range(-30..=30)) as u64;
            let header = seal_legacy_header(uuid, &cmd_key, &plain, ts)?;
            let resp_key = md5(&req_key);
            let resp_iv = md5(&req_iv);
            let decryptor = BufDecryptor::<Aes128>::new_from_slices(&resp_key, &resp_iv)
                .map_err(|_| invalid_data("vmess: bad response key"))?;
            (header, resp_key, resp_iv, Response::Legacy(decryptor))
        };

        Ok(VmessCodec {
            header: Some(header),
            writer: ChunkCipher::new(security, &req_key, &req_iv)?,
            reader: ChunkCipher::new(security, &resp_key, &resp_iv)?,
            response,
            resp_key,
            resp_iv,
            resp_v,
            chunk_len: None,
        })
    }

    /// Hands out the sealed request header once; later writes carry body chunks only.
    pub fn take_header(&mut self) -> Option<Vec<u8>> {
        self.header.take()
    }

    fn check_response(&self, header: &[u8]) -> io::Result<()> {
        if header.first() != Some(&self.resp_v) {
            return Err(invalid_data("vmess: unexpected response header"));
        }
        if header.get(2) != Some(&0) {
            return Err(invalid_data("vmess: dynamic port is not supported"));
        }
        Ok(())
    }

    fn decode_body(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        loop {
            let len = match self.chunk_len {
                Some(len) => len,
                None => {
                    if src.len() < 2 {
                        return Ok(());
                    }
                    let len = src.get_u16() as usize;
                    self.chunk_len = Some(len);
                    len
                }
            };
            if src.len() < len {
                return Ok(());
            }
            let chunk = src.split_to(len);
            self.chunk_len = None;
            let payload = self.reader.open(&chunk)?;
            if payload.is_empty() {
                log::debug!("[Vmess] remote closed the chunk stream");
                self.response = Response::Closed;
                src.clear();
                return Ok(());
            }
            dst.extend_from_slice(&payload);
        }
    }
}

fn first16(digest: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// `hmac_md5(uuid, ts) | aes-128-cfb(cmd_key, md5(ts x4), header)`
fn seal_legacy_header(uuid: &Uuid, cmd_key: &[u8; 16], plain: &[u8], ts: u64) -> io::Result<Vec<u8>> {
    let ts_bytes = ts.to_be_bytes();
    let mut out = hmac_md5(uuid.as_bytes(), &ts_bytes).to_vec();
    let iv = md5(&ts_bytes.repeat(4));
    let mut body = plain.to_vec();
    BufEncryptor::<Aes128>::new_from_slices(cmd_key, &iv)
        .map_err(|_| invalid_data("vmess: bad command key"))?
        .encrypt(&mut body);
    out.extend_from_slice(&body);
    Ok(out)
}

impl Codec for VmessCodec {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if let Some(header) = self.header.take() {
            dst.extend_from_slice(&header);
        }
        for payload in src.chunks(MAX_PAYLOAD) {
            self.writer.seal(payload, dst)?;
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        loop {
            match std::mem::replace(&mut self.response, Response::Body) {
                Response::AeadLength => {
                    if src.len() < 2 + TAG_SIZE {
                        self.response = Response::AeadLength;
                        return Ok(());
                    }
                    let sealed = src.split_to(2 + TAG_SIZE);
                    let len = kdf::open_response_len(&self.resp_key, &self.resp_iv, &sealed)?;
                    self.response = Response::AeadHeader(len);
                }
                Response::AeadHeader(len) => {
                    if src.len() < len + TAG_SIZE {
                        self.response = Response::AeadHeader(len);
                        return Ok(());
                    }
                    let sealed = src.split_to(len + TAG_SIZE);
                    let header = kdf::open_response_header(&self.resp_key, &self.resp_iv, &sealed)?;
                    self.check_response(&header)?;
                }
                Response::Legacy(mut decryptor) => {
                    if src.len() < 4 {
                        self.response = Response::Legacy(decryptor);
                        return Ok(());
                    }
                    let mut header = src.split_to(4);
                    decryptor.decrypt(&mut header);
                    self.check_response(&header)?;
                    if header[3] > 0 {
                        self.response = Response::LegacyCommand(decryptor, header[3] as usize);
                    }
                }
                Response::LegacyCommand(mut decryptor, len) => {
                    if src.len() < len {
                        self.response = Response::LegacyCommand(decryptor, len);
                        return Ok(());
                    }
                    let mut command = src.split_to(len);
                    decryptor.decrypt(&mut command);
                }
                Response::Body => return self.decode_body(src, dst),
                Response::Closed => {
                    self.response = Response::Closed;
                    src.clear();
                    return Ok(());
                }
            }
        }
    }
}

/// HTTP/1.1 request disguise: the first write carries a request head,
/// the reader drops everything up to the first blank line.
pub struct HttpHeaderCodec {
    head: Option<String>,
    response_done: bool,
}

impl HttpHeaderCodec {
    pub fn new(method: &str, host: &str, path: &str, headers: &[(String, String)]) -> Self {
        let method = if method.is_empty() { "GET" } else { method };
        let path = if path.is_empty() { "/" } else { path };
        let mut head = format!("{} {} HTTP/1.1\r\n", method, path);
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
            head.push_str(&format!("Host: {}\r\n", host));
        }
        for (k, v) in headers {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        HttpHeaderCodec {
            head: Some(head),
            response_done: false,
        }
    }
}

impl Codec for HttpHeaderCodec {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if let Some(head) = self.head.take() {
            dst.put_slice(head.as_bytes());
            dst.put_slice(format!("Content-Length: {}\r\n\r\n", src.len()).as_bytes());
        }
        dst.put_slice(src);
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        if !self.response_done {
            match crate::common::find_bytes(src, b"\r\n\r\n") {
                Some(idx) => {
                    src.advance(idx + 4);
                    self.response_done = true;
                }
                None => return Ok(()),
            }
        }
        dst.extend_from_slice(&src.split());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Network;

    #[test]
    fn cmd_key_vector() {
        let uuid = Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        assert_eq!(hex::encode(cmd_key(&uuid)), "b50d916ac0cec067981af8e5f38a758f");
    }

    #[test]
    fn security_names() {
        assert_eq!(Security::from_name("auto"), Some(Security::Aes128Gcm));
        assert_eq!(Security::from_name("CHACHA20-POLY1305"), Some(Security::Chacha20Poly1305));
        assert_eq!(Security::from_name("none"), Some(Security::None));
        assert_eq!(Security::from_name("aes-128-cfb"), None);
    }

    #[test]
    fn header_layout_and_checksum() {
        let addr = Address::parse(Network::Tcp, "example.com", 443).unwrap();
        let header = request_header(&[1; 16], &[2; 16], 7, Security::Aes128Gcm, CMD_TCP, &addr);
        assert_eq!(header[0], VERSION);
        assert_eq!(&header[1..17], &[1; 16]);
        assert_eq!(&header[17..33], &[2; 16]);
        assert_eq!(header[33], 7);
        assert_eq!(header[34], OPTION_CHUNK_STREAM);
        let padding = (header[35] >> 4) as usize;
        assert_eq!(header[35] & 0x0f, 0x03);
        assert_eq!(header[37], CMD_TCP);
        assert_eq!(&header[38..40], &443u16.to_be_bytes());
        assert_eq!(header[40], ATYP_DOMAIN);
        assert_eq!(header[41], 11);
        assert_eq!(&header[42..53], b"example.com");
        assert_eq!(header.len(), 53 + padding + 4);
        let (body, sum) = header.split_at(header.len() - 4);
        assert_eq!(sum, &fnv1a(body).to_be_bytes());
    }

    struct Server {
        reader: ChunkCipher,
        writer: ChunkCipher,
    }

    #[test]
    fn aead_session_round_trip() {
        let uuid = Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let addr = Address::parse(Network::Tcp, "1.2.3.4", 80).unwrap();
        let mut codec = VmessCodec::new(&uuid, 0, Security::Aes128Gcm, CMD_TCP, &addr).unwrap();
        let mut out = BytesMut::new();
        codec.encode(b"hello", &mut out).unwrap();

        let header = kdf::open_header(&cmd_key(&uuid), &out);
        let mut req_iv = [0u8; 16];
        let mut req_key = [0u8; 16];
        req_iv.copy_from_slice(&header[1..17]);
        req_key.copy_from_slice(&header[17..33]);
        let resp_v = header[33];
        let consumed = 16 + 18 + 8 + header.len() + 16;
        let mut body = out.split_off(consumed);

        let resp_key = first16(&Sha256::digest(req_key));
        let resp_iv = first16(&Sha256::digest(req_iv));
        let mut server = Server {
            reader: ChunkCipher::new(Security::Aes128Gcm, &req_key, &req_iv).unwrap(),
            writer: ChunkCipher::new(Security::Aes128Gcm, &resp_key, &resp_iv).unwrap(),
        };
        let len = body.get_u16() as usize;
        assert_eq!(server.reader.open(&body[..len]).unwrap(), b"hello");

        let mut reply = BytesMut::from(&kdf::seal_response(&resp_key, &resp_iv, &[resp_v, 0, 0, 0])[..]);
        server.writer.seal(b"world", &mut reply).unwrap();
        let mut decoded = BytesMut::new();
        // split across two reads to exercise partial state
        let mut first = reply.split_to(10);
        codec.decode(&mut first, &mut decoded).unwrap();
        assert!(decoded.is_empty());
        first.extend_from_slice(&reply);
        codec.decode(&mut first, &mut decoded).unwrap();
        assert_eq!(&decoded[..], b"world");

        let mut eof = BytesMut::new();
        server.writer.seal(b"", &mut eof).unwrap();
        codec.decode(&mut eof, &mut decoded).unwrap();
        assert!(matches!(codec.response, Response::Closed));
    }

    #[test]
    fn wrong_response_byte_is_rejected() {
        let uuid = Uuid::new_v4();
        let addr = Address::parse(Network::Tcp, "1.2.3.4", 80).unwrap();
        let mut codec = VmessCodec::new(&uuid, 0, Security::None, CMD_TCP, &addr).unwrap();
        let wrong = codec.resp_v.wrapping_add(1);
        let mut reply =
            BytesMut::from(&kdf::seal_response(&codec.resp_key, &codec.resp_iv, &[wrong, 0, 0, 0])[..]);
        assert!(codec.decode(&mut reply, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn legacy_header_decrypts() {
        let uuid = Uuid::new_v4();
        let key = cmd_key(&uuid);
        let sealed = seal_legacy_header(&uuid, &key, b"plain header", 1_633_248_908).unwrap();
        assert_eq!(&sealed[..16], &hmac_md5(uuid.as_bytes(), &1_633_248_908u64.to_be_bytes()));
        let mut body = sealed[16..].to_vec();
        let iv = md5(&1_633_248_908u64.to_be_bytes().repeat(4));
        BufDecryptor::<Aes128>::new_from_slices(&key, &iv)
            .unwrap()
            .decrypt(&mut body);
        assert_eq!(body, b"plain header");
    }

    #[test]
    fn chunks_are_capped() {
        let mut cipher = ChunkCipher::new(Security::None, &[0; 16], &[0; 16]).unwrap();
        let mut dst = BytesMut::new();
        for payload in vec![0u8; MAX_PAYLOAD + 10].chunks(MAX_PAYLOAD) {
            cipher.seal(payload, &mut dst).unwrap();
        }
        assert_eq!(&dst[..2], &(MAX_PAYLOAD as u16).to_be_bytes());
        assert_eq!(&dst[2 + MAX_PAYLOAD..4 + MAX_PAYLOAD], &10u16.to_be_bytes());
    }

    #[test]
    fn http_disguise() {
        let mut codec = HttpHeaderCodec::new("", "example.com", "/video", &[]);
        let mut out = BytesMut::new();
        codec.encode(b"abc", &mut out).unwrap();
        assert_eq!(
            &out[..],
            b"GET /video HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc"
        );
        codec.encode(b"def", &mut out).unwrap();
        assert!(out.ends_with(b"abcdef"));

        let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\nServer: x\r\n"[..]);
        let mut dst = BytesMut::new();
        codec.decode(&mut src, &mut dst).unwrap();
        assert!(dst.is_empty());
        src.extend_from_slice(b"\r\npayload");
        codec.decode(&mut src, &mut dst).unwrap();
        assert_eq!(&dst[..], b"payload");
    }
}
