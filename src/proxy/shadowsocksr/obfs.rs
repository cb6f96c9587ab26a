use std::io;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

use crate::common::codec::Codec;
use crate::common::find_bytes;
use crate::common::crypto::{hmac_sha1, random_fill};
use crate::error::{Error, Result, invalid_data};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/44.0",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Ubuntu/11.10 Chromium/27.0.1453.93 Chrome/27.0.1453.93 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/49.0.2623.87 Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct ObfsBase {
    pub host: String,
    pub port: u16,
    pub key: Vec<u8>,
    pub iv_size: usize,
    pub param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    HttpSimple,
    HttpPost,
    Tls12TicketAuth,
}

impl ObfsKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "plain" => Ok(ObfsKind::Plain),
            "http_simple" => Ok(ObfsKind::HttpSimple),
            "http_post" => Ok(ObfsKind::HttpPost),
            "tls1.2_ticket_auth" | "tls1.2_ticket_fastauth" => Ok(ObfsKind::Tls12TicketAuth),
            other => Err(Error::Config(format!("ssr obfs {} not supported", other))),
        }
    }

    pub fn overhead(self) -> usize {
        match self {
            ObfsKind::Tls12TicketAuth => 5,
            _ => 0,
        }
    }

    pub fn build(self, base: &ObfsBase, client_id: [u8; 32]) -> Box<dyn Codec> {
        match self {
            ObfsKind::Plain => Box::new(PassThrough),
            ObfsKind::HttpSimple => Box::new(HttpObfs::new(base.clone(), false)),
            ObfsKind::HttpPost => Box::new(HttpObfs::new(base.clone(), true)),
            ObfsKind::Tls12TicketAuth => Box::new(TlsTicketObfs::new(base.clone(), client_id)),
        }
    }
}

pub(crate) struct PassThrough;

impl Codec for PassThrough {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        dst.put_slice(src);
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_slice(&src.split());
        Ok(())
    }
}

/// Hides the first packet in a fake HTTP request and strips the response header.
struct HttpObfs {
    base: ObfsBase,
    post: bool,
    header_sent: bool,
    header_received: bool,
}

impl HttpObfs {
    fn new(base: ObfsBase, post: bool) -> Self {
        HttpObfs {
            base,
            post,
            header_sent: false,
            header_received: false,
        }
    }

    fn write_header(&self, head: &[u8], dst: &mut BytesMut) {
        let mut rng = rand::thread_rng();
        let (host, body) = match self.base.param.find('#') {
            Some(pos) => {
                let body = self.base.param[pos + 1..]
                    .replace("\\n", "\r\n")
                    .replace('\n', "\r\n");
                (&self.base.param[..pos], Some(body))
            }
            None if !self.base.param.is_empty() => (self.base.param.as_str(), None),
            None => (self.base.host.as_str(), None),
        };
        let hosts: Vec<&str> = host.split(',').collect();
        let host = hosts[rng.gen_range(0..hosts.len())];

        let mut req = String::with_capacity(512 + head.len() * 3);
        req.push_str(if self.post { "POST /" } else { "GET /" });
        for b in head {
            req.push_str(&format!("%{:02x}", b));
        }
        req.push_str(" HTTP/1.1\r\nHost: ");
        req.push_str(host);
        if self.base.port != 80 {
            req.push_str(&format!(":{}", self.base.port));
        }
        req.push_str("\r\n");
        match body {
            Some(body) if !body.is_empty() => {
                req.push_str(&body);
                req.push_str("\r\n\r\n");
            }
            _ => {
                req.push_str("User-Agent: ");
                req.push_str(USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]);
                req.push_str("\r\nAccept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\nAccept-Language: en-US,en;q=0.8\r\nAccept-Encoding: gzip, deflate\r\n");
                if self.post {
                    req.push_str("Content-Type: multipart/form-data; boundary=");
                    req.push_str(&boundary(&mut rng));
                    req.push_str("\r\n");
                }
                req.push_str("DNT: 1\r\nConnection: keep-alive\r\n\r\n");
            }
        }
        dst.put_slice(req.as_bytes());
    }
}

fn boundary(rng: &mut impl Rng) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..32)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

impl Codec for HttpObfs {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if self.header_sent {
            dst.put_slice(src);
            return Ok(());
        }
        let mut head_len = self.base.iv_size + 30;
        if src.len() > head_len + 64 {
            head_len += rand::thread_rng().gen_range(0..=64);
        } else {
            head_len = src.len();
        }
        self.write_header(&src[..head_len], dst);
        dst.put_slice(&src[head_len..]);
        self.header_sent = true;
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        if !self.header_received {
            match find_bytes(src, b"\r\n\r\n") {
                Some(pos) => {
                    src.advance(pos + 4);
                    self.header_received = true;
                }
                None => return Ok(()),
            }
        }
        dst.put_slice(&src.split());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    Init,
    HelloSent,
    Established,
}

/// Fake TLS 1.2 session-ticket handshake, then `0x17 0303 len` records.
struct TlsTicketObfs {
    base: ObfsBase,
    client_id: [u8; 32],
    state: TlsState,
    send_buf: BytesMut,
    reply: BytesMut,
}

impl TlsTicketObfs {
    fn new(base: ObfsBase, client_id: [u8; 32]) -> Self {
        TlsTicketObfs {
            base,
            client_id,
            state: TlsState::Init,
            send_buf: BytesMut::new(),
            reply: BytesMut::new(),
        }
    }

    fn hmac(&self, data: &[u8]) -> [u8; 10] {
        let mut key = self.base.key.clone();
        key.extend_from_slice(&self.client_id);
        let mut out = [0u8; 10];
        out.copy_from_slice(&hmac_sha1(&key, data)[..10]);
        out
    }

    fn host(&self) -> String {
        let mut host = if self.base.param.is_empty() {
            self.base.host.as_str()
        } else {
            self.base.param.as_str()
        };
        if host.ends_with(|c: char| c.is_ascii_digit()) {
            host = "";
        }
        let hosts: Vec<&str> = host.split(',').collect();
        hosts[rand::thread_rng().gen_range(0..hosts.len())].to_string()
    }

    fn client_hello(&self, dst: &mut BytesMut) {
        let host = self.host();
        let mut data = BytesMut::with_capacity(1024);
        data.put_slice(&[3, 3]);
        // random: unix time, 18 random bytes, hmac
        let start = data.len();
        data.put_u32(chrono::Utc::now().timestamp() as u32);
        let mut rnd = [0u8; 18];
        random_fill(&mut rnd);
        data.put_slice(&rnd);
        let mac = self.hmac(&data[start..]);
        data.put_slice(&mac);
        data.put_u8(0x20);
        data.put_slice(&self.client_id);
        data.put_slice(&[
            0x00, 0x1c, 0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0x14, 0xcc, 0x13,
            0xc0, 0x0a, 0xc0, 0x14, 0xc0, 0x09, 0xc0, 0x13, 0x00, 0x9c, 0x00, 0x35, 0x00, 0x2f,
            0x00, 0x0a,
        ]);
        data.put_slice(&[0x01, 0x00]);

        let mut ext = BytesMut::with_capacity(512);
        ext.put_slice(&[0xff, 0x01, 0x00, 0x01, 0x00]);
        // server_name
        let len = host.len() as u16;
        ext.put_slice(&[0, 0]);
        ext.put_u16(len + 5);
        ext.put_u16(len + 3);
        ext.put_u8(0);
        ext.put_u16(len);
        ext.put_slice(host.as_bytes());
        ext.put_slice(&[0x00, 0x17, 0x00, 0x00]);
        // session ticket
        let ticket_len = 16 * rand::thread_rng().gen_range(8..=24);
        let mut ticket = vec![0u8; ticket_len];
        random_fill(&mut ticket);
        ext.put_u16(0x23);
        ext.put_u16(ticket_len as u16);
        ext.put_slice(&ticket);
        ext.put_slice(&[
            0x00, 0x0d, 0x00, 0x16, 0x00, 0x14, 0x06, 0x01, 0x06, 0x03, 0x05, 0x01, 0x05, 0x03,
            0x04, 0x01, 0x04, 0x03, 0x03, 0x01, 0x03, 0x03, 0x02, 0x01, 0x02, 0x03,
        ]);
        ext.put_slice(&[0x00, 0x05, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00]);
        ext.put_slice(&[0x00, 0x12, 0x00, 0x00]);
        ext.put_slice(&[0x75, 0x50, 0x00, 0x00]);
        ext.put_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
        ext.put_slice(&[0x00, 0x0a, 0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18]);

        data.put_u16(ext.len() as u16);
        data.put_slice(&ext);

        dst.put_slice(&[0x16, 3, 1]);
        dst.put_u16(data.len() as u16 + 4);
        dst.put_slice(&[1, 0]);
        dst.put_u16(data.len() as u16);
        dst.put_slice(&data);
    }
}

fn pack_record(dst: &mut BytesMut, data: &[u8]) {
    dst.put_slice(&[0x17, 3, 3]);
    dst.put_u16(data.len() as u16);
    dst.put_slice(data);
}

impl Codec for TlsTicketObfs {
    fn encode(&mut self, mut src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        match self.state {
            TlsState::Established => {
                let mut rng = rand::thread_rng();
                while src.len() > 2048 {
                    let size = rng.gen_range(100..4196).min(src.len());
                    pack_record(dst, &src[..size]);
                    src = &src[size..];
                }
                if !src.is_empty() {
                    pack_record(dst, src);
                }
            }
            TlsState::Init => {
                if !src.is_empty() {
                    pack_record(&mut self.send_buf, src);
                }
                self.client_hello(dst);
                self.state = TlsState::HelloSent;
            }
            TlsState::HelloSent => {
                if !src.is_empty() {
                    pack_record(&mut self.send_buf, src);
                }
            }
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        if self.state != TlsState::Established {
            let hello = src.split();
            let n = hello.len();
            if n < 11 + 32 + 1 + 32 {
                return Err(invalid_data("tls1.2_ticket_auth: server hello too short"));
            }
            if hello[33..43] != self.hmac(&hello[11..33]) || hello[n - 10..] != self.hmac(&hello[..n - 10]) {
                return Err(invalid_data("tls1.2_ticket_auth: hmac mismatch"));
            }
            let start = self.reply.len();
            self.reply
                .put_slice(&[0x14, 3, 3, 0, 1, 1, 0x16, 3, 3, 0, 0x20]);
            let mut rnd = [0u8; 22];
            random_fill(&mut rnd);
            self.reply.put_slice(&rnd);
            let mac = self.hmac(&self.reply[start..]);
            self.reply.put_slice(&mac);
            let pending = self.send_buf.split();
            self.reply.put_slice(&pending);
            self.state = TlsState::Established;
            return Ok(());
        }
        while src.len() > 5 {
            if src[..3] != [0x17, 3, 3] {
                return Err(invalid_data("tls1.2_ticket_auth: invalid record header"));
            }
            let len = u16::from_be_bytes([src[3], src[4]]) as usize;
            if src.len() < 5 + len {
                break;
            }
            src.advance(5);
            dst.put_slice(&src.split_to(len));
        }
        Ok(())
    }

    fn take_reply(&mut self, dst: &mut BytesMut) {
        if !self.reply.is_empty() {
            dst.put_slice(&self.reply.split());
        }
    }
}
