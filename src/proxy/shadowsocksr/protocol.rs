use std::io;
use std::sync::{Arc, Mutex};

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

use super::obfs::PassThrough;
use crate::common::codec::Codec;
use crate::common::crypto::{hmac_md5, hmac_sha1, md5, random_fill, sha1};
use crate::common::encode_b64;
use crate::error::{Error, Result, invalid_data};
use crate::proxy::shadowsocks::cipher::evp_bytes_to_key;
use crate::proxy::shadowsocks::stream::{Keystream, rc4_keystream};

const TCP_MSS: usize = 1460;

#[derive(Debug, Clone)]
pub struct ProtocolBase {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub overhead: usize,
    pub param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Origin,
    AuthAes128Md5,
    AuthAes128Sha1,
    AuthChainA,
}

impl ProtocolKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "origin" => Ok(ProtocolKind::Origin),
            "auth_aes128_md5" => Ok(ProtocolKind::AuthAes128Md5),
            "auth_aes128_sha1" => Ok(ProtocolKind::AuthAes128Sha1),
            "auth_chain_a" => Ok(ProtocolKind::AuthChainA),
            other => Err(Error::Config(format!("ssr protocol {} not supported", other))),
        }
    }

    pub fn overhead(self) -> usize {
        match self {
            ProtocolKind::Origin => 0,
            ProtocolKind::AuthAes128Md5 | ProtocolKind::AuthAes128Sha1 => 9,
            ProtocolKind::AuthChainA => 4,
        }
    }

    pub fn build(self, base: ProtocolBase, auth: &Arc<Mutex<AuthData>>) -> io::Result<Box<dyn Codec>> {
        Ok(match self {
            ProtocolKind::Origin => Box::new(PassThrough),
            ProtocolKind::AuthAes128Md5 => Box::new(AuthAes128::new(base, auth.clone(), Digest::Md5)),
            ProtocolKind::AuthAes128Sha1 => Box::new(AuthAes128::new(base, auth.clone(), Digest::Sha1)),
            ProtocolKind::AuthChainA => Box::new(AuthChainA::new(base, auth.clone())?),
        })
    }
}

/// Client identity shared by every connection of one dialer.
#[derive(Debug, Default)]
pub struct AuthData {
    client_id: Option<[u8; 4]>,
    connection_id: u32,
}

impl AuthData {
    fn next(&mut self) -> ([u8; 4], u32) {
        self.connection_id = self.connection_id.wrapping_add(1);
        if self.connection_id > 0xff00_0000 {
            self.client_id = None;
        }
        let client_id = match self.client_id {
            Some(id) => id,
            None => {
                let mut id = [0u8; 4];
                random_fill(&mut id);
                self.connection_id = rand::thread_rng().r#gen::<u32>() & 0x00ff_ffff;
                *self.client_id.insert(id)
            }
        };
        (client_id, self.connection_id)
    }
}

/// `time | client_id | connection_id | a | b` in one AES block, ECB with the user key.
fn encrypted_auth_block(
    auth: &Mutex<AuthData>,
    user_key: &[u8],
    salt: &str,
    a: u16,
    b: u16,
) -> io::Result<[u8; 16]> {
    let (client_id, connection_id) = auth
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "auth data poisoned"))?
        .next();
    let mut block = [0u8; 16];
    block[..4].copy_from_slice(&(chrono::Utc::now().timestamp() as u32).to_le_bytes());
    block[4..8].copy_from_slice(&client_id);
    block[8..12].copy_from_slice(&connection_id.to_le_bytes());
    block[12..14].copy_from_slice(&a.to_le_bytes());
    block[14..16].copy_from_slice(&b.to_le_bytes());
    let key = evp_bytes_to_key(format!("{}{}", encode_b64(user_key), salt).as_bytes(), 16);
    let cipher = Aes128::new_from_slice(&key).map_err(|_| invalid_data("bad aes key"))?;
    cipher.encrypt_block(aes::Block::from_mut_slice(&mut block));
    Ok(block)
}

/// `uid:key` from the protocol param, or a random uid with the cipher key.
fn user_data(base: &ProtocolBase, hash: impl Fn(&[u8]) -> Vec<u8>) -> ([u8; 4], Vec<u8>) {
    if let Some((uid, key)) = base.param.split_once(':') {
        if let Ok(uid) = uid.parse::<u32>() {
            return (uid.to_le_bytes(), hash(key.as_bytes()));
        }
    }
    let mut uid = [0u8; 4];
    random_fill(&mut uid);
    (uid, base.key.clone())
}

/// Bytes of the leading socks address plus a little slack.
fn head_size(buf: &[u8], default: usize) -> usize {
    if buf.len() < 2 {
        return default;
    }
    match buf[0] & 7 {
        1 => 7,
        4 => 19,
        3 => 4 + buf[1] as usize,
        _ => default,
    }
}

fn first_packet_len(buf: &[u8]) -> usize {
    (head_size(buf, 30) + rand::thread_rng().gen_range(0..32)).min(buf.len())
}

fn random_vec(n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    random_fill(&mut v);
    v
}

#[derive(Clone, Copy)]
enum Digest {
    Md5,
    Sha1,
}

impl Digest {
    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Digest::Md5 => hmac_md5(key, data).to_vec(),
            Digest::Sha1 => hmac_sha1(key, data).to_vec(),
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Digest::Md5 => md5(data).to_vec(),
            Digest::Sha1 => sha1(data).to_vec(),
        }
    }

    fn salt(self) -> &'static str {
        match self {
            Digest::Md5 => "auth_aes128_md5",
            Digest::Sha1 => "auth_aes128_sha1",
        }
    }
}

struct AuthAes128 {
    base: ProtocolBase,
    auth: Arc<Mutex<AuthData>>,
    digest: Digest,
    user_id: [u8; 4],
    user_key: Vec<u8>,
    header_sent: bool,
    raw: bool,
    pack_id: u32,
    recv_id: u32,
}

impl AuthAes128 {
    const UNIT_LEN: usize = 8100;

    fn new(mut base: ProtocolBase, auth: Arc<Mutex<AuthData>>, digest: Digest) -> Self {
        base.overhead += ProtocolKind::AuthAes128Md5.overhead();
        let (user_id, user_key) = user_data(&base, |k| digest.hash(k));
        AuthAes128 {
            base,
            auth,
            digest,
            user_id,
            user_key,
            header_sent: false,
            raw: false,
            pack_id: 1,
            recv_id: 1,
        }
    }

    fn mac_key(&self, id: u32) -> Vec<u8> {
        let mut key = self.user_key.clone();
        key.extend_from_slice(&id.to_le_bytes());
        key
    }

    fn pack_rand_len(&self, data_len: usize, full_len: usize) -> usize {
        let mut rng = rand::thread_rng();
        if full_len >= 32 * 1024 - self.base.overhead {
            return 0;
        }
        let rev = TCP_MSS as isize - data_len as isize - 9;
        if rev == 0 {
            return 0;
        }
        if rev < 0 {
            if rev > -(TCP_MSS as isize) {
                return rng.gen_range(0..(rev + TCP_MSS as isize) as usize);
            }
            return rng.gen_range(0..32);
        }
        rng.gen_range(0..rev as usize)
    }

    fn pack_data(&mut self, dst: &mut BytesMut, data: &[u8], full_len: usize) {
        let rnd_len = self.pack_rand_len(data.len(), full_len);
        let mut packed_len = 2 + 2 + 3 + rnd_len + data.len() + 4;
        if rnd_len < 128 {
            packed_len -= 2;
        }
        let mac_key = self.mac_key(self.pack_id);
        self.pack_id = self.pack_id.wrapping_add(1);

        let start = dst.len();
        dst.put_u16_le(packed_len as u16);
        let mac = self.digest.hmac(&mac_key, &dst[start..start + 2]);
        dst.put_slice(&mac[..2]);
        if rnd_len < 128 {
            dst.put_u8(rnd_len as u8 + 1);
        } else {
            dst.put_u8(0xff);
            dst.put_u16_le(rnd_len as u16 + 3);
        }
        dst.put_slice(&random_vec(rnd_len));
        dst.put_slice(data);
        let mac = self.digest.hmac(&mac_key, &dst[start..]);
        dst.put_slice(&mac[..4]);
    }

    fn pack_auth_data(&mut self, dst: &mut BytesMut, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let rnd_len = if data.len() > 400 {
            rand::thread_rng().gen_range(0..512)
        } else {
            rand::thread_rng().gen_range(0..1024)
        };
        let packed_len = 7 + 4 + 16 + 4 + rnd_len + data.len() + 4;
        let mut mac_key = self.base.iv.clone();
        mac_key.extend_from_slice(&self.base.key);

        let start = dst.len();
        dst.put_u8(rand::thread_rng().r#gen());
        let mac = self.digest.hmac(&mac_key, &dst[start..]);
        dst.put_slice(&mac[..6]);
        dst.put_slice(&self.user_id);
        let block = encrypted_auth_block(
            &self.auth,
            &self.user_key,
            self.digest.salt(),
            packed_len as u16,
            rnd_len as u16,
        )?;
        dst.put_slice(&block);
        let mac = self.digest.hmac(&mac_key, &dst[start + 7..]);
        dst.put_slice(&mac[..4]);
        dst.put_slice(&random_vec(rnd_len));
        dst.put_slice(data);
        let mac = self.digest.hmac(&self.user_key, &dst[start..]);
        dst.put_slice(&mac[..4]);
        Ok(())
    }
}

impl Codec for AuthAes128 {
    fn encode(&mut self, mut src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let full_len = src.len();
        if !self.header_sent {
            let n = first_packet_len(src);
            self.pack_auth_data(dst, &src[..n])?;
            src = &src[n..];
            self.header_sent = true;
        }
        for chunk in src.chunks(Self::UNIT_LEN) {
            self.pack_data(dst, chunk, full_len);
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        if self.raw {
            dst.put_slice(&src.split());
            return Ok(());
        }
        while src.len() > 4 {
            let mac_key = self.mac_key(self.recv_id);
            if self.digest.hmac(&mac_key, &src[..2])[..2] != src[2..4] {
                src.clear();
                return Err(invalid_data("auth_aes128: mac mismatch"));
            }
            let len = u16::from_le_bytes([src[0], src[1]]) as usize;
            if !(7..8192).contains(&len) {
                self.raw = true;
                src.clear();
                return Err(invalid_data("auth_aes128: bad length"));
            }
            if len > src.len() {
                break;
            }
            if self.digest.hmac(&mac_key, &src[..len - 4])[..4] != src[len - 4..len] {
                self.raw = true;
                src.clear();
                return Err(invalid_data("auth_aes128: checksum mismatch"));
            }
            self.recv_id = self.recv_id.wrapping_add(1);
            let pos = if src[4] < 255 {
                src[4] as usize + 4
            } else {
                u16::from_le_bytes([src[5], src[6]]) as usize + 4
            };
            if pos > len - 4 {
                return Err(invalid_data("auth_aes128: bad padding"));
            }
            dst.put_slice(&src[pos..len - 4]);
            src.advance(len);
        }
        Ok(())
    }
}

/// xorshift128+ as used by the auth_chain family.
#[derive(Debug, Default, Clone)]
pub struct XorShift128Plus {
    s: [u64; 2],
}

impl XorShift128Plus {
    pub fn next(&mut self) -> u64 {
        let mut x = self.s[0];
        let y = self.s[1];
        self.s[0] = y;
        x ^= x << 23;
        x ^= y ^ (x >> 17) ^ (y >> 26);
        self.s[1] = x;
        x.wrapping_add(y)
    }

    pub fn init_from_bin_len(&mut self, bin: &[u8], len: usize) {
        let mut full = [0u8; 16];
        let n = bin.len().min(16);
        full[..n].copy_from_slice(&bin[..n]);
        full[..2].copy_from_slice(&(len as u16).to_le_bytes());
        self.s[0] = u64::from_le_bytes(full[..8].try_into().unwrap_or_default());
        self.s[1] = u64::from_le_bytes(full[8..].try_into().unwrap_or_default());
        for _ in 0..4 {
            self.next();
        }
    }
}

fn chain_rand_len(len: usize, last_hash: &[u8], random: &mut XorShift128Plus) -> usize {
    if len > 1440 {
        return 0;
    }
    random.init_from_bin_len(last_hash, len);
    let m = if len > 1300 {
        31
    } else if len > 900 {
        127
    } else if len > 400 {
        521
    } else {
        1021
    };
    (random.next() % m) as usize
}

fn chain_start_pos(len: usize, random: &mut XorShift128Plus) -> usize {
    if len == 0 {
        return 0;
    }
    ((random.next() % 8_589_934_609) % len as u64) as usize
}

struct AuthChainA {
    base: ProtocolBase,
    auth: Arc<Mutex<AuthData>>,
    user_id: [u8; 4],
    user_key: Vec<u8>,
    header_sent: bool,
    raw: bool,
    last_client_hash: [u8; 16],
    last_server_hash: [u8; 16],
    encrypter: Option<Box<dyn Keystream>>,
    decrypter: Option<Box<dyn Keystream>>,
    random_client: XorShift128Plus,
    random_server: XorShift128Plus,
    pack_id: u32,
    recv_id: u32,
}

impl AuthChainA {
    const SALT: &'static str = "auth_chain_a";
    const UNIT_LEN: usize = 2800;

    fn new(mut base: ProtocolBase, auth: Arc<Mutex<AuthData>>) -> io::Result<Self> {
        base.overhead += ProtocolKind::AuthChainA.overhead();
        let (user_id, user_key) = user_data(&base, |k| k.to_vec());
        Ok(AuthChainA {
            base,
            auth,
            user_id,
            user_key,
            header_sent: false,
            raw: false,
            last_client_hash: [0; 16],
            last_server_hash: [0; 16],
            encrypter: None,
            decrypter: None,
            random_client: XorShift128Plus::default(),
            random_server: XorShift128Plus::default(),
            pack_id: 1,
            recv_id: 1,
        })
    }

    fn mac_key(&self, id: u32) -> Vec<u8> {
        let mut key = self.user_key.clone();
        key.extend_from_slice(&id.to_le_bytes());
        key
    }

    fn init_rc4(&mut self) -> io::Result<()> {
        let password = format!(
            "{}{}",
            encode_b64(&self.user_key),
            encode_b64(&self.last_client_hash)
        );
        let key = evp_bytes_to_key(password.as_bytes(), 16);
        self.encrypter = Some(Box::new(rc4_keystream(&key)?));
        self.decrypter = Some(Box::new(rc4_keystream(&key)?));
        Ok(())
    }

    fn pack_data(&mut self, dst: &mut BytesMut, data: &[u8]) {
        let mut data = data.to_vec();
        if let Some(enc) = self.encrypter.as_mut() {
            enc.apply(&mut data);
        }
        let mac_key = self.mac_key(self.pack_id);
        self.pack_id = self.pack_id.wrapping_add(1);
        let xor = u16::from_le_bytes([self.last_client_hash[14], self.last_client_hash[15]]);
        let start = dst.len();
        dst.put_u16_le(data.len() as u16 ^ xor);

        let rnd_len = chain_rand_len(data.len(), &self.last_client_hash, &mut self.random_client);
        if data.is_empty() {
            dst.put_slice(&random_vec(rnd_len));
        } else if rnd_len > 0 {
            let pos = chain_start_pos(rnd_len, &mut self.random_client);
            dst.put_slice(&random_vec(pos));
            dst.put_slice(&data);
            dst.put_slice(&random_vec(rnd_len - pos));
        } else {
            dst.put_slice(&data);
        }
        self.last_client_hash = hmac_md5(&mac_key, &dst[start..]);
        dst.put_slice(&self.last_client_hash[..2]);
    }

    fn pack_auth_data(&mut self, dst: &mut BytesMut, data: &[u8]) -> io::Result<()> {
        let mut mac_key = self.base.iv.clone();
        mac_key.extend_from_slice(&self.base.key);

        let start = dst.len();
        let mut check_head = [0u8; 4];
        random_fill(&mut check_head);
        dst.put_slice(&check_head);
        self.last_client_hash = hmac_md5(&mac_key, &check_head);
        self.init_rc4()?;
        dst.put_slice(&self.last_client_hash[..8]);

        let uid = u32::from_le_bytes(self.user_id)
            ^ u32::from_le_bytes([
                self.last_client_hash[8],
                self.last_client_hash[9],
                self.last_client_hash[10],
                self.last_client_hash[11],
            ]);
        dst.put_u32_le(uid);
        let block = encrypted_auth_block(
            &self.auth,
            &self.user_key,
            Self::SALT,
            self.base.overhead as u16,
            0,
        )?;
        dst.put_slice(&block);
        self.last_server_hash = hmac_md5(&self.user_key, &dst[start + 12..]);
        dst.put_slice(&self.last_server_hash[..4]);
        self.pack_data(dst, data);
        Ok(())
    }
}

impl Codec for AuthChainA {
    fn encode(&mut self, mut src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if !self.header_sent {
            let n = first_packet_len(src);
            self.pack_auth_data(dst, &src[..n])?;
            src = &src[n..];
            self.header_sent = true;
        }
        for chunk in src.chunks(Self::UNIT_LEN) {
            self.pack_data(dst, chunk);
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        if self.raw {
            dst.put_slice(&src.split());
            return Ok(());
        }
        while src.len() > 4 {
            let mac_key = self.mac_key(self.recv_id);
            let xor = u16::from_le_bytes([self.last_server_hash[14], self.last_server_hash[15]]);
            let data_len = (u16::from_le_bytes([src[0], src[1]]) ^ xor) as usize;
            let rnd_len = chain_rand_len(data_len, &self.last_server_hash, &mut self.random_server);
            let len = data_len + rnd_len;
            if len >= 4096 {
                self.raw = true;
                src.clear();
                return Err(invalid_data("auth_chain_a: bad length"));
            }
            if len + 4 > src.len() {
                break;
            }
            let server_hash = hmac_md5(&mac_key, &src[..len + 2]);
            if server_hash[..2] != src[len + 2..len + 4] {
                self.raw = true;
                src.clear();
                return Err(invalid_data("auth_chain_a: checksum mismatch"));
            }
            self.last_server_hash = server_hash;
            let mut pos = 2;
            if data_len > 0 && rnd_len > 0 {
                pos += chain_start_pos(rnd_len, &mut self.random_server);
            }
            let mut data = src[pos..pos + data_len].to_vec();
            if let Some(dec) = self.decrypter.as_mut() {
                dec.apply(&mut data);
            }
            if self.recv_id == 1 {
                dst.put_slice(data.get(2..).unwrap_or_default());
            } else {
                dst.put_slice(&data);
            }
            self.recv_id = self.recv_id.wrapping_add(1);
            src.advance(len + 4);
        }
        Ok(())
    }
}

#[cfg(test)]
type Rc4Stream = crate::proxy::shadowsocks::stream::Xor<rc4::Rc4<rc4::consts::U16>>;

/// Server side of auth_chain_a framing, for exercising the client codec.
#[cfg(test)]
pub(crate) struct ChainServer {
    user_key: Vec<u8>,
    last_client_hash: [u8; 16],
    last_server_hash: [u8; 16],
    rc4: Option<(Rc4Stream, Rc4Stream)>,
    random: XorShift128Plus,
    pack_id: u32,
}

#[cfg(test)]
impl ChainServer {
    pub(crate) fn new(user_key: Vec<u8>) -> Self {
        ChainServer {
            user_key,
            last_client_hash: [0; 16],
            last_server_hash: [0; 16],
            rc4: None,
            random: XorShift128Plus::default(),
            pack_id: 1,
        }
    }

    /// Strips the auth header of the first client packet; returns the payload.
    pub(crate) fn accept(&mut self, iv: &[u8], key: &[u8], buf: &[u8]) -> Vec<u8> {
        let mut mac_key = iv.to_vec();
        mac_key.extend_from_slice(key);
        let head = hmac_md5(&mac_key, &buf[..4]);
        assert_eq!(&head[..8], &buf[4..12]);
        self.last_client_hash = head;
        let password = format!("{}{}", encode_b64(&self.user_key), encode_b64(&head));
        let k = evp_bytes_to_key(password.as_bytes(), 16);
        self.rc4 = Some((rc4_keystream(&k).unwrap(), rc4_keystream(&k).unwrap()));
        self.last_server_hash = hmac_md5(&self.user_key, &buf[12..12 + 4 + 16]);
        assert_eq!(&self.last_server_hash[..4], &buf[32..36]);
        self.read_client(&buf[36..])
    }

    fn read_client(&mut self, buf: &[u8]) -> Vec<u8> {
        let xor = u16::from_le_bytes([self.last_client_hash[14], self.last_client_hash[15]]);
        let data_len = (u16::from_le_bytes([buf[0], buf[1]]) ^ xor) as usize;
        let mut random = XorShift128Plus::default();
        let rnd_len = chain_rand_len(data_len, &self.last_client_hash, &mut random);
        let mut pos = 2;
        if data_len > 0 && rnd_len > 0 {
            pos += chain_start_pos(rnd_len, &mut random);
        }
        let mut mac_key = self.user_key.clone();
        mac_key.extend_from_slice(&1u32.to_le_bytes());
        let hash = hmac_md5(&mac_key, &buf[..2 + data_len + rnd_len]);
        assert_eq!(&hash[..2], &buf[2 + data_len + rnd_len..4 + data_len + rnd_len]);
        self.last_client_hash = hash;
        let mut data = buf[pos..pos + data_len].to_vec();
        self.rc4.as_mut().unwrap().1.apply(&mut data);
        data
    }

    /// Frames `data` the way a server answers; the first frame carries 2 mss bytes.
    pub(crate) fn reply(&mut self, data: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        if self.pack_id == 1 {
            plain.extend_from_slice(&(TCP_MSS as u16).to_le_bytes());
        }
        plain.extend_from_slice(data);
        self.rc4.as_mut().unwrap().0.apply(&mut plain);
        let mut mac_key = self.user_key.clone();
        mac_key.extend_from_slice(&self.pack_id.to_le_bytes());
        self.pack_id += 1;
        let xor = u16::from_le_bytes([self.last_server_hash[14], self.last_server_hash[15]]);
        let mut out = Vec::new();
        out.extend_from_slice(&(plain.len() as u16 ^ xor).to_le_bytes());
        let rnd_len = chain_rand_len(plain.len(), &self.last_server_hash, &mut self.random);
        let pos = chain_start_pos(rnd_len, &mut self.random);
        out.extend(std::iter::repeat(0u8).take(pos));
        out.extend_from_slice(&plain);
        out.extend(std::iter::repeat(0u8).take(rnd_len - pos));
        self.last_server_hash = hmac_md5(&mac_key, &out);
        out.extend_from_slice(&self.last_server_hash[..2]);
        out
    }
}
