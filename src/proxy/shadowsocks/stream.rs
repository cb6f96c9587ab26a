use std::io;

use aes::{Aes128, Aes192, Aes256};
use bytes::{BufMut, BytesMut};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy, XChaCha20};
use chacha20::cipher::{KeyInit, KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rc4::Rc4;
use rc4::consts::U16;

use super::cipher::random_bytes;
use crate::common::codec::Codec;
use crate::error::invalid_data;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Chacha20,
    Chacha20Ietf,
    XChacha20,
    Rc4Md5,
}

impl StreamKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "aes-128-ctr" => StreamKind::Aes128Ctr,
            "aes-192-ctr" => StreamKind::Aes192Ctr,
            "aes-256-ctr" => StreamKind::Aes256Ctr,
            "aes-128-cfb" => StreamKind::Aes128Cfb,
            "aes-192-cfb" => StreamKind::Aes192Cfb,
            "aes-256-cfb" => StreamKind::Aes256Cfb,
            "chacha20" => StreamKind::Chacha20,
            "chacha20-ietf" => StreamKind::Chacha20Ietf,
            "xchacha20" => StreamKind::XChacha20,
            "rc4-md5" => StreamKind::Rc4Md5,
            _ => return None,
        })
    }

    pub fn key_size(self) -> usize {
        match self {
            StreamKind::Aes128Ctr | StreamKind::Aes128Cfb | StreamKind::Rc4Md5 => 16,
            StreamKind::Aes192Ctr | StreamKind::Aes192Cfb => 24,
            _ => 32,
        }
    }

    pub fn iv_size(self) -> usize {
        match self {
            StreamKind::Chacha20 => 8,
            StreamKind::Chacha20Ietf => 12,
            StreamKind::XChacha20 => 24,
            _ => 16,
        }
    }

    pub fn keystream(self, key: &[u8], iv: &[u8], encrypt: bool) -> io::Result<Box<dyn Keystream>> {
        let bad = |_| invalid_data("bad key or iv length");
        Ok(match self {
            StreamKind::Aes128Ctr => Box::new(Xor(Aes128Ctr::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::Aes192Ctr => Box::new(Xor(Aes192Ctr::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::Aes256Ctr => Box::new(Xor(Aes256Ctr::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::Aes128Cfb => cfb::<Aes128>(key, iv, encrypt)?,
            StreamKind::Aes192Cfb => cfb::<Aes192>(key, iv, encrypt)?,
            StreamKind::Aes256Cfb => cfb::<Aes256>(key, iv, encrypt)?,
            StreamKind::Chacha20 => Box::new(Xor(ChaCha20Legacy::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::Chacha20Ietf => Box::new(Xor(ChaCha20::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::XChacha20 => Box::new(Xor(XChaCha20::new_from_slices(key, iv).map_err(bad)?)),
            StreamKind::Rc4Md5 => {
                let mut h = Md5::new();
                h.update(key);
                h.update(iv);
                Box::new(rc4_keystream(&h.finalize())?)
            }
        })
    }
}

/// In-place keystream application; one instance per direction.
pub trait Keystream: Send + Sync {
    fn apply(&mut self, data: &mut [u8]);
}

pub struct Xor<C>(pub C);

impl<C: StreamCipher + Send + Sync> Keystream for Xor<C> {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

struct CfbEnc<C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher>(BufEncryptor<C>);
struct CfbDec<C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher>(BufDecryptor<C>);

impl<C> Keystream for CfbEnc<C>
where
    C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher + Send + Sync,
{
    fn apply(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

impl<C> Keystream for CfbDec<C>
where
    C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher + Send + Sync,
{
    fn apply(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

fn cfb<C>(key: &[u8], iv: &[u8], encrypt: bool) -> io::Result<Box<dyn Keystream>>
where
    C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher + KeyInit + Send + Sync + 'static,
{
    let bad = |_| invalid_data("bad key or iv length");
    Ok(if encrypt {
        Box::new(CfbEnc(BufEncryptor::<C>::new_from_slices(key, iv).map_err(bad)?))
    } else {
        Box::new(CfbDec(BufDecryptor::<C>::new_from_slices(key, iv).map_err(bad)?))
    })
}

/// RC4 keyed with a 16 byte key.
pub fn rc4_keystream(key: &[u8]) -> io::Result<Xor<Rc4<U16>>> {
    Rc4::<U16>::new_from_slice(key)
        .map(Xor)
        .map_err(|_| invalid_data("bad rc4 key length"))
}

/// Stream cipher connection: IV ahead of the first write, then a plain keystream.
pub struct StreamCodec {
    kind: StreamKind,
    key: Vec<u8>,
    write_iv: Vec<u8>,
    iv_sent: bool,
    enc: Box<dyn Keystream>,
    dec: Option<Box<dyn Keystream>>,
}

impl StreamCodec {
    /// The write IV is fixed here so upper layers can read it before any I/O.
    pub fn new(kind: StreamKind, key: Vec<u8>) -> io::Result<Self> {
        let write_iv = random_bytes(kind.iv_size());
        let enc = kind.keystream(&key, &write_iv, true)?;
        Ok(StreamCodec {
            kind,
            key,
            write_iv,
            iv_sent: false,
            enc,
            dec: None,
        })
    }

    pub fn write_iv(&self) -> &[u8] {
        &self.write_iv
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Codec for StreamCodec {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if !self.iv_sent {
            dst.put_slice(&self.write_iv);
            self.iv_sent = true;
        }
        let start = dst.len();
        dst.put_slice(src);
        self.enc.apply(&mut dst[start..]);
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        let dec = match &mut self.dec {
            Some(dec) => dec,
            None => {
                let iv_size = self.kind.iv_size();
                if src.len() < iv_size {
                    return Ok(());
                }
                let iv = src.split_to(iv_size);
                self.dec.insert(self.kind.keystream(&self.key, &iv, false)?)
            }
        };
        let mut data = src.split();
        dec.apply(&mut data);
        dst.put_slice(&data);
        Ok(())
    }
}
