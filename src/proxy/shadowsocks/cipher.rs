use std::io;

use aes::Aes192;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload, consts::U12};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use super::aead::AeadCodec;
use super::stream::{StreamCodec, StreamKind};
use crate::common::codec::Codec;
use crate::error::{Error, Result, invalid_data};

pub const TAG_SIZE: usize = 16;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
    XChacha20Poly1305,
}

impl AeadKind {
    pub fn key_size(self) -> usize {
        match self {
            AeadKind::Aes128Gcm => 16,
            AeadKind::Aes192Gcm => 24,
            _ => 32,
        }
    }

    pub fn salt_size(self) -> usize {
        self.key_size()
    }

    pub fn nonce_size(self) -> usize {
        match self {
            AeadKind::XChacha20Poly1305 => 24,
            _ => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aead(AeadKind),
    Stream(StreamKind),
    /// Identity, only meaningful under ShadowsocksR.
    Dummy,
}

/// Cipher selected by name, with its master key derived from the password.
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    key: Vec<u8>,
}

impl Cipher {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let kind = pick(method)
            .ok_or_else(|| Error::Config(format!("cipher {} not supported", method)))?;
        let key_size = match kind {
            CipherKind::Aead(k) => k.key_size(),
            CipherKind::Stream(k) => k.key_size(),
            CipherKind::Dummy => 16,
        };
        Ok(Cipher {
            kind,
            key: evp_bytes_to_key(password.as_bytes(), key_size),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Salt (AEAD) or IV (stream) length written ahead of the payload.
    pub fn iv_size(&self) -> usize {
        match self.kind {
            CipherKind::Aead(k) => k.salt_size(),
            CipherKind::Stream(k) => k.iv_size(),
            CipherKind::Dummy => 0,
        }
    }

    pub fn stream_codec(&self) -> io::Result<Box<dyn Codec>> {
        match self.kind {
            CipherKind::Aead(k) => Ok(Box::new(AeadCodec::new(k, self.key.clone()))),
            CipherKind::Stream(k) => Ok(Box::new(StreamCodec::new(k, self.key.clone())?)),
            CipherKind::Dummy => Ok(Box::new(Plain)),
        }
    }

    /// `[salt][sealed payload]` with a zero nonce, or `[iv][xor'ed payload]`.
    pub fn encrypt_packet(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        match self.kind {
            CipherKind::Aead(k) => {
                let salt = random_bytes(k.salt_size());
                let aead = AeadCipher::new(k, &derive_subkey(&self.key, &salt, k.key_size())?)?;
                let nonce = vec![0u8; k.nonce_size()];
                let mut out = salt;
                out.extend_from_slice(&aead.seal(&nonce, payload)?);
                Ok(out)
            }
            CipherKind::Stream(k) => {
                let iv = random_bytes(k.iv_size());
                let mut ks = k.keystream(&self.key, &iv, true)?;
                let mut body = payload.to_vec();
                ks.apply(&mut body);
                let mut out = iv;
                out.extend_from_slice(&body);
                Ok(out)
            }
            CipherKind::Dummy => Ok(payload.to_vec()),
        }
    }

    pub fn decrypt_packet(&self, packet: &[u8]) -> io::Result<Vec<u8>> {
        let iv_size = self.iv_size();
        if packet.len() < iv_size {
            return Err(invalid_data("short packet"));
        }
        let (iv, body) = packet.split_at(iv_size);
        match self.kind {
            CipherKind::Aead(k) => {
                let aead = AeadCipher::new(k, &derive_subkey(&self.key, iv, k.key_size())?)?;
                aead.open(&vec![0u8; k.nonce_size()], body)
            }
            CipherKind::Stream(k) => {
                let mut ks = k.keystream(&self.key, iv, false)?;
                let mut body = body.to_vec();
                ks.apply(&mut body);
                Ok(body)
            }
            CipherKind::Dummy => Ok(body.to_vec()),
        }
    }
}

fn pick(method: &str) -> Option<CipherKind> {
    let kind = match method.to_ascii_lowercase().as_str() {
        "aes-128-gcm" | "aead_aes_128_gcm" => CipherKind::Aead(AeadKind::Aes128Gcm),
        "aes-192-gcm" | "aead_aes_192_gcm" => CipherKind::Aead(AeadKind::Aes192Gcm),
        "aes-256-gcm" | "aead_aes_256_gcm" => CipherKind::Aead(AeadKind::Aes256Gcm),
        "chacha20-ietf-poly1305" | "chacha20-poly1305" | "aead_chacha20_poly1305" => {
            CipherKind::Aead(AeadKind::Chacha20Poly1305)
        }
        "xchacha20-ietf-poly1305" | "xchacha20-poly1305" => {
            CipherKind::Aead(AeadKind::XChacha20Poly1305)
        }
        "dummy" | "none" => CipherKind::Dummy,
        other => CipherKind::Stream(StreamKind::from_name(other)?),
    };
    Some(kind)
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password);
        prev = h.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

pub fn derive_subkey(key: &[u8], salt: &[u8], len: usize) -> io::Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut okm = vec![0u8; len];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| invalid_data("hkdf output too long"))?;
    Ok(okm)
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::Rng::fill(&mut rand::thread_rng(), &mut buf[..]);
    buf
}

/// Little-endian counter nonce.
pub fn increment_nonce(nonce: &mut [u8]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

pub enum AeadCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
    Chacha(ChaCha20Poly1305),
    XChacha(XChaCha20Poly1305),
}

macro_rules! with_aead {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            AeadCipher::Aes128($c) => $body,
            AeadCipher::Aes192($c) => $body,
            AeadCipher::Aes256($c) => $body,
            AeadCipher::Chacha($c) => $body,
            AeadCipher::XChacha($c) => $body,
        }
    };
}

impl AeadCipher {
    pub fn new(kind: AeadKind, key: &[u8]) -> io::Result<Self> {
        let bad_key = |_| invalid_data("bad aead key length");
        Ok(match kind {
            AeadKind::Aes128Gcm => AeadCipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(bad_key)?),
            AeadKind::Aes192Gcm => AeadCipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(bad_key)?),
            AeadKind::Aes256Gcm => AeadCipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(bad_key)?),
            AeadKind::Chacha20Poly1305 => {
                AeadCipher::Chacha(ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?)
            }
            AeadKind::XChacha20Poly1305 => {
                AeadCipher::XChacha(XChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?)
            }
        })
    }

    pub fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> io::Result<Vec<u8>> {
        with_aead!(self, c => c
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .map_err(|_| invalid_data("aead seal failed")))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        with_aead!(self, c => c
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| invalid_data("aead open failed")))
    }

    pub fn seal_aad(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        with_aead!(self, c => c
            .encrypt(GenericArray::from_slice(nonce), payload)
            .map_err(|_| invalid_data("aead seal failed")))
    }

    pub fn open_aad(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        with_aead!(self, c => c
            .decrypt(GenericArray::from_slice(nonce), payload)
            .map_err(|_| invalid_data("aead open failed")))
    }
}

struct Plain;

impl Codec for Plain {
    fn encode(&mut self, src: &[u8], dst: &mut bytes::BytesMut) -> io::Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }

    fn decode(&mut self, src: &mut bytes::BytesMut, dst: &mut bytes::BytesMut) -> io::Result<()> {
        dst.extend_from_slice(&src.split());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evp_matches_openssl() {
        // openssl enc -aes-256-cfb -k foobar -nosalt -P -md md5
        let key = evp_bytes_to_key(b"foobar", 32);
        assert_eq!(
            hex::encode(key),
            "3858f62230ac3c915f300c664312c63f568378529614d22ddb49237d2f60bfdf"
        );
    }

    #[test]
    fn nonce_counter_carries() {
        let mut n = [0xff, 0xff, 0x00];
        increment_nonce(&mut n);
        assert_eq!(n, [0, 0, 1]);
    }

    #[test]
    fn unknown_cipher_is_config_error() {
        assert!(matches!(Cipher::new("rot13", "x"), Err(Error::Config(_))));
    }

    #[test]
    fn packets_round_trip() {
        for method in ["aes-128-gcm", "chacha20-ietf-poly1305", "aes-256-cfb", "rc4-md5", "chacha20-ietf"] {
            let c = Cipher::new(method, "secret").unwrap();
            let packet = c.encrypt_packet(b"\x01\x7f\x00\x00\x01\x00\x35dns").unwrap();
            assert_eq!(c.decrypt_packet(&packet).unwrap(), b"\x01\x7f\x00\x00\x01\x00\x35dns", "{}", method);
        }
    }
}
