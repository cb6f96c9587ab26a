use std::io;

use bytes::{BufMut, BytesMut};

use super::cipher::{AeadCipher, AeadKind, TAG_SIZE, derive_subkey, increment_nonce, random_bytes};
use crate::common::codec::Codec;
use crate::error::invalid_data;

pub const MAX_PAYLOAD: usize = 0x3fff;

struct Session {
    cipher: AeadCipher,
    nonce: Vec<u8>,
}

impl Session {
    fn new(kind: AeadKind, key: &[u8], salt: &[u8]) -> io::Result<Self> {
        let subkey = derive_subkey(key, salt, kind.key_size())?;
        Ok(Session {
            cipher: AeadCipher::new(kind, &subkey)?,
            nonce: vec![0u8; kind.nonce_size()],
        })
    }

    fn seal(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let out = self.cipher.seal(&self.nonce, data)?;
        increment_nonce(&mut self.nonce);
        Ok(out)
    }

    fn open(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let out = self.cipher.open(&self.nonce, data)?;
        increment_nonce(&mut self.nonce);
        Ok(out)
    }
}

/// Shadowsocks AEAD stream: salt, then `[len+tag][payload+tag]` chunks.
pub struct AeadCodec {
    kind: AeadKind,
    key: Vec<u8>,
    enc: Option<Session>,
    dec: Option<Session>,
    pending_len: Option<usize>,
}

impl AeadCodec {
    pub fn new(kind: AeadKind, key: Vec<u8>) -> Self {
        AeadCodec {
            kind,
            key,
            enc: None,
            dec: None,
            pending_len: None,
        }
    }
}

impl Codec for AeadCodec {
    fn encode(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let enc = match &mut self.enc {
            Some(enc) => enc,
            None => {
                let salt = random_bytes(self.kind.salt_size());
                dst.put_slice(&salt);
                self.enc.insert(Session::new(self.kind, &self.key, &salt)?)
            }
        };
        for chunk in src.chunks(MAX_PAYLOAD) {
            let len = (chunk.len() as u16).to_be_bytes();
            dst.put_slice(&enc.seal(&len)?);
            dst.put_slice(&enc.seal(chunk)?);
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        let dec = match &mut self.dec {
            Some(dec) => dec,
            None => {
                let salt_size = self.kind.salt_size();
                if src.len() < salt_size {
                    return Ok(());
                }
                let salt = src.split_to(salt_size);
                self.dec.insert(Session::new(self.kind, &self.key, &salt)?)
            }
        };
        loop {
            let len = match self.pending_len {
                Some(len) => len,
                None => {
                    if src.len() < 2 + TAG_SIZE {
                        return Ok(());
                    }
                    let head = src.split_to(2 + TAG_SIZE);
                    let plain = dec.open(&head)?;
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize & MAX_PAYLOAD;
                    *self.pending_len.insert(len)
                }
            };
            if src.len() < len + TAG_SIZE {
                return Ok(());
            }
            let body = src.split_to(len + TAG_SIZE);
            let plain = dec.open(&body)?;
            if plain.len() != len {
                return Err(invalid_data("aead chunk length mismatch"));
            }
            dst.put_slice(&plain);
            self.pending_len = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_stream_decodes_across_splits() {
        let key = vec![7u8; 32];
        let mut enc = AeadCodec::new(AeadKind::Aes256Gcm, key.clone());
        let mut dec = AeadCodec::new(AeadKind::Aes256Gcm, key);
        let payload = vec![0xabu8; MAX_PAYLOAD + 100];
        let mut wire = BytesMut::new();
        enc.encode(&payload, &mut wire).unwrap();
        enc.encode(b"tail", &mut wire).unwrap();
        // salt + 3 chunks
        assert_eq!(wire.len(), 32 + 3 * (2 + 2 * TAG_SIZE) + payload.len() + 4);

        let mut src = BytesMut::new();
        let mut out = BytesMut::new();
        for piece in wire.chunks(1000) {
            src.extend_from_slice(piece);
            dec.decode(&mut src, &mut out).unwrap();
        }
        assert!(src.is_empty());
        assert_eq!(&out[..payload.len()], &payload[..]);
        assert_eq!(&out[payload.len()..], b"tail");
    }

    #[test]
    fn tampered_chunk_is_rejected() {
        let key = vec![1u8; 16];
        let mut enc = AeadCodec::new(AeadKind::Aes128Gcm, key.clone());
        let mut dec = AeadCodec::new(AeadKind::Aes128Gcm, key);
        let mut wire = BytesMut::new();
        enc.encode(b"hello", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        let mut out = BytesMut::new();
        assert!(dec.decode(&mut wire, &mut out).is_err());
    }
}
