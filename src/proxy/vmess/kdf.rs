use std::io;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::common::crypto::random_fill;
use crate::error::invalid_data;
use crate::proxy::shadowsocks::cipher::{AeadCipher, AeadKind};

pub const SALT_KDF: &[u8] = b"VMess AEAD KDF";
pub const SALT_AUTH_ID_KEY: &[u8] = b"AES Auth ID Encryption";
pub const SALT_RESP_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub const SALT_RESP_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
pub const SALT_RESP_KEY: &[u8] = b"AEAD Resp Header Key";
pub const SALT_RESP_IV: &[u8] = b"AEAD Resp Header IV";
pub const SALT_HEADER_KEY: &[u8] = b"VMess Header AEAD Key";
pub const SALT_HEADER_IV: &[u8] = b"VMess Header AEAD Nonce";
pub const SALT_HEADER_LEN_KEY: &[u8] = b"VMess Header AEAD Key_Length";
pub const SALT_HEADER_LEN_IV: &[u8] = b"VMess Header AEAD Nonce_Length";

const BLOCK_SIZE: usize = 64;

/// HMAC whose hash is the HMAC one level up, bottoming out at HMAC-SHA256 keyed with `salts[0]`.
fn nested_hash(salts: &[&[u8]], msg: &[u8]) -> [u8; 32] {
    let Some((key, parents)) = salts.split_last() else {
        return [0u8; 32];
    };
    if parents.is_empty() {
        let mut out = [0u8; 32];
        if let Ok(mut mac) = <Hmac::<Sha256> as Mac>::new_from_slice(key) {
            mac.update(msg);
            out.copy_from_slice(&mac.finalize().into_bytes());
        }
        return out;
    }
    let mut k = if key.len() > BLOCK_SIZE {
        nested_hash(parents, key).to_vec()
    } else {
        key.to_vec()
    };
    k.resize(BLOCK_SIZE, 0);
    let mut inner: Vec<u8> = k.iter().map(|b| b ^ 0x36).collect();
    inner.extend_from_slice(msg);
    let inner = nested_hash(parents, &inner);
    let mut outer: Vec<u8> = k.iter().map(|b| b ^ 0x5c).collect();
    outer.extend_from_slice(&inner);
    nested_hash(parents, &outer)
}

pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
    let mut salts = Vec::with_capacity(path.len() + 1);
    salts.push(SALT_KDF);
    salts.extend_from_slice(path);
    nested_hash(&salts, key)
}

pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&kdf(key, path)[..16]);
    out
}

pub fn kdf12(key: &[u8], path: &[&[u8]]) -> [u8; 12] {
    let mut out = [0u8; 12];
    out.copy_from_slice(&kdf(key, path)[..12]);
    out
}

/// `AES(kdf16(cmd_key), time | rand(4) | crc32)`
pub fn create_auth_id(cmd_key: &[u8], time: i64) -> io::Result<[u8; 16]> {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&time.to_be_bytes());
    random_fill(&mut buf[8..12]);
    let crc = crc32fast::hash(&buf[..12]);
    buf[12..].copy_from_slice(&crc.to_be_bytes());
    let cipher = Aes128::new_from_slice(&kdf16(cmd_key, &[SALT_AUTH_ID_KEY]))
        .map_err(|_| invalid_data("bad auth id key"))?;
    cipher.encrypt_block(aes::Block::from_mut_slice(&mut buf));
    Ok(buf)
}

fn aes_gcm(key: &[u8]) -> io::Result<AeadCipher> {
    AeadCipher::new(AeadKind::Aes128Gcm, key)
}

/// `auth_id | sealed(len) | nonce | sealed(header)`
pub fn seal_header(cmd_key: &[u8], header: &[u8], time: i64) -> io::Result<Vec<u8>> {
    let auth_id = create_auth_id(cmd_key, time)?;
    let mut nonce = [0u8; 8];
    random_fill(&mut nonce);
    let path_len_key: [&[u8]; 3] = [SALT_HEADER_LEN_KEY, &auth_id, &nonce];
    let path_len_iv: [&[u8]; 3] = [SALT_HEADER_LEN_IV, &auth_id, &nonce];
    let path_key: [&[u8]; 3] = [SALT_HEADER_KEY, &auth_id, &nonce];
    let path_iv: [&[u8]; 3] = [SALT_HEADER_IV, &auth_id, &nonce];

    let len = (header.len() as u16).to_be_bytes();
    let sealed_len = aes_gcm(&kdf16(cmd_key, &path_len_key))?.seal_aad(
        &kdf12(cmd_key, &path_len_iv),
        &len,
        &auth_id,
    )?;
    let sealed_header = aes_gcm(&kdf16(cmd_key, &path_key))?.seal_aad(
        &kdf12(cmd_key, &path_iv),
        header,
        &auth_id,
    )?;

    let mut out = Vec::with_capacity(16 + sealed_len.len() + 8 + sealed_header.len());
    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed_header);
    Ok(out)
}

pub fn open_response_len(key: &[u8], iv: &[u8], sealed: &[u8]) -> io::Result<usize> {
    let plain = aes_gcm(&kdf16(key, &[SALT_RESP_LEN_KEY]))?
        .open(&kdf12(iv, &[SALT_RESP_LEN_IV]), sealed)?;
    if plain.len() != 2 {
        return Err(invalid_data("vmess: bad response length"));
    }
    Ok(u16::from_be_bytes([plain[0], plain[1]]) as usize)
}

pub fn open_response_header(key: &[u8], iv: &[u8], sealed: &[u8]) -> io::Result<Vec<u8>> {
    aes_gcm(&kdf16(key, &[SALT_RESP_KEY]))?.open(&kdf12(iv, &[SALT_RESP_IV]), sealed)
}

#[cfg(test)]
pub(crate) fn seal_response(key: &[u8], iv: &[u8], header: &[u8]) -> Vec<u8> {
    let len = (header.len() as u16).to_be_bytes();
    let mut out = aes_gcm(&kdf16(key, &[SALT_RESP_LEN_KEY]))
        .unwrap()
        .seal(&kdf12(iv, &[SALT_RESP_LEN_IV]), &len)
        .unwrap();
    out.extend(
        aes_gcm(&kdf16(key, &[SALT_RESP_KEY]))
            .unwrap()
            .seal(&kdf12(iv, &[SALT_RESP_IV]), header)
            .unwrap(),
    );
    out
}

/// Server side of `seal_header`.
#[cfg(test)]
pub(crate) fn open_header(cmd_key: &[u8], sealed: &[u8]) -> Vec<u8> {
    let auth_id = &sealed[..16];
    let nonce = &sealed[34..42];
    let path_len_key: [&[u8]; 3] = [SALT_HEADER_LEN_KEY, auth_id, nonce];
    let path_len_iv: [&[u8]; 3] = [SALT_HEADER_LEN_IV, auth_id, nonce];
    let len = aes_gcm(&kdf16(cmd_key, &path_len_key))
        .unwrap()
        .open_aad(&kdf12(cmd_key, &path_len_iv), &sealed[16..34], auth_id)
        .unwrap();
    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
    let path_key: [&[u8]; 3] = [SALT_HEADER_KEY, auth_id, nonce];
    let path_iv: [&[u8]; 3] = [SALT_HEADER_IV, auth_id, nonce];
    aes_gcm(&kdf16(cmd_key, &path_key))
        .unwrap()
        .open_aad(&kdf12(cmd_key, &path_iv), &sealed[42..42 + len + 16], auth_id)
        .unwrap()
}
