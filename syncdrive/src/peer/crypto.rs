use std::io::Write;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use flate2::{write::ZlibDecoder, write::ZlibEncoder, Compression};
use rand::RngCore;
use scrypt::Params;
use super::{PeerError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

// scrypt cost parameters: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data)?;
    decoder.finish()
}

fn derive_key(psk: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params =
        Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN).map_err(|_| PeerError::Crypto)?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(psk, salt, &params, &mut key).map_err(|_| PeerError::Crypto)?;
    Ok(key)
}

// Sealed record: salt || nonce || ciphertext (tag appended). Salt and
// nonce are fresh per block, so the derived key is never reused across
// nonces.
pub fn seal(plain: &[u8], psk: &[u8]) -> Result<Vec<u8>> {

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(psk, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| PeerError::Crypto)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| PeerError::Crypto)?;

    let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(sealed: &[u8], psk: &[u8]) -> Result<Vec<u8>> {

    if sealed.len() < SALT_LEN + NONCE_LEN {
        return Err(PeerError::Crypto);
    }
    let (salt, rest) = sealed.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(psk, salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| PeerError::Crypto)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| PeerError::Crypto)
}
