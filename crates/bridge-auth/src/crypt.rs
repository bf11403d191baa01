//! Hashing and symmetric crypto used by the handshake

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use blake2::{digest::consts::U32, Blake2b};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type Blake2b256 = Blake2b<U32>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from blob encryption
#[derive(Error, Debug)]
pub enum CryptError {
    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("AEAD operation failed")]
    Aead,

    #[error("Invalid MAC key")]
    InvalidKey,
}

/// Lowercase hex MD5 of `s`
pub fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// Raw Blake2b-256 digest of `s`
pub fn blake2b_256(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b256::digest(s.as_bytes()));
    out
}

/// Hash applied to a stored secret before comparing it to the 32 bytes an
/// agent sends during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHash {
    /// Legacy handshake: 32 ASCII hex characters of MD5
    Md5,
    /// Current handshake: 32 raw bytes of Blake2b-256
    Blake2b,
}

impl CredentialHash {
    /// Hash `secret` into the 32-byte form sent on the wire
    ///
    /// # Example
    /// ```
    /// use bridge_auth::CredentialHash;
    ///
    /// assert_eq!(CredentialHash::Md5.digest("abc").len(), 32);
    /// assert_eq!(CredentialHash::Blake2b.digest("abc").len(), 32);
    /// ```
    pub fn digest(&self, secret: &str) -> Vec<u8> {
        match self {
            CredentialHash::Md5 => md5_hex(secret).into_bytes(),
            CredentialHash::Blake2b => blake2b_256(secret).to_vec(),
        }
    }
}

fn handshake_mac(key: &str, timestamp: i64, pieces: &[&[u8]]) -> Result<HmacSha256, CryptError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| CryptError::InvalidKey)?;
    mac.update(&timestamp.to_be_bytes());
    for piece in pieces {
        mac.update(piece);
    }
    Ok(mac)
}

/// HMAC-SHA256 over the big-endian timestamp followed by `pieces`
pub fn compute_hmac(key: &str, timestamp: i64, pieces: &[&[u8]]) -> Result<[u8; 32], CryptError> {
    let tag = handshake_mac(key, timestamp, pieces)?.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Constant-time check of `tag` against [`compute_hmac`]
pub fn verify_hmac(key: &str, timestamp: i64, pieces: &[&[u8]], tag: &[u8]) -> bool {
    match handshake_mac(key, timestamp, pieces) {
        Ok(mac) => mac.verify_slice(tag).is_ok(),
        Err(_) => false,
    }
}

fn cipher_for(key: &str) -> Aes256Gcm {
    let key = Sha256::digest(key.as_bytes());
    Aes256Gcm::new(&key)
}

/// AES-256-GCM with key SHA-256(`key`); output is `nonce || ciphertext`.
///
/// An empty key leaves `data` unchanged.
pub fn encrypt_bytes(data: &[u8], key: &str) -> Result<Vec<u8>, CryptError> {
    if key.is_empty() {
        return Ok(data.to_vec());
    }

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher_for(key)
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|_| CryptError::Aead)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_bytes`]
pub fn decrypt_bytes(data: &[u8], key: &str) -> Result<Vec<u8>, CryptError> {
    if key.is_empty() {
        return Ok(data.to_vec());
    }
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptError::TooShort(data.len()));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher_for(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptError::Aead)
}

/// Random alphanumeric string, used for freshly minted client secrets
pub fn random_key(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
