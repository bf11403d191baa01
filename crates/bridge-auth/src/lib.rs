//! Credential hashing, handshake MACs and replay defence for the bridge

pub mod crypt;
pub mod replay;

pub use crypt::{
    blake2b_256, compute_hmac, decrypt_bytes, encrypt_bytes, md5_hex, random_key, verify_hmac,
    CredentialHash, CryptError,
};
pub use replay::ReplayCache;
