//! Key derivation.

use aws_lc_rs::hkdf::{self, Salt};
use digest::Digest;
use md5::Md5;

/// Per-direction AEAD subkey info string, fixed by the Shadowsocks spec.
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Password to master key, OpenSSL EVP_BytesToKey style: iterated MD5 where
/// each block hashes the previous block concatenated with the password.
/// Must stay bit-exact for interoperability with other implementations.
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

struct SubkeyLen(usize);

impl hkdf::KeyType for SubkeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Master key + session salt to per-direction subkey via HKDF-SHA1.
pub fn derive_subkey(master_key: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
    let salt = Salt::new(hkdf::HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt);
    let prk = salt.extract(master_key);
    let okm = prk
        .expand(&[SUBKEY_INFO], SubkeyLen(len))
        .expect("subkey length fits the hash output bound");
    let mut subkey = vec![0u8; len];
    okm.fill(&mut subkey)
        .expect("subkey length fits the hash output bound");
    subkey
}
