//! Cipher method registry and the per-direction cipher state machines.

use aes::{Aes128, Aes192, Aes256};
use aws_lc_rs::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::ChaCha20;
use chacha20::cipher::StreamCipher;

use crate::error::{CipherStreamError, Error, Result};

pub const AEAD_TAG_LEN: usize = 16;
pub const AEAD_NONCE_LEN: usize = 12;

/// Maximum plaintext bytes per AEAD record; the length field is masked to
/// 14 bits on the wire.
pub const AEAD_MAX_PAYLOAD: usize = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    ChaCha20Ietf,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
}

impl CipherKind {
    pub fn from_method(method: &str) -> Result<CipherKind> {
        match method.to_ascii_lowercase().as_str() {
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "chacha20-ietf" => Ok(CipherKind::ChaCha20Ietf),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20IetfPoly1305),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::ChaCha20Ietf => "chacha20-ietf",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cfb | CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb
            | CipherKind::ChaCha20Ietf
            | CipherKind::Aes256Gcm
            | CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Stream IV length, or AEAD salt length.
    pub fn prefix_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cfb | CipherKind::Aes192Cfb | CipherKind::Aes256Cfb => 16,
            CipherKind::ChaCha20Ietf => 12,
            // AEAD salts are as long as the key.
            CipherKind::Aes128Gcm | CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305 => {
                self.key_len()
            }
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherKind::Aes128Gcm | CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305
        )
    }

    fn aead_algorithm(&self) -> &'static aead::Algorithm {
        match self {
            CipherKind::Aes128Gcm => &aead::AES_128_GCM,
            CipherKind::Aes256Gcm => &aead::AES_256_GCM,
            CipherKind::ChaCha20IetfPoly1305 => &aead::CHACHA20_POLY1305,
            _ => unreachable!("stream ciphers have no AEAD algorithm"),
        }
    }
}

/// Encrypt-direction state for the stream cipher family.
pub enum StreamEncryptor {
    Aes128Cfb(BufEncryptor<Aes128>),
    Aes192Cfb(BufEncryptor<Aes192>),
    Aes256Cfb(BufEncryptor<Aes256>),
    ChaCha20(ChaCha20),
}

impl StreamEncryptor {
    pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> std::io::Result<Self> {
        let invalid =
            |_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad key or iv length");
        Ok(match kind {
            CipherKind::Aes128Cfb => {
                StreamEncryptor::Aes128Cfb(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::Aes192Cfb => {
                StreamEncryptor::Aes192Cfb(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::Aes256Cfb => {
                StreamEncryptor::Aes256Cfb(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::ChaCha20Ietf => {
                StreamEncryptor::ChaCha20(ChaCha20::new_from_slices(key, iv).map_err(invalid)?)
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "aead method in stream state",
                ));
            }
        })
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamEncryptor::Aes128Cfb(c) => c.encrypt(data),
            StreamEncryptor::Aes192Cfb(c) => c.encrypt(data),
            StreamEncryptor::Aes256Cfb(c) => c.encrypt(data),
            StreamEncryptor::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

/// Decrypt-direction state for the stream cipher family.
pub enum StreamDecryptor {
    Aes128Cfb(BufDecryptor<Aes128>),
    Aes192Cfb(BufDecryptor<Aes192>),
    Aes256Cfb(BufDecryptor<Aes256>),
    ChaCha20(ChaCha20),
}

impl StreamDecryptor {
    pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> std::io::Result<Self> {
        let invalid =
            |_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad key or iv length");
        Ok(match kind {
            CipherKind::Aes128Cfb => {
                StreamDecryptor::Aes128Cfb(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::Aes192Cfb => {
                StreamDecryptor::Aes192Cfb(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::Aes256Cfb => {
                StreamDecryptor::Aes256Cfb(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            CipherKind::ChaCha20Ietf => {
                StreamDecryptor::ChaCha20(ChaCha20::new_from_slices(key, iv).map_err(invalid)?)
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "aead method in stream state",
                ));
            }
        })
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamDecryptor::Aes128Cfb(c) => c.decrypt(data),
            StreamDecryptor::Aes192Cfb(c) => c.decrypt(data),
            StreamDecryptor::Aes256Cfb(c) => c.decrypt(data),
            StreamDecryptor::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

/// One AEAD direction: subkey plus the little-endian counter nonce.
pub struct AeadState {
    key: LessSafeKey,
    nonce: [u8; AEAD_NONCE_LEN],
}

impl AeadState {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> std::io::Result<Self> {
        let unbound = UnboundKey::new(kind.aead_algorithm(), subkey)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad subkey length"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce: [0u8; AEAD_NONCE_LEN],
        })
    }

    fn advance_nonce(&mut self) {
        for b in self.nonce.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }

    /// Seal one chunk, appending ciphertext and tag to `out`.
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> std::io::Result<()> {
        let mut data = plaintext.to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(self.nonce),
                Aad::empty(),
                &mut data,
            )
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "aead seal failed"))?;
        self.advance_nonce();
        out.extend_from_slice(&data);
        out.extend_from_slice(tag.as_ref());
        Ok(())
    }

    /// Open one chunk (ciphertext followed by its tag), returning plaintext.
    pub fn open(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut data = chunk.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(self.nonce),
                Aad::empty(),
                &mut data,
            )
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    CipherStreamError::AuthFailure,
                )
            })?
            .len();
        self.advance_nonce();
        data.truncate(plaintext_len);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::key::{derive_subkey, evp_bytes_to_key};

    #[test]
    fn method_lookup_round_trips() {
        for method in [
            "aes-128-cfb",
            "aes-192-cfb",
            "aes-256-cfb",
            "chacha20-ietf",
            "aes-128-gcm",
            "aes-256-gcm",
            "chacha20-ietf-poly1305",
        ] {
            let kind = CipherKind::from_method(method).unwrap();
            assert_eq!(kind.method_name(), method);
            assert_eq!(kind.key_len(), evp_bytes_to_key("pw", kind.key_len()).len());
        }
    }

    #[test]
    fn stream_cipher_round_trips() {
        let kind = CipherKind::Aes256Cfb;
        let key = evp_bytes_to_key("password", kind.key_len());
        let iv = [7u8; 16];

        let mut enc = StreamEncryptor::new(kind, &key, &iv).unwrap();
        let mut dec = StreamDecryptor::new(kind, &key, &iv).unwrap();

        let mut data = b"attack at dawn".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"attack at dawn");
        dec.apply(&mut data);
        assert_eq!(&data, b"attack at dawn");
    }

    #[test]
    fn aead_round_trip_and_tamper_detection() {
        let kind = CipherKind::Aes128Gcm;
        let master = evp_bytes_to_key("p", kind.key_len());
        let salt = [3u8; 16];
        let subkey = derive_subkey(&master, &salt, kind.key_len());

        let mut seal = AeadState::new(kind, &subkey).unwrap();
        let mut sealed = Vec::new();
        seal.seal(b"hello", &mut sealed).unwrap();
        assert_eq!(sealed.len(), 5 + AEAD_TAG_LEN);

        let mut open = AeadState::new(kind, &subkey).unwrap();
        assert_eq!(open.open(&sealed).unwrap(), b"hello");

        let mut tampered = sealed.clone();
        tampered[2] ^= 0x01;
        let mut open = AeadState::new(kind, &subkey).unwrap();
        assert!(open.open(&tampered).is_err());
    }

    #[test]
    fn nonce_increments_little_endian() {
        let kind = CipherKind::ChaCha20IetfPoly1305;
        let subkey = derive_subkey(&evp_bytes_to_key("p", 32), &[0u8; 32], 32);
        let mut state = AeadState::new(kind, &subkey).unwrap();
        for _ in 0..256 {
            state.advance_nonce();
        }
        assert_eq!(state.nonce[0], 0);
        assert_eq!(state.nonce[1], 1);
    }
}
