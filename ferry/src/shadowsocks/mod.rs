//! Shadowsocks cipher layer: method registry, key derivation, and the
//! encrypted stream wrapper.
//!
//! Both families present plaintext through `AsyncStream`; the wire side
//! carries the method's IV/salt prefix and, for AEAD, the two-chunk
//! length/payload framing.

mod cipher;
mod key;
mod stream;

pub use cipher::{CipherKind, StreamDecryptor, StreamEncryptor};
pub use key::{derive_subkey, evp_bytes_to_key};
pub use stream::ShadowsocksStream;

use crate::error::{Error, Result};
use crate::network::async_stream::AsyncStream;

/// Registry lookup: wrap `conn` so reads and writes pass through the cipher
/// selected by `method` with a key derived from `password`.
pub fn wrap(method: &str, password: &str, conn: Box<dyn AsyncStream>) -> Result<Box<dyn AsyncStream>> {
    let kind = CipherKind::from_method(method)?;
    let key = evp_bytes_to_key(password, kind.key_len());
    Ok(Box::new(ShadowsocksStream::new(conn, kind, key)))
}

/// Validate a method name at configuration time.
pub fn check_method(method: &str) -> Result<()> {
    CipherKind::from_method(method).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_is_rejected() {
        let err = CipherKind::from_method("rc4-md5").unwrap_err();
        assert!(matches!(err, Error::UnsupportedCipher(_)));
    }
}
