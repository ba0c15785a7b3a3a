//! Crate-wide error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unsupported cipher method: {0}")]
    UnsupportedCipher(String),

    #[error("cipher authentication failure")]
    AuthFailure,

    #[error("truncated cipher frame")]
    TruncatedFrame,

    #[error("dns resolution failed for {0}")]
    DnsFailure(String),

    #[error("no rule matched {0}")]
    NoRule(String),

    #[error("connection rejected by policy")]
    Rejected,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("internal panic: {0}")]
    InternalPanic(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed payload carried inside io errors raised by cipher-wrapped streams,
/// so connection teardown can classify them without string inspection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherStreamError {
    #[error("cipher authentication failure")]
    AuthFailure,
    #[error("truncated cipher frame")]
    TruncatedFrame,
}

impl Error {
    /// Whether the failure was a policy decision rather than a transport fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected)
    }

    /// Classify an io error that ended a forwarded connection, surfacing
    /// cipher failures under their own kinds.
    pub fn from_connection(e: std::io::Error) -> Error {
        if let Some(inner) = e.get_ref() {
            if let Some(cipher) = inner.downcast_ref::<CipherStreamError>() {
                return match cipher {
                    CipherStreamError::AuthFailure => Error::AuthFailure,
                    CipherStreamError::TruncatedFrame => Error::TruncatedFrame,
                };
            }
        }
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_payloads_map_to_their_own_kinds() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, CipherStreamError::AuthFailure);
        assert!(matches!(Error::from_connection(io), Error::AuthFailure));

        let io = std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            CipherStreamError::TruncatedFrame,
        );
        assert!(matches!(Error::from_connection(io), Error::TruncatedFrame));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        assert!(matches!(Error::from_connection(io), Error::Io(_)));
    }
}
