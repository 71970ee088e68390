//! Core error types.

use thiserror::Error;

/// Errors produced by identity and address handling.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Multiaddress could not be parsed or has a disallowed shape.
    #[error("invalid multiaddr {addr}: {reason}")]
    BadAddr { addr: String, reason: String },

    /// Key material could not be decoded.
    #[error("bad key encoding: {0}")]
    BadKeyEncoding(String),

    /// Signature did not parse or did not verify.
    #[error("signature invalid")]
    SignatureInvalid,

    /// Peer ID bytes are not a valid multihash.
    #[error("bad peer id: {0}")]
    BadPeerId(String),

    /// Multihash bytes are malformed.
    #[error("bad multihash: {0}")]
    BadMultihash(String),
}

impl CoreError {
    pub(crate) fn bad_addr(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::BadAddr {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
