//! Error types shared by the core wire/path primitives.

/// Errors that can occur while decoding or validating a [`crate::packet::E2ePacket`]
/// or cookie/keystream material.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("wire decode failed: {0}")]
    Decode(#[from] n4_wire::DecoderError),

    #[error("cookie must be exactly 32 bytes, got {0}")]
    BadCookieLength(usize),

    #[error("nonce must be exactly 16 bytes, got {0}")]
    BadNonceLength(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
