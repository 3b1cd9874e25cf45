//! Crate-level error type.
//!
//! Each module defines its own error enum. [`SpiError`] gathers them for
//! the few places that surface errors to the embedder (construction and
//! `start`). Everything else degrades to a state change and a log line.

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::{CryptoError, DhError};
use crate::message::CodecError;
use crate::session::pairing::PairingError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SpiError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("key exchange: {0}")]
    Dh(#[from] DhError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine has been disposed")]
    Disposed,
}
