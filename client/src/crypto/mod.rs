//! # Cryptographic Primitives for SPI
//!
//! Everything the envelope codec and the pairing handshake need, and nothing
//! else:
//!
//! - **AES-256-CBC / PKCS#7** with a fixed zero IV for message payloads.
//! - **HMAC-SHA256** over the hex ciphertext for authentication.
//! - **2048-bit MODP Diffie-Hellman** (RFC 3526 group 14) for pairing.
//! - **SHA-256** for key derivation and key rotation.
//!
//! None of these choices are ours to make. They are what the terminal
//! firmware speaks. Every function here is a thin wrapper around the
//! RustCrypto and `num-bigint` implementations.

pub mod dh;
pub mod encryption;
pub mod hash;
pub mod secrets;

pub use dh::{DhError, DhKeyPair};
pub use encryption::{aes_decrypt, aes_encrypt, hmac_signature, verify_hmac, CryptoError};
pub use hash::sha256;
pub use secrets::Secrets;
