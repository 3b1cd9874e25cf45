//! # Diffie-Hellman Pairing Exchange
//!
//! Classic finite-field Diffie-Hellman over the 2048-bit MODP group from
//! RFC 3526 (group 14), generator 2. Pairing runs two independent exchanges,
//! one per session key.
//!
//! ## Flow (POS side)
//!
//! 1. The terminal sends its public value `A` as a hex string.
//! 2. We pick a private exponent uniformly in `[2, p-2]` and publish
//!    `B = g^priv mod p`.
//! 3. Both sides compute `S = A^priv mod p` and derive the session key as
//!    `SHA-256` of the 256-byte big-endian rendering of `S`.
//!
//! ## Hex Quirks
//!
//! The terminal renders `S` as 512 uppercase hex digits (zero-padded) before
//! hashing the decoded bytes. Left-padding the big-endian bytes to 256 is the
//! same thing. Incoming values get a `0` nibble prepended before parsing so a
//! leading `8`..`F` digit is never read as a sign.

use std::sync::OnceLock;

use num_bigint::{BigUint, RandBigInt};
use thiserror::Error;

use super::hash::sha256;
use crate::config::{DH_SECRET_HEX_DIGITS, SESSION_KEY_LENGTH};

/// Bytes in a group element.
const GROUP_BYTES: usize = DH_SECRET_HEX_DIGITS / 2;

const GENERATOR: u32 = 2;

/// RFC 3526 group 14 prime, big-endian.
const MODP_2048_PRIME: [u8; GROUP_BYTES] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34,
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74,
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37,
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6,
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6,
    0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D, 0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63, 0xBF, 0x05,
    0x98, 0xDA, 0x48, 0x36, 0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8, 0xFD, 0x24, 0xCF, 0x5F,
    0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62, 0xF3, 0x56, 0x20, 0x85, 0x52, 0xBB,
    0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D, 0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04,
    0xF1, 0x74, 0x6C, 0x08, 0xCA, 0x18, 0x21, 0x7C, 0x32, 0x90, 0x5E, 0x46, 0x2E, 0x36, 0xCE, 0x3B,
    0xE3, 0x9E, 0x77, 0x2C, 0x18, 0x0E, 0x86, 0x03, 0x9B, 0x27, 0x83, 0xA2, 0xEC, 0x07, 0xA2, 0x8F,
    0xB5, 0xC5, 0x5D, 0xF0, 0x6F, 0x4C, 0x52, 0xC9, 0xDE, 0x2B, 0xCB, 0xF6, 0x95, 0x58, 0x17, 0x18,
    0x39, 0x95, 0x49, 0x7C, 0xEA, 0x95, 0x6A, 0xE5, 0x15, 0xD2, 0x26, 0x18, 0x98, 0xFA, 0x05, 0x10,
    0x15, 0x72, 0x8E, 0x5A, 0x8A, 0xAC, 0xAA, 0x68, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

fn prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| BigUint::from_bytes_be(&MODP_2048_PRIME))
}

/// Errors in the pairing key exchange.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DhError {
    #[error("peer public value is not valid hex")]
    InvalidHex,

    #[error("peer public value is outside [2, p-2]")]
    OutOfRange,

    #[error("private exponent is outside [2, p-2]")]
    InvalidPrivateKey,
}

/// One side of a single DH exchange.
///
/// The private exponent never leaves this struct and is not printed by
/// `Debug`.
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public_hex())
            .finish()
    }
}

impl DhKeyPair {
    /// Fresh key pair with a private exponent from the thread RNG.
    pub fn generate() -> Self {
        let p = prime();
        let low = BigUint::from(2u32);
        // gen_biguint_range is half-open, so the upper bound p-1 yields at most p-2.
        let high = p - 1u32;
        let private = rand::thread_rng().gen_biguint_range(&low, &high);
        let public = BigUint::from(GENERATOR).modpow(&private, p);
        Self { private, public }
    }

    /// Key pair from a known exponent. Used by tests and by simulators that
    /// play the terminal's half of the exchange.
    pub fn from_private(private: BigUint) -> Result<Self, DhError> {
        if !in_range(&private) {
            return Err(DhError::InvalidPrivateKey);
        }
        let public = BigUint::from(GENERATOR).modpow(&private, prime());
        Ok(Self { private, public })
    }

    /// Our public value as uppercase hex, no padding.
    pub fn public_hex(&self) -> String {
        format!("{:X}", self.public)
    }

    /// `peer^private mod p`.
    pub fn shared_secret(&self, peer_public_hex: &str) -> Result<BigUint, DhError> {
        let peer = parse_public_value(peer_public_hex)?;
        Ok(peer.modpow(&self.private, prime()))
    }

    /// Shared secret run through the session-key derivation.
    pub fn derive_session_key(
        &self,
        peer_public_hex: &str,
    ) -> Result<[u8; SESSION_KEY_LENGTH], DhError> {
        Ok(session_key_from_shared(&self.shared_secret(peer_public_hex)?))
    }
}

fn in_range(value: &BigUint) -> bool {
    let p = prime();
    *value >= BigUint::from(2u32) && *value <= p - 2u32
}

/// Parse a peer public value, rejecting anything outside `[2, p-2]`.
pub fn parse_public_value(hex_value: &str) -> Result<BigUint, DhError> {
    let trimmed = hex_value.trim();
    if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DhError::InvalidHex);
    }
    let prefixed = format!("0{trimmed}");
    let value = BigUint::parse_bytes(prefixed.as_bytes(), 16).ok_or(DhError::InvalidHex)?;
    if !in_range(&value) {
        return Err(DhError::OutOfRange);
    }
    Ok(value)
}

/// `SHA-256` over the 256-byte zero-padded big-endian rendering of `shared`.
///
/// Values wider than the group (impossible after reduction mod p, but the
/// terminal's rendering tolerates it) keep their low 256 bytes.
pub fn session_key_from_shared(shared: &BigUint) -> [u8; SESSION_KEY_LENGTH] {
    let raw = shared.to_bytes_be();
    let mut padded = [0u8; GROUP_BYTES];
    if raw.len() >= GROUP_BYTES {
        padded.copy_from_slice(&raw[raw.len() - GROUP_BYTES..]);
    } else {
        padded[GROUP_BYTES - raw.len()..].copy_from_slice(&raw);
    }
    sha256(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prime_is_2048_bits() {
        assert_eq!(prime().bits(), 2048);
        assert_eq!(MODP_2048_PRIME[8], 0xC9);
        assert_eq!(MODP_2048_PRIME[GROUP_BYTES - 9], 0x68);
    }

    #[test]
    fn derivation_regression_vectors() {
        // 2^2000 + 12345 renders as 501 hex digits and gets padded to 512.
        let big = (BigUint::from(1u32) << 2000usize) + BigUint::from(12345u32);
        assert_eq!(
            hex::encode_upper(session_key_from_shared(&big)),
            "00637ECFCDB2DA349C2C53AF2ABDA65D9DA7155C26FFEABD4595F50CC8DABABA"
        );
        assert_eq!(
            hex::encode_upper(session_key_from_shared(&BigUint::from(1u32))),
            "408A9E14B19F44EF1A763548B07EAE4FD4DD3525B1595C9D103BCA15310BAA29"
        );
    }

    #[test]
    fn small_exponent_exchange_is_deterministic() {
        let pos = DhKeyPair::from_private(BigUint::from(7u32)).unwrap();
        let terminal = DhKeyPair::from_private(BigUint::from(11u32)).unwrap();
        assert_eq!(pos.public_hex(), "80");
        assert_eq!(terminal.public_hex(), "800");

        let expected = "389B9D05F3D64C63A51F153AAA277AB9B8F152359C7CDB4852C2D88E8F40C250";
        let k1 = pos.derive_session_key(&terminal.public_hex()).unwrap();
        let k2 = terminal.derive_session_key(&pos.public_hex()).unwrap();
        assert_eq!(hex::encode_upper(k1), expected);
        assert_eq!(k1, k2);
    }

    #[test]
    fn random_exchange_is_symmetric() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        assert_eq!(
            a.shared_secret(&b.public_hex()).unwrap(),
            b.shared_secret(&a.public_hex()).unwrap()
        );
    }

    #[test]
    fn high_nibble_is_not_a_sign() {
        // A leading F digit must still parse as a large positive number.
        let v = parse_public_value("F0").unwrap();
        assert_eq!(v, BigUint::from(0xF0u32));
    }

    #[test]
    fn rejects_degenerate_peer_values() {
        assert_eq!(parse_public_value("1"), Err(DhError::OutOfRange));
        assert_eq!(parse_public_value(""), Err(DhError::OutOfRange));
        let p_minus_1 = format!("{:X}", prime() - 1u32);
        assert_eq!(parse_public_value(&p_minus_1), Err(DhError::OutOfRange));
        assert_eq!(parse_public_value("12G4"), Err(DhError::InvalidHex));
        assert_eq!(parse_public_value("1_000"), Err(DhError::InvalidHex));
    }

    #[test]
    fn private_exponent_is_range_checked() {
        assert_eq!(
            DhKeyPair::from_private(BigUint::from(1u32)).unwrap_err(),
            DhError::InvalidPrivateKey
        );
    }

    #[test]
    fn debug_hides_private_exponent() {
        let kp = DhKeyPair::from_private(BigUint::from(7u32)).unwrap();
        let shown = format!("{kp:?}");
        assert!(shown.contains("[REDACTED]"));
        assert!(shown.contains("\"80\""));
    }
}
