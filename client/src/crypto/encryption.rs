//! # AES-256-CBC Encryption + HMAC-SHA256
//!
//! The SPI envelope is encrypt-then-MAC:
//!
//! 1. The serialized message JSON is encrypted with AES-256-CBC, PKCS#7
//!    padding, and an all-zero IV. The ciphertext travels as uppercase hex.
//! 2. An HMAC-SHA256 is computed with the authentication key over the
//!    **hex text** of the ciphertext (not the raw bytes; the terminal signs
//!    what it puts on the wire), also as uppercase hex.
//!
//! ## About that zero IV
//!
//! Yes, it's fixed. It is a protocol constant, and the keys it is used with
//! are replaced on every pairing and every key rotation. Changing it here
//! would simply make every frame undecryptable by the terminal.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::{AES_IV, SESSION_KEY_LENGTH};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Errors from the symmetric layer.
///
/// Deliberately coarse: "wrong key" and "corrupted ciphertext" look the same
/// from the outside, and that is how it should stay.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid hex encoding")]
    InvalidHex,

    #[error("invalid key length: expected {SESSION_KEY_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("hmac key rejected")]
    HmacKey,
}

/// Encrypt `plaintext` with AES-256-CBC / PKCS#7 under the protocol IV.
pub fn aes_encrypt(key: &[u8; SESSION_KEY_LENGTH], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), (&AES_IV).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt AES-256-CBC / PKCS#7 ciphertext under the protocol IV.
///
/// Fails on bad padding, which in practice means wrong key or tampering.
pub fn aes_decrypt(
    key: &[u8; SESSION_KEY_LENGTH],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), (&AES_IV).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypt a UTF-8 payload and render the ciphertext as uppercase hex.
pub fn encrypt_to_hex(key: &[u8; SESSION_KEY_LENGTH], plaintext: &str) -> String {
    hex::encode_upper(aes_encrypt(key, plaintext.as_bytes()))
}

/// Inverse of [`encrypt_to_hex`]. Accepts either hex case.
pub fn decrypt_from_hex(
    key: &[u8; SESSION_KEY_LENGTH],
    ciphertext_hex: &str,
) -> Result<String, CryptoError> {
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CryptoError::InvalidHex)?;
    let plaintext = aes_decrypt(key, &ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

/// HMAC-SHA256 of `message` under `key`, as uppercase hex.
pub fn hmac_signature(key: &[u8; SESSION_KEY_LENGTH], message: &str) -> Result<String, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::HmacKey)?;
    mac.update(message.as_bytes());
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC (either case) over `message`.
///
/// Malformed hex is simply a failed verification.
pub fn verify_hmac(key: &[u8; SESSION_KEY_LENGTH], message: &str, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENC_KEY: [u8; 32] = [0x11; 32];
    const HMAC_KEY: [u8; 32] = [0x22; 32];

    const PLAINTEXT: &str = r#"{"message":{"id":"ping1","event":"pong","data":null,"datetime":"2026-10-19T12:00:00.000","pos_counter":3,"conn_id":"c1"}}"#;

    // Produced independently with a reference AES-CBC/HMAC implementation.
    const CIPHERTEXT_HEX: &str = "93838A6E3770893349D8EA480C6D8A53DC0A2EFE17ACFB66029DB457A059CB6AE4988DB777E400C1F23561BDA2DCE011C0D8B68A20975918A3D36880B23670C7E7364B9E1D02AB44EE73B0E7420F73E120F07962620141F7DE0A89E82BD7AB5B8C757E5D8FFBEB6783E0E437D3D8754A659FB7EB57E75009BD0296A95AF356AD";
    const HMAC_HEX: &str = "D34AD3CCEEA01FEC38507420149B49E649D7CBD0A32AD9428752CB61090D6BBA";

    #[test]
    fn encrypt_matches_reference_vector() {
        assert_eq!(encrypt_to_hex(&ENC_KEY, PLAINTEXT), CIPHERTEXT_HEX);
    }

    #[test]
    fn hmac_matches_reference_vector() {
        assert_eq!(hmac_signature(&HMAC_KEY, CIPHERTEXT_HEX).unwrap(), HMAC_HEX);
    }

    #[test]
    fn decrypt_reference_vector() {
        assert_eq!(decrypt_from_hex(&ENC_KEY, CIPHERTEXT_HEX).unwrap(), PLAINTEXT);
        // Lowercase hex from a sloppy peer still decodes.
        let lower = CIPHERTEXT_HEX.to_lowercase();
        assert_eq!(decrypt_from_hex(&ENC_KEY, &lower).unwrap(), PLAINTEXT);
    }

    #[test]
    fn padding_always_adds_a_block_fragment() {
        // PKCS#7 pads even block-aligned input with a full block.
        assert_eq!(aes_encrypt(&ENC_KEY, &[0u8; 16]).len(), 32);
        assert_eq!(aes_encrypt(&ENC_KEY, b"").len(), 16);
        assert_eq!(aes_encrypt(&ENC_KEY, b"hello").len(), 16);
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let sealed = aes_encrypt(&ENC_KEY, b"purchase 1981 cents");
        let mut wrong = ENC_KEY;
        wrong[0] ^= 0xFF;
        // CBC has no integrity of its own; a wrong key either trips the
        // padding check or yields garbage. Never the original plaintext.
        match aes_decrypt(&wrong, &sealed) {
            Ok(garbage) => assert_ne!(garbage, b"purchase 1981 cents"),
            Err(e) => assert_eq!(e, CryptoError::DecryptFailed),
        }
    }

    #[test]
    fn verify_hmac_accepts_either_case() {
        assert!(verify_hmac(&HMAC_KEY, CIPHERTEXT_HEX, HMAC_HEX));
        assert!(verify_hmac(&HMAC_KEY, CIPHERTEXT_HEX, &HMAC_HEX.to_lowercase()));
    }

    #[test]
    fn verify_hmac_rejects_tampering() {
        let mut bad_sig = HMAC_HEX.to_string();
        bad_sig.replace_range(0..1, "E");
        assert!(!verify_hmac(&HMAC_KEY, CIPHERTEXT_HEX, &bad_sig));

        let mut bad_msg = CIPHERTEXT_HEX.to_string();
        bad_msg.replace_range(10..11, "0");
        assert!(!verify_hmac(&HMAC_KEY, &bad_msg, HMAC_HEX));

        assert!(!verify_hmac(&HMAC_KEY, CIPHERTEXT_HEX, "not-hex"));
    }

    #[test]
    fn invalid_hex_is_reported() {
        assert_eq!(
            decrypt_from_hex(&ENC_KEY, "zz").unwrap_err(),
            CryptoError::InvalidHex
        );
    }
}
