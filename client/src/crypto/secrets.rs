//! Session key pair produced by pairing and replaced by rotation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::encryption::CryptoError;
use super::hash::sha256;
use crate::config::SESSION_KEY_LENGTH;

/// The encryption key and the authentication key shared with the terminal.
///
/// Immutable. Pairing and key rotation build a new value and swap it in
/// whole. The embedding application persists it via [`Secrets::to_hex`] and
/// hands it back on startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    enc_key: [u8; SESSION_KEY_LENGTH],
    hmac_key: [u8; SESSION_KEY_LENGTH],
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("enc_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

impl Secrets {
    pub fn new(enc_key: [u8; SESSION_KEY_LENGTH], hmac_key: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self { enc_key, hmac_key }
    }

    /// Restore from the hex pair written by [`Secrets::to_hex`]. Either case.
    pub fn from_hex(enc_key_hex: &str, hmac_key_hex: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            enc_key: decode_key(enc_key_hex)?,
            hmac_key: decode_key(hmac_key_hex)?,
        })
    }

    /// `(enc_key, hmac_key)` as uppercase hex.
    pub fn to_hex(&self) -> (String, String) {
        (hex::encode_upper(self.enc_key), hex::encode_upper(self.hmac_key))
    }

    pub fn enc_key(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.enc_key
    }

    pub fn hmac_key(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.hmac_key
    }

    /// Next generation of keys: each key is replaced by its own SHA-256.
    pub fn rotate(&self) -> Self {
        Self {
            enc_key: sha256(&self.enc_key),
            hmac_key: sha256(&self.hmac_key),
        }
    }
}

fn decode_key(key_hex: &str) -> Result<[u8; SESSION_KEY_LENGTH], CryptoError> {
    let bytes = hex::decode(key_hex.trim()).map_err(|_| CryptoError::InvalidHex)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(len))
}

#[derive(Serialize, Deserialize)]
struct SecretsHex {
    enc_key: String,
    hmac_key: String,
}

impl Serialize for Secrets {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (enc_key, hmac_key) = self.to_hex();
        SecretsHex { enc_key, hmac_key }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Secrets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = SecretsHex::deserialize(deserializer)?;
        Secrets::from_hex(&raw.enc_key, &raw.hmac_key).map_err(serde::de::Error::custom)
    }
}
