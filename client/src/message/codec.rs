//! # Envelope Codec
//!
//! Turns [`Message`]s into wire frames and back.
//!
//! ```text
//! unencrypted: {"message": {"id", "event", "data", "datetime", "pos_counter", "conn_id", "pos_id"}}
//! encrypted:   {"enc": HEX(AES(json({"message": ...}))), "hmac": HEX(HMAC(enc)), "pos_id"}
//! ```
//!
//! Encoding can fail (no keys for a message that needs them). Decoding never
//! does: every problem becomes a sentinel [`Event`] so the dispatch loop keeps
//! running and the controller decides what to log.

use chrono::{Local, TimeDelta};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Event, Message};
use crate::config::DATETIME_FORMAT;
use crate::crypto::encryption::{decrypt_from_hex, encrypt_to_hex, hmac_signature, verify_hmac};
use crate::crypto::{CryptoError, Secrets};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message {0} requires encryption but no secrets are held")]
    MissingSecrets(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Serialize, Deserialize)]
struct PlainEnvelope {
    message: Message,
}

#[derive(Serialize)]
struct SealedEnvelope<'a> {
    enc: &'a str,
    hmac: &'a str,
    pos_id: &'a str,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    message: Option<Message>,
    enc: Option<String>,
    hmac: Option<String>,
}

/// Per-connection stamping state.
///
/// `conn_id` and `pos_counter` belong to one transport connection: a new
/// connection gets a fresh id and the counter starts over.
#[derive(Debug, Clone)]
pub struct MessageStamp {
    pub pos_id: String,
    pub server_time_delta: TimeDelta,
    conn_id: String,
    pos_counter: u64,
}

impl MessageStamp {
    pub fn new(pos_id: impl Into<String>) -> Self {
        Self {
            pos_id: pos_id.into(),
            server_time_delta: TimeDelta::zero(),
            conn_id: uuid::Uuid::new_v4().to_string(),
            pos_counter: 0,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn pos_counter(&self) -> u64 {
        self.pos_counter
    }

    /// Start a new connection instance.
    pub fn reset_connection(&mut self) {
        self.conn_id = uuid::Uuid::new_v4().to_string();
        self.pos_counter = 0;
    }

    /// Stamp and serialize `msg` for the wire.
    pub fn encode(&mut self, msg: &Message, secrets: Option<&Secrets>) -> Result<String, CodecError> {
        let secrets = match (msg.needs_encryption, secrets) {
            (true, None) => return Err(CodecError::MissingSecrets(msg.id.clone())),
            (true, Some(s)) => Some(s),
            (false, _) => None,
        };

        let adjusted_now = Local::now().naive_local() + self.server_time_delta;
        self.pos_counter += 1;

        let mut stamped = msg.clone();
        stamped.date_time = Some(adjusted_now.format(DATETIME_FORMAT).to_string());
        stamped.pos_counter = self.pos_counter;
        stamped.conn_id = self.conn_id.clone();

        let Some(secrets) = secrets else {
            stamped.pos_id = Some(self.pos_id.clone());
            return Ok(serde_json::to_string(&PlainEnvelope { message: stamped })?);
        };

        stamped.pos_id = None;
        let inner = serde_json::to_string(&PlainEnvelope { message: stamped })?;
        let enc = encrypt_to_hex(secrets.enc_key(), &inner);
        let hmac = hmac_signature(secrets.hmac_key(), &enc)?;
        Ok(serde_json::to_string(&SealedEnvelope {
            enc: &enc,
            hmac: &hmac,
            pos_id: &self.pos_id,
        })?)
    }
}

/// Decode one wire frame. Never fails; see the module docs.
pub fn decode(text: &str, secrets: Option<&Secrets>) -> Message {
    let envelope: IncomingEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(error = %e, "frame is not a valid envelope");
            return Message::sentinel(Event::Unparseable, text);
        }
    };

    if let Some(message) = envelope.message {
        return message;
    }

    let (Some(enc), Some(hmac)) = (envelope.enc, envelope.hmac) else {
        return Message::sentinel(Event::Unparseable, text);
    };

    let Some(secrets) = secrets else {
        return Message::sentinel(Event::NoSecrets, &enc);
    };

    if !verify_hmac(secrets.hmac_key(), &enc, &hmac) {
        warn!("incoming frame failed hmac verification");
        return Message::sentinel(Event::InvalidHmacSignature, &enc);
    }

    let decrypted = match decrypt_from_hex(secrets.enc_key(), &enc) {
        Ok(plain) => plain,
        Err(e) => {
            warn!(error = %e, "authenticated frame did not decrypt");
            return Message::sentinel(Event::Unparseable, &enc);
        }
    };

    match serde_json::from_str::<PlainEnvelope>(&decrypted) {
        Ok(PlainEnvelope { mut message }) => {
            message.incoming_hmac = Some(hmac);
            message.decrypted_json = Some(decrypted);
            message
        }
        Err(e) => {
            debug!(error = %e, "decrypted payload is not a message");
            Message::sentinel(Event::Unparseable, &decrypted)
        }
    }
}
