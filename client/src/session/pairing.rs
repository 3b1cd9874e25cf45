//! # Pairing
//!
//! The five-step handshake that gives the POS and the terminal a shared pair
//! of keys:
//!
//! ```text
//! POS                                   Terminal
//!  │── pair_request {padding} ─────────────►│
//!  │◄──────────── key_request {enc.A, hmac.A}│
//!  │── key_response {enc.B, hmac.B} ───────►│   both sides derive Secrets
//!  │◄──────────────── key_check (encrypted) │   code = hmac[..6]
//!  │◄─────────────── pair_response {success}│
//! ```
//!
//! Then a human compares the confirmation code on both screens. Pairing only
//! succeeds once the operator has confirmed on the POS *and* the terminal
//! has reported success.

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::CONFIRMATION_CODE_LENGTH;
use crate::crypto::{DhError, DhKeyPair, Secrets};
use crate::message::{Event, Message, RequestIds};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("key_request is missing {0}")]
    MissingField(&'static str),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] DhError),
}

/// Where a pairing attempt stands, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairingFlowState {
    pub message: String,
    pub awaiting_check_from_eftpos: bool,
    pub awaiting_check_from_pos: bool,
    pub confirmation_code: String,
    pub finished: bool,
    pub successful: bool,
}

/// Result of one side confirming the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmProgress {
    /// Not in a state where this confirmation means anything.
    Ignored,
    /// Still waiting for the other side.
    Waiting,
    /// Both sides agree. Pairing is done.
    Complete,
}

impl PairingFlowState {
    pub fn connecting() -> Self {
        Self {
            message: "Connecting...".into(),
            ..Self::default()
        }
    }

    pub fn negotiating(&mut self) {
        self.message = "Negotiating pairing...".into();
    }

    pub fn key_check_received(&mut self, code: String) {
        self.message = format!("Confirm that the following code is showing on the terminal: {code}");
        self.confirmation_code = code;
        self.awaiting_check_from_eftpos = true;
        self.awaiting_check_from_pos = true;
    }

    /// The operator confirmed the code on the POS.
    pub fn pos_confirmed(&mut self) -> ConfirmProgress {
        if self.finished || !self.awaiting_check_from_pos {
            return ConfirmProgress::Ignored;
        }
        self.awaiting_check_from_pos = false;
        if self.awaiting_check_from_eftpos {
            self.message = format!("Click YES on EFTPOS if code is: {}", self.confirmation_code);
            return ConfirmProgress::Waiting;
        }
        ConfirmProgress::Complete
    }

    /// The terminal reported a successful pairing.
    pub fn terminal_confirmed(&mut self) -> ConfirmProgress {
        if self.finished {
            return ConfirmProgress::Ignored;
        }
        self.awaiting_check_from_eftpos = false;
        if self.awaiting_check_from_pos {
            self.message = format!(
                "Confirm that the following code is what the EFTPOS showed: {}",
                self.confirmation_code
            );
            return ConfirmProgress::Waiting;
        }
        ConfirmProgress::Complete
    }

    pub fn succeeded(&mut self) {
        self.message = "Pairing successful!".into();
        self.awaiting_check_from_eftpos = false;
        self.awaiting_check_from_pos = false;
        self.finished = true;
        self.successful = true;
    }

    pub fn failed(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.awaiting_check_from_eftpos = false;
        self.awaiting_check_from_pos = false;
        self.finished = true;
        self.successful = false;
    }

    /// The terminal already considers itself paired and only the POS
    /// operator has yet to confirm. Cancelling now has to tell the terminal.
    pub fn terminal_believes_paired(&self) -> bool {
        self.awaiting_check_from_pos && !self.awaiting_check_from_eftpos
    }
}

pub fn pair_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("pr"), Event::PairRequest, json!({"padding": true}), false)
}

pub fn drop_keys_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("drpkys"), Event::DropKeys, Value::Null, true)
}

/// The terminal's two DH public values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub request_id: String,
    pub enc_a: String,
    pub hmac_a: String,
}

impl KeyRequest {
    pub fn from_message(msg: &Message) -> Result<Self, PairingError> {
        let field = |outer: &str, name: &'static str| {
            msg.data
                .get(outer)
                .and_then(|v| v.get("A"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or(PairingError::MissingField(name))
        };
        Ok(Self {
            request_id: msg.id.clone(),
            enc_a: field("enc", "enc.A")?,
            hmac_a: field("hmac", "hmac.A")?,
        })
    }
}

/// Run both exchanges. Returns the new secrets and the unencrypted
/// `key_response` that hands the terminal our public values.
pub fn generate_secrets_and_key_response(
    request: &KeyRequest,
) -> Result<(Secrets, Message), PairingError> {
    let enc_pair = DhKeyPair::generate();
    let hmac_pair = DhKeyPair::generate();
    key_response_with(request, &enc_pair, &hmac_pair)
}

pub(crate) fn key_response_with(
    request: &KeyRequest,
    enc_pair: &DhKeyPair,
    hmac_pair: &DhKeyPair,
) -> Result<(Secrets, Message), PairingError> {
    let enc_key = enc_pair.derive_session_key(&request.enc_a)?;
    let hmac_key = hmac_pair.derive_session_key(&request.hmac_a)?;
    let data = json!({
        "enc": {"B": enc_pair.public_hex()},
        "hmac": {"B": hmac_pair.public_hex()},
    });
    let response = Message::new(request.request_id.clone(), Event::KeyResponse, data, false);
    Ok((Secrets::new(enc_key, hmac_key), response))
}

/// First characters of the key_check envelope's HMAC.
pub fn confirmation_code(key_check: &Message) -> Option<String> {
    let hmac = key_check.incoming_hmac.as_deref()?;
    hmac.get(..CONFIRMATION_CODE_LENGTH).map(str::to_owned)
}
