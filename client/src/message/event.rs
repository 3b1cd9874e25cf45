//! The SPI event catalogue.
//!
//! Every envelope carries an `event` string. It is decoded exactly once into
//! [`Event`] and everything downstream matches on the enum.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire event names, plus the three local sentinels the codec produces when
/// an incoming frame cannot be trusted or read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    // Pairing
    PairRequest,
    KeyRequest,
    KeyResponse,
    KeyCheck,
    PairResponse,
    DropKeys,

    // Session
    LoginRequest,
    LoginResponse,
    Ping,
    Pong,
    KeyRollRequest,
    KeyRollResponse,
    Error,

    // Transactions
    PurchaseRequest,
    PurchaseResponse,
    RefundRequest,
    RefundResponse,
    CashoutOnlyRequest,
    CashoutOnlyResponse,
    MotoPurchaseRequest,
    MotoPurchaseResponse,
    SettleRequest,
    SettleResponse,
    SettlementEnquiryRequest,
    SettlementEnquiryResponse,
    CancelTransactionRequest,
    CancelTransactionResponse,
    GetLastTransactionRequest,
    GetLastTransactionResponse,
    SignatureRequired,
    SignatureAccepted,
    SignatureDeclined,

    // Local sentinels, never sent
    InvalidHmacSignature,
    NoSecrets,
    Unparseable,

    /// Anything we don't know. Logged and dropped by the dispatcher.
    Other(String),
}

impl Event {
    pub fn as_str(&self) -> &str {
        match self {
            Event::PairRequest => "pair_request",
            Event::KeyRequest => "key_request",
            Event::KeyResponse => "key_response",
            Event::KeyCheck => "key_check",
            Event::PairResponse => "pair_response",
            Event::DropKeys => "drop_keys",
            Event::LoginRequest => "login_request",
            Event::LoginResponse => "login_response",
            Event::Ping => "ping",
            Event::Pong => "pong",
            Event::KeyRollRequest => "request_use_next_keys",
            Event::KeyRollResponse => "response_use_next_keys",
            Event::Error => "error",
            Event::PurchaseRequest => "purchase",
            Event::PurchaseResponse => "purchase_response",
            Event::RefundRequest => "refund",
            Event::RefundResponse => "refund_response",
            Event::CashoutOnlyRequest => "cash",
            Event::CashoutOnlyResponse => "cash_response",
            Event::MotoPurchaseRequest => "moto_purchase",
            Event::MotoPurchaseResponse => "moto_purchase_response",
            Event::SettleRequest => "settle",
            Event::SettleResponse => "settle_response",
            Event::SettlementEnquiryRequest => "settlement_enquiry",
            Event::SettlementEnquiryResponse => "settlement_enquiry_response",
            Event::CancelTransactionRequest => "cancel_transaction",
            Event::CancelTransactionResponse => "cancel_response",
            Event::GetLastTransactionRequest => "get_last_transaction",
            Event::GetLastTransactionResponse => "last_transaction",
            Event::SignatureRequired => "signature_required",
            Event::SignatureAccepted => "signature_accept",
            Event::SignatureDeclined => "signature_decline",
            Event::InvalidHmacSignature => "_INVALID_SIGNATURE_",
            Event::NoSecrets => "_NO_SECRETS_",
            Event::Unparseable => "_UNPARSEABLE_",
            Event::Other(name) => name,
        }
    }

    /// True for the codec's local sentinel events.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            Event::InvalidHmacSignature | Event::NoSecrets | Event::Unparseable
        )
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        match name {
            "pair_request" => Event::PairRequest,
            "key_request" => Event::KeyRequest,
            "key_response" => Event::KeyResponse,
            "key_check" => Event::KeyCheck,
            "pair_response" => Event::PairResponse,
            "drop_keys" => Event::DropKeys,
            "login_request" => Event::LoginRequest,
            "login_response" => Event::LoginResponse,
            "ping" => Event::Ping,
            "pong" => Event::Pong,
            "request_use_next_keys" => Event::KeyRollRequest,
            "response_use_next_keys" => Event::KeyRollResponse,
            "error" => Event::Error,
            "purchase" => Event::PurchaseRequest,
            "purchase_response" => Event::PurchaseResponse,
            "refund" => Event::RefundRequest,
            "refund_response" => Event::RefundResponse,
            "cash" => Event::CashoutOnlyRequest,
            "cash_response" => Event::CashoutOnlyResponse,
            "moto_purchase" => Event::MotoPurchaseRequest,
            "moto_purchase_response" => Event::MotoPurchaseResponse,
            "settle" => Event::SettleRequest,
            "settle_response" => Event::SettleResponse,
            "settlement_enquiry" => Event::SettlementEnquiryRequest,
            "settlement_enquiry_response" => Event::SettlementEnquiryResponse,
            "cancel_transaction" => Event::CancelTransactionRequest,
            "cancel_response" => Event::CancelTransactionResponse,
            "get_last_transaction" => Event::GetLastTransactionRequest,
            "last_transaction" => Event::GetLastTransactionResponse,
            "signature_required" => Event::SignatureRequired,
            "signature_accept" => Event::SignatureAccepted,
            "signature_decline" => Event::SignatureDeclined,
            "_INVALID_SIGNATURE_" => Event::InvalidHmacSignature,
            "_NO_SECRETS_" => Event::NoSecrets,
            "_UNPARSEABLE_" => Event::Unparseable,
            other => Event::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Event::from(name.as_str()))
    }
}
