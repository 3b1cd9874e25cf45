//! # SPI Messages
//!
//! A [`Message`] is the logical unit both sides exchange: an id, an
//! [`Event`], a JSON `data` object, and the per-connection stamp (`datetime`,
//! `pos_counter`, `conn_id`). The codec in [`codec`] wraps it in the wire
//! envelope, encrypted or not.
//!
//! Message ids are not globally meaningful. The terminal echoes the request id
//! in its reply, which is all the correlation the heartbeat and the
//! key-exchange need.

pub mod codec;
pub mod event;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DATETIME_PARSE_FORMAT;
use crate::transaction::SuccessState;

pub use codec::{decode, CodecError, MessageStamp};
pub use event::Event;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,

    pub event: Event,

    #[serde(default)]
    pub data: Value,

    #[serde(rename = "datetime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,

    #[serde(default)]
    pub pos_counter: u64,

    #[serde(default)]
    pub conn_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_id: Option<String>,

    /// Outgoing only: wrap in the encrypted envelope.
    #[serde(skip)]
    pub needs_encryption: bool,

    /// Incoming only: the envelope's HMAC, for the pairing confirmation code.
    #[serde(skip)]
    pub incoming_hmac: Option<String>,

    /// Incoming only: decrypted inner JSON, kept for diagnostics.
    #[serde(skip)]
    pub decrypted_json: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, event: Event, data: Value, needs_encryption: bool) -> Self {
        Self {
            id: id.into(),
            event,
            data,
            date_time: None,
            pos_counter: 0,
            conn_id: String::new(),
            pos_id: None,
            needs_encryption,
            incoming_hmac: None,
            decrypted_json: None,
        }
    }

    /// Codec sentinel carrying `data.msg` for diagnostics.
    pub(crate) fn sentinel(event: Event, diagnostic: &str) -> Self {
        let mut data = Map::new();
        data.insert("msg".into(), Value::String(diagnostic.to_string()));
        Self::new("UNKNOWN", event, Value::Object(data), false)
    }

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// Integer field, tolerating terminals that send numbers as strings.
    pub fn data_i64(&self, key: &str) -> Option<i64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `data.success` as a three-way state. Absent means unknown.
    pub fn success_state(&self) -> SuccessState {
        match self.data_bool("success") {
            Some(true) => SuccessState::Success,
            Some(false) => SuccessState::Failed,
            None => SuccessState::Unknown,
        }
    }

    pub fn pos_ref_id(&self) -> Option<&str> {
        self.data_str("pos_ref_id")
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.data_str("error_reason")
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.data_str("error_detail")
    }

    /// Parsed `datetime`, if present and well-formed.
    pub fn parsed_datetime(&self) -> Option<NaiveDateTime> {
        let raw = self.date_time.as_deref()?;
        NaiveDateTime::parse_from_str(raw, DATETIME_PARSE_FORMAT).ok()
    }

    /// How far the terminal's clock runs ahead of `now` (negative if behind).
    pub fn server_time_delta(&self, now: NaiveDateTime) -> Option<TimeDelta> {
        Some(self.parsed_datetime()? - now)
    }
}

/// Build a JSON object from key/value pairs.
pub(crate) fn data_object<const N: usize>(pairs: [(&str, Value); N]) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}

/// Mints message ids of the form `<prefix><n>`, unique for the process.
#[derive(Debug, Default)]
pub struct RequestIds {
    counter: AtomicU64,
}

impl RequestIds {
    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn incoming_message_tolerates_missing_stamp() {
        let msg: Message =
            serde_json::from_value(json!({"id": "p1", "event": "pong"})).unwrap();
        assert_eq!(msg.event, Event::Pong);
        assert_eq!(msg.pos_counter, 0);
        assert!(msg.data.is_null());
        assert_eq!(msg.success_state(), SuccessState::Unknown);
    }

    #[test]
    fn accessors_read_data() {
        let msg = Message::new(
            "r1",
            Event::PurchaseResponse,
            json!({
                "success": false,
                "pos_ref_id": "prchs-1",
                "error_reason": "CANCELLED",
                "purchase_amount": "1981",
            }),
            true,
        );
        assert_eq!(msg.success_state(), SuccessState::Failed);
        assert_eq!(msg.pos_ref_id(), Some("prchs-1"));
        assert_eq!(msg.error_reason(), Some("CANCELLED"));
        assert_eq!(msg.data_i64("purchase_amount"), Some(1981));
        assert_eq!(msg.error_detail(), None);
    }

    #[test]
    fn server_delta_from_datetime() {
        let mut msg = Message::new("x", Event::Pong, Value::Null, false);
        msg.date_time = Some("2026-10-19T12:00:03.500".into());
        let now = NaiveDateTime::parse_from_str("2026-10-19T12:00:00.000", DATETIME_PARSE_FORMAT)
            .unwrap();
        assert_eq!(msg.server_time_delta(now), Some(TimeDelta::milliseconds(3_500)));

        msg.date_time = Some("garbage".into());
        assert_eq!(msg.server_time_delta(now), None);
    }

    #[test]
    fn request_ids_increase() {
        let ids = RequestIds::default();
        assert_eq!(ids.next("ping"), "ping1");
        assert_eq!(ids.next("prchs"), "prchs2");
    }
}
