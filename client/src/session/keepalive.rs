//! # Keepalive
//!
//! While paired and connected we ping the terminal on a fixed cadence:
//!
//! ```text
//! send ping ──► wait pong_timeout ──┬─ pong arrived ──► rest (frequency - timeout) ──► repeat
//!                                   └─ no pong ───────► missed += 1 ──► threshold? disconnect : repeat now
//! ```
//!
//! Every pong also tells us the terminal's clock and whether our login needs
//! refreshing. That part is handled by the controller; this module owns the
//! bookkeeping and the loop.

use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::SpiInner;
use crate::config::{DATETIME_PARSE_FORMAT, LOGIN_REFRESH_WINDOW};
use crate::message::{Event, Message, RequestIds};

/// Outcome of checking for the pong to the last ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongCheck {
    Received,
    Missed { count: u32 },
    /// Threshold reached. The connection should be dropped.
    Dead,
}

/// The terminal's answer to our login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub success: bool,
    pub expires: Option<NaiveDateTime>,
}

impl LoginResponse {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            success: msg.data_bool("success").unwrap_or(false),
            expires: msg
                .data_str("expires_datetime")
                .and_then(|s| NaiveDateTime::parse_from_str(s, DATETIME_PARSE_FORMAT).ok()),
        }
    }

    /// Whether the login lapses within the refresh window of `server_now`.
    /// A login with no readable expiry is always due.
    pub fn expiring_soon(&self, server_now: NaiveDateTime) -> bool {
        let window = TimeDelta::from_std(LOGIN_REFRESH_WINDOW).unwrap_or_else(|_| TimeDelta::minutes(10));
        match self.expires {
            Some(expires) => server_now + window > expires,
            None => true,
        }
    }
}

/// Connection-scoped heartbeat and login bookkeeping.
#[derive(Debug, Default)]
pub struct KeepAlive {
    last_ping_id: Option<String>,
    last_pong_id: Option<String>,
    missed: u32,
    login: Option<LoginResponse>,
}

impl KeepAlive {
    pub fn ping_sent(&mut self, id: String) {
        self.last_ping_id = Some(id);
    }

    /// Record a pong. Returns whether it answers our latest ping.
    pub fn pong_received(&mut self, id: &str) -> bool {
        self.last_pong_id = Some(id.to_string());
        self.last_ping_id.as_deref() == Some(id)
    }

    pub fn check(&mut self, threshold: u32) -> PongCheck {
        let answered = self.last_ping_id.is_some() && self.last_ping_id == self.last_pong_id;
        if answered {
            self.missed = 0;
            return PongCheck::Received;
        }
        self.missed += 1;
        if self.missed >= threshold {
            PongCheck::Dead
        } else {
            PongCheck::Missed { count: self.missed }
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn login(&self) -> Option<&LoginResponse> {
        self.login.as_ref()
    }

    pub fn set_login(&mut self, login: LoginResponse) {
        self.login = Some(login);
    }

    /// No login on file, or the one we have is about to lapse.
    pub fn needs_login(&self, server_now: NaiveDateTime) -> bool {
        match &self.login {
            None => true,
            Some(login) => !login.success || login.expiring_soon(server_now),
        }
    }

    /// Forget everything tied to the current connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub fn ping_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("ping"), Event::Ping, Value::Null, true)
}

pub fn pong_response(ping: &Message) -> Message {
    Message::new(ping.id.clone(), Event::Pong, Value::Null, true)
}

pub fn login_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("l"), Event::LoginRequest, Value::Null, true)
}

/// The heartbeat loop. Runs until the connection is declared dead, the
/// engine shuts down, or the controller aborts it on disconnect.
pub(crate) async fn run_heartbeat(inner: Arc<SpiInner>, mut shutdown: watch::Receiver<bool>) {
    let (pong_timeout, ping_rest, threshold) = {
        let config = inner.config.lock();
        (config.pong_timeout(), config.ping_rest(), config.missed_pongs_to_disconnect)
    };
    info!("heartbeat started");

    loop {
        if *shutdown.borrow() {
            return;
        }
        if !inner.send_ping() {
            debug!("heartbeat stopping, cannot send ping");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(pong_timeout) => {}
            _ = shutdown.changed() => return,
        }

        let check = inner.keepalive.lock().check(threshold);
        match check {
            PongCheck::Received => {
                tokio::select! {
                    _ = tokio::time::sleep(ping_rest) => {}
                    _ = shutdown.changed() => return,
                }
            }
            PongCheck::Missed { count } => {
                warn!(missed = count, "pong not received in time");
            }
            PongCheck::Dead => {
                warn!(missed = threshold, "terminal stopped answering, disconnecting");
                inner.transport.disconnect();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DATETIME_PARSE_FORMAT).unwrap()
    }

    #[test]
    fn dead_after_exactly_threshold_misses() {
        let mut ka = KeepAlive::default();
        ka.ping_sent("ping1".into());
        assert_eq!(ka.check(2), PongCheck::Missed { count: 1 });
        ka.ping_sent("ping2".into());
        assert_eq!(ka.check(2), PongCheck::Dead);
    }

    #[test]
    fn a_pong_resets_the_count() {
        let mut ka = KeepAlive::default();
        ka.ping_sent("ping1".into());
        assert_eq!(ka.check(2), PongCheck::Missed { count: 1 });

        ka.ping_sent("ping2".into());
        assert!(ka.pong_received("ping2"));
        assert_eq!(ka.check(2), PongCheck::Received);
        assert_eq!(ka.missed(), 0);

        ka.ping_sent("ping3".into());
        assert_eq!(ka.check(2), PongCheck::Missed { count: 1 });
    }

    #[test]
    fn stale_pong_does_not_count() {
        let mut ka = KeepAlive::default();
        ka.ping_sent("ping1".into());
        ka.ping_sent("ping2".into());
        assert!(!ka.pong_received("ping1"));
        assert_eq!(ka.check(3), PongCheck::Missed { count: 1 });
    }

    #[test]
    fn login_refresh_window() {
        let mut ka = KeepAlive::default();
        let now = at("2026-10-19T10:00:00.000");
        assert!(ka.needs_login(now));

        ka.set_login(LoginResponse {
            success: true,
            expires: Some(at("2026-10-19T11:00:00.000")),
        });
        assert!(!ka.needs_login(now));
        assert!(ka.needs_login(at("2026-10-19T10:50:01.000")));

        ka.reset();
        assert!(ka.login().is_none());
    }

    #[test]
    fn login_response_parsing() {
        let msg = Message::new(
            "l1",
            Event::LoginResponse,
            serde_json::json!({"success": true, "expires_datetime": "2026-10-20T10:00:00.000"}),
            true,
        );
        let login = LoginResponse::from_message(&msg);
        assert!(login.success);
        assert_eq!(login.expires, Some(at("2026-10-20T10:00:00.000")));
        assert!(LoginResponse { success: true, expires: None }.expiring_soon(at("2026-10-19T10:00:00.000")));
    }

    #[test]
    fn pong_echoes_ping_id() {
        let ping = Message::new("ping42", Event::Ping, Value::Null, true);
        let pong = pong_response(&ping);
        assert_eq!(pong.id, "ping42");
        assert_eq!(pong.event, Event::Pong);
    }
}
