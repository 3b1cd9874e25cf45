//! # Protocol Configuration & Constants
//!
//! Every magic number the engine relies on lives here. The timing values are
//! defaults that match what terminal firmware expects; the wire constants are
//! not negotiable. Change them and the terminal stops talking to you.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// SPI protocol version we speak. Advertised in the WebSocket sub-protocol.
pub const SPI_PROTOCOL_VERSION: &str = "2.9.0";

/// Prefix of the WebSocket sub-protocol identifier (`spi.<version>`).
pub const SUBPROTOCOL_PREFIX: &str = "spi.";

/// Timestamp format stamped into every outgoing message (`datetime` field).
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Lenient parse format for incoming timestamps. Terminals are not always
/// consistent about the number of fractional digits.
pub const DATETIME_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Session key length in bytes. Both keys are SHA-256 outputs.
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-CBC block / IV length in bytes.
pub const AES_BLOCK_LENGTH: usize = 16;

/// The IV is fixed at all zeroes. This is a protocol constant: every key is
/// single-use per pairing or rotation, and the terminal firmware expects it.
pub const AES_IV: [u8; AES_BLOCK_LENGTH] = [0u8; AES_BLOCK_LENGTH];

/// Hex digits in a rendered DH shared secret (2048 bits).
pub const DH_SECRET_HEX_DIGITS: usize = 512;

/// Number of leading HMAC hex characters shown to the operator as the
/// pairing confirmation code.
pub const CONFIRMATION_CODE_LENGTH: usize = 6;

// ---------------------------------------------------------------------------
// Timing Defaults
// ---------------------------------------------------------------------------

/// How long a connect attempt may take before it is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8_000;

/// Period of the heartbeat loop (ping to ping, when pongs arrive on time).
pub const DEFAULT_PING_FREQUENCY_MS: u64 = 18_000;

/// How long we wait for the pong matching our ping.
pub const DEFAULT_PONG_TIMEOUT_MS: u64 = 5_000;

/// Consecutive missed pongs after which the connection is declared dead.
pub const DEFAULT_MISSED_PONGS_TO_DISCONNECT: u32 = 2;

/// Delay between losing a paired connection and trying again.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Tick of the transaction watchdog.
pub const DEFAULT_TX_MONITOR_INTERVAL_MS: u64 = 1_000;

/// Silence on an in-flight transaction after which we ask for the last
/// transaction to find out what happened.
pub const DEFAULT_CHECK_ON_TX_FREQUENCY_MS: u64 = 20_000;

/// How long a cancel request may stay unanswered before the outcome is
/// declared unknown.
pub const DEFAULT_MAX_WAIT_FOR_CANCEL_TX_MS: u64 = 10_000;

/// A login expiring within this window is refreshed on the next pong.
pub const LOGIN_REFRESH_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Slack subtracted from the request time when matching a recovered
/// transaction against the one we sent.
pub const GLT_MATCH_SLACK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Configuration errors. Surfaced by [`SpiConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pos_id must not be empty")]
    MissingPosId,

    #[error("eftpos_address must not be empty")]
    MissingEftposAddress,

    #[error("pong timeout ({pong_timeout_ms}ms) must be shorter than the ping frequency ({ping_frequency_ms}ms)")]
    PongTimeoutTooLong {
        pong_timeout_ms: u64,
        ping_frequency_ms: u64,
    },

    #[error("missed_pongs_to_disconnect must be at least 1")]
    ZeroMissedPongs,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Tunable parameters for an [`Spi`](crate::session::Spi) instance.
///
/// Every field has a sane default, so embedders usually only fill in
/// `pos_id` and `eftpos_address`. Deserializable so it can sit in whatever
/// config file the POS already has.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    /// Identifier of this POS as registered with the terminal.
    pub pos_id: String,

    /// Terminal address (`host[:port]`), without the `ws://` scheme.
    pub eftpos_address: String,

    /// Protocol version advertised in the WebSocket sub-protocol.
    pub protocol_version: String,

    pub connect_timeout_ms: u64,
    pub ping_frequency_ms: u64,
    pub pong_timeout_ms: u64,
    pub missed_pongs_to_disconnect: u32,
    pub reconnect_delay_ms: u64,
    pub tx_monitor_interval_ms: u64,
    pub check_on_tx_frequency_ms: u64,
    pub max_wait_for_cancel_tx_ms: u64,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            pos_id: String::new(),
            eftpos_address: String::new(),
            protocol_version: SPI_PROTOCOL_VERSION.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            ping_frequency_ms: DEFAULT_PING_FREQUENCY_MS,
            pong_timeout_ms: DEFAULT_PONG_TIMEOUT_MS,
            missed_pongs_to_disconnect: DEFAULT_MISSED_PONGS_TO_DISCONNECT,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            tx_monitor_interval_ms: DEFAULT_TX_MONITOR_INTERVAL_MS,
            check_on_tx_frequency_ms: DEFAULT_CHECK_ON_TX_FREQUENCY_MS,
            max_wait_for_cancel_tx_ms: DEFAULT_MAX_WAIT_FOR_CANCEL_TX_MS,
        }
    }
}

impl SpiConfig {
    /// Convenience constructor with default timings.
    pub fn new(pos_id: impl Into<String>, eftpos_address: impl Into<String>) -> Self {
        Self {
            pos_id: pos_id.into(),
            eftpos_address: eftpos_address.into(),
            ..Self::default()
        }
    }

    /// Check the invariants the engine relies on.
    ///
    /// Empty `pos_id` / `eftpos_address` are legal at construction time (the
    /// POS may fill them in later) but pairing refuses to start without them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pos_id.trim().is_empty() {
            return Err(ConfigError::MissingPosId);
        }
        if self.eftpos_address.trim().is_empty() {
            return Err(ConfigError::MissingEftposAddress);
        }
        self.validate_timings()
    }

    pub(crate) fn validate_timings(&self) -> Result<(), ConfigError> {
        if self.pong_timeout_ms >= self.ping_frequency_ms {
            return Err(ConfigError::PongTimeoutTooLong {
                pong_timeout_ms: self.pong_timeout_ms,
                ping_frequency_ms: self.ping_frequency_ms,
            });
        }
        if self.missed_pongs_to_disconnect == 0 {
            return Err(ConfigError::ZeroMissedPongs);
        }
        for (name, value) in [
            ("tx_monitor_interval_ms", self.tx_monitor_interval_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("check_on_tx_frequency_ms", self.check_on_tx_frequency_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    /// `ws://<address>`. The terminal only speaks plain WebSocket.
    pub fn websocket_url(&self) -> String {
        format!("ws://{}", self.eftpos_address)
    }

    /// `spi.<version>`.
    pub fn subprotocol(&self) -> String {
        format!("{}{}", SUBPROTOCOL_PREFIX, self.protocol_version)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_frequency(&self) -> Duration {
        Duration::from_millis(self.ping_frequency_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Time left in the heartbeat period after a pong has been awaited.
    pub fn ping_rest(&self) -> Duration {
        self.ping_frequency().saturating_sub(self.pong_timeout())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn tx_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.tx_monitor_interval_ms)
    }

    pub fn check_on_tx_frequency(&self) -> Duration {
        Duration::from_millis(self.check_on_tx_frequency_ms)
    }

    pub fn max_wait_for_cancel_tx(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_cancel_tx_ms)
    }
}
