// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SPI Client: POS-side Engine
//!
//! This crate is the point-of-sale half of SPI, the secure request/response
//! protocol spoken between a POS application and an EFTPOS payment terminal
//! over a persistent WebSocket.
//!
//! The terminal does the money part. We do everything around it: keep the
//! socket alive, pair with the terminal so both sides share symmetric keys,
//! encrypt and authenticate every frame, and make sure a payment is never
//! silently lost or doubled when the network hiccups mid-transaction.
//!
//! ## Architecture
//!
//! - **crypto**: AES-CBC + HMAC envelope primitives, the RFC 3526 Diffie-
//!   Hellman pairing exchange, and the `Secrets` key pair.
//! - **message**: The wire `Message`, the closed `Event` catalogue, and the
//!   codec that stamps, encrypts, and decodes envelopes.
//! - **transport**: The `Transport` seam and its WebSocket implementation.
//! - **transaction**: The single-transaction state machine, GLT recovery
//!   matching, and the thin request adapters.
//! - **session**: The `Spi` controller: pairing, keepalive, dispatch, and
//!   the one lock that serializes all session mutation.
//! - **config**: Protocol constants and the tunable `SpiConfig`.
//! - **logging**: Optional `tracing` subscriber setup for embedders.
//!
//! ## Design Philosophy
//!
//! 1. Nothing here is fatal. Every failure degrades to a state change and a
//!    log line; the POS decides what to do about it.
//! 2. Ambiguity is surfaced, never guessed. If we can't prove how a payment
//!    ended, the POS is told to check the terminal.
//! 3. No `.await` while holding the session lock. Ever.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod message;
pub mod session;
pub mod transaction;
pub mod transport;

pub use config::SpiConfig;
pub use crypto::Secrets;
pub use error::SpiError;
pub use message::{Event, Message};
pub use session::{PairingFlowState, Spi, SpiEvent, SpiFlow, SpiStatus};
pub use transaction::{
    InitiateTxResult, MidTxResult, SuccessState, TransactionFlowState, TransactionType,
};
