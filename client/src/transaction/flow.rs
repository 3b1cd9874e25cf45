//! # Transaction Flow State
//!
//! The single in-flight transaction, as an explicit state machine.
//!
//! ```text
//! Created ──sent──► Sent ──┬── signature_required ──► AwaitingSignature
//!                          ├── cancelling ──────────► CancelPending
//!                          ├── calling_glt ─────────► AwaitingGlt
//!                          └── completed / failed / unknown_completed ──► Finished
//! ```
//!
//! The waiting flags can overlap (a cancel can be pending while we are also
//! waiting for a GLT answer), but `finished` is terminal: once set, every
//! transition below is a no-op. Only the controller mutates this, and only
//! under the session lock. Time is passed in explicitly so the watchdog
//! logic can be tested without a clock.

use chrono::NaiveDateTime;
use tracing::debug;

use super::types::{SuccessState, TransactionType};
use crate::message::Message;

/// What the watchdog should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Nothing,
    /// The cancel request went unanswered for too long.
    CancelTimedOut,
    /// No news for too long, ask the terminal for its last transaction.
    RequestLastTransaction,
}

#[derive(Debug, Clone)]
pub struct TransactionFlowState {
    pub pos_ref_id: String,
    pub tx_type: TransactionType,
    pub amount_cents: u64,
    pub request_sent: bool,
    pub request_time: NaiveDateTime,
    pub last_state_request_time: NaiveDateTime,
    pub attempting_to_cancel: bool,
    pub cancel_attempt_time: Option<NaiveDateTime>,
    pub awaiting_signature_check: bool,
    pub awaiting_glt_response: bool,
    pub finished: bool,
    pub success: SuccessState,
    /// The message that was, or will be, sent.
    pub request: Message,
    /// The terminal's final word, if it gave one.
    pub response: Option<Message>,
    pub signature_required_message: Option<Message>,
    /// Operator-facing description of where things stand.
    pub display_message: String,
}

impl TransactionFlowState {
    pub fn new(
        pos_ref_id: impl Into<String>,
        tx_type: TransactionType,
        amount_cents: u64,
        request: Message,
        display_message: impl Into<String>,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            tx_type,
            amount_cents,
            request_sent: false,
            request_time: now,
            last_state_request_time: now,
            attempting_to_cancel: false,
            cancel_attempt_time: None,
            awaiting_signature_check: false,
            awaiting_glt_response: false,
            finished: false,
            success: SuccessState::Unknown,
            request,
            response: None,
            signature_required_message: None,
            display_message: display_message.into(),
        }
    }

    pub fn sent(&mut self, now: NaiveDateTime, display: impl Into<String>) {
        if self.finished {
            return;
        }
        self.request_sent = true;
        self.request_time = now;
        self.last_state_request_time = now;
        self.display_message = display.into();
    }

    pub fn cancelling(&mut self, now: NaiveDateTime, display: impl Into<String>) {
        if self.finished {
            return;
        }
        self.attempting_to_cancel = true;
        self.cancel_attempt_time = Some(now);
        self.display_message = display.into();
    }

    pub fn cancel_failed(&mut self, display: impl Into<String>) {
        if self.finished {
            return;
        }
        self.attempting_to_cancel = false;
        self.cancel_attempt_time = None;
        self.display_message = display.into();
    }

    pub fn calling_glt(&mut self, now: NaiveDateTime) {
        if self.finished {
            return;
        }
        self.awaiting_glt_response = true;
        self.last_state_request_time = now;
    }

    pub fn got_glt_response(&mut self) {
        self.awaiting_glt_response = false;
    }

    pub fn signature_required(&mut self, request: Message, display: impl Into<String>) {
        if self.finished {
            return;
        }
        self.signature_required_message = Some(request);
        self.awaiting_signature_check = true;
        self.display_message = display.into();
    }

    pub fn signature_responded(&mut self, display: impl Into<String>) {
        if self.finished {
            return;
        }
        self.awaiting_signature_check = false;
        self.display_message = display.into();
    }

    /// Terminal outcome known (or deliberately given up on).
    pub fn completed(
        &mut self,
        success: SuccessState,
        response: Option<Message>,
        display: impl Into<String>,
    ) {
        if self.finished {
            debug!(pos_ref_id = %self.pos_ref_id, "ignoring completion of finished transaction");
            return;
        }
        self.success = success;
        self.response = response;
        self.finished = true;
        self.attempting_to_cancel = false;
        self.awaiting_glt_response = false;
        self.awaiting_signature_check = false;
        self.display_message = display.into();
    }

    pub fn failed(&mut self, response: Option<Message>, display: impl Into<String>) {
        self.completed(SuccessState::Failed, response, display);
    }

    /// Could not establish the outcome. The operator must check the terminal.
    pub fn unknown_completed(&mut self, display: impl Into<String>) {
        self.completed(SuccessState::Unknown, None, display);
    }

    /// Whether `response` is the final word on this transaction.
    pub fn is_response_for_us(&self, response: &Message) -> bool {
        if !self.tx_type.is_correlated() {
            return true;
        }
        response.pos_ref_id() == Some(self.pos_ref_id.as_str())
    }

    pub fn watchdog_action(
        &self,
        now: NaiveDateTime,
        max_wait_for_cancel: chrono::TimeDelta,
        check_on_tx_frequency: chrono::TimeDelta,
    ) -> WatchdogAction {
        if self.finished {
            return WatchdogAction::Nothing;
        }
        if self.attempting_to_cancel {
            return match self.cancel_attempt_time {
                Some(at) if now > at + max_wait_for_cancel => WatchdogAction::CancelTimedOut,
                _ => WatchdogAction::Nothing,
            };
        }
        if self.request_sent && now > self.last_state_request_time + check_on_tx_frequency {
            return WatchdogAction::RequestLastTransaction;
        }
        WatchdogAction::Nothing
    }
}
