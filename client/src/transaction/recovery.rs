//! # Get-Last-Transaction Recovery
//!
//! When the final response for a transaction is lost (socket dropped, the
//! terminal went quiet), the only way to learn what happened is to ask the
//! terminal for the last transaction it processed and decide whether that is
//! ours.
//!
//! There is no correlation id to lean on here. The match is a heuristic:
//!
//! 1. same transaction type (mapped from the terminal's label),
//! 2. exactly the same amount,
//! 3. the terminal finished it no earlier than we sent ours, allowing for the
//!    clock difference between us and the terminal plus a few seconds of slack.
//!
//! Two transactions with the same type and amount inside that window cannot
//! be told apart. Anything that doesn't match is reported as `Unknown` so the
//! operator checks the terminal by hand. We never guess "success".

use chrono::{NaiveDateTime, TimeDelta};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::flow::TransactionFlowState;
use super::types::{SuccessState, TransactionType};
use crate::config::GLT_MATCH_SLACK;
use crate::message::Message;

const BANK_DATETIME_FORMAT: &str = "%d%m%Y%H%M%S";

const OPERATION_IN_PROGRESS: &str = "OPERATION_IN_PROGRESS";
const OPERATION_IN_PROGRESS_AWAITING_SIGNATURE: &str = "OPERATION_IN_PROGRESS_AWAITING_SIGNATURE";
const TIME_OUT_OF_SYNC: &str = "TIME_OUT_OF_SYNC";

pub(crate) const RECOVERY_FAILED_MESSAGE: &str =
    "Failed to recover transaction status. Check EFTPOS.";

/// Read-only view over a `last_transaction` message.
#[derive(Debug, Clone, Copy)]
pub struct LastTransactionResponse<'a> {
    msg: &'a Message,
}

impl<'a> LastTransactionResponse<'a> {
    pub fn new(msg: &'a Message) -> Self {
        Self { msg }
    }

    /// Retrieval succeeded when the terminal reports a host response code.
    /// The `success` flag can't be used: a retrieved transaction may itself
    /// have failed.
    pub fn was_retrieved_successfully(&self) -> bool {
        self.host_response_code().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn was_operation_in_progress(&self) -> bool {
        self.error_starts_with(OPERATION_IN_PROGRESS)
    }

    pub fn is_waiting_for_signature(&self) -> bool {
        self.error_starts_with(OPERATION_IN_PROGRESS_AWAITING_SIGNATURE)
    }

    pub fn was_time_out_of_sync(&self) -> bool {
        self.error_starts_with(TIME_OUT_OF_SYNC)
    }

    fn error_starts_with(&self, prefix: &str) -> bool {
        self.msg.error_reason().is_some_and(|r| r.starts_with(prefix))
    }

    pub fn host_response_code(&self) -> Option<&'a str> {
        self.msg.data_str("host_response_code")
    }

    pub fn transaction_type(&self) -> Option<TransactionType> {
        self.msg
            .data_str("transaction_type")
            .and_then(TransactionType::from_terminal_label)
    }

    /// Amount for `tx_type`, falling back to the generic amount field.
    pub fn amount_cents(&self, tx_type: TransactionType) -> Option<i64> {
        tx_type
            .amount_key()
            .and_then(|key| self.msg.data_i64(key))
            .or_else(|| self.msg.data_i64("amount_transaction_type"))
    }

    /// When the bank says the transaction completed, in terminal local time.
    pub fn bank_datetime(&self) -> Option<NaiveDateTime> {
        let date = self.msg.data_str("bank_date")?;
        let time = self.msg.data_str("bank_time")?;
        NaiveDateTime::parse_from_str(&format!("{date}{time}"), BANK_DATETIME_FORMAT).ok()
    }

    pub fn pos_ref_id(&self) -> Option<&'a str> {
        self.msg.pos_ref_id()
    }

    pub fn success_state(&self) -> SuccessState {
        self.msg.success_state()
    }
}

/// Decide whether a retrieved last transaction is the one we sent.
///
/// Returns the retrieved outcome on a match and `Unknown` otherwise.
pub fn glt_match(
    glt: &LastTransactionResponse<'_>,
    expected_type: TransactionType,
    expected_amount_cents: u64,
    request_time: NaiveDateTime,
    server_time_delta: TimeDelta,
    pos_ref_id: &str,
) -> SuccessState {
    info!(
        pos_ref_id,
        retrieved_pos_ref_id = glt.pos_ref_id().unwrap_or(""),
        "matching last transaction"
    );

    if glt.transaction_type() != Some(expected_type) {
        info!(expected = %expected_type, "last transaction type differs");
        return SuccessState::Unknown;
    }

    let amount_matches = glt
        .amount_cents(expected_type)
        .is_some_and(|a| u64::try_from(a).ok() == Some(expected_amount_cents));
    if !amount_matches {
        info!(expected_amount_cents, "last transaction amount differs");
        return SuccessState::Unknown;
    }

    let Some(bank_time) = glt.bank_datetime() else {
        warn!("last transaction has no readable bank date/time");
        return SuccessState::Unknown;
    };

    let slack = TimeDelta::from_std(GLT_MATCH_SLACK).unwrap_or_else(|_| TimeDelta::seconds(5));
    let compare_time = request_time + server_time_delta - slack;
    if compare_time > bank_time {
        info!(%compare_time, %bank_time, "last transaction predates our request");
        return SuccessState::Unknown;
    }

    glt.success_state()
}

/// What a `last_transaction` message did to the active transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GltOutcome {
    /// Not waiting for one. Nothing changed.
    Ignored,
    /// Recovery finished the transaction with this outcome.
    Completed(SuccessState),
    /// The terminal is still working on it. Keep waiting.
    StillInProgress,
    /// The terminal is waiting for a signature we hadn't been told about.
    SignatureRequired,
    /// Clock disagreement, the next watchdog tick will ask again.
    TimeOutOfSync,
}

/// Apply a `last_transaction` response to the active transaction.
pub fn apply_glt_response(
    tx: &mut TransactionFlowState,
    msg: &Message,
    server_time_delta: TimeDelta,
) -> GltOutcome {
    if tx.finished {
        return GltOutcome::Ignored;
    }

    // A plain POS-initiated lookup just reports what the terminal says.
    if tx.tx_type == TransactionType::GetLastTransaction {
        let success = msg.success_state();
        tx.completed(success, Some(msg.clone()), "Last transaction retrieved");
        return GltOutcome::Completed(success);
    }

    if !tx.awaiting_glt_response {
        debug!(pos_ref_id = %tx.pos_ref_id, "unsolicited last_transaction ignored");
        return GltOutcome::Ignored;
    }
    tx.got_glt_response();

    let glt = LastTransactionResponse::new(msg);
    if glt.was_retrieved_successfully() {
        let success = glt_match(
            &glt,
            tx.tx_type,
            tx.amount_cents,
            tx.request_time,
            server_time_delta,
            &tx.pos_ref_id,
        );
        if success == SuccessState::Unknown {
            tx.unknown_completed(RECOVERY_FAILED_MESSAGE);
        } else {
            let response = with_customer_receipt_fallback(msg);
            tx.completed(success, Some(response), "Transaction ended");
        }
        return GltOutcome::Completed(success);
    }

    if glt.was_time_out_of_sync() {
        warn!(pos_ref_id = %tx.pos_ref_id, "terminal reports time out of sync, will retry");
        return GltOutcome::TimeOutOfSync;
    }

    if glt.was_operation_in_progress() {
        if let Some(other) = glt.pos_ref_id().filter(|r| *r != tx.pos_ref_id) {
            warn!(pos_ref_id = %tx.pos_ref_id, other, "terminal busy with another transaction");
        }
        if glt.is_waiting_for_signature() && !tx.awaiting_signature_check {
            tx.signature_required(msg.clone(), "Terminal is waiting for a signature check");
            return GltOutcome::SignatureRequired;
        }
        info!(pos_ref_id = %tx.pos_ref_id, "transaction still in progress on terminal");
        return GltOutcome::StillInProgress;
    }

    warn!(
        pos_ref_id = %tx.pos_ref_id,
        reason = msg.error_reason().unwrap_or(""),
        "last transaction retrieval failed"
    );
    tx.unknown_completed(RECOVERY_FAILED_MESSAGE);
    GltOutcome::Completed(SuccessState::Unknown)
}

/// Some firmware omits the customer receipt from recovery responses. Fall
/// back to the merchant copy.
fn with_customer_receipt_fallback(msg: &Message) -> Message {
    let mut msg = msg.clone();
    let customer_missing = msg
        .data_str("customer_receipt")
        .map_or(true, |r| r.trim().is_empty());
    let merchant = msg
        .data_str("merchant_receipt")
        .filter(|r| !r.trim().is_empty())
        .map(str::to_owned);
    if let (true, Some(merchant), Value::Object(map)) = (customer_missing, merchant, &mut msg.data) {
        map.insert("customer_receipt".into(), Value::String(merchant));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Event;
    use serde_json::json;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn glt_msg(data: Value) -> Message {
        Message::new("glt1", Event::GetLastTransactionResponse, data, true)
    }

    fn retrieved(tx_type: &str, amount: u64, bank_date: &str, bank_time: &str, ok: bool) -> Message {
        glt_msg(json!({
            "success": ok,
            "host_response_code": "000",
            "transaction_type": tx_type,
            "purchase_amount": amount,
            "refund_amount": amount,
            "bank_date": bank_date,
            "bank_time": bank_time,
            "pos_ref_id": "r1",
            "merchant_receipt": "MERCHANT COPY",
        }))
    }

    fn pending_purchase(request_time: NaiveDateTime) -> TransactionFlowState {
        let req = Message::new("prchs1", Event::PurchaseRequest, json!({}), true);
        let mut tx = TransactionFlowState::new(
            "r1",
            TransactionType::Purchase,
            1981,
            req,
            "Waiting",
            request_time,
        );
        tx.sent(request_time, "Sent");
        tx.calling_glt(request_time);
        tx
    }

    #[test]
    fn matching_transaction_adopts_outcome() {
        let msg = retrieved("PURCHASE", 1981, "19102026", "100005", true);
        let glt = LastTransactionResponse::new(&msg);
        let outcome = glt_match(
            &glt,
            TransactionType::Purchase,
            1981,
            at("2026-10-19T10:00:00"),
            TimeDelta::zero(),
            "r1",
        );
        assert_eq!(outcome, SuccessState::Success);

        let declined = retrieved("PURCHASE", 1981, "19102026", "100005", false);
        let glt = LastTransactionResponse::new(&declined);
        let outcome = glt_match(
            &glt,
            TransactionType::Purchase,
            1981,
            at("2026-10-19T10:00:00"),
            TimeDelta::zero(),
            "r1",
        );
        assert_eq!(outcome, SuccessState::Failed);
    }

    #[test]
    fn amount_or_type_mismatch_is_unknown() {
        let request_time = at("2026-10-19T10:00:00");
        let msg = retrieved("PURCHASE", 1980, "19102026", "100005", true);
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(
            glt_match(&glt, TransactionType::Purchase, 1981, request_time, TimeDelta::zero(), "r1"),
            SuccessState::Unknown
        );

        let msg = retrieved("REFUND", 1981, "19102026", "100005", true);
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(
            glt_match(&glt, TransactionType::Purchase, 1981, request_time, TimeDelta::zero(), "r1"),
            SuccessState::Unknown
        );
    }

    #[test]
    fn completion_before_request_is_unknown() {
        // Finished at 09:59:50; we sent at 10:00:00. Slack is only 5 s.
        let msg = retrieved("PURCHASE", 1981, "19102026", "095950", true);
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(
            glt_match(
                &glt,
                TransactionType::Purchase,
                1981,
                at("2026-10-19T10:00:00"),
                TimeDelta::zero(),
                "r1"
            ),
            SuccessState::Unknown
        );

        // Within the slack still matches.
        let msg = retrieved("PURCHASE", 1981, "19102026", "095956", true);
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(
            glt_match(
                &glt,
                TransactionType::Purchase,
                1981,
                at("2026-10-19T10:00:00"),
                TimeDelta::zero(),
                "r1"
            ),
            SuccessState::Success
        );
    }

    #[test]
    fn server_delta_shifts_the_window() {
        // Terminal clock runs 60 s behind ours: bank time 09:59:10 is after
        // 10:00:00 - 60 s - 5 s.
        let msg = retrieved("PURCHASE", 1981, "19102026", "095910", true);
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(
            glt_match(
                &glt,
                TransactionType::Purchase,
                1981,
                at("2026-10-19T10:00:00"),
                TimeDelta::seconds(-60),
                "r1"
            ),
            SuccessState::Success
        );
    }

    #[test]
    fn applied_match_completes_and_backfills_receipt() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = retrieved("PURCHASE", 1981, "19102026", "100030", true);
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::Completed(SuccessState::Success)
        );
        assert!(tx.finished);
        assert!(!tx.awaiting_glt_response);
        let response = tx.response.unwrap();
        assert_eq!(response.data_str("customer_receipt"), Some("MERCHANT COPY"));
    }

    #[test]
    fn applied_mismatch_is_unknown_completed() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = retrieved("REFUND", 1981, "19102026", "100030", true);
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::Completed(SuccessState::Unknown)
        );
        assert!(tx.finished);
        assert_eq!(tx.success, SuccessState::Unknown);
        assert_eq!(tx.display_message, RECOVERY_FAILED_MESSAGE);
    }

    #[test]
    fn in_progress_keeps_waiting() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = glt_msg(json!({"success": false, "error_reason": "OPERATION_IN_PROGRESS", "pos_ref_id": "r1"}));
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::StillInProgress
        );
        assert!(!tx.finished);
    }

    #[test]
    fn in_progress_awaiting_signature_enters_signature_check() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = glt_msg(json!({
            "success": false,
            "error_reason": "OPERATION_IN_PROGRESS_AWAITING_SIGNATURE",
            "pos_ref_id": "r1",
        }));
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::SignatureRequired
        );
        assert!(tx.awaiting_signature_check);
        assert!(!tx.finished);
    }

    #[test]
    fn time_out_of_sync_is_ignored() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = glt_msg(json!({"success": false, "error_reason": "TIME_OUT_OF_SYNC"}));
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::TimeOutOfSync
        );
        assert!(!tx.finished);
    }

    #[test]
    fn other_retrieval_errors_are_unknown() {
        let mut tx = pending_purchase(at("2026-10-19T10:00:00"));
        let msg = glt_msg(json!({"success": false, "error_reason": "NO_TRANSACTION_FOUND"}));
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::Completed(SuccessState::Unknown)
        );
        assert!(tx.finished);
    }

    #[test]
    fn unsolicited_response_is_ignored() {
        let req = Message::new("prchs1", Event::PurchaseRequest, json!({}), true);
        let mut tx = TransactionFlowState::new(
            "r1",
            TransactionType::Purchase,
            1981,
            req,
            "Waiting",
            at("2026-10-19T10:00:00"),
        );
        let msg = retrieved("PURCHASE", 1981, "19102026", "100030", true);
        assert_eq!(apply_glt_response(&mut tx, &msg, TimeDelta::zero()), GltOutcome::Ignored);
        assert!(!tx.finished);
    }

    #[test]
    fn plain_lookup_reports_retrieved_outcome() {
        let req = Message::new("glt1", Event::GetLastTransactionRequest, Value::Null, true);
        let mut tx = TransactionFlowState::new(
            "",
            TransactionType::GetLastTransaction,
            0,
            req,
            "Waiting",
            at("2026-10-19T10:00:00"),
        );
        let msg = retrieved("PURCHASE", 500, "19102026", "090000", true);
        assert_eq!(
            apply_glt_response(&mut tx, &msg, TimeDelta::zero()),
            GltOutcome::Completed(SuccessState::Success)
        );
        assert!(tx.response.is_some());
    }

    #[test]
    fn generic_amount_field_is_a_fallback() {
        let msg = glt_msg(json!({"amount_transaction_type": 700}));
        let glt = LastTransactionResponse::new(&msg);
        assert_eq!(glt.amount_cents(TransactionType::CashoutOnly), Some(700));
    }
}
