//! Request builders and response accessors for the transaction events.
//!
//! These map POS-side fields onto message `data` and back. No logic lives
//! here.

use serde_json::{json, Value};

use super::types::SuccessState;
use crate::message::{data_object, Event, Message, RequestIds};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub pos_ref_id: String,
    pub purchase_amount: u64,
    pub tip_amount: u64,
    pub cashout_amount: u64,
    pub prompt_for_cashout: bool,
}

impl PurchaseRequest {
    pub fn new(pos_ref_id: impl Into<String>, purchase_amount: u64) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            purchase_amount,
            tip_amount: 0,
            cashout_amount: 0,
            prompt_for_cashout: false,
        }
    }

    pub fn amount_summary(&self) -> String {
        format!(
            "Purchase: {:.2}; Tip: {:.2}; Cashout: {:.2};",
            self.purchase_amount as f64 / 100.0,
            self.tip_amount as f64 / 100.0,
            self.cashout_amount as f64 / 100.0,
        )
    }

    pub fn to_message(&self, ids: &RequestIds) -> Message {
        let data = data_object([
            ("pos_ref_id", json!(self.pos_ref_id)),
            ("purchase_amount", json!(self.purchase_amount)),
            ("tip_amount", json!(self.tip_amount)),
            ("cash_amount", json!(self.cashout_amount)),
            ("prompt_for_cashout", json!(self.prompt_for_cashout)),
        ]);
        Message::new(ids.next("prchs"), Event::PurchaseRequest, data, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub pos_ref_id: String,
    pub amount_cents: u64,
}

impl RefundRequest {
    pub fn to_message(&self, ids: &RequestIds) -> Message {
        let data = data_object([
            ("pos_ref_id", json!(self.pos_ref_id)),
            ("refund_amount", json!(self.amount_cents)),
        ]);
        Message::new(ids.next("refund"), Event::RefundRequest, data, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashoutOnlyRequest {
    pub pos_ref_id: String,
    pub amount_cents: u64,
}

impl CashoutOnlyRequest {
    pub fn to_message(&self, ids: &RequestIds) -> Message {
        let data = data_object([
            ("pos_ref_id", json!(self.pos_ref_id)),
            ("cash_amount", json!(self.amount_cents)),
        ]);
        Message::new(ids.next("cshout"), Event::CashoutOnlyRequest, data, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotoPurchaseRequest {
    pub pos_ref_id: String,
    pub amount_cents: u64,
}

impl MotoPurchaseRequest {
    pub fn to_message(&self, ids: &RequestIds) -> Message {
        let data = data_object([
            ("pos_ref_id", json!(self.pos_ref_id)),
            ("purchase_amount", json!(self.amount_cents)),
        ]);
        Message::new(ids.next("moto"), Event::MotoPurchaseRequest, data, true)
    }
}

pub fn settle_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("stl"), Event::SettleRequest, Value::Null, true)
}

pub fn settlement_enquiry_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("stlenq"), Event::SettlementEnquiryRequest, Value::Null, true)
}

pub fn get_last_transaction_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("glt"), Event::GetLastTransactionRequest, Value::Null, true)
}

pub fn cancel_transaction_request(ids: &RequestIds) -> Message {
    Message::new(ids.next("ctx"), Event::CancelTransactionRequest, Value::Null, true)
}

pub fn signature_accept(ids: &RequestIds, pos_ref_id: &str) -> Message {
    let data = data_object([("pos_ref_id", json!(pos_ref_id))]);
    Message::new(ids.next("sigacc"), Event::SignatureAccepted, data, true)
}

pub fn signature_decline(ids: &RequestIds, pos_ref_id: &str) -> Message {
    let data = data_object([("pos_ref_id", json!(pos_ref_id))]);
    Message::new(ids.next("sigdec"), Event::SignatureDeclined, data, true)
}

/// Accessors over a terminal's final transaction response.
#[derive(Debug, Clone, Copy)]
pub struct TransactionResponse<'a> {
    msg: &'a Message,
}

impl<'a> TransactionResponse<'a> {
    pub fn new(msg: &'a Message) -> Self {
        Self { msg }
    }

    pub fn success_state(&self) -> SuccessState {
        self.msg.success_state()
    }

    pub fn pos_ref_id(&self) -> Option<&'a str> {
        self.msg.pos_ref_id()
    }

    pub fn error_reason(&self) -> Option<&'a str> {
        self.msg.error_reason()
    }

    pub fn error_detail(&self) -> Option<&'a str> {
        self.msg.error_detail()
    }

    pub fn host_response_code(&self) -> Option<&'a str> {
        self.msg.data_str("host_response_code")
    }

    pub fn host_response_text(&self) -> Option<&'a str> {
        self.msg.data_str("host_response_text")
    }

    pub fn customer_receipt(&self) -> Option<&'a str> {
        self.msg.data_str("customer_receipt")
    }

    pub fn merchant_receipt(&self) -> Option<&'a str> {
        self.msg.data_str("merchant_receipt")
    }

    pub fn rrn(&self) -> Option<&'a str> {
        self.msg.data_str("rrn")
    }

    pub fn scheme_name(&self) -> Option<&'a str> {
        self.msg.data_str("scheme_name")
    }

    pub fn was_customer_receipt_printed(&self) -> bool {
        self.msg.data_bool("customer_receipt_printed").unwrap_or(false)
    }

    pub fn was_merchant_receipt_printed(&self) -> bool {
        self.msg.data_bool("merchant_receipt_printed").unwrap_or(false)
    }
}
