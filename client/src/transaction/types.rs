//! Small value types shared by the transaction engine and the POS surface.

use serde::{Deserialize, Serialize};

use crate::message::Event;

/// Kind of financial operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Purchase,
    Refund,
    CashoutOnly,
    Moto,
    Settle,
    SettlementEnquiry,
    GetLastTransaction,
}

impl TransactionType {
    /// Map the label the terminal reports in a last-transaction response.
    ///
    /// Firmware builds disagree on the exact spelling, so matching is
    /// case-insensitive and accepts the known variants.
    pub fn from_terminal_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "PURCHASE" => Some(TransactionType::Purchase),
            "REFUND" => Some(TransactionType::Refund),
            "CASH" | "CASHOUT" | "CASHOUTONLY" | "CASHOUT_ONLY" => {
                Some(TransactionType::CashoutOnly)
            }
            "MOTO" | "MOTO PURCHASE" | "MOTO_PURCHASE" => Some(TransactionType::Moto),
            "SETTLE" | "SETTLEMENT" => Some(TransactionType::Settle),
            "SETTLEMENT ENQUIRY" | "SETTLEMENT_ENQUIRY" => {
                Some(TransactionType::SettlementEnquiry)
            }
            _ => None,
        }
    }

    /// Key holding this type's amount inside a terminal response.
    pub fn amount_key(self) -> Option<&'static str> {
        match self {
            TransactionType::Purchase | TransactionType::Moto => Some("purchase_amount"),
            TransactionType::Refund => Some("refund_amount"),
            TransactionType::CashoutOnly => Some("cash_amount"),
            _ => None,
        }
    }

    /// The event that carries the terminal's final answer.
    pub fn response_event(self) -> Event {
        match self {
            TransactionType::Purchase => Event::PurchaseResponse,
            TransactionType::Refund => Event::RefundResponse,
            TransactionType::CashoutOnly => Event::CashoutOnlyResponse,
            TransactionType::Moto => Event::MotoPurchaseResponse,
            TransactionType::Settle => Event::SettleResponse,
            TransactionType::SettlementEnquiry => Event::SettlementEnquiryResponse,
            TransactionType::GetLastTransaction => Event::GetLastTransactionResponse,
        }
    }

    /// Whether a final response must carry this transaction's `pos_ref_id`.
    pub(crate) fn is_correlated(self) -> bool {
        !matches!(
            self,
            TransactionType::Settle
                | TransactionType::SettlementEnquiry
                | TransactionType::GetLastTransaction
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::Purchase => "Purchase",
            TransactionType::Refund => "Refund",
            TransactionType::CashoutOnly => "Cashout Only",
            TransactionType::Moto => "MOTO",
            TransactionType::Settle => "Settle",
            TransactionType::SettlementEnquiry => "Settlement Enquiry",
            TransactionType::GetLastTransaction => "Get Last Transaction",
        };
        f.write_str(name)
    }
}

/// Outcome of a transaction as far as we can prove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuccessState {
    /// Could not be established. The operator has to check the terminal.
    #[default]
    Unknown,
    Success,
    Failed,
}

/// Answer to an initiate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateTxResult {
    pub initiated: bool,
    pub message: String,
}

impl InitiateTxResult {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            initiated: true,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            initiated: false,
            message: message.into(),
        }
    }
}

/// Answer to an action on a transaction already in flight (cancel, signature).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidTxResult {
    pub valid: bool,
    pub message: String,
}

impl MidTxResult {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_labels_map_case_insensitively() {
        assert_eq!(
            TransactionType::from_terminal_label("purchase"),
            Some(TransactionType::Purchase)
        );
        assert_eq!(
            TransactionType::from_terminal_label(" REFUND "),
            Some(TransactionType::Refund)
        );
        assert_eq!(
            TransactionType::from_terminal_label("CASH"),
            Some(TransactionType::CashoutOnly)
        );
        assert_eq!(TransactionType::from_terminal_label("PREAUTH"), None);
    }

    #[test]
    fn amount_keys() {
        assert_eq!(TransactionType::Moto.amount_key(), Some("purchase_amount"));
        assert_eq!(TransactionType::CashoutOnly.amount_key(), Some("cash_amount"));
        assert_eq!(TransactionType::Settle.amount_key(), None);
        assert!(!TransactionType::Settle.is_correlated());
        assert!(TransactionType::Refund.is_correlated());
        assert_eq!(TransactionType::Moto.response_event(), Event::MotoPurchaseResponse);
    }
}
