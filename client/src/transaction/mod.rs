//! # Transactions
//!
//! One financial operation at a time. [`flow`] holds its state machine,
//! [`recovery`] decides what happened when the answer got lost, and
//! [`requests`] builds the wire payloads.

pub mod flow;
pub mod recovery;
pub mod requests;
pub mod types;

pub use flow::{TransactionFlowState, WatchdogAction};
pub use recovery::{apply_glt_response, glt_match, GltOutcome, LastTransactionResponse};
pub use requests::{
    CashoutOnlyRequest, MotoPurchaseRequest, PurchaseRequest, RefundRequest, TransactionResponse,
};
pub use types::{InitiateTxResult, MidTxResult, SuccessState, TransactionType};
