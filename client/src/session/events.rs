//! Notifications published to the POS.

use super::pairing::PairingFlowState;
use super::state::{SpiFlow, SpiStatus};
use crate::crypto::Secrets;
use crate::transaction::TransactionFlowState;

/// Broadcast to every [`Spi::subscribe`](super::Spi::subscribe)r after the
/// session lock has been released. Each carries a snapshot, so a slow
/// subscriber never observes a half-applied change.
#[derive(Debug, Clone)]
pub enum SpiEvent {
    StatusChanged(SpiStatus),
    FlowChanged(SpiFlow),
    PairingFlowChanged(PairingFlowState),
    TxFlowChanged(TransactionFlowState),
    /// New keys to persist, or `None` when they must be forgotten.
    SecretsChanged(Option<Secrets>),
}

/// Capacity of the notification channel. Lagging subscribers lose the
/// oldest notifications, and the getters always have the current state.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;
