//! The session state guarded by the controller's lock.
//!
//! Fields are private. Every mutation goes through a method that also queues
//! the matching [`SpiEvent`], and the controller publishes the queue only
//! after it has released the lock.

use serde::{Deserialize, Serialize};

use super::events::SpiEvent;
use super::pairing::PairingFlowState;
use crate::crypto::Secrets;
use crate::transaction::TransactionFlowState;

/// Whether we are paired, and if so whether the terminal is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpiStatus {
    Unpaired,
    PairedConnecting,
    PairedConnected,
}

/// What the session is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpiFlow {
    Idle,
    Pairing,
    Transaction,
}

#[derive(Debug)]
pub struct SessionState {
    status: SpiStatus,
    flow: SpiFlow,
    pairing: PairingFlowState,
    tx: Option<TransactionFlowState>,
    secrets: Option<Secrets>,
    /// Logged in on the current connection.
    ready_to_transact: bool,
    pending: Vec<SpiEvent>,
}

impl SessionState {
    pub fn new(secrets: Option<Secrets>) -> Self {
        let status = if secrets.is_some() {
            SpiStatus::PairedConnecting
        } else {
            SpiStatus::Unpaired
        };
        Self {
            status,
            flow: SpiFlow::Idle,
            pairing: PairingFlowState::default(),
            tx: None,
            secrets,
            ready_to_transact: false,
            pending: Vec::new(),
        }
    }

    pub fn status(&self) -> SpiStatus {
        self.status
    }

    pub fn flow(&self) -> SpiFlow {
        self.flow
    }

    pub fn pairing(&self) -> &PairingFlowState {
        &self.pairing
    }

    pub fn tx(&self) -> Option<&TransactionFlowState> {
        self.tx.as_ref()
    }

    pub fn secrets(&self) -> Option<&Secrets> {
        self.secrets.as_ref()
    }

    pub fn is_paired(&self) -> bool {
        self.status != SpiStatus::Unpaired
    }

    pub fn ready_to_transact(&self) -> bool {
        self.ready_to_transact
    }

    pub fn set_ready_to_transact(&mut self, ready: bool) {
        self.ready_to_transact = ready;
    }

    /// The active transaction, if there is one and it has not finished.
    pub fn active_tx(&self) -> Option<&TransactionFlowState> {
        match (self.flow, &self.tx) {
            (SpiFlow::Transaction, Some(tx)) if !tx.finished => Some(tx),
            _ => None,
        }
    }

    pub fn in_active_pairing(&self) -> bool {
        self.flow == SpiFlow::Pairing && !self.pairing.finished
    }

    pub fn set_status(&mut self, status: SpiStatus) {
        if self.status != status {
            self.status = status;
            self.pending.push(SpiEvent::StatusChanged(status));
        }
    }

    pub fn set_flow(&mut self, flow: SpiFlow) {
        if self.flow != flow {
            self.flow = flow;
            self.pending.push(SpiEvent::FlowChanged(flow));
        }
    }

    /// Replace the keys. `announce` queues a `SecretsChanged` for the POS to
    /// persist. Mid-pairing keys are not announced until pairing succeeds.
    pub fn set_secrets(&mut self, secrets: Option<Secrets>, announce: bool) {
        self.secrets = secrets;
        if announce {
            self.pending.push(SpiEvent::SecretsChanged(self.secrets.clone()));
        }
    }

    pub fn start_pairing(&mut self, pairing: PairingFlowState) {
        self.set_flow(SpiFlow::Pairing);
        self.replace_pairing(pairing);
    }

    fn replace_pairing(&mut self, pairing: PairingFlowState) {
        self.pairing = pairing;
        self.pending.push(SpiEvent::PairingFlowChanged(self.pairing.clone()));
    }

    /// Mutate the pairing state and queue a snapshot.
    pub fn update_pairing<R>(&mut self, f: impl FnOnce(&mut PairingFlowState) -> R) -> R {
        let out = f(&mut self.pairing);
        self.pending.push(SpiEvent::PairingFlowChanged(self.pairing.clone()));
        out
    }

    pub fn start_transaction(&mut self, tx: TransactionFlowState) {
        self.set_flow(SpiFlow::Transaction);
        self.pending.push(SpiEvent::TxFlowChanged(tx.clone()));
        self.tx = Some(tx);
    }

    /// Mutate the current transaction (finished or not) and queue a snapshot.
    /// Returns `None` when there is no transaction.
    pub fn update_tx<R>(&mut self, f: impl FnOnce(&mut TransactionFlowState) -> R) -> Option<R> {
        let tx = self.tx.as_mut()?;
        let out = f(tx);
        self.pending.push(SpiEvent::TxFlowChanged(tx.clone()));
        Some(out)
    }

    /// Finished flows may be acknowledged back to idle.
    pub fn current_flow_finished(&self) -> bool {
        match self.flow {
            SpiFlow::Idle => true,
            SpiFlow::Pairing => self.pairing.finished,
            SpiFlow::Transaction => self.tx.as_ref().map_or(true, |tx| tx.finished),
        }
    }

    pub fn back_to_idle(&mut self) {
        self.set_flow(SpiFlow::Idle);
    }

    pub fn take_events(&mut self) -> Vec<SpiEvent> {
        std::mem::take(&mut self.pending)
    }
}
