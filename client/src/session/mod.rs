//! # Session Controller
//!
//! [`Spi`] is the engine the POS holds on to. It owns the transport, the
//! keys, the pairing and transaction flows, and the timers that drive them.
//!
//! ## Concurrency
//!
//! All session state lives in one [`SessionState`] behind one lock. Three
//! kinds of callers mutate it:
//!
//! - POS calls (`initiate_*`, `cancel_transaction`, `pair`, ...) lock,
//!   mutate, and return synchronously.
//! - The dispatch loop consumes transport events (connection changes and
//!   inbound frames) and timer commands, one at a time.
//! - The heartbeat task only touches the keepalive bookkeeping and the
//!   transport.
//!
//! Notifications are queued while the lock is held and broadcast after it
//! is released. Nothing awaits with a lock held. Lock order is
//! `session` before `stamp`, `keepalive`, `config` and `tasks`.
//!
//! ```text
//!   transport ──► TransportEvent ──┐
//!   watchdog  ──► WatchdogTick  ──┼──► dispatch loop ──► SessionState ──► SpiEvent broadcast
//!   reconnect ──► Reconnect     ──┘                          ▲
//!   POS calls ───────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod keepalive;
pub mod pairing;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use events::SpiEvent;
pub use pairing::PairingFlowState;
pub use state::{SpiFlow, SpiStatus};

use self::events::EVENT_CHANNEL_CAPACITY;
use self::keepalive::{login_request, ping_request, pong_response, KeepAlive, LoginResponse};
use self::pairing::{
    confirmation_code, drop_keys_request, generate_secrets_and_key_response, pair_request,
    ConfirmProgress, KeyRequest,
};
use self::state::SessionState;
use crate::config::SpiConfig;
use crate::crypto::Secrets;
use crate::error::SpiError;
use crate::message::{decode, Event, Message, MessageStamp, RequestIds};
use crate::transaction::requests::{
    cancel_transaction_request, get_last_transaction_request, settle_request,
    settlement_enquiry_request, signature_accept, signature_decline,
};
use crate::transaction::{
    apply_glt_response, CashoutOnlyRequest, InitiateTxResult, MidTxResult, MotoPurchaseRequest,
    PurchaseRequest, RefundRequest, SuccessState, TransactionFlowState, TransactionType,
    WatchdogAction,
};
use crate::transport::{ConnectionState, Transport, TransportEvent, WebSocketTransport};

/// Capacity of the timer command queue. A full queue drops watchdog ticks,
/// which is harmless since the next tick re-evaluates everything.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

const PAIRING_FAILED: &str = "Pairing Failed";

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn to_time_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn with_summary(display: String, summary: Option<&str>) -> String {
    match summary {
        Some(summary) => format!("{display}. {summary}"),
        None => display,
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Timer-originated work, executed on the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    WatchdogTick,
    Reconnect,
}

#[derive(Default)]
struct Tasks {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

type Receivers = (
    mpsc::UnboundedReceiver<TransportEvent>,
    mpsc::Receiver<Command>,
);

pub(crate) struct SpiInner {
    pub(crate) config: Mutex<SpiConfig>,
    session: Mutex<SessionState>,
    stamp: Mutex<MessageStamp>,
    pub(crate) keepalive: Mutex<KeepAlive>,
    ids: RequestIds,
    pub(crate) transport: Arc<dyn Transport>,
    events: broadcast::Sender<SpiEvent>,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
    receivers: Mutex<Option<Receivers>>,
}

impl SpiInner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `f` under the session lock, then publish whatever it queued.
    fn with_session<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (out, events) = {
            let mut session = self.session.lock();
            let out = f(&mut session);
            (out, session.take_events())
        };
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        out
    }

    /// Stamp, seal and hand a message to the transport. Returns false when
    /// it could not go out.
    fn send_locked(&self, session: &SessionState, msg: &Message) -> bool {
        if !self.transport.is_connected() {
            debug!(event = %msg.event, id = %msg.id, "not connected, message not sent");
            return false;
        }
        let frame = match self.stamp.lock().encode(msg, session.secrets()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = %msg.event, id = %msg.id, error = %e, "could not encode message");
                return false;
            }
        };
        debug!(event = %msg.event, id = %msg.id, "sending");
        self.transport.send(frame);
        true
    }

    fn send_message(&self, msg: &Message) -> bool {
        self.with_session(|s| self.send_locked(s, msg))
    }

    /// Called by the heartbeat loop.
    pub(crate) fn send_ping(&self) -> bool {
        let ping = ping_request(&self.ids);
        self.keepalive.lock().ping_sent(ping.id.clone());
        self.with_session(|s| s.secrets().is_some() && self.send_locked(s, &ping))
    }

    // -- tasks --------------------------------------------------------------

    fn start_heartbeat(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if let Some(stale) = tasks.heartbeat.take() {
            stale.abort();
        }
        if self.is_shut_down() {
            return;
        }
        let shutdown = self.shutdown.subscribe();
        tasks.heartbeat = Some(tokio::spawn(keepalive::run_heartbeat(Arc::clone(self), shutdown)));
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.tasks.lock().heartbeat.take() {
            handle.abort();
        }
    }

    fn schedule_reconnect(&self) {
        if self.is_shut_down() {
            return;
        }
        let delay = self.config.lock().reconnect_delay();
        let commands = self.commands.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::Reconnect).await;
                }
                _ = shutdown.changed() => {}
            }
        });
        if let Some(stale) = self.tasks.lock().reconnect.replace(handle) {
            stale.abort();
        }
        info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self.tasks.lock().reconnect.take() {
            handle.abort();
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(ConnectionState::Connecting) => {
                debug!("connecting to terminal");
            }
            TransportEvent::StateChanged(ConnectionState::Connected) => self.on_connected(),
            TransportEvent::StateChanged(ConnectionState::Disconnected) => self.on_disconnected(),
            TransportEvent::Received(text) => self.on_frame(&text),
            TransportEvent::Error(e) => warn!(error = %e, "transport error"),
        }
    }

    fn on_command(&self, command: Command) {
        match command {
            Command::WatchdogTick => self.check_transaction(local_now()),
            Command::Reconnect => {
                if self.is_shut_down() {
                    return;
                }
                let reconnect = self.with_session(|s| s.status() == SpiStatus::PairedConnecting);
                if reconnect {
                    info!("reconnecting to terminal");
                    self.transport.connect();
                }
            }
        }
    }

    fn on_connected(self: &Arc<Self>) {
        info!("connected to terminal");
        self.stamp.lock().reset_connection();
        self.keepalive.lock().reset();

        let paired = self.with_session(|s| {
            if s.in_active_pairing() {
                s.update_pairing(|p| p.message = "Requesting to pair...".into());
                self.send_locked(s, &pair_request(&self.ids));
                return false;
            }
            s.is_paired()
        });
        if paired {
            self.start_heartbeat();
        }
    }

    fn on_disconnected(&self) {
        info!("disconnected from terminal");
        self.stop_heartbeat();
        self.keepalive.lock().reset();

        let reconnect = self.with_session(|s| {
            s.set_ready_to_transact(false);
            if s.in_active_pairing() {
                warn!("lost connection during pairing");
                self.on_pairing_failed(s);
                return false;
            }
            if s.is_paired() {
                s.set_status(SpiStatus::PairedConnecting);
                return true;
            }
            false
        });
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn on_frame(self: &Arc<Self>, text: &str) {
        let secrets = self.session.lock().secrets().cloned();
        let msg = decode(text, secrets.as_ref());
        info!(event = %msg.event, id = %msg.id, "received");

        match &msg.event {
            Event::KeyRequest => self.handle_key_request(&msg),
            Event::KeyCheck => self.handle_key_check(&msg),
            Event::PairResponse => self.handle_pair_response(&msg),
            Event::DropKeys => self.handle_drop_keys(),
            Event::LoginResponse => self.handle_login_response(&msg),
            Event::Ping => {
                self.send_message(&pong_response(&msg));
            }
            Event::Pong => self.handle_pong(&msg),
            Event::KeyRollRequest => self.handle_key_roll(&msg),
            Event::PurchaseResponse
            | Event::RefundResponse
            | Event::CashoutOnlyResponse
            | Event::MotoPurchaseResponse
            | Event::SettleResponse
            | Event::SettlementEnquiryResponse => self.handle_tx_response(&msg),
            Event::SignatureRequired => self.handle_signature_required(&msg),
            Event::CancelTransactionResponse => self.handle_cancel_response(&msg),
            Event::GetLastTransactionResponse => self.handle_glt_response(&msg),
            Event::Error => self.handle_error(&msg),
            Event::InvalidHmacSignature => {
                info!("could not verify message from terminal, re-pairing may be required");
            }
            Event::NoSecrets => info!("received an encrypted message while holding no keys"),
            Event::Unparseable => warn!(frame = %text, "could not parse frame"),
            Event::PairRequest
            | Event::KeyResponse
            | Event::LoginRequest
            | Event::KeyRollResponse
            | Event::PurchaseRequest
            | Event::RefundRequest
            | Event::CashoutOnlyRequest
            | Event::MotoPurchaseRequest
            | Event::SettleRequest
            | Event::SettlementEnquiryRequest
            | Event::CancelTransactionRequest
            | Event::GetLastTransactionRequest
            | Event::SignatureAccepted
            | Event::SignatureDeclined
            | Event::Other(_) => info!(event = %msg.event, "ignoring unexpected event"),
        }
    }

    // -- pairing ------------------------------------------------------------

    fn handle_key_request(&self, msg: &Message) {
        if !self.with_session(|s| s.in_active_pairing()) {
            warn!("key_request outside of pairing, ignoring");
            return;
        }
        // The exchange is slow enough to keep out of the lock.
        let exchange = KeyRequest::from_message(msg).and_then(|r| generate_secrets_and_key_response(&r));

        self.with_session(|s| {
            if !s.in_active_pairing() {
                return;
            }
            match exchange {
                Ok((secrets, response)) => {
                    s.update_pairing(|p| p.negotiating());
                    s.set_secrets(Some(secrets), false);
                    self.send_locked(s, &response);
                }
                Err(e) => {
                    warn!(error = %e, "key exchange failed");
                    self.on_pairing_failed(s);
                }
            }
        });
    }

    fn handle_key_check(&self, msg: &Message) {
        self.with_session(|s| {
            if !s.in_active_pairing() {
                return;
            }
            match confirmation_code(msg) {
                Some(code) => {
                    info!(code = %code, "confirmation code received");
                    s.update_pairing(|p| p.key_check_received(code));
                }
                None => warn!("key_check without a usable hmac"),
            }
        });
    }

    fn handle_pair_response(self: &Arc<Self>, msg: &Message) {
        let keep_alive = self.with_session(|s| {
            if !s.in_active_pairing() {
                return false;
            }
            if msg.success_state() != SuccessState::Success {
                warn!("terminal rejected pairing");
                self.on_pairing_failed(s);
                return false;
            }
            match s.update_pairing(|p| p.terminal_confirmed()) {
                ConfirmProgress::Complete => self.on_pairing_success(s),
                ConfirmProgress::Waiting => info!("terminal confirmed, waiting for the POS operator"),
                ConfirmProgress::Ignored => {}
            }
            true
        });
        if keep_alive {
            self.start_heartbeat();
        }
    }

    fn on_pairing_success(&self, s: &mut SessionState) {
        info!("pairing successful");
        s.update_pairing(|p| p.succeeded());
        s.set_status(SpiStatus::PairedConnected);
        let secrets = s.secrets().cloned();
        s.set_secrets(secrets, true);
    }

    fn on_pairing_failed(&self, s: &mut SessionState) {
        s.set_secrets(None, false);
        s.set_status(SpiStatus::Unpaired);
        s.set_ready_to_transact(false);
        s.update_pairing(|p| p.failed(PAIRING_FAILED));
        self.stop_heartbeat();
        self.transport.disconnect();
    }

    fn handle_drop_keys(&self) {
        self.with_session(|s| {
            if s.in_active_pairing() {
                self.on_pairing_failed(s);
            } else if s.is_paired() {
                info!("terminal dropped our keys, unpairing");
                self.unpair_locked(s);
            }
        });
    }

    fn unpair_locked(&self, s: &mut SessionState) {
        s.set_status(SpiStatus::Unpaired);
        s.set_secrets(None, true);
        s.set_ready_to_transact(false);
        self.stop_heartbeat();
        self.cancel_reconnect();
        self.keepalive.lock().reset();
        self.transport.disconnect();
    }

    // -- keepalive and login ------------------------------------------------

    fn update_server_time_delta(&self, msg: &Message) -> TimeDelta {
        let mut stamp = self.stamp.lock();
        if let Some(delta) = msg.server_time_delta(local_now()) {
            stamp.server_time_delta = delta;
        }
        stamp.server_time_delta
    }

    fn handle_pong(&self, msg: &Message) {
        if !self.keepalive.lock().pong_received(&msg.id) {
            debug!(id = %msg.id, "pong does not answer the latest ping");
        }
        let delta = self.update_server_time_delta(msg);
        let needs_login = self.keepalive.lock().needs_login(local_now() + delta);
        if needs_login {
            info!("requesting login");
            self.send_message(&login_request(&self.ids));
        }
    }

    fn handle_login_response(&self, msg: &Message) {
        self.update_server_time_delta(msg);
        let login = LoginResponse::from_message(msg);
        if !login.success {
            warn!("login rejected by terminal, dropping connection");
            self.transport.disconnect();
            return;
        }
        self.keepalive.lock().set_login(login);

        self.with_session(|s| {
            if s.ready_to_transact() {
                debug!("login refreshed");
                return;
            }
            s.set_ready_to_transact(true);
            if s.in_active_pairing() || !s.is_paired() {
                return;
            }
            info!("ready to transact");
            s.set_status(SpiStatus::PairedConnected);
            self.resume_transaction(s);
        });
    }

    /// Pick an interrupted transaction back up after a fresh login.
    fn resume_transaction(&self, s: &mut SessionState) {
        let Some(tx) = s.active_tx() else {
            return;
        };
        if tx.request_sent {
            info!(pos_ref_id = %tx.pos_ref_id, "reconnected mid-transaction, asking for the last transaction");
            s.update_tx(|t| t.calling_glt(local_now()));
            self.send_locked(s, &get_last_transaction_request(&self.ids));
        } else {
            let request = tx.request.clone();
            if self.send_locked(s, &request) {
                s.update_tx(|t| t.sent(local_now(), "Sending request now..."));
            }
        }
    }

    fn handle_key_roll(&self, msg: &Message) {
        self.with_session(|s| {
            let Some(current) = s.secrets().cloned() else {
                warn!("key roll requested while holding no keys");
                return;
            };
            info!("rolling keys");
            s.set_secrets(Some(current.rotate()), true);
            let ack = Message::new(
                msg.id.clone(),
                Event::KeyRollResponse,
                json!({"status": "confirmed"}),
                true,
            );
            self.send_locked(s, &ack);
        });
    }

    // -- transactions -------------------------------------------------------

    fn handle_tx_response(&self, msg: &Message) {
        self.with_session(|s| {
            let Some(tx) = s.active_tx() else {
                info!(event = %msg.event, "response arrived with no transaction in progress");
                return;
            };
            if msg.event != tx.tx_type.response_event() || !tx.is_response_for_us(msg) {
                info!(
                    event = %msg.event,
                    pos_ref_id = msg.pos_ref_id().unwrap_or(""),
                    "response is not for the current transaction"
                );
                return;
            }
            let success = msg.success_state();
            info!(pos_ref_id = %tx.pos_ref_id, ?success, "transaction ended");
            s.update_tx(|t| t.completed(success, Some(msg.clone()), "Transaction ended"));
        });
    }

    fn handle_signature_required(&self, msg: &Message) {
        self.with_session(|s| {
            let Some(tx) = s.active_tx() else {
                return;
            };
            if msg.pos_ref_id() != Some(tx.pos_ref_id.as_str()) {
                info!("signature_required for another transaction, ignoring");
                return;
            }
            s.update_tx(|t| t.signature_required(msg.clone(), "Ask customer to sign the receipt"));
        });
    }

    fn handle_cancel_response(&self, msg: &Message) {
        self.with_session(|s| {
            let Some(tx) = s.active_tx() else {
                return;
            };
            if msg.pos_ref_id().is_some_and(|r| r != tx.pos_ref_id) {
                return;
            }
            if msg.success_state() == SuccessState::Success {
                debug!("cancel accepted, waiting for the final response");
                return;
            }
            let display = match msg.error_reason() {
                Some("TXN_PAST_POINT_OF_NO_RETURN") => {
                    "Too late to cancel. Transaction is past the point of no return.".to_string()
                }
                _ => format!(
                    "Failed to cancel transaction: {}. Check EFTPOS.",
                    msg.error_detail().unwrap_or("unknown reason")
                ),
            };
            s.update_tx(|t| t.cancel_failed(display));
        });
    }

    fn handle_glt_response(&self, msg: &Message) {
        let delta = self.stamp.lock().server_time_delta;
        self.with_session(|s| {
            if s.active_tx().is_none() {
                info!("last_transaction with no transaction in progress");
                return;
            }
            let outcome = s.update_tx(|t| apply_glt_response(t, msg, delta));
            debug!(?outcome, "last transaction applied");
        });
    }

    fn handle_error(&self, msg: &Message) {
        let reason = msg.error_reason().unwrap_or("");
        self.with_session(|s| {
            let cancelling = s.active_tx().is_some_and(|t| t.attempting_to_cancel);
            if cancelling && reason.starts_with("NO_TRANSACTION") {
                info!("cancel found no transaction on the terminal, asking for the last transaction");
                s.update_tx(|t| t.calling_glt(local_now()));
                self.send_locked(s, &get_last_transaction_request(&self.ids));
                return;
            }
            warn!(reason, detail = msg.error_detail().unwrap_or(""), "terminal reported an error");
        });
    }

    /// One watchdog pass over the active transaction.
    pub(crate) fn check_transaction(&self, now: NaiveDateTime) {
        let (max_wait_for_cancel, check_on_tx_frequency) = {
            let config = self.config.lock();
            (
                to_time_delta(config.max_wait_for_cancel_tx()),
                to_time_delta(config.check_on_tx_frequency()),
            )
        };
        self.with_session(|s| {
            let Some(tx) = s.active_tx() else {
                return;
            };
            match tx.watchdog_action(now, max_wait_for_cancel, check_on_tx_frequency) {
                WatchdogAction::Nothing => {}
                WatchdogAction::CancelTimedOut => {
                    warn!(pos_ref_id = %tx.pos_ref_id, "cancel took too long");
                    s.update_tx(|t| t.unknown_completed("Cancel took too long. Check EFTPOS."));
                }
                WatchdogAction::RequestLastTransaction => {
                    if !s.ready_to_transact() {
                        return;
                    }
                    info!(pos_ref_id = %tx.pos_ref_id, "checking on transaction");
                    s.update_tx(|t| t.calling_glt(now));
                    self.send_locked(s, &get_last_transaction_request(&self.ids));
                }
            }
        });
    }

    fn initiate(
        &self,
        pos_ref_id: String,
        tx_type: TransactionType,
        amount_cents: u64,
        request: Message,
        amount_summary: Option<String>,
    ) -> InitiateTxResult {
        self.with_session(|s| {
            if !s.is_paired() {
                return InitiateTxResult::rejected("Not Paired");
            }
            if s.flow() != SpiFlow::Idle {
                return InitiateTxResult::rejected("Not Idle");
            }
            let now = local_now();
            let mut tx = TransactionFlowState::new(
                pos_ref_id,
                tx_type,
                amount_cents,
                request.clone(),
                with_summary(
                    format!("Waiting for EFTPOS connection to make {tx_type} request"),
                    amount_summary.as_deref(),
                ),
                now,
            );
            if self.send_locked(s, &request) {
                let display = with_summary(
                    format!("Asked EFTPOS to accept {tx_type}"),
                    amount_summary.as_deref(),
                );
                tx.sent(now, display);
            }
            info!(pos_ref_id = %tx.pos_ref_id, %tx_type, amount_cents, sent = tx.request_sent, "transaction initiated");
            s.start_transaction(tx);
            InitiateTxResult::ok(format!("{tx_type} Initiated"))
        })
    }
}

async fn run_dispatch(
    inner: Arc<SpiInner>,
    (mut transport_events, mut commands): Receivers,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = transport_events.recv() => match event {
                Some(event) => inner.on_transport_event(event),
                None => break,
            },
            command = commands.recv() => match command {
                Some(command) => inner.on_command(command),
                None => break,
            },
        }
    }
    debug!("dispatch loop stopped");
}

async fn run_watchdog(
    commands: mpsc::Sender<Command>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if commands.try_send(Command::WatchdogTick).is_err() {
                    debug!("watchdog tick dropped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// The POS-side engine. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Spi {
    inner: Arc<SpiInner>,
}

impl Spi {
    /// Build an engine speaking WebSocket to `config.eftpos_address`.
    ///
    /// `secrets` are the keys persisted from an earlier pairing, if any.
    pub fn new(config: SpiConfig, secrets: Option<Secrets>) -> Result<Self, SpiError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WebSocketTransport::new(
            config.websocket_url(),
            config.subprotocol(),
            config.connect_timeout(),
            events_tx,
        ));
        Self::with_transport(config, secrets, transport, events_rx)
    }

    /// Build an engine over any [`Transport`]. `transport_events` must be
    /// the receiving end of the channel the transport reports to.
    pub fn with_transport(
        config: SpiConfig,
        secrets: Option<Secrets>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Self, SpiError> {
        config.validate_timings()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let stamp = MessageStamp::new(config.pos_id.clone());

        Ok(Self {
            inner: Arc::new(SpiInner {
                config: Mutex::new(config),
                session: Mutex::new(SessionState::new(secrets)),
                stamp: Mutex::new(stamp),
                keepalive: Mutex::new(KeepAlive::default()),
                ids: RequestIds::default(),
                transport,
                events,
                commands,
                shutdown,
                tasks: Mutex::new(Tasks::default()),
                receivers: Mutex::new(Some((transport_events, commands_rx))),
            }),
        })
    }

    /// Spawn the background tasks and, when already paired, connect.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SpiError> {
        if self.inner.is_shut_down() {
            return Err(SpiError::Disposed);
        }
        let paired = self.inner.with_session(|s| s.is_paired());
        let interval = {
            let config = self.inner.config.lock();
            if paired {
                config.validate()?;
            }
            config.tx_monitor_interval()
        };
        let receivers = self.inner.receivers.lock().take().ok_or(SpiError::AlreadyStarted)?;

        tokio::spawn(run_dispatch(
            Arc::clone(&self.inner),
            receivers,
            self.inner.shutdown.subscribe(),
        ));
        tokio::spawn(run_watchdog(
            self.inner.commands.clone(),
            interval,
            self.inner.shutdown.subscribe(),
        ));

        if paired {
            info!("starting with stored keys, connecting");
            self.inner.transport.connect();
        } else {
            info!("starting unpaired");
        }
        Ok(())
    }

    /// Stop every task and close the connection. The engine cannot be
    /// restarted afterwards.
    pub fn dispose(&self) {
        info!("disposing");
        self.inner.shutdown.send_replace(true);
        self.inner.stop_heartbeat();
        self.inner.cancel_reconnect();
        self.inner.transport.disconnect();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpiEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SpiStatus {
        self.inner.session.lock().status()
    }

    pub fn flow(&self) -> SpiFlow {
        self.inner.session.lock().flow()
    }

    pub fn pairing_flow_state(&self) -> PairingFlowState {
        self.inner.session.lock().pairing().clone()
    }

    /// The current or most recent transaction.
    pub fn tx_flow_state(&self) -> Option<TransactionFlowState> {
        self.inner.session.lock().tx().cloned()
    }

    pub fn secrets(&self) -> Option<Secrets> {
        self.inner.session.lock().secrets().cloned()
    }

    pub fn config(&self) -> SpiConfig {
        self.inner.config.lock().clone()
    }

    /// Change the POS id. Only allowed while unpaired.
    pub fn set_pos_id(&self, pos_id: impl Into<String>) -> bool {
        let pos_id = pos_id.into();
        self.inner.with_session(|s| {
            if s.is_paired() {
                return false;
            }
            self.inner.config.lock().pos_id = pos_id.clone();
            self.inner.stamp.lock().pos_id = pos_id;
            true
        })
    }

    /// Change the terminal address. Only allowed while unpaired.
    pub fn set_eftpos_address(&self, address: impl Into<String>) -> bool {
        let address = address.into();
        self.inner.with_session(|s| {
            if s.is_paired() {
                return false;
            }
            let url = {
                let mut config = self.inner.config.lock();
                config.eftpos_address = address;
                config.websocket_url()
            };
            self.inner.transport.set_url(url);
            true
        })
    }

    // -- pairing ------------------------------------------------------------

    /// Begin pairing with the configured terminal.
    pub fn pair(&self) -> bool {
        if let Err(e) = self.inner.config.lock().validate() {
            warn!(error = %e, "cannot pair");
            return false;
        }
        let started = self.inner.with_session(|s| {
            if s.is_paired() {
                warn!("already paired");
                return false;
            }
            if s.flow() == SpiFlow::Transaction {
                return false;
            }
            s.start_pairing(PairingFlowState::connecting());
            if self.inner.transport.is_connected() {
                s.update_pairing(|p| p.message = "Requesting to pair...".into());
                self.inner.send_locked(s, &pair_request(&self.inner.ids));
            }
            true
        });
        if started && !self.inner.transport.is_connected() {
            self.inner.transport.connect();
        }
        started
    }

    /// The operator confirmed the code shown on both screens.
    pub fn pairing_confirm_code(&self) {
        self.inner.with_session(|s| {
            if !s.in_active_pairing() {
                return;
            }
            match s.update_pairing(|p| p.pos_confirmed()) {
                ConfirmProgress::Complete => self.inner.on_pairing_success(s),
                ConfirmProgress::Waiting => info!("POS confirmed, waiting for the terminal"),
                ConfirmProgress::Ignored => {}
            }
        });
    }

    pub fn pairing_cancel(&self) {
        self.inner.with_session(|s| {
            if !s.in_active_pairing() {
                return;
            }
            if s.pairing().terminal_believes_paired() {
                self.inner.send_locked(s, &drop_keys_request(&self.inner.ids));
            }
            self.inner.on_pairing_failed(s);
        });
    }

    /// Forget the keys and tell the terminal to do the same. Only while
    /// paired and idle.
    pub fn unpair(&self) -> bool {
        self.inner.with_session(|s| {
            if !s.is_paired() || s.flow() != SpiFlow::Idle {
                return false;
            }
            self.inner.send_locked(s, &drop_keys_request(&self.inner.ids));
            self.inner.unpair_locked(s);
            true
        })
    }

    // -- transactions -------------------------------------------------------

    pub fn initiate_purchase_tx(
        &self,
        pos_ref_id: impl Into<String>,
        purchase_amount: u64,
        tip_amount: u64,
        cashout_amount: u64,
        prompt_for_cashout: bool,
    ) -> InitiateTxResult {
        let request = PurchaseRequest {
            tip_amount,
            cashout_amount,
            prompt_for_cashout,
            ..PurchaseRequest::new(pos_ref_id, purchase_amount)
        };
        let msg = request.to_message(&self.inner.ids);
        let summary = request.amount_summary();
        self.inner.initiate(
            request.pos_ref_id,
            TransactionType::Purchase,
            purchase_amount,
            msg,
            Some(summary),
        )
    }

    pub fn initiate_refund_tx(&self, pos_ref_id: impl Into<String>, amount_cents: u64) -> InitiateTxResult {
        let request = RefundRequest {
            pos_ref_id: pos_ref_id.into(),
            amount_cents,
        };
        let msg = request.to_message(&self.inner.ids);
        self.inner.initiate(request.pos_ref_id, TransactionType::Refund, amount_cents, msg, None)
    }

    pub fn initiate_cashout_only_tx(
        &self,
        pos_ref_id: impl Into<String>,
        amount_cents: u64,
    ) -> InitiateTxResult {
        let request = CashoutOnlyRequest {
            pos_ref_id: pos_ref_id.into(),
            amount_cents,
        };
        let msg = request.to_message(&self.inner.ids);
        self.inner
            .initiate(request.pos_ref_id, TransactionType::CashoutOnly, amount_cents, msg, None)
    }

    pub fn initiate_moto_purchase_tx(
        &self,
        pos_ref_id: impl Into<String>,
        amount_cents: u64,
    ) -> InitiateTxResult {
        let request = MotoPurchaseRequest {
            pos_ref_id: pos_ref_id.into(),
            amount_cents,
        };
        let msg = request.to_message(&self.inner.ids);
        self.inner.initiate(request.pos_ref_id, TransactionType::Moto, amount_cents, msg, None)
    }

    pub fn initiate_settle_tx(&self, pos_ref_id: impl Into<String>) -> InitiateTxResult {
        let msg = settle_request(&self.inner.ids);
        self.inner.initiate(pos_ref_id.into(), TransactionType::Settle, 0, msg, None)
    }

    pub fn initiate_settlement_enquiry(&self, pos_ref_id: impl Into<String>) -> InitiateTxResult {
        let msg = settlement_enquiry_request(&self.inner.ids);
        self.inner
            .initiate(pos_ref_id.into(), TransactionType::SettlementEnquiry, 0, msg, None)
    }

    /// Ask the terminal what its last transaction was.
    pub fn initiate_get_last_tx(&self) -> InitiateTxResult {
        let msg = get_last_transaction_request(&self.inner.ids);
        let pos_ref_id = msg.id.clone();
        self.inner.initiate(pos_ref_id, TransactionType::GetLastTransaction, 0, msg, None)
    }

    /// Try to cancel the transaction in flight. The outcome arrives later
    /// through the transaction flow state.
    pub fn cancel_transaction(&self) -> MidTxResult {
        self.inner.with_session(|s| {
            let Some(tx) = s.active_tx() else {
                return MidTxResult::rejected("Asked to cancel transaction but I was not in the middle of one.");
            };
            let now = local_now();
            if !tx.request_sent {
                s.update_tx(|t| {
                    t.cancelling(now, "Attempting to cancel transaction...");
                    t.failed(None, "Transaction cancelled. Request had not even been sent yet.");
                });
                return MidTxResult::ok("");
            }
            s.update_tx(|t| t.cancelling(now, "Attempting to cancel transaction..."));
            self.inner.send_locked(s, &cancel_transaction_request(&self.inner.ids));
            MidTxResult::ok("")
        })
    }

    /// Answer the terminal's signature check.
    pub fn accept_signature(&self, accepted: bool) -> MidTxResult {
        self.inner.with_session(|s| {
            let pos_ref_id = match s.active_tx() {
                Some(tx) if tx.awaiting_signature_check => tx.pos_ref_id.clone(),
                _ => {
                    return MidTxResult::rejected("Asked to accept signature but I was not waiting for one.");
                }
            };
            let (msg, display) = if accepted {
                (signature_accept(&self.inner.ids, &pos_ref_id), "Accepting signature...")
            } else {
                (signature_decline(&self.inner.ids, &pos_ref_id), "Declining signature...")
            };
            s.update_tx(|t| t.signature_responded(display));
            self.inner.send_locked(s, &msg);
            MidTxResult::ok("")
        })
    }

    /// Acknowledge a finished flow and return to idle. Returns false while
    /// the flow is still running.
    pub fn ack_flow_ended_and_back_to_idle(&self) -> bool {
        self.inner.with_session(|s| {
            if s.flow() == SpiFlow::Idle {
                return true;
            }
            if s.current_flow_finished() {
                s.back_to_idle();
                return true;
            }
            false
        })
    }
}
