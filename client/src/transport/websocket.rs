//! WebSocket implementation of [`Transport`].
//!
//! Each connect attempt runs in its own task and carries a generation number.
//! `connect()` and `disconnect()` bump the generation under the lock, so a
//! superseded attempt that finishes late finds itself stale and reports
//! nothing. Events are emitted while holding the same lock, which keeps them
//! in order across the caller's thread and the connection task.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{ConnectionState, Transport, TransportError, TransportEvent};

enum Command {
    Send(String),
    Close,
}

struct Shared {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        // The listener going away means the engine is shutting down.
        let _ = self.events.send(event);
    }

    fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        self.emit(TransportEvent::StateChanged(state));
    }
}

pub struct WebSocketTransport {
    url: Mutex<String>,
    subprotocol: String,
    connect_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl WebSocketTransport {
    pub fn new(
        url: impl Into<String>,
        subprotocol: impl Into<String>,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            url: Mutex::new(url.into()),
            subprotocol: subprotocol.into(),
            connect_timeout,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                task: None,
                events,
            })),
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self) {
        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Connected {
            return;
        }
        if let Some(stale) = shared.task.take() {
            stale.abort();
        }

        shared.generation += 1;
        let generation = shared.generation;
        let (tx, rx) = mpsc::unbounded_channel();
        shared.outbound = Some(tx);
        shared.transition(ConnectionState::Connecting);

        let url = self.url.lock().clone();
        info!(%url, generation, "connecting to terminal");
        let task = tokio::spawn(run_connection(
            url,
            self.subprotocol.clone(),
            self.connect_timeout,
            generation,
            Arc::clone(&self.shared),
            rx,
        ));
        shared.task = Some(task);
    }

    fn disconnect(&self) {
        let mut shared = self.shared.lock();
        match shared.state {
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting => {
                if let Some(task) = shared.task.take() {
                    task.abort();
                }
            }
            ConnectionState::Connected => {
                // Let the pump send a close frame and exit on its own.
                if let Some(outbound) = &shared.outbound {
                    let _ = outbound.send(Command::Close);
                }
                shared.task = None;
            }
        }
        shared.generation += 1;
        shared.outbound = None;
        shared.transition(ConnectionState::Disconnected);
        info!("disconnected from terminal");
    }

    fn send(&self, text: String) {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Connected {
            debug!("dropping frame, transport not connected");
            return;
        }
        if let Some(outbound) = &shared.outbound {
            let _ = outbound.send(Command::Send(text));
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn set_url(&self, url: String) {
        *self.url.lock() = url;
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().task.take() {
            task.abort();
        }
    }
}

fn build_request(url: &str, subprotocol: &str) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let value = HeaderValue::from_str(subprotocol)
        .map_err(|_| TransportError::InvalidSubprotocol(subprotocol.to_string()))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    Ok(request)
}

/// Report a failed attempt, unless it has been superseded.
fn fail_attempt(shared: &Mutex<Shared>, generation: u64, error: &TransportError) {
    let mut shared = shared.lock();
    if shared.generation != generation {
        return;
    }
    warn!(%error, "terminal connection failed");
    shared.task = None;
    shared.outbound = None;
    shared.emit(TransportEvent::Error(error.to_string()));
    shared.transition(ConnectionState::Disconnected);
}

async fn run_connection(
    url: String,
    subprotocol: String,
    connect_timeout: Duration,
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let request = match build_request(&url, &subprotocol) {
        Ok(request) => request,
        Err(e) => return fail_attempt(&shared, generation, &e),
    };

    let stream =
        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return fail_attempt(&shared, generation, &TransportError::from(e)),
            Err(_) => {
                let ms = connect_timeout.as_millis() as u64;
                return fail_attempt(&shared, generation, &TransportError::Timeout(ms));
            }
        };

    {
        let mut guard = shared.lock();
        if guard.generation != generation {
            return;
        }
        guard.transition(ConnectionState::Connected);
    }
    info!(%url, "terminal connection established");

    let (mut write, mut read) = stream.split();
    let mut error: Option<String> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        error = Some(e.to_string());
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let guard = shared.lock();
                    if guard.generation != generation {
                        break;
                    }
                    guard.emit(TransportEvent::Received(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error = Some(e.to_string());
                    break;
                }
            },
        }
    }

    let mut guard = shared.lock();
    if guard.generation != generation {
        return;
    }
    guard.task = None;
    guard.outbound = None;
    if let Some(reason) = error {
        warn!(%reason, "terminal connection lost");
        guard.emit(TransportEvent::Error(reason));
    } else {
        info!("terminal closed the connection");
    }
    guard.transition(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> (WebSocketTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = WebSocketTransport::new(url, "spi.2.9.0", Duration::from_millis(500), tx);
        (t, rx)
    }

    #[test]
    fn request_carries_subprotocol() {
        let request = build_request("ws://127.0.0.1:8080", "spi.2.9.0").unwrap();
        assert_eq!(
            request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "spi.2.9.0"
        );
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(matches!(
            build_request("not a url", "spi.2.9.0"),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_no_op() {
        let (t, mut rx) = transport("ws://127.0.0.1:9");
        t.send("hello".into());
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (t, mut rx) = transport("ws://127.0.0.1:9");
        t.disconnect();
        t.disconnect();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_connect_reports_error_then_disconnected() {
        // Nothing listens on the discard port.
        let (t, mut rx) = transport("ws://127.0.0.1:9");
        t.connect();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::StateChanged(ConnectionState::Connecting))
        );
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::StateChanged(ConnectionState::Disconnected))
        );
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_attempt() {
        // A non-routable address keeps the attempt pending until the timeout.
        let (t, mut rx) = transport("ws://10.255.255.1:8080");
        t.connect();
        t.disconnect();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::StateChanged(ConnectionState::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::StateChanged(ConnectionState::Disconnected))
        );
        // The aborted attempt must not report anything afterwards.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(rx.try_recv().is_err());
    }
}
