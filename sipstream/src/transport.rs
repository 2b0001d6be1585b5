//! Transport state machine for a reliable, stream-style SIP transport.
//!
//! The machine owns the connection lifecycle (connect, disconnect,
//! keep-alive, unsolicited close) and hands framed messages up to the
//! user-agent core. The actual I/O lives behind the [`Connector`] and
//! [`Connection`] traits; the reference binding is the RFC 7118
//! WebSocket transport, but anything reliable, ordered and
//! message-preserving fits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::{Error, Result, StateTransitionError, TransportError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::timer::Timer;

/// The keep-alive ping frame (RFC 5626 CRLF mechanism).
pub const KEEP_ALIVE_PING: &str = "\r\n\r\n";
/// The keep-alive pong frame.
pub const KEEP_ALIVE_PONG: &str = "\r\n";

/// Transport connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Disconnected => "Disconnected",
            TransportState::Connecting => "Connecting",
            TransportState::Connected => "Connected",
            TransportState::Disconnecting => "Disconnecting",
        };
        f.write_str(s)
    }
}

/// Events an open connection delivers to the transport.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A framed, complete SIP message (or a bare CRLF keep-alive frame).
    Message(String),
    /// The connection closed. `None` for a locally requested close,
    /// `Some(error)` for an unsolicited one.
    Closed(Option<TransportError>),
}

/// An established connection.
///
/// Implementations must emit [`ConnectionEvent::Closed`] on the event
/// channel once the connection is down, including after a local
/// [`close`](Connection::close).
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, frame: &str) -> std::result::Result<(), TransportError>;

    async fn close(&self);

    /// Stream transports are reliable; the transaction layer skips
    /// retransmission timers when this is true.
    fn reliable(&self) -> bool {
        true
    }
}

/// The handle a [`Connector`] returns for a completed handshake.
pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Opens connections to a server. This is the pluggable I/O seam.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, server: &str) -> std::result::Result<ConnectionHandle, TransportError>;
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// The server URL handed to the connector.
    pub server: String,
    /// How long a connect attempt may take before it fails.
    pub connection_timeout: Duration,
    /// Base interval between keep-alive pings; `None` disables them.
    /// The effective interval is randomized to 80-100% of this.
    pub keep_alive_interval: Option<Duration>,
    /// How long to wait for the pong before logging a warning.
    pub keep_alive_debounce: Option<Duration>,
    /// Log every frame sent and received.
    pub trace_sip: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            server: String::new(),
            connection_timeout: Duration::from_secs(5),
            keep_alive_interval: None,
            keep_alive_debounce: None,
            trace_sip: false,
        }
    }
}

type ConnectWaiter = oneshot::Sender<std::result::Result<(), TransportError>>;
type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;

struct Inner {
    options: TransportOptions,
    connector: Box<dyn Connector>,
    state: Mutex<TransportState>,
    guard: TransitionGuard,
    state_emitter: StateEmitter<TransportState>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    /// Bumped per established connection; events carrying an older
    /// generation are stale and dropped.
    generation: AtomicU64,
    attempt: Mutex<Option<JoinHandle<()>>>,
    connect_waiters: Mutex<Vec<ConnectWaiter>>,
    disconnect_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    /// Set when `connect()` arrives while Disconnecting; the close
    /// completion then transitions straight to Connecting.
    connect_queued: AtomicBool,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    keep_alive_debounce: Mutex<Option<Timer>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

/// The transport state machine.
#[derive(Clone)]
pub struct Transport(Arc<Inner>);

impl Transport {
    pub fn new(connector: impl Connector, options: TransportOptions) -> Self {
        Transport(Arc::new(Inner {
            options,
            connector: Box::new(connector),
            state: Mutex::new(TransportState::Disconnected),
            guard: TransitionGuard::new("Transport"),
            state_emitter: StateEmitter::new(),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempt: Mutex::new(None),
            connect_waiters: Mutex::new(Vec::new()),
            disconnect_waiters: Mutex::new(Vec::new()),
            connect_queued: AtomicBool::new(false),
            keep_alive: Mutex::new(None),
            keep_alive_debounce: Mutex::new(None),
            on_message: Mutex::new(None),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> TransportState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn server(&self) -> &str {
        &self.0.options.server
    }

    /// Whether the current connection is reliable. Stream transports
    /// are; without a connection this answers for the binding's default.
    pub fn reliable(&self) -> bool {
        self.0
            .connection
            .lock()
            .expect("Lock failed")
            .as_ref()
            .map(|connection| connection.reliable())
            .unwrap_or(true)
    }

    /// Registers a state-change observer. Observers fire synchronously
    /// during the transition, after the state is updated and before
    /// pending connect/disconnect futures resolve.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&TransportState) + Send + Sync + 'static,
    {
        self.0.state_emitter.on(observer);
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.0.on_message.lock().expect("Lock failed") = Some(Arc::new(callback));
    }

    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.0.on_connect.lock().expect("Lock failed") = Some(Arc::new(callback));
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(Option<TransportError>) + Send + Sync + 'static,
    {
        *self.0.on_disconnect.lock().expect("Lock failed") = Some(Arc::new(callback));
    }

    /// Connects to the server.
    ///
    /// Completes when Connected is reached or the attempt fails.
    /// Concurrent calls share the in-flight attempt. Called while
    /// Disconnecting, the connect is queued as the next transition.
    pub async fn connect(&self) -> Result<()> {
        let rx = {
            match self.state() {
                TransportState::Connected => return Ok(()),
                TransportState::Connecting => self.push_connect_waiter(),
                TransportState::Disconnecting => {
                    self.0.connect_queued.store(true, Ordering::SeqCst);
                    self.push_connect_waiter()
                }
                TransportState::Disconnected => {
                    self.transition(TransportState::Connecting)?;
                    let rx = self.push_connect_waiter();
                    self.spawn_connect_attempt();
                    rx
                }
            }
        };
        // The attempt may have completed between the state check and the
        // waiter registration.
        if self.state() == TransportState::Connected {
            return Ok(());
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Disconnects from the server. Concurrent calls share the close.
    pub async fn disconnect(&self) -> Result<()> {
        let rx = {
            match self.state() {
                TransportState::Disconnected => return Ok(()),
                TransportState::Disconnecting => self.push_disconnect_waiter(),
                TransportState::Connecting => {
                    self.transition(TransportState::Disconnecting)?;
                    if let Some(attempt) = self.0.attempt.lock().expect("Lock failed").take() {
                        attempt.abort();
                    }
                    self.resolve_connect_waiters(Err(TransportError::ConnectAborted));
                    let rx = self.push_disconnect_waiter();
                    self.finish_disconnect();
                    rx
                }
                TransportState::Connected => {
                    self.transition(TransportState::Disconnecting)?;
                    let rx = self.push_disconnect_waiter();
                    self.stop_keep_alive();
                    let connection = self.0.connection.lock().expect("Lock failed").take();
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Some(connection) = connection {
                            connection.close().await;
                        }
                        // The Closed event normally completes the close;
                        // this is the fallback when the connection is
                        // already gone.
                        transport.finish_disconnect();
                    });
                    rx
                }
            }
        };
        if self.state() == TransportState::Disconnected {
            return Ok(());
        }
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Sends one SIP message. Rejects unless Connected.
    pub async fn send(&self, message: &str) -> Result<()> {
        let connection = {
            if self.state() != TransportState::Connected {
                return Err(TransportError::NotConnected.into());
            }
            self.0
                .connection
                .lock()
                .expect("Lock failed")
                .clone()
                .ok_or(TransportError::NotConnected)?
        };
        if self.0.options.trace_sip {
            log::debug!("sending message:\n\n{message}");
        }
        connection.send(message).await?;
        Ok(())
    }

    fn transition(&self, to: TransportState) -> std::result::Result<(), StateTransitionError> {
        let token = self.0.guard.enter()?;
        let from = {
            let mut state = self.0.state.lock().expect("Lock failed");
            let from = *state;
            if !legal_transition(from, to) {
                return Err(StateTransitionError::Invalid {
                    object: "Transport",
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };
        log::debug!("transport transitioned {from} -> {to}");
        // Release before observers so that an observer may start the
        // next transition instead of tripping the loop guard.
        token.release();
        self.0.state_emitter.emit(&to);
        Ok(())
    }

    fn push_connect_waiter(&self) -> oneshot::Receiver<std::result::Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.0.connect_waiters.lock().expect("Lock failed").push(tx);
        rx
    }

    fn push_disconnect_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.0
            .disconnect_waiters
            .lock()
            .expect("Lock failed")
            .push(tx);
        rx
    }

    fn resolve_connect_waiters(&self, result: std::result::Result<(), TransportError>) {
        let waiters: Vec<ConnectWaiter> =
            self.0.connect_waiters.lock().expect("Lock failed").drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_disconnect_waiters(&self) {
        let waiters: Vec<oneshot::Sender<()>> = self
            .0
            .disconnect_waiters
            .lock()
            .expect("Lock failed")
            .drain(..)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn spawn_connect_attempt(&self) {
        let transport = self.clone();
        let handle = tokio::spawn(async move {
            let open = transport
                .0
                .connector
                .open(&transport.0.options.server);
            match time::timeout(transport.0.options.connection_timeout, open).await {
                Ok(Ok(handle)) => transport.connect_succeeded(handle),
                Ok(Err(error)) => transport.connect_failed(error),
                Err(_) => transport.connect_failed(TransportError::ConnectTimeout),
            }
        });
        *self.0.attempt.lock().expect("Lock failed") = Some(handle);
    }

    fn connect_succeeded(&self, handle: ConnectionHandle) {
        if self.state() != TransportState::Connecting {
            // A disconnect won the race; drop the fresh connection.
            let connection = handle.connection;
            tokio::spawn(async move { connection.close().await });
            return;
        }
        let generation = self.0.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.0.connection.lock().expect("Lock failed") = Some(handle.connection);
        *self.0.attempt.lock().expect("Lock failed") = None;

        if self.transition(TransportState::Connected).is_err() {
            return;
        }
        self.spawn_reader(generation, handle.events);
        self.start_keep_alive(generation);
        let callback = self.0.on_connect.lock().expect("Lock failed").clone();
        if let Some(callback) = callback {
            callback();
        }
        self.resolve_connect_waiters(Ok(()));
    }

    fn connect_failed(&self, error: TransportError) {
        if self.state() != TransportState::Connecting {
            return;
        }
        log::warn!("connect to {} failed: {error}", self.server());
        *self.0.attempt.lock().expect("Lock failed") = None;
        if self.transition(TransportState::Disconnected).is_err() {
            return;
        }
        self.resolve_connect_waiters(Err(error));
    }

    fn finish_disconnect(&self) {
        if self.state() != TransportState::Disconnecting {
            return;
        }
        if self.0.connect_queued.swap(false, Ordering::SeqCst) {
            // connect() arrived mid-close: Disconnecting -> Connecting.
            self.resolve_disconnect_waiters();
            if self.transition(TransportState::Connecting).is_ok() {
                self.spawn_connect_attempt();
            }
            return;
        }
        if self.transition(TransportState::Disconnected).is_err() {
            return;
        }
        self.resolve_disconnect_waiters();
        let callback = self.0.on_disconnect.lock().expect("Lock failed").clone();
        if let Some(callback) = callback {
            callback(None);
        }
    }

    fn spawn_reader(&self, generation: u64, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if generation != transport.0.generation.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    ConnectionEvent::Message(frame) => transport.handle_frame(frame),
                    ConnectionEvent::Closed(error) => {
                        transport.handle_closed(error);
                        break;
                    }
                }
            }
        });
    }

    fn handle_frame(&self, frame: String) {
        if frame == KEEP_ALIVE_PING {
            // Server-side ping; answer and treat as liveness proof.
            self.clear_keep_alive_debounce();
            let transport = self.clone();
            tokio::spawn(async move {
                let _ = transport.send(KEEP_ALIVE_PONG).await;
            });
            return;
        }
        if frame == KEEP_ALIVE_PONG {
            self.clear_keep_alive_debounce();
            return;
        }
        if self.0.options.trace_sip {
            log::debug!("received message:\n\n{frame}");
        }
        let callback = self.0.on_message.lock().expect("Lock failed").clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    fn handle_closed(&self, error: Option<TransportError>) {
        match self.state() {
            TransportState::Disconnecting => self.finish_disconnect(),
            TransportState::Connected => {
                self.stop_keep_alive();
                *self.0.connection.lock().expect("Lock failed") = None;
                let error = error.unwrap_or_else(|| {
                    TransportError::ConnectionLost("connection closed".to_string())
                });
                log::warn!("transport disconnected: {error}");
                if self.transition(TransportState::Disconnected).is_err() {
                    return;
                }
                let callback = self.0.on_disconnect.lock().expect("Lock failed").clone();
                if let Some(callback) = callback {
                    callback(Some(error));
                }
            }
            _ => {}
        }
    }

    fn start_keep_alive(&self, generation: u64) {
        let Some(interval) = self.0.options.keep_alive_interval else {
            return;
        };
        let transport = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let delay = {
                    let mut rng = rand::rng();
                    let factor = rand::Rng::random_range(&mut rng, 0.8..=1.0);
                    interval.mul_f64(factor)
                };
                time::sleep(delay).await;
                if transport.state() != TransportState::Connected
                    || generation != transport.0.generation.load(Ordering::SeqCst)
                {
                    break;
                }
                if transport.send_keep_alive().await.is_err() {
                    break;
                }
            }
        });
        *self.0.keep_alive.lock().expect("Lock failed") = Some(handle);
    }

    async fn send_keep_alive(&self) -> Result<()> {
        {
            let debounce = self.0.keep_alive_debounce.lock().expect("Lock failed");
            if debounce.is_some() {
                // Still waiting on the previous pong.
                return Ok(());
            }
        }
        if let Some(debounce) = self.0.options.keep_alive_debounce {
            let transport = self.clone();
            let timer = Timer::start(debounce, async move {
                log::warn!("no keep-alive response within {debounce:?}");
                transport
                    .0
                    .keep_alive_debounce
                    .lock()
                    .expect("Lock failed")
                    .take();
            });
            *self.0.keep_alive_debounce.lock().expect("Lock failed") = Some(timer);
        }
        self.send(KEEP_ALIVE_PING).await
    }

    fn clear_keep_alive_debounce(&self) {
        self.0
            .keep_alive_debounce
            .lock()
            .expect("Lock failed")
            .take();
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.0.keep_alive.lock().expect("Lock failed").take() {
            handle.abort();
        }
        self.clear_keep_alive_debounce();
    }
}

fn legal_transition(from: TransportState, to: TransportState) -> bool {
    use TransportState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnecting)
            | (Connecting, Disconnected)
            | (Connected, Disconnecting)
            | (Connected, Disconnected)
            | (Disconnecting, Disconnected)
            | (Disconnecting, Connecting)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockConnector, MockServer};

    use std::sync::atomic::AtomicUsize;

    fn transport_with(server: &MockServer) -> Transport {
        Transport::new(
            MockConnector::new(server),
            TransportOptions {
                server: "wss://edge.example.com".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let server = MockServer::new();
        let transport = transport_with(&server);

        transport.connect().await.unwrap();

        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connect_shares_attempt() {
        let server = MockServer::new();
        let transport = transport_with(&server);

        let (a, b) = tokio::join!(transport.connect(), transport.connect());

        a.unwrap();
        b.unwrap();
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test]
    async fn test_send_rejects_when_not_connected() {
        let server = MockServer::new();
        let transport = transport_with(&server);

        let err = transport.send("OPTIONS").await.unwrap_err();

        assert_matches!(err, Error::Transport(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_delivers_frame() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        transport.connect().await.unwrap();

        transport.send("OPTIONS sip:x SIP/2.0\r\n\r\n").await.unwrap();

        assert_eq!(server.sent_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let server = MockServer::new();
        server.stall_connects();
        let transport = transport_with(&server);

        let err = transport.connect().await.unwrap_err();

        assert_matches!(err, Error::Transport(TransportError::ConnectTimeout));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_goes_back_to_disconnected() {
        let server = MockServer::new();
        server.refuse_connects();
        let transport = transport_with(&server);

        let err = transport.connect().await.unwrap_err();

        assert_matches!(err, Error::Transport(TransportError::ConnectionLost(_)));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_from_connected() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        transport.connect().await.unwrap();

        transport.disconnect().await.unwrap();

        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsolicited_close_surfaces_error() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        transport.on_disconnect(move |error| {
            if error.is_some() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        transport.connect().await.unwrap();

        server.drop_connection(TransportError::ConnectionLost("gone".to_string()));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_callback() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        transport.on_message(move |frame| sink.lock().unwrap().push(frame));
        transport.connect().await.unwrap();

        server.push_message("OPTIONS sip:x SIP/2.0\r\n\r\n");
        tokio::task::yield_now().await;

        assert_eq!(messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_ping_answered_with_pong() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        transport.connect().await.unwrap();

        server.push_message(KEEP_ALIVE_PING);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(server.sent_frames(), vec![KEEP_ALIVE_PONG.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_pings() {
        let server = MockServer::new();
        let transport = Transport::new(
            MockConnector::new(&server),
            TransportOptions {
                server: "wss://edge.example.com".to_string(),
                keep_alive_interval: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        );
        transport.connect().await.unwrap();

        // The interval is randomized to 80-100%; a full period is enough.
        time::sleep(Duration::from_secs(10)).await;

        let frames = server.sent_frames();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|frame| frame == KEEP_ALIVE_PING));
    }

    #[tokio::test]
    async fn test_connect_during_disconnect_queued() {
        let server = MockServer::new();
        let transport = transport_with(&server);
        transport.connect().await.unwrap();

        let disconnect = transport.disconnect();
        let reconnect = transport.connect();
        let (d, c) = tokio::join!(disconnect, reconnect);

        d.unwrap();
        c.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_mid_connect_aborts_attempt() {
        let server = MockServer::new();
        server.stall_connects();
        let transport = transport_with(&server);

        let connect = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await })
        };
        tokio::task::yield_now().await;
        transport.disconnect().await.unwrap();

        let result = connect.await.unwrap();
        assert_matches!(
            result,
            Err(Error::Transport(TransportError::ConnectAborted))
        );
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_transition_table() {
        use TransportState::*;

        assert!(legal_transition(Disconnected, Connecting));
        assert!(legal_transition(Disconnecting, Connecting));
        assert!(!legal_transition(Disconnected, Connected));
        assert!(!legal_transition(Connected, Connecting));
    }
}
