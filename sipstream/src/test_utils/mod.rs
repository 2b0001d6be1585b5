//! Shared mocks for tests: an in-memory transport connector, message
//! builders and a recording transaction user.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::{Method, Request, Response, Uri};
use crate::transaction::{ClientTransactionUser, ServerTransactionUser};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionHandle, Connector, Transport, TransportOptions,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Accept,
    Stall,
    Refuse,
}

struct ServerInner {
    opens: AtomicUsize,
    mode: Mutex<ConnectMode>,
    sent: Mutex<Vec<String>>,
    reliable: AtomicBool,
    fail_sends: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

/// The far end of a mock connection: records sent frames and lets tests
/// inject inbound messages, refusals and connection drops.
#[derive(Clone)]
pub struct MockServer(Arc<ServerInner>);

impl MockServer {
    pub fn new() -> Self {
        MockServer(Arc::new(ServerInner {
            opens: AtomicUsize::new(0),
            mode: Mutex::new(ConnectMode::Accept),
            sent: Mutex::new(Vec::new()),
            reliable: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            events: Mutex::new(None),
        }))
    }

    pub fn open_count(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    /// Everything the client sent, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.0.sent.lock().unwrap().clone()
    }

    pub fn last_frame(&self) -> Option<String> {
        self.0.sent.lock().unwrap().last().cloned()
    }

    pub fn clear_sent(&self) {
        self.0.sent.lock().unwrap().clear();
    }

    /// Make connect attempts hang forever.
    pub fn stall_connects(&self) {
        *self.0.mode.lock().unwrap() = ConnectMode::Stall;
    }

    /// Make connect attempts fail immediately.
    pub fn refuse_connects(&self) {
        *self.0.mode.lock().unwrap() = ConnectMode::Refuse;
    }

    pub fn accept_connects(&self) {
        *self.0.mode.lock().unwrap() = ConnectMode::Accept;
    }

    /// Pretend the connection is datagram-like so retransmission timers
    /// run.
    pub fn set_unreliable(&self) {
        self.0.reliable.store(false, Ordering::SeqCst);
    }

    /// Make every send fail with a transport error.
    pub fn fail_sends(&self) {
        self.0.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Delivers an inbound frame to the client.
    pub fn push_message(&self, frame: impl Into<String>) {
        if let Some(events) = self.0.events.lock().unwrap().as_ref() {
            let _ = events.send(ConnectionEvent::Message(frame.into()));
        }
    }

    /// Closes the connection from the server side.
    pub fn drop_connection(&self, error: TransportError) {
        if let Some(events) = self.0.events.lock().unwrap().take() {
            let _ = events.send(ConnectionEvent::Closed(Some(error)));
        }
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector half handed to the [`Transport`] under test.
pub struct MockConnector {
    server: MockServer,
}

impl MockConnector {
    pub fn new(server: &MockServer) -> Self {
        MockConnector {
            server: server.clone(),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _server: &str) -> Result<ConnectionHandle, TransportError> {
        let mode = *self.server.0.mode.lock().unwrap();
        match mode {
            ConnectMode::Stall => {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
            ConnectMode::Refuse => Err(TransportError::ConnectionLost(
                "connection refused".to_string(),
            )),
            ConnectMode::Accept => {
                self.server.0.opens.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                *self.server.0.events.lock().unwrap() = Some(tx);
                Ok(ConnectionHandle {
                    connection: Arc::new(MockConnection {
                        server: self.server.clone(),
                    }),
                    events: rx,
                })
            }
        }
    }
}

struct MockConnection {
    server: MockServer,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if self.server.0.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("simulated failure".to_string()));
        }
        self.server.0.sent.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn close(&self) {
        if let Some(events) = self.server.0.events.lock().unwrap().take() {
            let _ = events.send(ConnectionEvent::Closed(None));
        }
    }

    fn reliable(&self) -> bool {
        self.server.0.reliable.load(Ordering::SeqCst)
    }
}

/// A transport already connected to a fresh [`MockServer`].
pub async fn connected_transport() -> (Transport, MockServer) {
    let server = MockServer::new();
    let transport = Transport::new(
        MockConnector::new(&server),
        TransportOptions {
            server: "wss://edge.example.com".to_string(),
            ..Default::default()
        },
    );
    transport.connect().await.unwrap();
    (transport, server)
}

pub const TEST_BRANCH: &str = "z9hG4bK74bf9";

/// A minimal compliant request as a client would send it.
pub fn outgoing_request(method: Method) -> Request {
    let uri: Uri = "sip:bob@example.com".parse().unwrap();
    let mut request = Request::new(method, uri);
    request
        .headers
        .push("Via", format!("SIP/2.0/WS client.invalid;branch={TEST_BRANCH}"));
    request.headers.push("Max-Forwards", "70");
    request.headers.push("To", "<sip:bob@example.com>");
    request
        .headers
        .push("From", "<sip:alice@example.com>;tag=9fxced76sl");
    request
        .headers
        .push("Call-ID", "3848276298220188511@client.invalid");
    request.headers.push("CSeq", format!("1 {method}"));
    request
}

/// A minimal compliant request as received from a peer.
pub fn incoming_request(method: Method) -> Request {
    let uri: Uri = "sip:alice@example.com".parse().unwrap();
    let mut request = Request::new(method, uri);
    request
        .headers
        .push("Via", format!("SIP/2.0/WS peer.invalid;branch={TEST_BRANCH}"));
    request.headers.push("Max-Forwards", "70");
    request.headers.push("To", "<sip:alice@example.com>");
    request
        .headers
        .push("From", "<sip:bob@example.com>;tag=456248");
    request.headers.push("Call-ID", "843817637684230@peer.invalid");
    request.headers.push("CSeq", format!("1 {method}"));
    request
}

/// A response matching [`outgoing_request`]'s transaction.
pub fn incoming_response(code: u16, method: Method) -> Response {
    let mut response = Response::new(code);
    response
        .headers
        .push("Via", format!("SIP/2.0/WS client.invalid;branch={TEST_BRANCH}"));
    response
        .headers
        .push("To", "<sip:bob@example.com>;tag=as83kd9bs");
    response
        .headers
        .push("From", "<sip:alice@example.com>;tag=9fxced76sl");
    response
        .headers
        .push("Call-ID", "3848276298220188511@client.invalid");
    response.headers.push("CSeq", format!("1 {method}"));
    response
}

/// A scripted offer/answer handler: offers from Stable, answers from
/// HasRemoteOffer, and complains loudly about misuse.
pub struct MockSdh {
    state: Mutex<crate::session_description::SdhState>,
    closed: AtomicBool,
}

impl MockSdh {
    pub fn new() -> Arc<Self> {
        Arc::new(MockSdh {
            state: Mutex::new(crate::session_description::SdhState::Stable),
            closed: AtomicBool::new(false),
        })
    }

    pub fn factory() -> crate::session_description::SessionDescriptionHandlerFactory {
        Arc::new(|| {
            MockSdh::new() as Arc<dyn crate::session_description::SessionDescriptionHandler>
        })
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::session_description::SessionDescriptionHandler for MockSdh {
    async fn get_description(
        &self,
        _options: &crate::session_description::DescriptionOptions,
    ) -> crate::error::Result<crate::message::Body> {
        use crate::session_description::SdhState::*;
        let mut state = self.state.lock().unwrap();
        let content = match *state {
            Stable => {
                *state = HasLocalOffer;
                "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=offer\r\n"
            }
            HasRemoteOffer => {
                *state = Stable;
                "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=answer\r\n"
            }
            HasLocalOffer => {
                return Err(crate::error::Error::Validation(
                    "get_description while an offer is outstanding".into(),
                ))
            }
        };
        Ok(crate::message::Body::new("application/sdp", content))
    }

    async fn set_description(
        &self,
        _content: &str,
        _content_type: &str,
    ) -> crate::error::Result<()> {
        use crate::session_description::SdhState::*;
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            Stable => HasRemoteOffer,
            HasLocalOffer => Stable,
            HasRemoteOffer => {
                return Err(crate::error::Error::Validation(
                    "set_description with a remote offer already installed".into(),
                ))
            }
        };
        Ok(())
    }

    fn has_description(&self, content_type: &str) -> bool {
        content_type == "application/sdp"
    }

    async fn rollback_description(&self) -> crate::error::Result<()> {
        *self.state.lock().unwrap() = crate::session_description::SdhState::Stable;
        Ok(())
    }

    async fn send_dtmf(&self, _tones: &str) -> crate::error::Result<()> {
        Ok(())
    }

    fn state(&self) -> crate::session_description::SdhState {
        *self.state.lock().unwrap()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records everything a transaction reports to its user.
#[derive(Default)]
pub struct RecordingUser {
    responses: Mutex<Vec<u16>>,
    timeouts: AtomicUsize,
    acks: AtomicUsize,
    errors: Mutex<Vec<TransportError>>,
}

impl RecordingUser {
    pub fn responses(&self) -> Vec<u16> {
        self.responses.lock().unwrap().clone()
    }

    pub fn timed_out(&self) -> bool {
        self.timeouts.load(Ordering::SeqCst) > 0
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn transport_errors(&self) -> Vec<TransportError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ClientTransactionUser for RecordingUser {
    fn receive_response(&self, response: &Response) {
        self.responses.lock().unwrap().push(response.status.as_u16());
    }

    fn on_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transport_error(&self, error: &TransportError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

impl ServerTransactionUser for RecordingUser {
    fn receive_ack(&self, _request: &Request) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transport_error(&self, error: &TransportError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}
