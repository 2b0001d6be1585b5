//! SIP transaction layer (RFC 3261 section 17).
//!
//! Four state machines — INVITE client, INVITE server, non-INVITE
//! client, non-INVITE server — plus the matching tables. Each machine
//! shares the [`Transaction`] core: key, transport handle, guarded
//! state, last transmitted wire image and retransmission counter.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::message::{Request, Response};
use crate::transport::Transport;

mod client_invite;
mod client_non_invite;
pub(crate) mod key;
mod server_invite;
mod server_non_invite;

pub use client_invite::InviteClientTransaction;
pub use client_non_invite::NonInviteClientTransaction;
pub use key::TransactionKey;
pub use server_invite::InviteServerTransaction;
pub use server_non_invite::NonInviteServerTransaction;

/// States shared by the four transaction machines. Each machine uses
/// its own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Accepted,
    Completed,
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Accepted => "Accepted",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// The role a transaction takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// Callbacks a client transaction delivers to its transaction user.
pub trait ClientTransactionUser: Send + Sync {
    /// A response matched to this transaction. 2xx retransmissions to an
    /// INVITE are delivered again; non-2xx retransmissions are absorbed.
    fn receive_response(&self, response: &Response);

    /// Timer B/F expired without a final response.
    fn on_timeout(&self);

    fn on_transport_error(&self, error: &TransportError);
}

/// Callbacks a server transaction delivers to its transaction user.
pub trait ServerTransactionUser: Send + Sync {
    /// An ACK forwarded while the INVITE server transaction is Accepted.
    fn receive_ack(&self, request: &Request) {
        let _ = request;
    }

    /// A CANCEL arrived for the INVITE this transaction serves. The
    /// CANCEL itself is answered by its own transaction; the TU is
    /// expected to finish the INVITE with a 487.
    fn receive_cancel(&self, request: &Request) {
        let _ = request;
    }

    /// Timer H expired: the far end never acknowledged the final
    /// response.
    fn on_timeout(&self) {}

    fn on_transport_error(&self, error: &TransportError);
}

struct TransactionInner {
    kind: &'static str,
    key: TransactionKey,
    role: Role,
    transport: Transport,
    layer: TransactionLayer,
    state: Mutex<TransactionState>,
    guard: TransitionGuard,
    emitter: StateEmitter<TransactionState>,
    client_user: Mutex<Option<Arc<dyn ClientTransactionUser>>>,
    server_user: Mutex<Option<Arc<dyn ServerTransactionUser>>>,
    last_request: Mutex<Option<String>>,
    last_response: Mutex<Option<String>>,
    retransmit_count: AtomicU32,
}

/// State shared by every transaction flavor.
#[derive(Clone)]
pub struct Transaction(Arc<TransactionInner>);

impl Transaction {
    fn new(
        kind: &'static str,
        key: TransactionKey,
        role: Role,
        initial: TransactionState,
        transport: Transport,
        layer: TransactionLayer,
    ) -> Self {
        let tsx = Transaction(Arc::new(TransactionInner {
            kind,
            key,
            role,
            transport,
            layer,
            state: Mutex::new(initial),
            guard: TransitionGuard::new(kind),
            emitter: StateEmitter::new(),
            client_user: Mutex::new(None),
            server_user: Mutex::new(None),
            last_request: Mutex::new(None),
            last_response: Mutex::new(None),
            retransmit_count: AtomicU32::new(0),
        }));
        log::trace!("{} created [{:?}]", tsx.0.kind, tsx.0.key);
        tsx
    }

    pub fn key(&self) -> &TransactionKey {
        &self.0.key
    }

    pub fn state(&self) -> TransactionState {
        *self.0.state.lock().expect("Lock failed")
    }

    /// Whether the underlying transport is reliable. Retransmission
    /// timers only run over unreliable transports.
    pub fn reliable(&self) -> bool {
        self.0.transport.reliable()
    }

    pub fn retransmit_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst)
    }

    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&TransactionState) + Send + Sync + 'static,
    {
        self.0.emitter.on(observer);
    }

    /// Detaches the transaction user; later events are dropped. Used by
    /// a TU's `dispose` so the transaction does not keep it alive.
    pub fn detach_user(&self) {
        self.0.client_user.lock().expect("Lock failed").take();
        self.0.server_user.lock().expect("Lock failed").take();
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.0.transport
    }

    fn set_client_user(&self, user: Arc<dyn ClientTransactionUser>) {
        *self.0.client_user.lock().expect("Lock failed") = Some(user);
    }

    fn set_server_user(&self, user: Arc<dyn ServerTransactionUser>) {
        *self.0.server_user.lock().expect("Lock failed") = Some(user);
    }

    fn client_user(&self) -> Option<Arc<dyn ClientTransactionUser>> {
        self.0.client_user.lock().expect("Lock failed").clone()
    }

    fn server_user(&self) -> Option<Arc<dyn ServerTransactionUser>> {
        self.0.server_user.lock().expect("Lock failed").clone()
    }

    /// Moves the machine to `state`. Returns false when the machine is
    /// already terminated (the one-terminal-entry invariant).
    fn set_state(&self, state: TransactionState) -> bool {
        let token = match self.0.guard.enter() {
            Ok(token) => token,
            Err(error) => {
                log::warn!("{}: {error}", self.0.kind);
                return false;
            }
        };
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            if *guard == TransactionState::Terminated {
                return false;
            }
            std::mem::replace(&mut *guard, state)
        };
        log::trace!("{} state changed [{old} -> {state}]", self.0.kind);
        token.release();
        self.0.emitter.emit(&state);
        true
    }

    /// Enters Terminated (once), deregisters from the layer and drops
    /// the TU reference. No events are delivered past this point.
    fn on_terminated(&self) {
        if !self.set_state(TransactionState::Terminated) {
            return;
        }
        match self.0.role {
            Role::Uac => {
                self.0.layer.remove_client(&self.0.key);
            }
            Role::Uas => {
                self.0.layer.remove_server(&self.0.key);
            }
        };
        self.detach_user();
    }

    /// Hands a response up to the transaction user, if one is still
    /// attached.
    fn deliver_response(&self, response: &Response) {
        if let Some(user) = self.client_user() {
            user.receive_response(response);
        }
    }

    /// Surfaces a send failure to the transaction user.
    fn notify_transport_error(&self, error: &crate::error::Error) {
        let error = match error {
            crate::error::Error::Transport(error) => error.clone(),
            other => TransportError::SendFailed(other.to_string()),
        };
        if let Some(user) = self.client_user() {
            user.on_transport_error(&error);
        }
        if let Some(user) = self.server_user() {
            user.on_transport_error(&error);
        }
    }

    /// Terminates the transaction after `delay`, unless it moved out of
    /// `only_if` first (late timers are no-ops).
    fn schedule_termination(&self, delay: std::time::Duration, only_if: TransactionState) {
        let tsx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tsx.state() == only_if {
                tsx.on_terminated();
            }
        });
    }

    fn remember_request(&self, wire: String) {
        *self.0.last_request.lock().expect("Lock failed") = Some(wire);
    }

    fn remember_response(&self, wire: String) {
        *self.0.last_response.lock().expect("Lock failed") = Some(wire);
    }

    fn has_sent_response(&self) -> bool {
        self.0.last_response.lock().expect("Lock failed").is_some()
    }

    async fn send_wire(&self, wire: &str) -> Result<()> {
        self.0.transport.send(wire).await
    }

    async fn retransmit_request(&self) -> Result<u32> {
        let wire = self.0.last_request.lock().expect("Lock failed").clone();
        match wire {
            Some(wire) => {
                self.send_wire(&wire).await?;
                Ok(self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) + 1)
            }
            None => Ok(0),
        }
    }

    async fn retransmit_last_response(&self) -> Result<u32> {
        let wire = self.0.last_response.lock().expect("Lock failed").clone();
        match wire {
            Some(wire) => {
                self.send_wire(&wire).await?;
                Ok(self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) + 1)
            }
            None => Ok(0),
        }
    }
}

/// A client transaction of either flavor.
#[derive(Clone)]
pub enum ClientTransaction {
    Invite(InviteClientTransaction),
    NonInvite(NonInviteClientTransaction),
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        match self {
            ClientTransaction::Invite(tsx) => tsx.key(),
            ClientTransaction::NonInvite(tsx) => tsx.key(),
        }
    }

    pub async fn receive_response(&self, response: &Response) {
        match self {
            ClientTransaction::Invite(tsx) => tsx.receive_response(response).await,
            ClientTransaction::NonInvite(tsx) => tsx.receive_response(response).await,
        }
    }

    pub fn terminate(&self) {
        match self {
            ClientTransaction::Invite(tsx) => tsx.on_terminated(),
            ClientTransaction::NonInvite(tsx) => tsx.on_terminated(),
        }
    }
}

/// A server transaction of either flavor.
#[derive(Clone)]
pub enum ServerTransaction {
    Invite(InviteServerTransaction),
    NonInvite(NonInviteServerTransaction),
}

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        match self {
            ServerTransaction::Invite(tsx) => tsx.key(),
            ServerTransaction::NonInvite(tsx) => tsx.key(),
        }
    }

    pub async fn receive_request(&self, request: &Request) {
        match self {
            ServerTransaction::Invite(tsx) => tsx.receive_request(request).await,
            ServerTransaction::NonInvite(tsx) => tsx.receive_request(request).await,
        }
    }

    pub async fn respond(&self, response: Response) -> Result<()> {
        match self {
            ServerTransaction::Invite(tsx) => tsx.respond(response).await,
            ServerTransaction::NonInvite(tsx) => tsx.respond(response).await,
        }
    }

    pub fn terminate(&self) {
        match self {
            ServerTransaction::Invite(tsx) => tsx.on_terminated(),
            ServerTransaction::NonInvite(tsx) => tsx.on_terminated(),
        }
    }

    /// Swaps in the real transaction user once a TU claims the request.
    pub(crate) fn set_user(&self, user: Arc<dyn ServerTransactionUser>) {
        match self {
            ServerTransaction::Invite(tsx) => tsx.set_server_user(user),
            ServerTransaction::NonInvite(tsx) => tsx.set_server_user(user),
        }
    }

    /// Forwards a CANCEL to the transaction user (INVITE flavor only).
    pub(crate) fn notify_cancel(&self, request: &Request) {
        if let ServerTransaction::Invite(tsx) = self {
            if let Some(user) = tsx.server_user() {
                user.receive_cancel(request);
            }
        }
    }
}

#[derive(Default)]
struct LayerInner {
    client: Mutex<HashMap<TransactionKey, ClientTransaction>>,
    server: Mutex<HashMap<TransactionKey, ServerTransaction>>,
}

/// The transaction tables, owned by the user-agent core.
#[derive(Clone, Default)]
pub struct TransactionLayer(Arc<LayerInner>);

impl TransactionLayer {
    pub fn new() -> Self {
        Default::default()
    }

    pub(crate) fn register_client(&self, tsx: ClientTransaction) {
        let key = tsx.key().clone();
        self.0.client.lock().expect("Lock failed").insert(key, tsx);
    }

    pub(crate) fn register_server(&self, tsx: ServerTransaction) {
        let key = tsx.key().clone();
        self.0.server.lock().expect("Lock failed").insert(key, tsx);
    }

    pub fn find_client(&self, key: &TransactionKey) -> Option<ClientTransaction> {
        self.0.client.lock().expect("Lock failed").get(key).cloned()
    }

    pub fn find_server(&self, key: &TransactionKey) -> Option<ServerTransaction> {
        self.0.server.lock().expect("Lock failed").get(key).cloned()
    }

    pub fn remove_client(&self, key: &TransactionKey) -> Option<ClientTransaction> {
        self.0.client.lock().expect("Lock failed").remove(key)
    }

    pub fn remove_server(&self, key: &TransactionKey) -> Option<ServerTransaction> {
        self.0.server.lock().expect("Lock failed").remove(key)
    }

    pub fn client_count(&self) -> usize {
        self.0.client.lock().expect("Lock failed").len()
    }

    pub fn server_count(&self) -> usize {
        self.0.server.lock().expect("Lock failed").len()
    }

    /// Terminates every transaction and clears both tables.
    pub fn reset(&self) {
        let clients: Vec<ClientTransaction> = {
            let mut map = self.0.client.lock().expect("Lock failed");
            map.drain().map(|(_, tsx)| tsx).collect()
        };
        for tsx in clients {
            tsx.terminate();
        }
        let servers: Vec<ServerTransaction> = {
            let mut map = self.0.server.lock().expect("Lock failed");
            map.drain().map(|(_, tsx)| tsx).collect()
        };
        for tsx in servers {
            tsx.terminate();
        }
    }
}
