//! User-agent core: routes inbound messages to transactions, dialogs
//! and transaction users, creates outbound transactions and answers
//! statelessly where no transaction is warranted (RFC 3261 section 8.2).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tokio::sync::mpsc;

use crate::auth::DigestAuthentication;
use crate::dialog::{Dialog, DialogId};
use crate::error::Result;
use crate::message::{
    parse_message, Body, Method, NameAddr, Request, Response, SipMessage, Uri,
};
use crate::transaction::{
    InviteServerTransaction, NonInviteServerTransaction, ServerTransaction,
    ServerTransactionUser, TransactionKey, TransactionLayer,
};
use crate::transport::Transport;

mod client;
mod server;

pub use client::{ClientRequestDelegate, UserAgentClient};
pub(crate) use client::ResponseWaiter;
pub use server::{ReplyOptions, ServerRequest};

/// The methods this stack understands, advertised in Allow.
pub const ALLOWED_METHODS: &str =
    "ACK, BYE, CANCEL, INFO, INVITE, MESSAGE, NOTIFY, OPTIONS, REFER, REGISTER, SUBSCRIBE";

/// Configuration the core needs; assembled by the user agent.
pub struct CoreConfig {
    /// The address of record requests go out as.
    pub aor: Uri,
    /// The reachable contact advertised in dialog-forming responses and
    /// REGISTER bindings.
    pub contact: NameAddr,
    pub display_name: Option<String>,
    /// `User-Agent` header value, when one should be sent.
    pub user_agent: Option<String>,
    /// The host placed in Via sent-by; responses whose Via disagrees
    /// are dropped.
    pub via_host: String,
    /// Transport token for Via (`WS`, `WSS`, ...).
    pub via_transport: String,
    /// Ask the far end to reply to the source port (RFC 3581).
    pub via_rport: bool,
    /// This instance's unique id; doubles as the Call-ID prefix so
    /// self-looped requests can be caught.
    pub call_id_prefix: String,
    /// Option tags for the Supported header.
    pub supported: Vec<String>,
    pub authorization_username: Option<String>,
    pub authorization_password: Option<String>,
    /// Routes preloaded onto out-of-dialog requests.
    pub preloaded_route_set: Vec<String>,
    /// Accept an out-of-dialog initial NOTIFY (RFC 6665 relaxation);
    /// off by default, yielding a 481.
    pub allow_out_of_dialog_notify: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let host = "anonymous.invalid".to_string();
        let uri = Uri::builder()
            .user("anonymous")
            .host(host.clone())
            .build();
        CoreConfig {
            aor: uri.clone(),
            contact: NameAddr::new(uri),
            display_name: None,
            user_agent: None,
            via_host: host,
            via_transport: "WS".to_string(),
            via_rport: false,
            call_id_prefix: crate::random_token(8),
            supported: Vec::new(),
            authorization_username: None,
            authorization_password: None,
            preloaded_route_set: Vec::new(),
            allow_out_of_dialog_notify: false,
        }
    }
}

/// Where the core hands requests it does not consume itself. The user
/// agent implements this; the defaults answer the way a bare core must.
pub trait CoreDelegate: Send + Sync {
    /// An out-of-dialog INVITE with a new server transaction behind it.
    fn on_invite(&self, request: ServerRequest) {
        request.reply_in_background(486);
    }

    fn on_message(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    /// An out-of-dialog NOTIFY that config allowed through.
    fn on_notify(&self, request: ServerRequest) {
        request.reply_in_background(481);
    }

    fn on_refer(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    fn on_register(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    fn on_subscribe(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    fn on_options(&self, request: ServerRequest) {
        let request = request;
        tokio::spawn(async move {
            let options = ReplyOptions::new().with_header(format!("Allow: {ALLOWED_METHODS}"));
            if let Err(error) = request.reply(200, options).await {
                log::warn!("failed to answer OPTIONS: {error}");
            }
        });
    }

    /// A response that matched no transaction and no dialog.
    fn on_stray_response(&self, response: &Response) {
        log::debug!(
            "dropping stray response {} {}",
            response.status,
            response.reason
        );
    }
}

/// Options for [`UserAgentCore::make_request`].
#[derive(Default)]
pub struct RequestOptions {
    /// Defaults to the configured AOR.
    pub from_uri: Option<Uri>,
    /// Defaults to the target.
    pub to_uri: Option<Uri>,
    pub from_display_name: Option<String>,
    /// Generated (20 random hex chars) when absent.
    pub from_tag: Option<String>,
    /// Generated (`call_id_prefix` + 15 random chars) when absent.
    pub call_id: Option<String>,
    /// Defaults to 1.
    pub cseq: Option<u32>,
    pub extra_headers: Vec<String>,
    pub body: Option<Body>,
    /// Defaults to the preloaded route set.
    pub route_set: Option<Vec<String>>,
}

struct CoreInner {
    config: CoreConfig,
    transport: Transport,
    transactions: TransactionLayer,
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
    delegate: Mutex<Option<Arc<dyn CoreDelegate>>>,
    queue: mpsc::UnboundedSender<String>,
}

/// The user-agent core.
#[derive(Clone)]
pub struct UserAgentCore(Arc<CoreInner>);

impl UserAgentCore {
    pub fn new(config: CoreConfig, transport: Transport) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let core = UserAgentCore(Arc::new(CoreInner {
            config,
            transport,
            transactions: TransactionLayer::new(),
            dialogs: Mutex::new(HashMap::new()),
            delegate: Mutex::new(None),
            queue,
        }));
        core.spawn_receive_loop(rx);
        core
    }

    // Inbound messages are funneled through one consumer task so they
    // are processed strictly in arrival order. The task holds only a
    // weak handle; it exits when the core is dropped.
    fn spawn_receive_loop(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        let weak = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                UserAgentCore(inner).process_raw(&raw).await;
            }
        });
    }

    pub fn config(&self) -> &CoreConfig {
        &self.0.config
    }

    pub fn transport(&self) -> &Transport {
        &self.0.transport
    }

    pub fn transactions(&self) -> &TransactionLayer {
        &self.0.transactions
    }

    pub fn set_delegate(&self, delegate: Arc<dyn CoreDelegate>) {
        *self.0.delegate.lock().expect("Lock failed") = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn CoreDelegate>> {
        self.0.delegate.lock().expect("Lock failed").clone()
    }

    /// Enqueues a raw inbound message for processing.
    pub fn receive_message(&self, raw: String) {
        let _ = self.0.queue.send(raw);
    }

    /// Drops all transactions and dialogs.
    pub fn reset(&self) {
        self.0.transactions.reset();
        self.0.dialogs.lock().expect("Lock failed").clear();
    }

    // --- dialogs -----------------------------------------------------

    pub fn add_dialog(&self, dialog: Dialog) {
        let id = dialog.id().clone();
        self.0.dialogs.lock().expect("Lock failed").insert(id, dialog);
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.0.dialogs.lock().expect("Lock failed").get(id).cloned()
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        self.0.dialogs.lock().expect("Lock failed").remove(id);
    }

    /// Deregisters one usage; the dialog goes away with its last one.
    pub fn deregister_usage(&self, id: &DialogId, usage_id: &str) {
        if let Some(dialog) = self.find_dialog(id) {
            if dialog.deregister_usage(usage_id) {
                self.remove_dialog(id);
            }
        }
    }

    pub fn dialog_count(&self) -> usize {
        self.0.dialogs.lock().expect("Lock failed").len()
    }

    // --- outbound ----------------------------------------------------

    pub(crate) fn digest_credentials(&self) -> Option<DigestAuthentication> {
        let config = self.config();
        let username = config.authorization_username.as_ref()?;
        let password = config.authorization_password.as_deref().unwrap_or("");
        Some(DigestAuthentication::new(username, password))
    }

    pub(crate) fn supported_header(&self) -> Option<String> {
        let tags = &self.config().supported;
        if tags.is_empty() {
            None
        } else {
            Some(tags.iter().join(", "))
        }
    }

    /// Constructs an out-of-dialog request envelope per the rules of
    /// RFC 3261 section 8.1.1. The Via is stamped at send time, once
    /// the branch is known.
    pub fn make_request(&self, method: Method, target: Uri, options: RequestOptions) -> Request {
        let config = self.config();
        let mut request = Request::new(method, target.clone());

        let to = NameAddr::new(options.to_uri.unwrap_or(target));
        let mut from = match options.from_uri {
            Some(uri) => NameAddr::new(uri),
            None => NameAddr::new(config.aor.clone()),
        };
        if let Some(name) = options
            .from_display_name
            .or_else(|| config.display_name.clone())
        {
            from = NameAddr::with_display_name(from.uri().clone(), name);
        }
        from.set_tag(options.from_tag.unwrap_or_else(crate::new_tag));

        let call_id = options
            .call_id
            .unwrap_or_else(|| format!("{}{}", config.call_id_prefix, crate::random_token(15)));

        request.headers.push("Max-Forwards", "70");
        request.headers.push("To", to.to_string());
        request.headers.push("From", from.to_string());
        request.headers.push("Call-ID", call_id);
        request
            .headers
            .push("CSeq", format!("{} {method}", options.cseq.unwrap_or(1)));
        for route in options
            .route_set
            .unwrap_or_else(|| config.preloaded_route_set.clone())
        {
            request.headers.push("Route", route);
        }
        request.extra_headers = options.extra_headers;
        request.body = options.body;
        request
    }

    /// Stamps (or replaces) the top Via with a fresh branch.
    pub(crate) fn restamp_via(&self, request: &mut Request) {
        let config = self.config();
        let rport = if config.via_rport { ";rport" } else { "" };
        let via = format!(
            "SIP/2.0/{} {}{rport};branch={}",
            config.via_transport,
            config.via_host,
            crate::new_branch()
        );
        if request.headers.contains("Via") {
            request.headers.set("Via", via);
        } else {
            request.headers.push_front("Via", via);
        }
    }

    fn add_envelope_headers(&self, request: &mut Request) {
        let config = self.config();
        if !request.headers.contains("Supported") {
            if let Some(supported) = self.supported_header() {
                request.headers.push("Supported", supported);
            }
        }
        if !request.headers.contains("User-Agent") {
            if let Some(user_agent) = &config.user_agent {
                request.headers.push("User-Agent", user_agent);
            }
        }
    }

    /// Creates a client transaction for `request` and routes responses
    /// to `delegate`. A 401/407 is answered once with the configured
    /// credentials.
    ///
    /// A request arriving without a Via gets one with a fresh branch; a
    /// pre-stamped Via is left alone (CANCEL must reuse the branch of
    /// the INVITE it targets).
    pub async fn request(
        &self,
        mut request: Request,
        delegate: Option<Arc<dyn ClientRequestDelegate>>,
    ) -> Result<UserAgentClient> {
        if !request.headers.contains("Via") {
            self.restamp_via(&mut request);
        }
        self.add_envelope_headers(&mut request);
        UserAgentClient::send(self.clone(), request, delegate).await
    }

    /// Sends a request outside any transaction (the ACK for a 2xx).
    pub async fn send_request_direct(&self, mut request: Request) -> Result<()> {
        self.restamp_via(&mut request);
        self.add_envelope_headers(&mut request);
        log::debug!("=> request {} {}", request.method, request.uri);
        self.0.transport.send(&request.encode()).await
    }

    /// Replies without creating a server transaction.
    pub async fn reply_stateless(&self, request: &Request, status: u16) -> Result<()> {
        let mut response = Response::reply_to(request, status);
        if status > 100 && request.headers.to_tag().is_none() {
            if let Some(mut to) = request.headers.to_header() {
                to.set_tag(crate::new_tag());
                response.headers.set("To", to.to_string());
            }
        }
        if let Some(user_agent) = &self.config().user_agent {
            response.headers.push("User-Agent", user_agent);
        }
        log::debug!("=> stateless response {status}");
        self.0.transport.send(&response.encode()).await
    }

    // --- inbound -----------------------------------------------------

    async fn process_raw(&self, raw: &str) {
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(error) => {
                log::warn!("dropping unparsable message ({error}):\n{raw}");
                return;
            }
        };
        match message {
            SipMessage::Request(request) => self.receive_request(request, raw).await,
            SipMessage::Response(response) => self.receive_response(response).await,
        }
    }

    async fn receive_request(&self, request: Request, raw: &str) {
        // Mandatory header sanity (8.2): drop silently when unusable.
        let headers = &request.headers;
        if headers.get("From").is_none()
            || headers.get("To").is_none()
            || headers.call_id().is_none()
            || headers.get("Via").is_none()
        {
            log::warn!("dropping {} without mandatory headers", request.method);
            return;
        }
        let Some(cseq) = headers.cseq() else {
            log::warn!("dropping {} without CSeq", request.method);
            return;
        };
        if cseq.method != request.method {
            log::warn!("dropping {}: CSeq method mismatch", request.method);
            return;
        }

        // A request of ours looped back to us.
        if request.headers.to_tag().is_none()
            && request.method != Method::Ack
            && headers
                .call_id()
                .map(|call_id| call_id.starts_with(&self.config().call_id_prefix))
                .unwrap_or(false)
        {
            let _ = self.reply_stateless(&request, 482).await;
            return;
        }

        // Declared Content-Length beyond the actual body length.
        if let Some(declared) = declared_content_length(raw) {
            let actual = request.body.as_ref().map(|body| body.byte_len()).unwrap_or(0);
            if declared > actual {
                let _ = self.reply_stateless(&request, 400).await;
                return;
            }
        }

        // An existing server transaction absorbs retransmissions (and
        // the ACK for a non-2xx final response).
        match TransactionKey::for_request(&request) {
            Some(key) => {
                if let Some(transaction) = self.0.transactions.find_server(&key) {
                    transaction.receive_request(&request).await;
                    return;
                }
            }
            None => {
                log::warn!("dropping {} without RFC 3261 branch", request.method);
                return;
            }
        }

        if request.method == Method::Cancel {
            self.receive_cancel(request).await;
            return;
        }

        if request.headers.to_tag().is_some() {
            self.receive_in_dialog(request).await;
            return;
        }

        self.receive_out_of_dialog(request).await;
    }

    async fn receive_cancel(&self, request: Request) {
        // 9.2: the CANCEL gets its own transaction and a 200 when the
        // INVITE it targets is still around, else a 481; the INVITE's
        // TU is told to finish with a 487.
        let invite = request
            .headers
            .via_branch()
            .zip(request.headers.via_sent_by())
            .map(|(branch, sent_by)| TransactionKey::server(branch, sent_by, Method::Invite))
            .and_then(|key| self.0.transactions.find_server(&key));

        let transaction = match NonInviteServerTransaction::new(
            &request,
            self.0.transport.clone(),
            self.0.transactions.clone(),
            Arc::new(CoreServerUser),
        ) {
            Ok(transaction) => ServerTransaction::NonInvite(transaction),
            Err(error) => {
                log::warn!("failed to create CANCEL transaction: {error}");
                return;
            }
        };
        let server_request =
            ServerRequest::new(request.clone(), Some(transaction), self.clone());
        match invite {
            Some(invite) => {
                if let Err(error) = server_request.reply(200, ReplyOptions::new()).await {
                    log::warn!("failed to answer CANCEL: {error}");
                }
                invite.notify_cancel(&request);
            }
            None => {
                let _ = server_request.reply(481, ReplyOptions::new()).await;
            }
        }
    }

    async fn receive_in_dialog(&self, request: Request) {
        let Some(id) = DialogId::for_incoming_request(&request) else {
            let _ = self.reply_stateless(&request, 400).await;
            return;
        };
        let Some(dialog) = self.find_dialog(&id) else {
            // 12.2.2: no matching dialog. ACKs die quietly; a NOTIFY may
            // legally beat the 2xx that would have built the dialog, so
            // the delegate gets a look at it first.
            match request.method {
                Method::Ack => {}
                Method::Notify => {
                    let transaction = match self.new_server_transaction(&request) {
                        Ok(transaction) => Some(transaction),
                        Err(_) => None,
                    };
                    let server_request = ServerRequest::new(request, transaction, self.clone());
                    match self.delegate() {
                        Some(delegate) => delegate.on_notify(server_request),
                        None => server_request.reply_in_background(481),
                    }
                }
                _ => {
                    let _ = self.reply_stateless(&request, 481).await;
                }
            }
            return;
        };

        if request.method != Method::Ack {
            if let Some(cseq) = request.headers.cseq() {
                if !dialog.validate_remote_cseq(cseq.seq) {
                    log::warn!("dropping in-dialog {} with stale CSeq", request.method);
                    return;
                }
            }
        }

        let transaction = if request.method == Method::Ack {
            None
        } else {
            match self.new_server_transaction(&request) {
                Ok(transaction) => Some(transaction),
                Err(error) => {
                    log::warn!("failed to create server transaction: {error}");
                    return;
                }
            }
        };
        let server_request = ServerRequest::new(request.clone(), transaction, self.clone());

        match dialog.usage_for(&request) {
            Some(usage) => usage.receive_request(server_request),
            None => {
                // No usage claims it (e.g. NOTIFY for a dead
                // subscription).
                if request.method != Method::Ack {
                    server_request.reply_in_background(481);
                }
            }
        }
    }

    async fn receive_out_of_dialog(&self, request: Request) {
        let method = request.method;
        if method == Method::Ack {
            log::debug!("dropping stray ACK");
            return;
        }
        if method == Method::Bye {
            // A BYE outside any dialog (12.2.2).
            let _ = self.reply_stateless(&request, 481).await;
            return;
        }
        if method == Method::Notify && !self.config().allow_out_of_dialog_notify {
            let _ = self.reply_stateless(&request, 481).await;
            return;
        }

        let transaction = match self.new_server_transaction(&request) {
            Ok(transaction) => transaction,
            Err(error) => {
                log::warn!("failed to create server transaction: {error}");
                return;
            }
        };
        let server_request = ServerRequest::new(request, Some(transaction), self.clone());

        let Some(delegate) = self.delegate() else {
            let status = match method {
                Method::Invite => 486,
                Method::Options => 200,
                _ => 405,
            };
            server_request.reply_in_background(status);
            return;
        };
        match method {
            Method::Invite => delegate.on_invite(server_request),
            Method::Message => delegate.on_message(server_request),
            Method::Notify => delegate.on_notify(server_request),
            Method::Refer => delegate.on_refer(server_request),
            Method::Register => delegate.on_register(server_request),
            Method::Subscribe => delegate.on_subscribe(server_request),
            Method::Options => delegate.on_options(server_request),
            _ => {
                // Understood but unhandled out-of-dialog (INFO, UPDATE,
                // PRACK): 405 with Allow.
                server_request.reply_in_background(405);
            }
        }
    }

    fn new_server_transaction(&self, request: &Request) -> Result<ServerTransaction> {
        let user: Arc<dyn ServerTransactionUser> = Arc::new(CoreServerUser);
        match request.method {
            Method::Invite => InviteServerTransaction::new(
                request,
                self.0.transport.clone(),
                self.0.transactions.clone(),
                user,
            )
            .map(ServerTransaction::Invite),
            _ => NonInviteServerTransaction::new(
                request,
                self.0.transport.clone(),
                self.0.transactions.clone(),
                user,
            )
            .map(ServerTransaction::NonInvite),
        }
    }

    async fn receive_response(&self, response: Response) {
        let via_count = response.headers.via_count();
        if via_count == 0 {
            log::warn!("dropping response without Via");
            return;
        }
        if via_count > 1 {
            log::warn!("dropping response with {via_count} Via headers");
            return;
        }
        if let Some(sent_by) = response.headers.via_sent_by() {
            let host = sent_by.split(':').next().unwrap_or("");
            if !host.eq_ignore_ascii_case(&self.config().via_host) {
                log::warn!("dropping response with foreign Via sent-by '{sent_by}'");
                return;
            }
        }

        if let Some(key) = TransactionKey::for_response(&response) {
            if let Some(transaction) = self.0.transactions.find_client(&key) {
                transaction.receive_response(&response).await;
                return;
            }
        }

        // A 2xx to INVITE after its transaction ended: the session
        // usage re-ACKs.
        let is_invite_2xx = response.status.is_success()
            && response
                .headers
                .cseq()
                .map(|cseq| cseq.method == Method::Invite)
                .unwrap_or(false);
        if is_invite_2xx {
            if let Some(id) = DialogId::for_incoming_response(&response) {
                if let Some(dialog) = self.find_dialog(&id) {
                    for usage in dialog.usages() {
                        usage.receive_stray_response(&response);
                    }
                    return;
                }
            }
        }

        match self.delegate() {
            Some(delegate) => delegate.on_stray_response(&response),
            None => log::debug!("dropping unmatched response {}", response.status),
        }
    }
}

struct CoreServerUser;

impl ServerTransactionUser for CoreServerUser {
    fn on_transport_error(&self, error: &crate::error::TransportError) {
        log::warn!("server transaction transport error: {error}");
    }
}

fn declared_content_length(raw: &str) -> Option<usize> {
    let head = match raw.find("\r\n\r\n") {
        Some(at) => &raw[..at],
        None => raw,
    };
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }
    None
}
