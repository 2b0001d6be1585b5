//! The user agent: configuration, contact, lifecycle, delegate
//! dispatch and the transaction-user collections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::core::{
    CoreConfig, CoreDelegate, RequestOptions, ServerRequest, UserAgentCore,
};
use crate::dialog::DialogId;
use crate::error::{Error, Result, TransportError};
use crate::message::{parser, NameAddr, Request, Scheme, Uri, UriBuilder};
use crate::session_description::SessionDescriptionHandlerFactory;
use crate::transport::{Connector, Transport, TransportOptions};

mod invitation;
mod inviter;
mod messager;
mod publisher;
mod registerer;
mod session;
mod subscription;

pub use invitation::Invitation;
pub use inviter::{Inviter, InviterOptions};
pub use messager::Messager;
pub use publisher::{Publisher, PublisherOptions, PublisherState};
pub use registerer::{Registerer, RegistererOptions, RegistererState};
pub use session::{Session, SessionDelegate, SessionState};
pub use subscription::{
    Subscription, SubscriptionDelegate, SubscriptionOptions, SubscriptionState,
};

/// User agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgentState {
    Started,
    Stopped,
}

/// How a SIP extension is advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SipExtension {
    Required,
    Supported,
    #[default]
    Unsupported,
}

// Option tags registered with IANA; anything else in
// `sip_extension_extra_supported` is dropped unless the hack flag says
// otherwise.
const REGISTERED_OPTION_TAGS: [&str; 14] = [
    "100rel",
    "early-session",
    "eventlist",
    "gruu",
    "ice",
    "join",
    "norefersub",
    "outbound",
    "path",
    "precondition",
    "replaces",
    "sdp-anat",
    "tdialog",
    "timer",
];

/// User agent configuration.
pub struct UserAgentOptions {
    /// The address of record.
    pub uri: Option<Uri>,
    pub display_name: Option<String>,
    pub authorization_username: Option<String>,
    pub authorization_password: Option<String>,
    /// Connect the transport as soon as the agent is constructed.
    pub auto_start: bool,
    /// Stop the agent after reconnection attempts are exhausted.
    pub auto_stop: bool,
    /// Ring automatically (180) before handing an invitation to the
    /// delegate.
    pub auto_send_initial_provisional_response: bool,
    pub force_rport: bool,
    /// Claim TCP in Via for far ends that refuse WS there.
    pub hack_via_tcp: bool,
    /// Put a dotted quad instead of an `.invalid` host in Contact.
    pub hack_ip_in_contact: bool,
    /// Claim `wss` as the Contact transport parameter.
    pub hack_wss_in_transport: bool,
    /// Advertise unregistered option tags verbatim.
    pub hack_allow_unregistered_option_tags: bool,
    /// Accept an out-of-dialog initial NOTIFY instead of rejecting it
    /// with a 481.
    pub allow_out_of_dialog_notify: bool,
    /// Log the effective configuration at start.
    pub log_configuration: bool,
    /// How long an invitation may ring before a 480 goes out.
    pub no_answer_timeout: Duration,
    pub preloaded_route_set: Vec<String>,
    /// Reconnect attempts after an unsolicited disconnect; zero
    /// disables reconnection.
    pub reconnection_attempts: u32,
    /// Delay between reconnection attempts (the first one is
    /// immediate).
    pub reconnection_delay: Duration,
    pub session_description_handler_factory: Option<SessionDescriptionHandlerFactory>,
    pub sip_extension_100rel: SipExtension,
    pub sip_extension_replaces: SipExtension,
    pub sip_extension_extra_supported: Vec<String>,
    pub transport_options: TransportOptions,
    /// `User-Agent` header value.
    pub user_agent_string: Option<String>,
    pub via_host: Option<String>,
}

impl Default for UserAgentOptions {
    fn default() -> Self {
        UserAgentOptions {
            uri: None,
            display_name: None,
            authorization_username: None,
            authorization_password: None,
            auto_start: false,
            auto_stop: false,
            auto_send_initial_provisional_response: true,
            force_rport: false,
            hack_via_tcp: false,
            hack_ip_in_contact: false,
            hack_wss_in_transport: false,
            hack_allow_unregistered_option_tags: false,
            allow_out_of_dialog_notify: false,
            log_configuration: false,
            no_answer_timeout: Duration::from_secs(60),
            preloaded_route_set: Vec::new(),
            reconnection_attempts: 0,
            reconnection_delay: Duration::from_secs(4),
            session_description_handler_factory: None,
            sip_extension_100rel: SipExtension::Unsupported,
            sip_extension_replaces: SipExtension::Unsupported,
            sip_extension_extra_supported: Vec::new(),
            transport_options: TransportOptions::default(),
            user_agent_string: None,
            via_host: None,
        }
    }
}

/// Application-level callbacks.
pub trait UserAgentDelegate: Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self, error: Option<&TransportError>) {
        let _ = error;
    }

    /// An inbound call. Without a delegate the agent declines with 486.
    fn on_invite(&self, invitation: Arc<Invitation>) {
        tokio::spawn(async move {
            let _ = invitation.reject(486).await;
        });
    }

    /// An inbound pager-mode MESSAGE (already answered 200).
    fn on_message(&self, request: &Request) {
        let _ = request;
    }

    /// An out-of-dialog NOTIFY that configuration allowed through
    /// (already answered 200).
    fn on_notify(&self, request: &Request) {
        let _ = request;
    }

    /// An out-of-dialog REFER. Answer it or it is rejected 405.
    fn on_refer(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    /// An inbound SUBSCRIBE (UAS role). Unhandled means 405.
    fn on_subscribe(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }

    /// An inbound REGISTER (registrar role). Unhandled means 405.
    fn on_register(&self, request: ServerRequest) {
        request.reply_in_background(405);
    }
}

pub(crate) enum SessionHandle {
    Inviter(Arc<Inviter>),
    Invitation(Arc<Invitation>),
}

impl SessionHandle {
    fn session(&self) -> &Session {
        match self {
            SessionHandle::Inviter(inviter) => inviter.session(),
            SessionHandle::Invitation(invitation) => invitation.session(),
        }
    }

    async fn dispose(&self) -> Result<()> {
        match self {
            SessionHandle::Inviter(inviter) => inviter.dispose().await,
            SessionHandle::Invitation(invitation) => invitation.dispose().await,
        }
    }
}

struct UaInner {
    state: Mutex<UserAgentState>,
    stopping: AtomicBool,
    instance_id: String,
    transport: Transport,
    core: UserAgentCore,
    sdh_factory: Option<SessionDescriptionHandlerFactory>,
    delegate: Mutex<Option<Arc<dyn UserAgentDelegate>>>,
    registerers: Mutex<HashMap<String, Registerer>>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    publishers: Mutex<HashMap<String, Publisher>>,
    auto_stop: bool,
    auto_send_initial_provisional_response: bool,
    no_answer_timeout: Duration,
    reconnection_attempts: u32,
    reconnection_delay: Duration,
    sip_extension_replaces: SipExtension,
}

/// A SIP user agent over one stream transport.
#[derive(Clone)]
pub struct UserAgent(Arc<UaInner>);

impl UserAgent {
    pub fn new(connector: impl Connector, options: UserAgentOptions) -> UserAgent {
        let instance_id = Uuid::new_v4().to_string();
        let call_id_prefix = instance_id
            .split('-')
            .next()
            .unwrap_or("sipstream")
            .to_string();

        let contact_host = if options.hack_ip_in_contact {
            let mut rng = rand::rng();
            format!("192.0.2.{}", rng.random_range(1..=254u8))
        } else {
            format!("{call_id_prefix}.invalid")
        };
        let contact_transport = if options.hack_wss_in_transport {
            "wss"
        } else {
            "ws"
        };
        let contact_uri = UriBuilder::new()
            .scheme(Scheme::Sip)
            .user(crate::random_token(8))
            .host(contact_host.clone())
            .param("transport", Some(contact_transport))
            .build();
        let contact = NameAddr::new(contact_uri);

        let aor = options
            .uri
            .clone()
            .unwrap_or_else(|| Uri::new(Scheme::Sip, contact_host.clone()));
        let via_host = options.via_host.clone().unwrap_or(contact_host);
        let via_transport = if options.hack_via_tcp { "TCP" } else { "WS" };

        let config = CoreConfig {
            aor,
            contact,
            display_name: options.display_name.clone(),
            user_agent: options.user_agent_string.clone(),
            via_host,
            via_transport: via_transport.to_string(),
            via_rport: options.force_rport,
            call_id_prefix,
            supported: supported_option_tags(&options),
            authorization_username: options.authorization_username.clone(),
            authorization_password: options.authorization_password.clone(),
            preloaded_route_set: options.preloaded_route_set.clone(),
            allow_out_of_dialog_notify: options.allow_out_of_dialog_notify,
        };

        let transport = Transport::new(connector, options.transport_options.clone());
        let core = UserAgentCore::new(config, transport.clone());

        let ua = UserAgent(Arc::new(UaInner {
            state: Mutex::new(UserAgentState::Stopped),
            stopping: AtomicBool::new(false),
            instance_id,
            transport: transport.clone(),
            core: core.clone(),
            sdh_factory: options.session_description_handler_factory.clone(),
            delegate: Mutex::new(None),
            registerers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            publishers: Mutex::new(HashMap::new()),
            auto_stop: options.auto_stop,
            auto_send_initial_provisional_response: options
                .auto_send_initial_provisional_response,
            no_answer_timeout: options.no_answer_timeout,
            reconnection_attempts: options.reconnection_attempts,
            reconnection_delay: options.reconnection_delay,
            sip_extension_replaces: options.sip_extension_replaces,
        }));

        // The transport and core hold only weak handles back to the
        // agent; dropping the last UserAgent clone tears it all down.
        let weak = Arc::downgrade(&ua.0);
        {
            let weak = weak.clone();
            transport.on_message(move |raw| {
                if let Some(inner) = weak.upgrade() {
                    inner.core.receive_message(raw);
                }
            });
        }
        {
            let weak = weak.clone();
            transport.on_connect(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Some(delegate) = inner.delegate.lock().expect("Lock failed").clone() {
                        delegate.on_connect();
                    }
                }
            });
        }
        {
            let weak = weak.clone();
            transport.on_disconnect(move |error| {
                if let Some(inner) = weak.upgrade() {
                    UserAgent(inner).handle_transport_disconnect(error);
                }
            });
        }
        core.set_delegate(Arc::new(UaCoreDelegate { ua: weak }));

        if options.log_configuration {
            log::info!(
                "user agent configured: aor={} contact={} instance={}",
                core.config().aor,
                core.config().contact,
                ua.0.instance_id
            );
        }
        if options.auto_start {
            let ua = ua.clone();
            tokio::spawn(async move {
                if let Err(error) = ua.start().await {
                    log::warn!("auto-start failed: {error}");
                }
            });
        }
        ua
    }

    pub fn state(&self) -> UserAgentState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn instance_id(&self) -> &str {
        &self.0.instance_id
    }

    pub fn transport(&self) -> &Transport {
        &self.0.transport
    }

    pub fn core(&self) -> &UserAgentCore {
        &self.0.core
    }

    pub fn contact(&self) -> &NameAddr {
        &self.0.core.config().contact
    }

    pub fn set_delegate(&self, delegate: Arc<dyn UserAgentDelegate>) {
        *self.0.delegate.lock().expect("Lock failed") = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn UserAgentDelegate>> {
        self.0.delegate.lock().expect("Lock failed").clone()
    }

    /// Connects the transport and marks the agent started.
    pub async fn start(&self) -> Result<()> {
        *self.0.state.lock().expect("Lock failed") = UserAgentState::Started;
        self.0.transport.connect().await
    }

    /// Stops the agent: transaction users are disposed serially
    /// (registrations first, so the flood of cleanup requests stays
    /// ordered), then the transport closes and the core resets.
    /// A `stop` during `stop` is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if self.0.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let registerers: Vec<Registerer> = {
            let mut map = self.0.registerers.lock().expect("Lock failed");
            map.drain().map(|(_, registerer)| registerer).collect()
        };
        for registerer in registerers {
            if let Err(error) = registerer.dispose().await {
                log::warn!("failed to dispose registerer: {error}");
            }
        }

        let sessions: Vec<SessionHandle> = {
            let mut map = self.0.sessions.lock().expect("Lock failed");
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            if let Err(error) = session.dispose().await {
                log::warn!("failed to dispose session: {error}");
            }
        }

        let subscriptions: Vec<Subscription> = {
            let mut map = self.0.subscriptions.lock().expect("Lock failed");
            map.drain().map(|(_, subscription)| subscription).collect()
        };
        for subscription in subscriptions {
            if let Err(error) = subscription.dispose().await {
                log::warn!("failed to dispose subscription: {error}");
            }
        }

        let publishers: Vec<Publisher> = {
            let mut map = self.0.publishers.lock().expect("Lock failed");
            map.drain().map(|(_, publisher)| publisher).collect()
        };
        for publisher in publishers {
            if let Err(error) = publisher.dispose().await {
                log::warn!("failed to dispose publisher: {error}");
            }
        }

        let result = self.0.transport.disconnect().await;
        self.0.core.reset();
        *self.0.state.lock().expect("Lock failed") = UserAgentState::Stopped;
        self.0.stopping.store(false, Ordering::SeqCst);
        result
    }

    // --- transaction user factories ----------------------------------

    /// Creates a registerer bound to this agent; it leaves the agent's
    /// collection when it terminates.
    pub fn make_registerer(&self, options: RegistererOptions) -> Registerer {
        let registerer = Registerer::new(self.0.core.clone(), options);
        let id = registerer.id().to_string();
        let weak = Arc::downgrade(&self.0);
        {
            let id = id.clone();
            registerer.on_state_change(move |state| {
                if *state == RegistererState::Terminated {
                    if let Some(inner) = weak.upgrade() {
                        inner.registerers.lock().expect("Lock failed").remove(&id);
                    }
                }
            });
        }
        self.0
            .registerers
            .lock()
            .expect("Lock failed")
            .insert(id, registerer.clone());
        registerer
    }

    /// Creates an inviter for an outbound call.
    pub fn make_inviter(
        &self,
        target: Uri,
        options: InviterOptions,
    ) -> Result<Arc<Inviter>> {
        let factory = self
            .0
            .sdh_factory
            .as_ref()
            .ok_or_else(|| {
                Error::Validation("no session description handler factory configured".into())
            })?;
        let inviter = Inviter::new(self.0.core.clone(), target, factory(), options);
        self.track_session(SessionHandle::Inviter(inviter.clone()));
        Ok(inviter)
    }

    pub fn make_publisher(&self, target: Uri, options: PublisherOptions) -> Publisher {
        let publisher = Publisher::new(self.0.core.clone(), target, options);
        let id = publisher.id().to_string();
        let weak = Arc::downgrade(&self.0);
        {
            let id = id.clone();
            publisher.on_state_change(move |state| {
                if *state == PublisherState::Terminated {
                    if let Some(inner) = weak.upgrade() {
                        inner.publishers.lock().expect("Lock failed").remove(&id);
                    }
                }
            });
        }
        self.0
            .publishers
            .lock()
            .expect("Lock failed")
            .insert(id, publisher.clone());
        publisher
    }

    pub fn make_subscription(&self, target: Uri, options: SubscriptionOptions) -> Subscription {
        let subscription = Subscription::new(self.0.core.clone(), target, options);
        let id = subscription.id().to_string();
        let weak = Arc::downgrade(&self.0);
        {
            let id = id.clone();
            subscription.on_state_change(move |state| {
                if *state == SubscriptionState::Terminated {
                    if let Some(inner) = weak.upgrade() {
                        inner.subscriptions.lock().expect("Lock failed").remove(&id);
                    }
                }
            });
        }
        self.0
            .subscriptions
            .lock()
            .expect("Lock failed")
            .insert(id, subscription.clone());
        subscription
    }

    pub fn make_messager(&self, target: Uri, content_type: impl Into<String>) -> Messager {
        Messager::new(self.0.core.clone(), target, content_type)
    }

    pub fn registerer_count(&self) -> usize {
        self.0.registerers.lock().expect("Lock failed").len()
    }

    pub fn session_count(&self) -> usize {
        self.0.sessions.lock().expect("Lock failed").len()
    }

    pub fn subscription_count(&self) -> usize {
        self.0.subscriptions.lock().expect("Lock failed").len()
    }

    pub fn publisher_count(&self) -> usize {
        self.0.publishers.lock().expect("Lock failed").len()
    }

    fn track_session(&self, handle: SessionHandle) {
        let session = handle.session().clone();
        let id = session.id().to_string();
        let weak = Arc::downgrade(&self.0);
        {
            let id = id.clone();
            session.on_state_change(move |state| {
                if *state == SessionState::Terminated {
                    if let Some(inner) = weak.upgrade() {
                        inner.sessions.lock().expect("Lock failed").remove(&id);
                    }
                }
            });
        }
        self.0
            .sessions
            .lock()
            .expect("Lock failed")
            .insert(id, handle);
    }

    // --- transport events --------------------------------------------

    fn handle_transport_disconnect(&self, error: Option<TransportError>) {
        if self.0.stopping.load(Ordering::SeqCst) {
            return;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_disconnect(error.as_ref());
        }
        if error.is_some() && self.0.reconnection_attempts > 0 {
            let ua = self.clone();
            tokio::spawn(async move { ua.attempt_reconnection().await });
        }
    }

    // First attempt immediately, then one per delay period, stopping on
    // success or exhaustion. Registered bindings refresh on success.
    async fn attempt_reconnection(&self) {
        for attempt in 0..self.0.reconnection_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.0.reconnection_delay).await;
            }
            if self.state() == UserAgentState::Stopped {
                return;
            }
            log::debug!("reconnection attempt {}", attempt + 1);
            match self.0.transport.connect().await {
                Ok(()) => {
                    let registerers: Vec<Registerer> = {
                        let map = self.0.registerers.lock().expect("Lock failed");
                        map.values().cloned().collect()
                    };
                    for registerer in registerers {
                        if registerer.state() == RegistererState::Registered {
                            tokio::spawn(async move {
                                if let Err(error) = registerer.register().await {
                                    log::warn!("re-registration failed: {error}");
                                }
                            });
                        }
                    }
                    return;
                }
                Err(error) => log::warn!("reconnection attempt failed: {error}"),
            }
        }
        log::warn!("reconnection attempts exhausted");
        if self.0.auto_stop {
            let ua = self.clone();
            tokio::spawn(async move {
                let _ = ua.stop().await;
            });
        }
    }

    // --- inbound dispatch --------------------------------------------

    fn handle_invite(&self, request: ServerRequest) {
        // RFC 3891 Replaces: the replaced dialog must exist (481) and,
        // under early-only, must still be early (486).
        if self.0.sip_extension_replaces != SipExtension::Unsupported {
            if let Some(replaces) = request.request().headers.get("Replaces") {
                let (call_id, params) = parser::split_value_params(replaces);
                let to_tag = params.value_of("to-tag").unwrap_or_default();
                let from_tag = params.value_of("from-tag").unwrap_or_default();
                let id = DialogId::new(call_id.trim(), to_tag, from_tag);
                match self.0.core.find_dialog(&id) {
                    None => {
                        request.reply_in_background(481);
                        return;
                    }
                    Some(dialog) => {
                        if params.contains("early-only")
                            && dialog.state() == crate::dialog::DialogState::Confirmed
                        {
                            request.reply_in_background(486);
                            return;
                        }
                    }
                }
            }
        }

        let Some(factory) = self.0.sdh_factory.as_ref() else {
            log::warn!("inbound INVITE without a session description handler factory");
            request.reply_in_background(486);
            return;
        };
        let invitation = Invitation::new(
            self.0.core.clone(),
            request,
            factory(),
            self.0.no_answer_timeout,
        );
        self.track_session(SessionHandle::Invitation(invitation.clone()));

        let delegate = self.delegate();
        if self.0.auto_send_initial_provisional_response && delegate.is_some() {
            let invitation = invitation.clone();
            tokio::spawn(async move {
                if let Err(error) = invitation.progress(180).await {
                    log::info!("failed to ring: {error}");
                }
            });
        }
        match delegate {
            Some(delegate) => delegate.on_invite(invitation),
            None => {
                tokio::spawn(async move {
                    let _ = invitation.reject(486).await;
                });
            }
        }
    }

    fn handle_notify(&self, request: ServerRequest) {
        // A NOTIFY that raced ahead of its SUBSCRIBE's 2xx.
        let subscription = {
            let map = self.0.subscriptions.lock().expect("Lock failed");
            map.values()
                .find(|subscription| subscription.matches_early_notify(request.request()))
                .cloned()
        };
        match subscription {
            Some(subscription) => subscription.receive_early_notify(request),
            None => {
                // A NOTIFY into an unknown dialog is a dead subscription;
                // only the out-of-dialog kind may go to the application.
                let in_dialog = request.request().headers.to_tag().is_some();
                match self.delegate() {
                    Some(delegate) if !in_dialog => {
                        delegate.on_notify(request.request());
                        request.reply_in_background(200);
                    }
                    _ => request.reply_in_background(481),
                }
            }
        }
    }
}

fn supported_option_tags(options: &UserAgentOptions) -> Vec<String> {
    let mut tags = Vec::new();
    if options.sip_extension_100rel != SipExtension::Unsupported {
        tags.push("100rel".to_string());
    }
    if options.sip_extension_replaces != SipExtension::Unsupported {
        tags.push("replaces".to_string());
    }
    for tag in &options.sip_extension_extra_supported {
        let registered = REGISTERED_OPTION_TAGS.contains(&tag.as_str());
        if registered || options.hack_allow_unregistered_option_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        } else {
            log::warn!("dropping unregistered option tag '{tag}'");
        }
    }
    tags
}

struct UaCoreDelegate {
    ua: Weak<UaInner>,
}

impl UaCoreDelegate {
    fn ua(&self) -> Option<UserAgent> {
        self.ua.upgrade().map(UserAgent)
    }
}

impl CoreDelegate for UaCoreDelegate {
    fn on_invite(&self, request: ServerRequest) {
        match self.ua() {
            Some(ua) => ua.handle_invite(request),
            None => request.reply_in_background(480),
        }
    }

    fn on_message(&self, request: ServerRequest) {
        match self.ua().and_then(|ua| ua.delegate()) {
            Some(delegate) => {
                delegate.on_message(request.request());
                request.reply_in_background(200);
            }
            None => request.reply_in_background(405),
        }
    }

    fn on_notify(&self, request: ServerRequest) {
        match self.ua() {
            Some(ua) => ua.handle_notify(request),
            None => request.reply_in_background(481),
        }
    }

    fn on_refer(&self, request: ServerRequest) {
        match self.ua().and_then(|ua| ua.delegate()) {
            Some(delegate) => delegate.on_refer(request),
            None => request.reply_in_background(405),
        }
    }

    fn on_register(&self, request: ServerRequest) {
        match self.ua().and_then(|ua| ua.delegate()) {
            Some(delegate) => delegate.on_register(request),
            None => request.reply_in_background(405),
        }
    }

    fn on_subscribe(&self, request: ServerRequest) {
        match self.ua().and_then(|ua| ua.delegate()) {
            Some(delegate) => delegate.on_subscribe(request),
            None => request.reply_in_background(405),
        }
    }
}

// Out-of-dialog requests the core routes to a user agent use the
// RequestOptions envelope; re-exported for applications building their
// own requests.
pub use crate::core::{ClientRequestDelegate, ReplyOptions};
pub type OutgoingRequestOptions = RequestOptions;
