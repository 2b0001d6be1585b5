//! The INVITE dialog usage shared by both session roles.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{ReplyOptions, ServerRequest, UserAgentCore};
use crate::dialog::{Dialog, DialogUsage};
use crate::error::{Error, Result, StateTransitionError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::message::{Body, Method, Request, Response, Uri};
use crate::session_description::{DescriptionOptions, SessionDescriptionHandler};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initial => "Initial",
            SessionState::Establishing => "Establishing",
            SessionState::Established => "Established",
            SessionState::Terminating => "Terminating",
            SessionState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

fn legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Initial, Establishing)
            | (Initial, Terminating)
            | (Initial, Terminated)
            | (Establishing, Established)
            | (Establishing, Terminating)
            | (Establishing, Terminated)
            | (Established, Terminating)
            | (Established, Terminated)
            | (Terminating, Terminated)
    )
}

/// Application callbacks for in-dialog traffic.
pub trait SessionDelegate: Send + Sync {
    fn on_bye(&self) {}

    fn on_info(&self, request: &Request) {
        let _ = request;
    }

    fn on_refer(&self, request: &Request) {
        let _ = request;
    }

    fn on_message(&self, request: &Request) {
        let _ = request;
    }
}

pub(crate) struct SessionInner {
    id: String,
    core: UserAgentCore,
    state: Mutex<SessionState>,
    guard: TransitionGuard,
    emitter: StateEmitter<SessionState>,
    dialog: Mutex<Option<Dialog>>,
    sdh: Mutex<Option<Arc<dyn SessionDescriptionHandler>>>,
    delegate: Mutex<Option<Arc<dyn SessionDelegate>>>,
    /// CSeq number of the INVITE the dialog rests on; the ACK mirrors
    /// it.
    invite_cseq: AtomicU32,
}

/// The session usage of an INVITE dialog. [`Inviter`] and
/// [`Invitation`] wrap one of these with their role-specific halves.
///
/// [`Inviter`]: crate::ua::Inviter
/// [`Invitation`]: crate::ua::Invitation
#[derive(Clone)]
pub struct Session(pub(crate) Arc<SessionInner>);

impl Session {
    pub(crate) fn new(core: UserAgentCore, id: String) -> Self {
        Session(Arc::new(SessionInner {
            id,
            core,
            state: Mutex::new(SessionState::Initial),
            guard: TransitionGuard::new("Session"),
            emitter: StateEmitter::new(),
            dialog: Mutex::new(None),
            sdh: Mutex::new(None),
            delegate: Mutex::new(None),
            invite_cseq: AtomicU32::new(1),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn state(&self) -> SessionState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.0.emitter.on(observer);
    }

    pub fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        *self.0.delegate.lock().expect("Lock failed") = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.0.delegate.lock().expect("Lock failed").clone()
    }

    pub fn session_description_handler(&self) -> Option<Arc<dyn SessionDescriptionHandler>> {
        self.0.sdh.lock().expect("Lock failed").clone()
    }

    pub(crate) fn set_session_description_handler(
        &self,
        sdh: Arc<dyn SessionDescriptionHandler>,
    ) {
        *self.0.sdh.lock().expect("Lock failed") = Some(sdh);
    }

    pub(crate) fn core(&self) -> &UserAgentCore {
        &self.0.core
    }

    pub fn dialog(&self) -> Option<Dialog> {
        self.0.dialog.lock().expect("Lock failed").clone()
    }

    pub(crate) fn set_invite_cseq(&self, seq: u32) {
        self.0.invite_cseq.store(seq, Ordering::SeqCst);
    }

    /// Installs the dialog and registers this session as its usage.
    pub(crate) fn adopt_dialog(&self, dialog: Dialog) {
        dialog.register_usage(self.0.id.clone(), Arc::new(self.clone()));
        self.0.core.add_dialog(dialog.clone());
        *self.0.dialog.lock().expect("Lock failed") = Some(dialog);
    }

    /// Moves the machine, failing on illegal or reentrant transitions.
    pub(crate) fn transition(&self, to: SessionState) -> Result<()> {
        let token = self.0.guard.enter()?;
        let from = {
            let mut state = self.0.state.lock().expect("Lock failed");
            if *state == to {
                return Ok(());
            }
            if !legal_transition(*state, to) {
                return Err(StateTransitionError::Invalid {
                    object: "Session",
                    from: state.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            std::mem::replace(&mut *state, to)
        };
        log::debug!("session {} transitioned {from} -> {to}", self.0.id);
        token.release();
        self.0.emitter.emit(&to);
        Ok(())
    }

    /// Tears the session down: terminal state, dialog usage gone, media
    /// released. Safe to call repeatedly.
    pub(crate) fn terminate(&self) {
        if self.state() != SessionState::Terminated {
            let _ = self.transition(SessionState::Terminated);
        }
        let dialog = self.0.dialog.lock().expect("Lock failed").take();
        if let Some(dialog) = dialog {
            self.0.core.deregister_usage(dialog.id(), &self.0.id);
        }
        let sdh = self.0.sdh.lock().expect("Lock failed").take();
        if let Some(sdh) = sdh {
            sdh.close();
        }
    }

    /// Emits the ACK for a 2xx. The TU owns this ACK, not the INVITE
    /// transaction.
    pub(crate) async fn send_ack(&self) -> Result<()> {
        let dialog = self
            .dialog()
            .ok_or_else(|| Error::Validation("no dialog to ACK in".into()))?;
        let ack = dialog.create_ack(self.0.invite_cseq.load(Ordering::SeqCst));
        self.0.core.send_request_direct(ack).await
    }

    /// Ends an established session with a BYE.
    pub async fn bye(&self) -> Result<()> {
        match self.state() {
            SessionState::Established => {}
            SessionState::Terminating | SessionState::Terminated => return Ok(()),
            state => {
                return Err(Error::Validation(format!(
                    "cannot BYE a session in state {state}"
                )))
            }
        }
        self.transition(SessionState::Terminating)?;
        let dialog = self
            .dialog()
            .ok_or_else(|| Error::Validation("no dialog to BYE in".into()))?;
        let request = dialog.create_request(Method::Bye);

        let (delegate, done) = crate::core::ResponseWaiter::new();
        self.0.core.request(request, Some(delegate)).await?;
        // Terminated on any final response, and equally on timeout or a
        // dead transport.
        let _ = done.await;
        self.terminate();
        Ok(())
    }

    /// Sends an in-dialog INFO.
    pub async fn info(&self, body: Option<Body>) -> Result<()> {
        self.send_in_dialog(Method::Info, body, Vec::new()).await
    }

    /// Sends an in-dialog MESSAGE.
    pub async fn message(&self, body: Body) -> Result<()> {
        self.send_in_dialog(Method::Message, Some(body), Vec::new())
            .await
    }

    /// Refers the peer to another target (blind transfer).
    pub async fn refer(&self, target: &Uri) -> Result<()> {
        let headers = vec![format!("Refer-To: <{target}>")];
        self.send_in_dialog(Method::Refer, None, headers).await
    }

    /// Plays DTMF through the media handler.
    pub async fn send_dtmf(&self, tones: &str) -> Result<()> {
        let sdh = self
            .session_description_handler()
            .ok_or_else(|| Error::Validation("no session description handler".into()))?;
        sdh.send_dtmf(tones).await
    }

    async fn send_in_dialog(
        &self,
        method: Method,
        body: Option<Body>,
        extra_headers: Vec<String>,
    ) -> Result<()> {
        if self.state() != SessionState::Established {
            return Err(Error::Validation(format!(
                "cannot send {method} outside an established session"
            )));
        }
        let dialog = self
            .dialog()
            .ok_or_else(|| Error::Validation("no dialog".into()))?;
        let mut request = dialog.create_request(method);
        request.extra_headers = extra_headers;
        request.body = body;

        let (delegate, done) = crate::core::ResponseWaiter::new();
        self.0.core.request(request, Some(delegate)).await?;
        match done.await {
            Ok(Ok(response)) if response.status.is_success() => Ok(()),
            Ok(Ok(response)) => Err(Error::RequestFailure {
                code: response.status,
                reason: response.reason,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    // The UAS side of an in-dialog re-INVITE: install their offer (if
    // any), answer from the handler, 200 with the answer.
    fn handle_reinvite(&self, request: ServerRequest) {
        let session = self.clone();
        tokio::spawn(async move {
            let Some(sdh) = session.session_description_handler() else {
                let _ = request.reject(488).await;
                return;
            };
            let local_tag = session
                .dialog()
                .map(|dialog| dialog.id().local_tag().to_string())
                .unwrap_or_default();

            if let Some(body) = &request.request().body {
                if sdh
                    .set_description(&body.content, &body.content_type)
                    .await
                    .is_err()
                {
                    let _ = request.reject(488).await;
                    return;
                }
            }
            match sdh.get_description(&DescriptionOptions::default()).await {
                Ok(answer) => {
                    let options = ReplyOptions::new().with_body(answer).with_to_tag(local_tag);
                    if let Err(error) = request.accept(options).await {
                        log::warn!("failed to accept re-INVITE: {error}");
                    }
                    if let Some(contact) = request.request().headers.contact() {
                        if let Some(dialog) = session.dialog() {
                            dialog.set_remote_target(contact.uri().clone());
                        }
                    }
                }
                Err(error) => {
                    log::warn!("re-INVITE answer failed: {error}");
                    let _ = request.reject(488).await;
                }
            }
        });
    }

    fn handle_bye(&self, request: ServerRequest) {
        let session = self.clone();
        tokio::spawn(async move {
            let _ = request.reply(200, ReplyOptions::new()).await;
            if let Some(delegate) = session.delegate() {
                delegate.on_bye();
            }
            session.terminate();
        });
    }
}

impl DialogUsage for Session {
    fn handles(&self, request: &Request) -> bool {
        !matches!(request.method, Method::Notify | Method::Subscribe)
    }

    fn receive_request(&self, request: ServerRequest) {
        match request.method() {
            Method::Ack => {
                // The ACK that completes our 2xx. When our 2xx carried
                // the offer, the answer rides in here.
                if let Some(body) = request.request().body.clone() {
                    if let Some(sdh) = self.session_description_handler() {
                        if sdh.state() == crate::session_description::SdhState::HasLocalOffer {
                            tokio::spawn(async move {
                                if let Err(error) =
                                    sdh.set_description(&body.content, &body.content_type).await
                                {
                                    log::warn!("failed to apply answer from ACK: {error}");
                                }
                            });
                        }
                    }
                }
                if self.state() == SessionState::Establishing {
                    let _ = self.transition(SessionState::Established);
                }
            }
            Method::Bye => self.handle_bye(request),
            Method::Invite => self.handle_reinvite(request),
            Method::Info => {
                if let Some(delegate) = self.delegate() {
                    delegate.on_info(request.request());
                }
                request.reply_in_background(200);
            }
            Method::Message => {
                if let Some(delegate) = self.delegate() {
                    delegate.on_message(request.request());
                }
                request.reply_in_background(200);
            }
            Method::Refer => {
                if let Some(delegate) = self.delegate() {
                    delegate.on_refer(request.request());
                }
                // 202 acknowledges the referral without implying it ran.
                request.reply_in_background(202);
            }
            _ => request.reply_in_background(405),
        }
    }

    fn receive_stray_response(&self, response: &Response) {
        // A retransmitted 2xx to our INVITE: our ACK was lost, resend.
        if response.status.is_success() {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(error) = session.send_ack().await {
                    log::info!("failed to re-ACK: {error}");
                }
            });
        }
    }
}
