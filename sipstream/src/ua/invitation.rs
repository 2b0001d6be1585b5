//! The UAS half of an INVITE session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time;

use crate::core::{ReplyOptions, ServerRequest, UserAgentCore};
use crate::dialog::{Dialog, DialogState};
use crate::error::{Error, Result, TransportError};
use crate::message::{Body, Request};
use crate::session_description::{
    DescriptionOptions, SessionDescriptionHandler,
};
use crate::timer::{Timer, T1, T2, TIMER_L};
use crate::transaction::{ServerTransaction, ServerTransactionUser};
use crate::ua::session::{Session, SessionState};

/// An inbound call offered to the application.
///
/// A 100 Trying goes out on construction. `progress()` rings,
/// `accept()` answers with a description from the handler, `reject()`
/// declines. An unanswered call is rejected 480 after the no-answer
/// timeout; a CANCEL finishes it with 487.
pub struct Invitation {
    me: Weak<Invitation>,
    session: Session,
    server_request: ServerRequest,
    local_tag: String,
    /// Set once a final response went out.
    answered: AtomicBool,
    no_answer: Mutex<Option<Timer>>,
}

impl Invitation {
    pub(crate) fn new(
        core: UserAgentCore,
        server_request: ServerRequest,
        sdh: Arc<dyn SessionDescriptionHandler>,
        no_answer_timeout: Duration,
    ) -> Arc<Invitation> {
        let session = Session::new(core, format!("invitation-{}", crate::random_token(8)));
        session.set_session_description_handler(sdh);
        if let Some(cseq) = server_request.request().headers.cseq() {
            session.set_invite_cseq(cseq.seq);
        }

        let invitation = Arc::new_cyclic(|me| Invitation {
            me: me.clone(),
            session,
            server_request,
            local_tag: crate::new_tag(),
            answered: AtomicBool::new(false),
            no_answer: Mutex::new(None),
        });

        invitation
            .server_request
            .set_transaction_user(Arc::new(InvitationTsxUser {
                invitation: Arc::downgrade(&invitation),
            }));

        {
            let invitation = invitation.clone();
            tokio::spawn(async move {
                if let Err(error) = invitation.server_request.trying().await {
                    log::info!("failed to send 100 Trying: {error}");
                }
            });
        }

        let reaper = Arc::downgrade(&invitation);
        *invitation.no_answer.lock().expect("Lock failed") =
            Some(Timer::start(no_answer_timeout, async move {
                if let Some(invitation) = reaper.upgrade() {
                    if !invitation.answered.load(Ordering::SeqCst) {
                        log::debug!("no answer; rejecting invitation");
                        let _ = invitation.reject(480).await;
                    }
                }
            }));

        invitation
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn request(&self) -> &Request {
        self.server_request.request()
    }

    /// Sends a provisional ringing response (default 180).
    pub async fn progress(&self, status: u16) -> Result<()> {
        if self.answered.load(Ordering::SeqCst) {
            return Err(Error::Validation("invitation already answered".into()));
        }
        self.ensure_dialog(DialogState::Early)?;
        let options = ReplyOptions::new().with_to_tag(self.local_tag.clone());
        self.server_request.progress(status, options).await
    }

    /// Answers the call: the handler produces the answer for the offer
    /// carried in the INVITE (or an offer, when the INVITE had none),
    /// and the 200 goes out. Established once the ACK lands.
    pub async fn accept(&self) -> Result<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation("invitation already answered".into()));
        }
        self.session.transition(SessionState::Establishing)?;
        self.cancel_no_answer_timer();

        let body = match self.negotiate().await {
            Ok(body) => body,
            Err(error) => {
                let _ = self.server_request.reject(488).await;
                self.session.terminate();
                return Err(error);
            }
        };

        self.ensure_dialog(DialogState::Confirmed)?;
        if let Some(dialog) = self.session.dialog() {
            dialog.confirm();
        }

        let options = ReplyOptions::new()
            .with_to_tag(self.local_tag.clone())
            .with_body(body);
        self.server_request.accept(options).await?;

        // The TU retransmits the 2xx until the ACK arrives (RFC 6026;
        // the Accepted transaction only bounds the wait).
        if let Some(invitation) = self.me.upgrade() {
            tokio::spawn(async move { invitation.retransmit_2xx_until_acked().await });
        }
        Ok(())
    }

    /// Declines the call with a final response.
    pub async fn reject(&self, status: u16) -> Result<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation("invitation already answered".into()));
        }
        self.cancel_no_answer_timer();
        let options = ReplyOptions::new().with_to_tag(self.local_tag.clone());
        let result = self.server_request.reply(status, options).await;
        self.session.terminate();
        result
    }

    /// Graceful teardown: reject if unanswered, BYE if established.
    pub async fn dispose(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Initial => {
                if !self.answered.load(Ordering::SeqCst) {
                    self.reject(480).await
                } else {
                    Ok(())
                }
            }
            SessionState::Established => self.session.bye().await,
            _ => {
                self.session.terminate();
                Ok(())
            }
        }
    }

    async fn negotiate(&self) -> Result<Body> {
        let sdh = self
            .session
            .session_description_handler()
            .ok_or_else(|| Error::Validation("no session description handler".into()))?;
        if let Some(offer) = &self.server_request.request().body {
            sdh.set_description(&offer.content, &offer.content_type)
                .await?;
        }
        sdh.get_description(&DescriptionOptions::default()).await
    }

    fn ensure_dialog(&self, state: DialogState) -> Result<()> {
        if self.session.dialog().is_some() {
            return Ok(());
        }
        let dialog = Dialog::new_uas(self.server_request.request(), &self.local_tag, state)
            .ok_or_else(|| Error::Validation("INVITE unusable for a dialog".into()))?;
        self.session.adopt_dialog(dialog);
        Ok(())
    }

    fn cancel_no_answer_timer(&self) {
        self.no_answer.lock().expect("Lock failed").take();
    }

    async fn retransmit_2xx_until_acked(self: Arc<Self>) {
        let Some(ServerTransaction::Invite(transaction)) =
            self.server_request.transaction().cloned()
        else {
            return;
        };
        let mut interval = T1;
        let mut elapsed = Duration::ZERO;
        while elapsed < TIMER_L {
            time::sleep(interval).await;
            elapsed += interval;
            if self.session.state() != SessionState::Establishing {
                return;
            }
            if let Err(error) = transaction.retransmit_response().await {
                log::info!("failed to retransmit 2xx: {error}");
                return;
            }
            interval = std::cmp::min(interval * 2, T2);
        }
        // No ACK within 64*T1: give up on the session.
        log::warn!("2xx never acknowledged; terminating session");
        self.session.terminate();
    }

    fn handle_cancel(self: Arc<Self>) {
        tokio::spawn(async move {
            if self.answered.swap(true, Ordering::SeqCst) {
                return;
            }
            self.cancel_no_answer_timer();
            let options = ReplyOptions::new().with_to_tag(self.local_tag.clone());
            if let Err(error) = self.server_request.reply(487, options).await {
                log::info!("failed to send 487: {error}");
            }
            self.session.terminate();
        });
    }
}

struct InvitationTsxUser {
    invitation: Weak<Invitation>,
}

impl ServerTransactionUser for InvitationTsxUser {
    fn receive_ack(&self, request: &Request) {
        let _ = request;
        if let Some(invitation) = self.invitation.upgrade() {
            if invitation.session.state() == SessionState::Establishing {
                let _ = invitation.session.transition(SessionState::Established);
            }
        }
    }

    fn receive_cancel(&self, request: &Request) {
        let _ = request;
        if let Some(invitation) = self.invitation.upgrade() {
            invitation.handle_cancel();
        }
    }

    fn on_timeout(&self) {
        // The non-2xx final was never acknowledged.
        if let Some(invitation) = self.invitation.upgrade() {
            invitation.session.terminate();
        }
    }

    fn on_transport_error(&self, error: &TransportError) {
        log::warn!("invitation transport error: {error}");
    }
}
