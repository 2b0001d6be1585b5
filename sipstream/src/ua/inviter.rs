//! The UAC half of an INVITE session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::core::{ClientRequestDelegate, RequestOptions, UserAgentClient, UserAgentCore};
use crate::dialog::Dialog;
use crate::error::{Error, Result, TransportError};
use crate::message::{Method, Request, Response, Uri};
use crate::session_description::{DescriptionOptions, SdhState, SessionDescriptionHandler};
use crate::ua::session::{Session, SessionState};

/// Knobs for an outbound call.
#[derive(Default)]
pub struct InviterOptions {
    pub extra_headers: Vec<String>,
}

/// Places and controls an outbound call.
///
/// `invite()` moves Initial to Establishing and sends the INVITE with
/// an offer from the session-description handler; the 2xx answer is
/// installed, ACKed, and the session is Established. `cancel()` before
/// the 2xx tears the attempt down via the 487 path.
pub struct Inviter {
    me: Weak<Inviter>,
    session: Session,
    target: Uri,
    options: InviterOptions,
    uac: Mutex<Option<UserAgentClient>>,
    cancel_requested: AtomicBool,
}

impl Inviter {
    pub(crate) fn new(
        core: UserAgentCore,
        target: Uri,
        sdh: Arc<dyn SessionDescriptionHandler>,
        options: InviterOptions,
    ) -> Arc<Inviter> {
        let session = Session::new(core, format!("inviter-{}", crate::random_token(8)));
        session.set_session_description_handler(sdh);
        Arc::new_cyclic(|me| Inviter {
            me: me.clone(),
            session,
            target,
            options,
            uac: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Sends the INVITE (initial call) or a re-INVITE when already
    /// established.
    pub async fn invite(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Initial => {}
            SessionState::Established => return self.reinvite().await,
            state => {
                return Err(Error::Validation(format!(
                    "cannot invite from state {state}"
                )))
            }
        }
        self.session.transition(SessionState::Establishing)?;

        let sdh = self
            .session
            .session_description_handler()
            .ok_or_else(|| Error::Validation("no session description handler".into()))?;
        let offer = sdh.get_description(&DescriptionOptions::default()).await?;

        let core = self.session.core().clone();
        let mut options = RequestOptions {
            body: Some(offer),
            ..Default::default()
        };
        options
            .extra_headers
            .push(format!("Contact: {}", core.config().contact));
        options
            .extra_headers
            .extend(self.options.extra_headers.clone());

        let request = core.make_request(Method::Invite, self.target.clone(), options);
        self.session.set_invite_cseq(1);

        let delegate = Arc::new(InviterDelegate {
            inviter: self.me.clone(),
        });
        let uac = core.request(request, Some(delegate)).await?;
        *self.uac.lock().expect("Lock failed") = Some(uac);
        Ok(())
    }

    // Re-INVITE with a fresh offer. The handler must be back in Stable
    // before a new negotiation starts; re-offering from has-remote-offer
    // corrupts the handler.
    async fn reinvite(&self) -> Result<()> {
        let sdh = self
            .session
            .session_description_handler()
            .ok_or_else(|| Error::Validation("no session description handler".into()))?;
        if sdh.state() != SdhState::Stable {
            return Err(Error::Validation(
                "session description handler is mid-negotiation".into(),
            ));
        }
        let dialog = self
            .session
            .dialog()
            .ok_or_else(|| Error::Validation("no dialog".into()))?;

        let offer = sdh.get_description(&DescriptionOptions::default()).await?;
        let core = self.session.core().clone();
        let mut request = dialog.create_request(Method::Invite);
        request
            .extra_headers
            .push(format!("Contact: {}", core.config().contact));
        request.body = Some(offer);
        let cseq = request.headers.cseq().map(|cseq| cseq.seq).unwrap_or(1);
        self.session.set_invite_cseq(cseq);

        let delegate = Arc::new(ReinviteDelegate {
            inviter: self.me.clone(),
        });
        core.request(request, Some(delegate)).await?;
        Ok(())
    }

    /// Cancels a pending INVITE. The CANCEL reuses the INVITE's Via
    /// branch (RFC 3261 section 9.1); the 487 on the INVITE transaction
    /// finishes the session off.
    pub async fn cancel(&self) -> Result<()> {
        if self.session.state() != SessionState::Establishing {
            return Err(Error::Validation("no pending INVITE to cancel".into()));
        }
        self.cancel_requested.store(true, Ordering::SeqCst);

        let invite = {
            let uac = self.uac.lock().expect("Lock failed");
            uac.as_ref()
                .map(|uac| uac.request())
                .ok_or_else(|| Error::Validation("INVITE not sent yet".into()))?
        };
        let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
        if let Some(via) = invite.headers.get("Via") {
            cancel.headers.push("Via", via);
        }
        for route in invite.headers.get_all("Route") {
            cancel.headers.push("Route", route);
        }
        cancel.headers.push("Max-Forwards", "70");
        if let Some(to) = invite.headers.get("To") {
            cancel.headers.push("To", to);
        }
        if let Some(from) = invite.headers.get("From") {
            cancel.headers.push("From", from);
        }
        if let Some(call_id) = invite.headers.call_id() {
            cancel.headers.push("Call-ID", call_id);
        }
        let seq = invite.headers.cseq().map(|cseq| cseq.seq).unwrap_or(1);
        cancel.headers.push("CSeq", format!("{seq} {}", Method::Cancel));

        let core = self.session.core().clone();
        let (waiter, done) = crate::core::ResponseWaiter::new();
        core.request(cancel, Some(waiter)).await?;
        let _ = done.await;
        Ok(())
    }

    /// Graceful teardown appropriate to the current state: nothing sent
    /// from Initial, CANCEL while Establishing, BYE once Established.
    pub async fn dispose(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Initial => {
                self.session.terminate();
                Ok(())
            }
            SessionState::Establishing => self.cancel().await,
            SessionState::Established => self.session.bye().await,
            _ => Ok(()),
        }
    }

    fn sent_invite(&self) -> Option<Request> {
        self.uac
            .lock()
            .expect("Lock failed")
            .as_ref()
            .map(|uac| uac.request())
    }

    fn handle_progress(self: Arc<Self>, response: Response) {
        tokio::spawn(async move {
            if self.session.state() != SessionState::Establishing {
                return;
            }
            // A to-tag on a reliable provisional opens the early dialog.
            if response.headers.to_tag().is_some() && self.session.dialog().is_none() {
                if let Some(invite) = self.sent_invite() {
                    if let Some(dialog) = Dialog::new_uac(&invite, &response) {
                        self.session.adopt_dialog(dialog);
                    }
                }
            }
            if let Some(body) = &response.body {
                if let Some(sdh) = self.session.session_description_handler() {
                    if sdh.state() == SdhState::HasLocalOffer {
                        if let Err(error) =
                            sdh.set_description(&body.content, &body.content_type).await
                        {
                            log::warn!("failed to apply early answer: {error}");
                        }
                    }
                }
            }
        });
    }

    fn handle_accept(self: Arc<Self>, response: Response) {
        tokio::spawn(async move {
            if self.session.state() == SessionState::Established {
                // A 2xx retransmission; our ACK got lost.
                let _ = self.session.send_ack().await;
                return;
            }
            if self.session.state() != SessionState::Establishing {
                return;
            }

            match self.session.dialog() {
                Some(dialog) => {
                    dialog.confirm();
                    if let Some(contact) = response.headers.contact() {
                        dialog.set_remote_target(contact.uri().clone());
                    }
                }
                None => {
                    if let Some(invite) = self.sent_invite() {
                        if let Some(dialog) = Dialog::new_uac(&invite, &response) {
                            self.session.adopt_dialog(dialog);
                        }
                    }
                }
            }
            if self.session.dialog().is_none() {
                log::warn!("2xx without usable dialog state; dropping call");
                self.session.terminate();
                return;
            }

            if let Some(body) = &response.body {
                if let Some(sdh) = self.session.session_description_handler() {
                    if sdh.state() == SdhState::HasLocalOffer {
                        if let Err(error) =
                            sdh.set_description(&body.content, &body.content_type).await
                        {
                            log::warn!("failed to apply answer: {error}");
                            let _ = self.session.send_ack().await;
                            self.session.terminate();
                            return;
                        }
                    }
                }
            }

            if let Err(error) = self.session.send_ack().await {
                log::warn!("failed to ACK: {error}");
            }
            let _ = self.session.transition(SessionState::Established);

            if self.cancel_requested.load(Ordering::SeqCst) {
                // The 2xx won the race against our CANCEL; hang up.
                let _ = self.session.bye().await;
            }
        });
    }
}

struct InviterDelegate {
    inviter: Weak<Inviter>,
}

impl InviterDelegate {
    fn inviter(&self) -> Option<Arc<Inviter>> {
        self.inviter.upgrade()
    }
}

impl ClientRequestDelegate for InviterDelegate {
    fn on_progress(&self, response: &Response) {
        if let Some(inviter) = self.inviter() {
            inviter.handle_progress(response.clone());
        }
    }

    fn on_accept(&self, response: &Response) {
        if let Some(inviter) = self.inviter() {
            inviter.handle_accept(response.clone());
        }
    }

    fn on_redirect(&self, response: &Response) {
        let _ = response;
        if let Some(inviter) = self.inviter() {
            inviter.session.terminate();
        }
    }

    fn on_reject(&self, response: &Response) {
        // 487 after our CANCEL and every other failure end the attempt.
        let _ = response;
        if let Some(inviter) = self.inviter() {
            inviter.session.terminate();
        }
    }

    fn on_timeout(&self) {
        if let Some(inviter) = self.inviter() {
            inviter.session.terminate();
        }
    }

    fn on_transport_error(&self, error: &TransportError) {
        log::warn!("INVITE transport error: {error}");
        if let Some(inviter) = self.inviter() {
            inviter.session.terminate();
        }
    }
}

struct ReinviteDelegate {
    inviter: Weak<Inviter>,
}

impl ClientRequestDelegate for ReinviteDelegate {
    fn on_accept(&self, response: &Response) {
        let Some(inviter) = self.inviter.upgrade() else {
            return;
        };
        let response = response.clone();
        tokio::spawn(async move {
            if let Some(body) = &response.body {
                if let Some(sdh) = inviter.session.session_description_handler() {
                    if let Err(error) =
                        sdh.set_description(&body.content, &body.content_type).await
                    {
                        log::warn!("failed to apply re-INVITE answer: {error}");
                    }
                }
            }
            if let Err(error) = inviter.session.send_ack().await {
                log::warn!("failed to ACK re-INVITE: {error}");
            }
        });
    }

    fn on_reject(&self, response: &Response) {
        let _ = response;
        let Some(inviter) = self.inviter.upgrade() else {
            return;
        };
        // The peer refused the new offer; roll the handler back so the
        // session keeps its previous description.
        tokio::spawn(async move {
            if let Some(sdh) = inviter.session.session_description_handler() {
                if let Err(error) = sdh.rollback_description().await {
                    log::warn!("rollback failed: {error}");
                }
            }
        });
    }
}
