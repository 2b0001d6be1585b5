//! Client-side request handling: sends a request through the right
//! transaction flavor, answers one digest challenge, and routes the
//! responses to a per-request delegate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::DigestAuthentication;
use crate::core::UserAgentCore;
use crate::error::{Result, TransportError};
use crate::message::{Method, Request, Response};
use crate::transaction::{
    ClientTransactionUser, InviteClientTransaction, NonInviteClientTransaction,
};

/// Per-request response callbacks, keyed by status class.
pub trait ClientRequestDelegate: Send + Sync {
    fn on_trying(&self, response: &Response) {
        let _ = response;
    }

    fn on_progress(&self, response: &Response) {
        let _ = response;
    }

    fn on_accept(&self, response: &Response) {
        let _ = response;
    }

    fn on_redirect(&self, response: &Response) {
        let _ = response;
    }

    fn on_reject(&self, response: &Response) {
        let _ = response;
    }

    /// Timer B/F expired.
    fn on_timeout(&self) {}

    fn on_transport_error(&self, error: &TransportError) {
        let _ = error;
    }
}

struct UacInner {
    core: UserAgentCore,
    request: Mutex<Request>,
    delegate: Mutex<Option<Arc<dyn ClientRequestDelegate>>>,
    credentials: Mutex<Option<DigestAuthentication>>,
    /// One credential retry per request; set once the first 401/407 is
    /// answered.
    challenged: AtomicBool,
}

/// A user-agent client: one outbound request and its response handling.
#[derive(Clone)]
pub struct UserAgentClient(Arc<UacInner>);

impl UserAgentClient {
    /// Sends `request` (Via already stamped by the core) and returns
    /// the client handle.
    pub(crate) async fn send(
        core: UserAgentCore,
        request: Request,
        delegate: Option<Arc<dyn ClientRequestDelegate>>,
    ) -> Result<UserAgentClient> {
        let credentials = core.digest_credentials();
        let uac = UserAgentClient(Arc::new(UacInner {
            core,
            request: Mutex::new(request),
            delegate: Mutex::new(delegate),
            credentials: Mutex::new(credentials),
            challenged: AtomicBool::new(false),
        }));
        uac.start_transaction().await?;
        Ok(uac)
    }

    /// A copy of the request as last sent (credentials included after a
    /// challenge retry).
    pub fn request(&self) -> Request {
        self.0.request.lock().expect("Lock failed").clone()
    }

    async fn start_transaction(&self) -> Result<()> {
        let request = self.request();
        let transport = self.0.core.transport().clone();
        let layer = self.0.core.transactions().clone();
        let user: Arc<dyn ClientTransactionUser> = Arc::new(self.clone());
        log::debug!("=> request {} {}", request.method, request.uri);
        match request.method {
            Method::Invite => {
                InviteClientTransaction::send(request, transport, layer, user).await?;
            }
            _ => {
                NonInviteClientTransaction::send(request, transport, layer, user).await?;
            }
        }
        Ok(())
    }

    fn delegate(&self) -> Option<Arc<dyn ClientRequestDelegate>> {
        self.0.delegate.lock().expect("Lock failed").clone()
    }

    /// Answers a 401/407 once: fresh branch, bumped CSeq, credentials
    /// header, new transaction.
    fn try_answer_challenge(&self, response: &Response) -> bool {
        if self.0.challenged.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some((credentials_header, challenge)) = response.headers.challenge() else {
            log::warn!("401/407 without a challenge header");
            return false;
        };

        let mut guard = self.0.credentials.lock().expect("Lock failed");
        let Some(auth) = guard.as_mut() else {
            return false;
        };
        if !auth.authenticate(challenge) {
            return false;
        }

        let mut request = self.0.request.lock().expect("Lock failed").clone();
        if let Some(cseq) = request.headers.cseq() {
            request
                .headers
                .set("CSeq", format!("{} {}", cseq.seq + 1, cseq.method));
        }
        let uri = request.uri.to_string();
        let body = request.body.as_ref().map(|body| body.content.clone());
        let value = auth.credentials(request.method, &uri, body.as_deref());
        request.headers.set(credentials_header, value);
        self.0.core.restamp_via(&mut request);
        drop(guard);

        *self.0.request.lock().expect("Lock failed") = request;

        let uac = self.clone();
        tokio::spawn(async move {
            if let Err(error) = uac.start_transaction().await {
                log::warn!("failed to resend request with credentials: {error}");
                if let Some(delegate) = uac.delegate() {
                    delegate.on_transport_error(&TransportError::SendFailed(error.to_string()));
                }
            }
        });
        true
    }
}

impl ClientTransactionUser for UserAgentClient {
    fn receive_response(&self, response: &Response) {
        let code = response.status.as_u16();
        log::debug!("<= response {code} {}", response.reason);

        if matches!(code, 401 | 407) && self.try_answer_challenge(response) {
            return;
        }

        let Some(delegate) = self.delegate() else {
            return;
        };
        match code {
            100 => delegate.on_trying(response),
            101..=199 => delegate.on_progress(response),
            200..=299 => delegate.on_accept(response),
            300..=399 => delegate.on_redirect(response),
            _ => delegate.on_reject(response),
        }
    }

    fn on_timeout(&self) {
        if let Some(delegate) = self.delegate() {
            delegate.on_timeout();
        }
    }

    fn on_transport_error(&self, error: &TransportError) {
        if let Some(delegate) = self.delegate() {
            delegate.on_transport_error(error);
        }
    }
}

/// A delegate that resolves a oneshot with the final response of a
/// request (any class; callers inspect the status), or an error on
/// timeout or a dead transport. Provisional responses pass through
/// silently.
pub(crate) struct ResponseWaiter {
    tx: Mutex<Option<tokio::sync::oneshot::Sender<Result<Response>>>>,
}

impl ResponseWaiter {
    pub(crate) fn new() -> (
        Arc<Self>,
        tokio::sync::oneshot::Receiver<Result<Response>>,
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Arc::new(ResponseWaiter {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn resolve(&self, result: Result<Response>) {
        if let Some(tx) = self.tx.lock().expect("Lock failed").take() {
            let _ = tx.send(result);
        }
    }
}

impl ClientRequestDelegate for ResponseWaiter {
    fn on_accept(&self, response: &Response) {
        self.resolve(Ok(response.clone()));
    }

    fn on_redirect(&self, response: &Response) {
        self.resolve(Ok(response.clone()));
    }

    fn on_reject(&self, response: &Response) {
        self.resolve(Ok(response.clone()));
    }

    fn on_timeout(&self) {
        self.resolve(Err(crate::error::Error::Timeout));
    }

    fn on_transport_error(&self, error: &TransportError) {
        self.resolve(Err(error.clone().into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoreConfig, RequestOptions};
    use crate::test_utils::connected_transport;
    use crate::message::Uri;

    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        accepted: StdMutex<Vec<u16>>,
        rejected: StdMutex<Vec<u16>>,
    }

    impl ClientRequestDelegate for Recorder {
        fn on_accept(&self, response: &Response) {
            self.accepted.lock().unwrap().push(response.status.as_u16());
        }

        fn on_reject(&self, response: &Response) {
            self.rejected.lock().unwrap().push(response.status.as_u16());
        }
    }

    fn config_with_credentials() -> CoreConfig {
        CoreConfig {
            authorization_username: Some("alice".to_string()),
            authorization_password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_401_answered_with_credentials() {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(config_with_credentials(), transport);
        let target: Uri = "sip:registrar.example.com".parse().unwrap();
        let request = core.make_request(Method::Register, target, RequestOptions::default());
        let delegate = Arc::new(Recorder::default());
        core.request(request, Some(delegate.clone())).await.unwrap();

        // Answer the REGISTER with a 401 carrying a digest challenge.
        let first = server.sent_frames()[0].clone();
        let parsed = crate::message::parse_message(&first).unwrap();
        let register = parsed.as_request().unwrap();
        let mut challenge = Response::reply_to(register, 401);
        challenge.headers.push(
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"xyz\", qop=\"auth\"",
        );
        core.receive_message(challenge.encode());
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let frames = server.sent_frames();
        assert_eq!(frames.len(), 2, "expected a credentialed resend");
        let retry = frames[1].clone();
        assert!(retry.contains("Authorization: Digest"));
        assert!(retry.contains("username=\"alice\""));
        // CSeq bumped, fresh branch.
        assert!(retry.contains("CSeq: 2 REGISTER"));
        let retry_parsed = crate::message::parse_message(&retry).unwrap();
        assert_ne!(
            retry_parsed.headers().via_branch(),
            register.headers.via_branch(),
        );
        assert!(delegate.rejected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_401_surfaces_as_reject() {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(config_with_credentials(), transport);
        let target: Uri = "sip:registrar.example.com".parse().unwrap();
        let request = core.make_request(Method::Register, target, RequestOptions::default());
        let delegate = Arc::new(Recorder::default());
        core.request(request, Some(delegate.clone())).await.unwrap();

        for _ in 0..2 {
            let last = server.last_frame().unwrap();
            let parsed = crate::message::parse_message(&last).unwrap();
            let register = parsed.as_request().unwrap();
            let mut challenge = Response::reply_to(register, 401);
            challenge.headers.push(
                "WWW-Authenticate",
                "Digest realm=\"example.com\", nonce=\"xyz\", qop=\"auth\"",
            );
            core.receive_message(challenge.encode());
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }

        assert_eq!(delegate.rejected.lock().unwrap().as_slice(), &[401]);
    }

    #[tokio::test]
    async fn test_2xx_dispatched_to_on_accept() {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(CoreConfig::default(), transport);
        let target: Uri = "sip:bob@example.com".parse().unwrap();
        let request = core.make_request(Method::Message, target, RequestOptions::default());
        let delegate = Arc::new(Recorder::default());
        core.request(request, Some(delegate.clone())).await.unwrap();

        let sent = server.last_frame().unwrap();
        let parsed = crate::message::parse_message(&sent).unwrap();
        let response = Response::reply_to(parsed.as_request().unwrap(), 200);
        core.receive_message(response.encode());
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        assert_eq!(delegate.accepted.lock().unwrap().as_slice(), &[200]);
    }
}
