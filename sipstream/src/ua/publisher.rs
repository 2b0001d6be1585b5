//! PUBLISH client (RFC 3903): event state publication with ETag
//! tracking and refresh.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::{RequestOptions, ResponseWaiter, UserAgentCore};
use crate::error::{Error, Result, StateTransitionError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::message::{Body, Method, Response, Uri};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Initial,
    Published,
    Unpublished,
    Terminated,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublisherState::Initial => "Initial",
            PublisherState::Published => "Published",
            PublisherState::Unpublished => "Unpublished",
            PublisherState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

pub struct PublisherOptions {
    /// The event package being published (`presence`, `dialog`, ...).
    pub event: String,
    /// Requested publication lifetime in seconds.
    pub expires: u32,
    pub content_type: String,
    /// When to refresh, as a percentage of the granted lifetime.
    pub refresh_frequency: u32,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            event: "presence".to_string(),
            expires: 3600,
            content_type: "application/pidf+xml".to_string(),
            refresh_frequency: 90,
        }
    }
}

struct PubInner {
    id: String,
    core: UserAgentCore,
    state: Mutex<PublisherState>,
    guard: TransitionGuard,
    emitter: StateEmitter<PublisherState>,
    target: Uri,
    event: String,
    content_type: String,
    requested_expires: AtomicU32,
    refresh_frequency: u32,
    etag: Mutex<Option<String>>,
    /// The last published document, resent after a 412.
    last_content: Mutex<Option<String>>,
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    refresh: Mutex<Option<Timer>>,
    disposed: AtomicBool,
}

/// Publishes event state to an event-state compositor.
#[derive(Clone)]
pub struct Publisher(Arc<PubInner>);

impl Publisher {
    pub fn new(core: UserAgentCore, target: Uri, options: PublisherOptions) -> Self {
        let call_id = format!(
            "{}{}",
            core.config().call_id_prefix,
            crate::random_token(15)
        );
        Publisher(Arc::new(PubInner {
            id: format!("publisher-{}", crate::random_token(8)),
            core,
            state: Mutex::new(PublisherState::Initial),
            guard: TransitionGuard::new("Publisher"),
            emitter: StateEmitter::new(),
            target,
            event: options.event,
            content_type: options.content_type,
            requested_expires: AtomicU32::new(options.expires),
            refresh_frequency: options.refresh_frequency.clamp(50, 99),
            etag: Mutex::new(None),
            last_content: Mutex::new(None),
            call_id,
            from_tag: crate::new_tag(),
            cseq: AtomicU32::new(0),
            refresh: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn state(&self) -> PublisherState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn etag(&self) -> Option<String> {
        self.0.etag.lock().expect("Lock failed").clone()
    }

    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&PublisherState) + Send + Sync + 'static,
    {
        self.0.emitter.on(observer);
    }

    fn transition(&self, to: PublisherState) -> Result<()> {
        use PublisherState::*;
        let token = self.0.guard.enter()?;
        let from = {
            let mut state = self.0.state.lock().expect("Lock failed");
            if *state == to {
                return Ok(());
            }
            let legal = matches!(
                (*state, to),
                (Initial, Published)
                    | (Initial, Unpublished)
                    | (Initial, Terminated)
                    | (Published, Unpublished)
                    | (Published, Terminated)
                    | (Unpublished, Published)
                    | (Unpublished, Terminated)
            );
            if !legal {
                return Err(StateTransitionError::Invalid {
                    object: "Publisher",
                    from: state.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            std::mem::replace(&mut *state, to)
        };
        log::debug!("publisher transitioned {from} -> {to}");
        token.release();
        self.0.emitter.emit(&to);
        Ok(())
    }

    async fn send_publish(
        &self,
        expires: u32,
        content: Option<String>,
        with_etag: bool,
    ) -> Result<Response> {
        let mut extra_headers = vec![
            format!("Event: {}", self.0.event),
            format!("Expires: {expires}"),
        ];
        if with_etag {
            if let Some(etag) = self.etag() {
                extra_headers.push(format!("SIP-If-Match: {etag}"));
            }
        }
        let options = RequestOptions {
            from_tag: Some(self.0.from_tag.clone()),
            call_id: Some(self.0.call_id.clone()),
            cseq: Some(self.0.cseq.fetch_add(1, Ordering::SeqCst) + 1),
            extra_headers,
            body: content.map(|content| Body::new(self.0.content_type.clone(), content)),
            ..Default::default()
        };
        let request =
            self.0
                .core
                .make_request(Method::Publish, self.0.target.clone(), options);
        let (waiter, done) = ResponseWaiter::new();
        self.0.core.request(request, Some(waiter)).await?;
        match done.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    fn adopt_success(&self, response: &Response) -> u32 {
        match response.headers.sip_etag() {
            Some(etag) => {
                *self.0.etag.lock().expect("Lock failed") = Some(etag.to_string());
            }
            None => log::warn!("2xx to PUBLISH without SIP-ETag"),
        }
        let requested = self.0.requested_expires.load(Ordering::SeqCst);
        // The compositor may shorten the lifetime, never lengthen it.
        let granted = response
            .headers
            .expires()
            .map(|granted| granted.min(requested))
            .unwrap_or(requested);
        self.schedule_refresh(granted);
        granted
    }

    /// Publishes (or modifies) the event state document.
    pub async fn publish(&self, content: String) -> Result<()> {
        if self.0.disposed.load(Ordering::SeqCst) {
            return Err(Error::Validation("publisher is disposed".into()));
        }
        *self.0.last_content.lock().expect("Lock failed") = Some(content.clone());
        let mut attempted_412 = false;
        let mut attempted_423 = false;
        loop {
            let requested = self.0.requested_expires.load(Ordering::SeqCst);
            let response = self
                .send_publish(requested, Some(content.clone()), true)
                .await?;
            match response.status.as_u16() {
                200..=299 => {
                    self.adopt_success(&response);
                    self.transition(PublisherState::Published)?;
                    return Ok(());
                }
                412 if !attempted_412 => {
                    // Our ETag is gone; start over as an initial publish.
                    log::debug!("conditional request failed; dropping etag");
                    self.0.etag.lock().expect("Lock failed").take();
                    attempted_412 = true;
                }
                423 if !attempted_423 => {
                    let Some(min_expires) = response.headers.min_expires() else {
                        return self.fail(response);
                    };
                    self.0
                        .requested_expires
                        .store(min_expires.max(requested), Ordering::SeqCst);
                    attempted_423 = true;
                }
                _ => return self.fail(response),
            }
        }
    }

    /// Removes the publication (Expires: 0, SIP-If-Match, no body).
    pub async fn unpublish(&self) -> Result<()> {
        self.cancel_refresh();
        if self.etag().is_none() && self.state() != PublisherState::Published {
            self.transition(PublisherState::Unpublished)?;
            return Ok(());
        }
        let response = self.send_publish(0, None, true).await?;
        match response.status.as_u16() {
            200..=299 => {
                self.0.etag.lock().expect("Lock failed").take();
                self.transition(PublisherState::Unpublished)?;
                Ok(())
            }
            412 => {
                // Nothing left to remove; the publication is already
                // dead, so the publisher is too.
                self.0.etag.lock().expect("Lock failed").take();
                let _ = self.transition(PublisherState::Unpublished);
                let _ = self.transition(PublisherState::Terminated);
                Ok(())
            }
            _ => self.fail(response),
        }
    }

    pub async fn dispose(&self) -> Result<()> {
        if self.0.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_refresh();
        if self.state() == PublisherState::Published {
            if let Err(error) = self.unpublish().await {
                log::warn!("unpublish on dispose failed: {error}");
            }
        }
        let _ = self.transition(PublisherState::Terminated);
        Ok(())
    }

    fn fail(&self, response: Response) -> Result<()> {
        let _ = self.transition(PublisherState::Unpublished);
        let _ = self.transition(PublisherState::Terminated);
        Err(Error::RequestFailure {
            code: response.status,
            reason: response.reason,
        })
    }

    // The refresh is a conditional PUBLISH carrying no body; on a 412
    // the stored document is republished from scratch.
    fn schedule_refresh(&self, granted: u32) {
        let delay =
            Duration::from_secs(u64::from(granted) * u64::from(self.0.refresh_frequency) / 100);
        let weak: Weak<PubInner> = Arc::downgrade(&self.0);
        let timer = Timer::start(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            let publisher = Publisher(inner);
            if publisher.state() != PublisherState::Published {
                return;
            }
            if let Err(error) = publisher.refresh().await {
                log::warn!("publication refresh failed: {error}");
            }
        });
        *self.0.refresh.lock().expect("Lock failed") = Some(timer);
    }

    async fn refresh(&self) -> Result<()> {
        let requested = self.0.requested_expires.load(Ordering::SeqCst);
        let response = self.send_publish(requested, None, true).await?;
        match response.status.as_u16() {
            200..=299 => {
                self.adopt_success(&response);
                Ok(())
            }
            412 => {
                // Republish the whole document.
                self.0.etag.lock().expect("Lock failed").take();
                let content = self.0.last_content.lock().expect("Lock failed").clone();
                match content {
                    Some(content) => self.publish(content).await,
                    None => self.fail(response),
                }
            }
            _ => self.fail(response),
        }
    }

    fn cancel_refresh(&self) {
        self.0.refresh.lock().expect("Lock failed").take();
    }
}
