//! SUBSCRIBE/NOTIFY client (RFC 6665).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::{ReplyOptions, RequestOptions, ResponseWaiter, ServerRequest, UserAgentCore};
use crate::dialog::{Dialog, DialogState, DialogUsage};
use crate::error::{Error, Result, StateTransitionError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::message::{Method, Request, Uri};
use crate::timer::{Timer, TIMER_N};

/// Subscription states per RFC 6665: the machine leaves NotifyWait on
/// the first NOTIFY, whose Subscription-State decides between Pending
/// and Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Initial,
    NotifyWait,
    Pending,
    Active,
    Terminated,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Initial => "Initial",
            SubscriptionState::NotifyWait => "NotifyWait",
            SubscriptionState::Pending => "Pending",
            SubscriptionState::Active => "Active",
            SubscriptionState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

fn legal_transition(from: SubscriptionState, to: SubscriptionState) -> bool {
    use SubscriptionState::*;
    matches!(
        (from, to),
        (Initial, NotifyWait)
            | (Initial, Terminated)
            | (NotifyWait, Pending)
            | (NotifyWait, Active)
            | (NotifyWait, Terminated)
            | (Pending, Active)
            | (Pending, Terminated)
            | (Active, Terminated)
    )
}

/// Notification callbacks.
pub trait SubscriptionDelegate: Send + Sync {
    fn on_notify(&self, request: &Request) {
        let _ = request;
    }
}

pub struct SubscriptionOptions {
    /// The event package subscribed to.
    pub event: String,
    /// Requested subscription lifetime in seconds.
    pub expires: u32,
    /// When to re-SUBSCRIBE, as a percentage of the granted lifetime.
    pub refresh_frequency: u32,
    pub extra_headers: Vec<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            event: "presence".to_string(),
            expires: 3600,
            refresh_frequency: 90,
            extra_headers: Vec::new(),
        }
    }
}

struct SubInner {
    id: String,
    core: UserAgentCore,
    state: Mutex<SubscriptionState>,
    guard: TransitionGuard,
    emitter: StateEmitter<SubscriptionState>,
    target: Uri,
    event: String,
    requested_expires: AtomicU32,
    refresh_frequency: u32,
    extra_headers: Vec<String>,
    dialog: Mutex<Option<Dialog>>,
    delegate: Mutex<Option<Arc<dyn SubscriptionDelegate>>>,
    call_id: String,
    from_tag: String,
    /// The SUBSCRIBE as sent (for building the dialog from the 2xx).
    sent_subscribe: Mutex<Option<Request>>,
    refresh: Mutex<Option<Timer>>,
    expiry: Mutex<Option<Timer>>,
    unsubscribing: AtomicBool,
    disposed: AtomicBool,
}

/// One event subscription and its dialog usage.
#[derive(Clone)]
pub struct Subscription(Arc<SubInner>);

impl Subscription {
    pub fn new(core: UserAgentCore, target: Uri, options: SubscriptionOptions) -> Self {
        let call_id = format!(
            "{}{}",
            core.config().call_id_prefix,
            crate::random_token(15)
        );
        Subscription(Arc::new(SubInner {
            id: format!("subscription-{}", crate::random_token(8)),
            core,
            state: Mutex::new(SubscriptionState::Initial),
            guard: TransitionGuard::new("Subscription"),
            emitter: StateEmitter::new(),
            target,
            event: options.event,
            requested_expires: AtomicU32::new(options.expires),
            refresh_frequency: options.refresh_frequency.clamp(50, 99),
            extra_headers: options.extra_headers,
            dialog: Mutex::new(None),
            delegate: Mutex::new(None),
            call_id,
            from_tag: crate::new_tag(),
            sent_subscribe: Mutex::new(None),
            refresh: Mutex::new(None),
            expiry: Mutex::new(None),
            unsubscribing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn event(&self) -> &str {
        &self.0.event
    }

    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&SubscriptionState) + Send + Sync + 'static,
    {
        self.0.emitter.on(observer);
    }

    pub fn set_delegate(&self, delegate: Arc<dyn SubscriptionDelegate>) {
        *self.0.delegate.lock().expect("Lock failed") = Some(delegate);
    }

    fn transition(&self, to: SubscriptionState) -> Result<()> {
        let token = self.0.guard.enter()?;
        let from = {
            let mut state = self.0.state.lock().expect("Lock failed");
            if *state == to {
                return Ok(());
            }
            if !legal_transition(*state, to) {
                return Err(StateTransitionError::Invalid {
                    object: "Subscription",
                    from: state.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            std::mem::replace(&mut *state, to)
        };
        log::debug!("subscription {} transitioned {from} -> {to}", self.0.event);
        token.release();
        self.0.emitter.emit(&to);
        Ok(())
    }

    /// Sends the initial SUBSCRIBE; the machine waits in NotifyWait for
    /// the first NOTIFY.
    pub async fn subscribe(&self) -> Result<()> {
        if self.0.disposed.load(Ordering::SeqCst) {
            return Err(Error::Validation("subscription is disposed".into()));
        }
        if self.state() != SubscriptionState::Initial {
            return Err(Error::Validation("already subscribed".into()));
        }
        self.transition(SubscriptionState::NotifyWait)?;

        let core = &self.0.core;
        let requested = self.0.requested_expires.load(Ordering::SeqCst);
        let mut extra_headers = vec![
            format!("Event: {}", self.0.event),
            format!("Expires: {requested}"),
            format!("Contact: {}", core.config().contact),
        ];
        extra_headers.extend(self.0.extra_headers.clone());
        let options = RequestOptions {
            from_tag: Some(self.0.from_tag.clone()),
            call_id: Some(self.0.call_id.clone()),
            extra_headers,
            ..Default::default()
        };
        let request = core.make_request(Method::Subscribe, self.0.target.clone(), options);

        let (waiter, done) = ResponseWaiter::new();
        let uac = core.request(request, Some(waiter)).await?;
        *self.0.sent_subscribe.lock().expect("Lock failed") = Some(uac.request());

        let response = match done.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ChannelClosed),
        };
        if !response.status.is_success() {
            self.terminate();
            return Err(Error::RequestFailure {
                code: response.status,
                reason: response.reason,
            });
        }

        // The NOTIFY may have raced us and built the dialog already.
        if self.dialog().is_none() {
            let subscribe = self.0.sent_subscribe.lock().expect("Lock failed").clone();
            if let Some(subscribe) = subscribe {
                if let Some(dialog) = Dialog::new_uac(&subscribe, &response) {
                    self.adopt_dialog(dialog);
                }
            }
        }
        let granted = response
            .headers
            .expires()
            .map(|granted| granted.min(requested))
            .unwrap_or(requested);
        self.schedule_refresh(granted);
        self.restart_expiry(granted);
        Ok(())
    }

    /// Ends the subscription with an Expires: 0 SUBSCRIBE; the
    /// notifier's terminal NOTIFY (or Timer N) finishes the machine.
    pub async fn unsubscribe(&self) -> Result<()> {
        match self.state() {
            SubscriptionState::Pending | SubscriptionState::Active => {}
            SubscriptionState::Terminated => return Ok(()),
            _ => {
                self.terminate();
                return Ok(());
            }
        }
        if self.0.unsubscribing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_timers();
        let dialog = self
            .dialog()
            .ok_or_else(|| Error::Validation("no subscription dialog".into()))?;
        let mut request = dialog.create_request(Method::Subscribe);
        request
            .extra_headers
            .push(format!("Event: {}", self.0.event));
        request.extra_headers.push("Expires: 0".to_string());

        let (waiter, done) = ResponseWaiter::new();
        self.0.core.request(request, Some(waiter)).await?;
        let _ = done.await;

        // Timer N: do not wait forever for the terminal NOTIFY.
        let weak = Arc::downgrade(&self.0);
        *self.0.expiry.lock().expect("Lock failed") = Some(Timer::start(TIMER_N, async move {
            if let Some(inner) = weak.upgrade() {
                Subscription(inner).terminate();
            }
        }));
        Ok(())
    }

    pub async fn dispose(&self) -> Result<()> {
        if self.0.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.state() {
            SubscriptionState::Pending | SubscriptionState::Active => {
                if let Err(error) = self.unsubscribe().await {
                    log::warn!("unsubscribe on dispose failed: {error}");
                    self.terminate();
                }
            }
            _ => self.terminate(),
        }
        Ok(())
    }

    pub fn dialog(&self) -> Option<Dialog> {
        self.0.dialog.lock().expect("Lock failed").clone()
    }

    fn adopt_dialog(&self, dialog: Dialog) {
        dialog.register_usage(self.0.id.clone(), Arc::new(self.clone()));
        self.0.core.add_dialog(dialog.clone());
        *self.0.dialog.lock().expect("Lock failed") = Some(dialog);
    }

    /// Whether an in-dialog NOTIFY that found no dialog belongs to this
    /// subscription (it beat our 2xx).
    pub(crate) fn matches_early_notify(&self, request: &Request) -> bool {
        request.headers.call_id() == Some(self.0.call_id.as_str())
            && request.headers.to_tag().as_deref() == Some(self.0.from_tag.as_str())
    }

    /// Builds the dialog from an early NOTIFY and processes it.
    pub(crate) fn receive_early_notify(&self, request: ServerRequest) {
        if self.dialog().is_none() {
            if let Some(dialog) =
                Dialog::new_uas(request.request(), &self.0.from_tag, DialogState::Confirmed)
            {
                // Our SUBSCRIBE already used CSeq 1.
                dialog.set_local_cseq(1);
                self.adopt_dialog(dialog);
            }
        }
        self.receive_request(request);
    }

    fn handle_notify(&self, request: ServerRequest) {
        let subscription = self.clone();
        tokio::spawn(async move {
            let Some(state) = request.request().headers.subscription_state() else {
                let _ = request.reply(400, ReplyOptions::new()).await;
                return;
            };
            if let Err(error) = request.reply(200, ReplyOptions::new()).await {
                log::info!("failed to answer NOTIFY: {error}");
            }

            if let Some(delegate) = subscription.0.delegate.lock().expect("Lock failed").clone() {
                delegate.on_notify(request.request());
            }

            match state.state.as_str() {
                "active" => {
                    let _ = subscription.transition(SubscriptionState::Active);
                    if let Some(expires) = state.expires {
                        subscription.restart_expiry(expires);
                    }
                }
                "pending" => {
                    let _ = subscription.transition(SubscriptionState::Pending);
                }
                "terminated" => subscription.terminate(),
                other => log::warn!("NOTIFY with unknown Subscription-State '{other}'"),
            }
        });
    }

    /// Re-SUBSCRIBE inside the dialog.
    async fn refresh(&self) -> Result<()> {
        let dialog = self
            .dialog()
            .ok_or_else(|| Error::Validation("no subscription dialog".into()))?;
        let requested = self.0.requested_expires.load(Ordering::SeqCst);
        let mut request = dialog.create_request(Method::Subscribe);
        request
            .extra_headers
            .push(format!("Event: {}", self.0.event));
        request
            .extra_headers
            .push(format!("Expires: {requested}"));

        let (waiter, done) = ResponseWaiter::new();
        self.0.core.request(request, Some(waiter)).await?;
        match done.await {
            Ok(Ok(response)) if response.status.is_success() => {
                let granted = response
                    .headers
                    .expires()
                    .map(|granted| granted.min(requested))
                    .unwrap_or(requested);
                self.schedule_refresh(granted);
                self.restart_expiry(granted);
                Ok(())
            }
            Ok(Ok(response)) => {
                self.terminate();
                Err(Error::RequestFailure {
                    code: response.status,
                    reason: response.reason,
                })
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    fn schedule_refresh(&self, granted: u32) {
        let delay =
            Duration::from_secs(u64::from(granted) * u64::from(self.0.refresh_frequency) / 100);
        let weak: Weak<SubInner> = Arc::downgrade(&self.0);
        let timer = Timer::start(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            let subscription = Subscription(inner);
            if matches!(
                subscription.state(),
                SubscriptionState::Pending | SubscriptionState::Active
            ) {
                if let Err(error) = subscription.refresh().await {
                    log::warn!("subscription refresh failed: {error}");
                }
            }
        });
        *self.0.refresh.lock().expect("Lock failed") = Some(timer);
    }

    fn restart_expiry(&self, expires: u32) {
        let weak: Weak<SubInner> = Arc::downgrade(&self.0);
        let timer = Timer::start(Duration::from_secs(u64::from(expires)), async move {
            if let Some(inner) = weak.upgrade() {
                log::debug!("subscription expired");
                Subscription(inner).terminate();
            }
        });
        *self.0.expiry.lock().expect("Lock failed") = Some(timer);
    }

    fn cancel_timers(&self) {
        self.0.refresh.lock().expect("Lock failed").take();
        self.0.expiry.lock().expect("Lock failed").take();
    }

    fn terminate(&self) {
        self.cancel_timers();
        if self.state() != SubscriptionState::Terminated {
            let _ = self.transition(SubscriptionState::Terminated);
        }
        let dialog = self.0.dialog.lock().expect("Lock failed").take();
        if let Some(dialog) = dialog {
            self.0.core.deregister_usage(dialog.id(), &self.0.id);
        }
    }
}

impl DialogUsage for Subscription {
    fn handles(&self, request: &Request) -> bool {
        match request.method {
            Method::Notify => request
                .headers
                .event()
                .map(|event| event == self.0.event)
                .unwrap_or(true),
            _ => false,
        }
    }

    fn receive_request(&self, request: ServerRequest) {
        match request.method() {
            Method::Notify => self.handle_notify(request),
            _ => request.reply_in_background(405),
        }
    }
}
