//! REGISTER client (RFC 3261 section 10).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::{RequestOptions, ResponseWaiter, UserAgentCore};
use crate::error::{Error, Result, StateTransitionError};
use crate::fsm::{StateEmitter, TransitionGuard};
use crate::message::{Method, Request, Response, Uri};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistererState {
    Initial,
    Registered,
    Unregistered,
    Terminated,
}

impl fmt::Display for RegistererState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistererState::Initial => "Initial",
            RegistererState::Registered => "Registered",
            RegistererState::Unregistered => "Unregistered",
            RegistererState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

pub struct RegistererOptions {
    /// The registrar to bind at; defaults to the AOR's host.
    pub registrar: Option<Uri>,
    /// Requested binding lifetime in seconds.
    pub expires: u32,
    /// When to refresh, as a percentage of the granted lifetime.
    pub refresh_frequency: u32,
    pub extra_headers: Vec<String>,
    /// Send an Expires: 0 REGISTER before terminating when still
    /// registered at dispose time.
    pub unregister_on_dispose: bool,
}

impl Default for RegistererOptions {
    fn default() -> Self {
        RegistererOptions {
            registrar: None,
            expires: 600,
            refresh_frequency: 90,
            extra_headers: Vec::new(),
            unregister_on_dispose: true,
        }
    }
}

struct RegInner {
    id: String,
    core: UserAgentCore,
    state: Mutex<RegistererState>,
    guard: TransitionGuard,
    emitter: StateEmitter<RegistererState>,
    registrar: Uri,
    requested_expires: AtomicU32,
    refresh_frequency: u32,
    extra_headers: Vec<String>,
    /// Stable across refreshes; registrars correlate bindings on it.
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    refresh: Mutex<Option<Timer>>,
    disposed: AtomicBool,
    unregister_on_dispose: bool,
}

/// Maintains one REGISTER binding: initial registration, refreshes at
/// a fraction of the granted lifetime, 423 recovery and removal.
#[derive(Clone)]
pub struct Registerer(Arc<RegInner>);

impl Registerer {
    pub fn new(core: UserAgentCore, options: RegistererOptions) -> Self {
        let config = core.config();
        let registrar = options.registrar.unwrap_or_else(|| {
            Uri::new(config.aor.scheme(), config.aor.host())
        });
        let call_id = format!("{}{}", config.call_id_prefix, crate::random_token(15));
        let refresh_frequency = options.refresh_frequency.clamp(50, 99);
        Registerer(Arc::new(RegInner {
            id: format!("registerer-{}", crate::random_token(8)),
            core,
            state: Mutex::new(RegistererState::Initial),
            guard: TransitionGuard::new("Registerer"),
            emitter: StateEmitter::new(),
            registrar,
            requested_expires: AtomicU32::new(options.expires),
            refresh_frequency,
            extra_headers: options.extra_headers,
            call_id,
            from_tag: crate::new_tag(),
            cseq: AtomicU32::new(0),
            refresh: Mutex::new(None),
            disposed: AtomicBool::new(false),
            unregister_on_dispose: options.unregister_on_dispose,
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn state(&self) -> RegistererState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&RegistererState) + Send + Sync + 'static,
    {
        self.0.emitter.on(observer);
    }

    fn transition(&self, to: RegistererState) -> Result<()> {
        use RegistererState::*;
        let token = self.0.guard.enter()?;
        let from = {
            let mut state = self.0.state.lock().expect("Lock failed");
            if *state == to {
                return Ok(());
            }
            let legal = matches!(
                (*state, to),
                (Initial, Registered)
                    | (Initial, Unregistered)
                    | (Initial, Terminated)
                    | (Registered, Unregistered)
                    | (Registered, Terminated)
                    | (Unregistered, Registered)
                    | (Unregistered, Terminated)
            );
            if !legal {
                return Err(StateTransitionError::Invalid {
                    object: "Registerer",
                    from: state.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            std::mem::replace(&mut *state, to)
        };
        log::debug!("registerer transitioned {from} -> {to}");
        token.release();
        self.0.emitter.emit(&to);
        Ok(())
    }

    fn build_register(&self, expires: u32) -> Request {
        let core = &self.0.core;
        let config = core.config();
        let options = RequestOptions {
            to_uri: Some(config.aor.clone()),
            from_uri: Some(config.aor.clone()),
            from_tag: Some(self.0.from_tag.clone()),
            call_id: Some(self.0.call_id.clone()),
            cseq: Some(self.0.cseq.fetch_add(1, Ordering::SeqCst) + 1),
            extra_headers: {
                let mut headers = vec![
                    format!("Contact: {}", config.contact),
                    format!("Expires: {expires}"),
                ];
                headers.extend(self.0.extra_headers.clone());
                headers
            },
            ..Default::default()
        };
        core.make_request(Method::Register, self.0.registrar.clone(), options)
    }

    async fn send_register(&self, expires: u32) -> Result<Response> {
        let request = self.build_register(expires);
        let (waiter, done) = ResponseWaiter::new();
        self.0.core.request(request, Some(waiter)).await?;
        match done.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Registers the binding. Resolves with the granted lifetime in
    /// seconds; a refresh is scheduled at the configured fraction of it.
    pub async fn register(&self) -> Result<u32> {
        if self.0.disposed.load(Ordering::SeqCst) {
            return Err(Error::Validation("registerer is disposed".into()));
        }
        let mut attempted_423 = false;
        loop {
            let requested = self.0.requested_expires.load(Ordering::SeqCst);
            let response = self.send_register(requested).await?;
            let code = response.status.as_u16();
            match code {
                200..=299 => {
                    // The server may grant less than we asked for.
                    let granted = response.headers.expires().unwrap_or(requested);
                    self.schedule_refresh(granted);
                    self.transition(RegistererState::Registered)?;
                    return Ok(granted);
                }
                423 if !attempted_423 => {
                    let Some(min_expires) = response.headers.min_expires() else {
                        let _ = self.transition(RegistererState::Unregistered);
                        return Err(Error::RequestFailure {
                            code: response.status,
                            reason: response.reason,
                        });
                    };
                    log::debug!("interval too brief; retrying with Expires: {min_expires}");
                    self.0
                        .requested_expires
                        .store(min_expires.max(requested), Ordering::SeqCst);
                    attempted_423 = true;
                }
                _ => {
                    let _ = self.transition(RegistererState::Unregistered);
                    return Err(Error::RequestFailure {
                        code: response.status,
                        reason: response.reason,
                    });
                }
            }
        }
    }

    /// Removes the binding with an Expires: 0 REGISTER. Resolves
    /// without emitting a request when not registered.
    pub async fn unregister(&self) -> Result<()> {
        self.cancel_refresh();
        if self.state() != RegistererState::Registered {
            return Ok(());
        }
        let response = self.send_register(0).await?;
        if response.status.is_success() {
            self.transition(RegistererState::Unregistered)?;
            Ok(())
        } else {
            Err(Error::RequestFailure {
                code: response.status,
                reason: response.reason,
            })
        }
    }

    /// Tears the registerer down, un-registering first when configured.
    pub async fn dispose(&self) -> Result<()> {
        if self.0.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_refresh();
        if self.state() == RegistererState::Registered && self.0.unregister_on_dispose {
            if let Err(error) = self.unregister().await {
                log::warn!("unregister on dispose failed: {error}");
            }
        }
        let _ = self.transition(RegistererState::Terminated);
        Ok(())
    }

    fn schedule_refresh(&self, granted: u32) {
        let delay =
            Duration::from_secs(u64::from(granted) * u64::from(self.0.refresh_frequency) / 100);
        let weak: Weak<RegInner> = Arc::downgrade(&self.0);
        let timer = Timer::start(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            let registerer = Registerer(inner);
            if registerer.state() == RegistererState::Registered {
                if let Err(error) = registerer.register().await {
                    log::warn!("registration refresh failed: {error}");
                }
            }
        });
        *self.0.refresh.lock().expect("Lock failed") = Some(timer);
    }

    fn cancel_refresh(&self) {
        self.0.refresh.lock().expect("Lock failed").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreConfig;
    use crate::message::parse_message;
    use crate::test_utils::connected_transport;

    async fn registerer() -> (Registerer, UserAgentCore, crate::test_utils::MockServer) {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(
            CoreConfig {
                aor: "sip:alice@example.com".parse().unwrap(),
                ..Default::default()
            },
            transport,
        );
        let registerer = Registerer::new(core.clone(), RegistererOptions::default());
        (registerer, core, server)
    }

    async fn answer_register(
        core: &UserAgentCore,
        server: &crate::test_utils::MockServer,
        build: impl FnOnce(&Request) -> Response,
    ) {
        let frame = server.last_frame().unwrap();
        let parsed = parse_message(&frame).unwrap();
        let request = parsed.as_request().unwrap();
        core.receive_message(build(request).encode());
    }

    #[tokio::test]
    async fn test_register_success_schedules_refresh() {
        let (registerer, core, server) = registerer().await;

        let handle = {
            let registerer = registerer.clone();
            tokio::spawn(async move { registerer.register().await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        // Sanity of the emitted REGISTER.
        let frame = server.last_frame().unwrap();
        assert!(frame.starts_with("REGISTER sip:example.com SIP/2.0"));
        assert!(frame.contains("Expires: 600"));
        assert!(frame.contains("Contact: "));

        answer_register(&core, &server, |request| {
            let mut response = Response::reply_to(request, 200);
            response.headers.push("Expires", "3600");
            response
        })
        .await;

        let granted = handle.await.unwrap().unwrap();
        assert_eq!(granted, 3600);
        assert_eq!(registerer.state(), RegistererState::Registered);
    }

    #[tokio::test]
    async fn test_423_recovery() {
        let (registerer, core, server) = registerer().await;

        let handle = {
            let registerer = registerer.clone();
            tokio::spawn(async move { registerer.register().await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        answer_register(&core, &server, |request| {
            let mut response = Response::reply_to(request, 423);
            response.headers.push("Min-Expires", "1800");
            response
        })
        .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        // The resend adopts the minimum.
        let frame = server.last_frame().unwrap();
        assert!(frame.contains("Expires: 1800"));
        assert!(frame.contains("CSeq: 2 REGISTER"));

        answer_register(&core, &server, |request| {
            let mut response = Response::reply_to(request, 200);
            response.headers.push("Expires", "1800");
            response
        })
        .await;

        assert_eq!(handle.await.unwrap().unwrap(), 1800);
        assert_eq!(registerer.state(), RegistererState::Registered);
    }

    #[tokio::test]
    async fn test_call_id_stable_across_refreshes() {
        let (registerer, core, server) = registerer().await;

        for _ in 0..2 {
            let handle = {
                let registerer = registerer.clone();
                tokio::spawn(async move { registerer.register().await })
            };
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            answer_register(&core, &server, |request| {
                let mut response = Response::reply_to(request, 200);
                response.headers.push("Expires", "600");
                response
            })
            .await;
            handle.await.unwrap().unwrap();
        }

        let frames = server.sent_frames();
        let call_ids: Vec<String> = frames
            .iter()
            .filter(|frame| frame.starts_with("REGISTER"))
            .map(|frame| {
                parse_message(frame)
                    .unwrap()
                    .headers()
                    .call_id()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(call_ids.len(), 2);
        assert_eq!(call_ids[0], call_ids[1]);
    }

    #[tokio::test]
    async fn test_unregister_when_not_registered_sends_nothing() {
        let (registerer, _core, server) = registerer().await;

        registerer.unregister().await.unwrap();

        assert!(server.sent_frames().is_empty());
        assert_eq!(registerer.state(), RegistererState::Initial);
    }

    #[tokio::test]
    async fn test_unregister_sends_expires_zero() {
        let (registerer, core, server) = registerer().await;

        let handle = {
            let registerer = registerer.clone();
            tokio::spawn(async move { registerer.register().await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        answer_register(&core, &server, |request| {
            let mut response = Response::reply_to(request, 200);
            response.headers.push("Expires", "600");
            response
        })
        .await;
        handle.await.unwrap().unwrap();

        let handle = {
            let registerer = registerer.clone();
            tokio::spawn(async move { registerer.unregister().await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let frame = server.last_frame().unwrap();
        assert!(frame.contains("Expires: 0"));

        answer_register(&core, &server, |request| Response::reply_to(request, 200)).await;
        handle.await.unwrap().unwrap();
        assert_eq!(registerer.state(), RegistererState::Unregistered);
    }

    #[tokio::test]
    async fn test_double_dispose_is_noop() {
        let (registerer, _core, server) = registerer().await;

        registerer.dispose().await.unwrap();
        registerer.dispose().await.unwrap();

        assert_eq!(registerer.state(), RegistererState::Terminated);
        assert!(server.sent_frames().is_empty());
    }
}
