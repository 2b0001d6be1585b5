use std::cmp;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::error::{Error, Result};
use crate::message::{Method, Request, Response};
use crate::timer::{timer_i, T1, T2, TIMER_H, TIMER_L, TRYING_DELAY};
use crate::transaction::{
    Role, ServerTransaction, ServerTransactionUser, Transaction, TransactionKey, TransactionLayer,
    TransactionState,
};
use crate::transport::Transport;

/// INVITE server transaction (RFC 3261 section 17.2.1, with the
/// Accepted state of RFC 6026).
///
/// A 100 Trying goes out automatically when the TU has not responded
/// within 200 ms. Retransmission of a 2xx is the TU's duty (Timer L
/// merely bounds how long the machine stays around for it); non-2xx
/// final responses are retransmitted here per Timer G until acknowledged.
#[derive(Clone)]
pub struct InviteServerTransaction {
    tsx: Transaction,
    request: Arc<Request>,
}

impl InviteServerTransaction {
    pub fn new(
        request: &Request,
        transport: Transport,
        layer: TransactionLayer,
        user: Arc<dyn ServerTransactionUser>,
    ) -> Result<Self> {
        assert!(
            matches!(request.method, Method::Invite),
            "expected INVITE, got {}",
            request.method
        );
        let key = TransactionKey::for_request(request)
            .ok_or_else(|| Error::Validation("INVITE without RFC 3261 Via branch".into()))?;
        let tsx = Transaction::new(
            "InviteServerTransaction",
            key,
            Role::Uas,
            TransactionState::Proceeding,
            transport,
            layer.clone(),
        );
        tsx.set_server_user(user);

        let ist = InviteServerTransaction {
            tsx,
            request: Arc::new(request.clone()),
        };
        layer.register_server(ServerTransaction::Invite(ist.clone()));
        ist.schedule_auto_trying();
        Ok(ist)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    fn schedule_auto_trying(&self) {
        let ist = self.clone();
        tokio::spawn(async move {
            time::sleep(TRYING_DELAY).await;
            if ist.state() == TransactionState::Proceeding && !ist.has_sent_response() {
                let trying = Response::reply_to(&ist.request, 100);
                if let Err(error) = ist.respond(trying).await {
                    log::info!("failed to send automatic 100 Trying: {error}");
                }
            }
        });
    }

    /// Sends a response from the TU through the machine. Only legal
    /// while Proceeding; whatever came after a final response is the
    /// retransmission machinery's business, not a new send.
    pub async fn respond(&self, response: Response) -> Result<()> {
        if self.state() != TransactionState::Proceeding {
            return Err(Error::Validation(format!(
                "INVITE transaction already answered (state {})",
                self.state()
            )));
        }
        let code = response.status;
        let wire = response.encode();
        log::debug!("=> response {code} {}", response.reason);

        if let Err(error) = self.send_wire(&wire).await {
            // RFC 6026 section 7.1: transport errors do not destroy the
            // INVITE server transaction; its timers clean up.
            self.notify_transport_error(&error);
            return Err(error);
        }
        self.remember_response(wire);

        if code.is_provisional() {
            // Stay in Proceeding.
        } else if code.is_success() {
            self.set_state(TransactionState::Accepted);
            self.schedule_termination(TIMER_L, TransactionState::Accepted);
        } else {
            self.set_state(TransactionState::Completed);
            tokio::spawn(self.clone().completed_retransmission_loop());
        }
        Ok(())
    }

    /// Resends the last response. Used by the TU to retransmit an
    /// unacknowledged 2xx.
    pub async fn retransmit_response(&self) -> Result<()> {
        self.retransmit_last_response().await.map(|_| ())
    }

    /// Handles a retransmitted INVITE or an ACK matched to this machine.
    pub async fn receive_request(&self, request: &Request) {
        match request.method {
            Method::Invite => {
                if matches!(
                    self.state(),
                    TransactionState::Proceeding | TransactionState::Completed
                ) {
                    if let Err(error) = self.retransmit_last_response().await {
                        log::info!("failed to retransmit response: {error}");
                    }
                }
            }
            Method::Ack => match self.state() {
                TransactionState::Completed => {
                    self.set_state(TransactionState::Confirmed);
                    self.schedule_termination(timer_i(self.reliable()), TransactionState::Confirmed);
                }
                TransactionState::Accepted => {
                    // 2xx ACKs belong to the TU.
                    if let Some(user) = self.server_user() {
                        user.receive_ack(request);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    // Timer G doubles up to T2 while Completed (unreliable only);
    // Timer H gives up on ever seeing the ACK.
    async fn completed_retransmission_loop(self) {
        pin! {
            let timer_h = time::sleep(TIMER_H);
            let timer_g = if !self.reliable() {
                Either::Left(time::sleep(T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }
        let mut fired = 0u32;

        loop {
            tokio::select! {
                _ = &mut timer_g, if self.state() == TransactionState::Completed => {
                    if let Err(error) = self.retransmit_last_response().await {
                        log::info!("failed to retransmit response: {error}");
                    }
                    fired += 1;
                    let next = cmp::min(T1 * (1 << fired), T2);
                    timer_g.set(Either::Left(time::sleep(next)));
                }
                _ = &mut timer_h => {
                    if self.state() == TransactionState::Completed {
                        if let Some(user) = self.server_user() {
                            user.on_timeout();
                        }
                        self.on_terminated();
                    }
                    break;
                }
            }
        }
    }
}

impl Deref for InviteServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}
