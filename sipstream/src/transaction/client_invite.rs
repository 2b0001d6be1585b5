use std::cmp;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::error::{Error, Result};
use crate::message::{Method, Request, Response};
use crate::timer::{timer_d, T1, T2, TIMER_B, TIMER_M};
use crate::transaction::{
    ClientTransaction, ClientTransactionUser, Role, Transaction, TransactionKey, TransactionLayer,
    TransactionState,
};
use crate::transport::Transport;

/// INVITE client transaction (RFC 3261 section 17.1.1, with the
/// Accepted state of RFC 6026).
///
/// The ACK for a 2xx belongs to the TU; this machine only generates the
/// ACK that absorbs non-2xx final responses.
#[derive(Clone)]
pub struct InviteClientTransaction {
    tsx: Transaction,
    request: Arc<Request>,
}

impl InviteClientTransaction {
    /// Sends the INVITE and registers the new transaction. The machine
    /// starts in Calling; Timer A drives request retransmissions over
    /// unreliable transports and Timer B bounds the wait for a response.
    pub async fn send(
        request: Request,
        transport: Transport,
        layer: TransactionLayer,
        user: Arc<dyn ClientTransactionUser>,
    ) -> Result<InviteClientTransaction> {
        assert!(
            matches!(request.method, Method::Invite),
            "expected INVITE, got {}",
            request.method
        );
        let key = TransactionKey::for_outgoing(&request)
            .ok_or_else(|| Error::Validation("INVITE without Via branch".into()))?;
        let tsx = Transaction::new(
            "InviteClientTransaction",
            key,
            Role::Uac,
            TransactionState::Calling,
            transport,
            layer.clone(),
        );
        tsx.set_client_user(user);

        let wire = request.encode();
        let ict = InviteClientTransaction {
            tsx,
            request: Arc::new(request),
        };
        layer.register_client(ClientTransaction::Invite(ict.clone()));

        if let Err(error) = ict.send_wire(&wire).await {
            ict.notify_transport_error(&error);
            ict.on_terminated();
            return Err(error);
        }
        ict.remember_request(wire);

        tokio::spawn(ict.clone().retransmission_loop());
        Ok(ict)
    }

    /// The original INVITE.
    pub fn request(&self) -> &Request {
        &self.request
    }

    async fn retransmission_loop(self) {
        pin! {
            let timer_b = time::sleep(TIMER_B);
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        loop {
            tokio::select! {
                _ = &mut timer_a, if self.state() == TransactionState::Calling => {
                    match self.retransmit_request().await {
                        Ok(count) => {
                            let next = cmp::min(T1 * (1 << count), T2);
                            timer_a.set(Either::Left(time::sleep(next)));
                        }
                        Err(error) => {
                            log::info!("failed to retransmit INVITE: {error}");
                        }
                    }
                }
                _ = &mut timer_b => {
                    if self.state() == TransactionState::Calling {
                        if let Some(user) = self.client_user() {
                            user.on_timeout();
                        }
                        self.on_terminated();
                    }
                    break;
                }
            }
        }
    }

    /// Advances the machine for a matched response.
    pub async fn receive_response(&self, response: &Response) {
        let code = response.status;
        match self.state() {
            TransactionState::Calling if code.is_provisional() => {
                self.set_state(TransactionState::Proceeding);
                self.deliver_response(response);
            }
            TransactionState::Proceeding if code.is_provisional() => {
                self.deliver_response(response);
            }
            TransactionState::Calling | TransactionState::Proceeding if code.is_success() => {
                // RFC 6026: 2xx enters Accepted; the TU emits the ACK and
                // sees every 2xx retransmission.
                self.set_state(TransactionState::Accepted);
                self.deliver_response(response);
                self.schedule_termination(TIMER_M, TransactionState::Accepted);
            }
            TransactionState::Accepted if code.is_success() => {
                self.deliver_response(response);
            }
            TransactionState::Calling | TransactionState::Proceeding if code.is_final() => {
                self.set_state(TransactionState::Completed);
                let wire = self.create_ack(response).encode();
                if let Err(error) = self.send_wire(&wire).await {
                    log::info!("failed to send ACK: {error}");
                }
                self.remember_request(wire);
                self.deliver_response(response);
                self.schedule_termination(timer_d(self.reliable()), TransactionState::Completed);
            }
            TransactionState::Completed => {
                // 17.1.1.2: a retransmitted final response re-triggers the
                // ACK but is not passed up to the TU.
                if let Err(error) = self.retransmit_request().await {
                    log::info!("failed to retransmit ACK: {error}");
                }
            }
            _ => {}
        }
    }

    // 17.1.1.3: the ACK reuses the Request-URI, Call-ID, From, top Via
    // and CSeq number of the INVITE; the To comes from the response being
    // acknowledged; Route headers carry over.
    fn create_ack(&self, response: &Response) -> Request {
        let mut ack = Request::new(Method::Ack, self.request.uri.clone());
        if let Some(via) = self.request.headers.get("Via") {
            ack.headers.push("Via", via);
        }
        for route in self.request.headers.get_all("Route") {
            ack.headers.push("Route", route);
        }
        if let Some(from) = self.request.headers.get("From") {
            ack.headers.push("From", from);
        }
        if let Some(to) = response.headers.get("To") {
            ack.headers.push("To", to);
        }
        if let Some(call_id) = self.request.headers.get("Call-ID") {
            ack.headers.push("Call-ID", call_id);
        }
        let seq = self.request.headers.cseq().map(|cseq| cseq.seq).unwrap_or(1);
        ack.headers.push("CSeq", format!("{seq} {}", Method::Ack));
        ack.headers.push("Max-Forwards", "70");
        ack
    }
}

impl Deref for InviteClientTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        connected_transport, incoming_response, outgoing_request, RecordingUser,
    };
    use tokio::time::Duration;

    async fn sent_ict() -> (InviteClientTransaction, crate::test_utils::MockServer, Arc<RecordingUser>)
    {
        let (transport, server) = connected_transport().await;
        let layer = TransactionLayer::new();
        let user = Arc::new(RecordingUser::default());
        let ict = InviteClientTransaction::send(
            outgoing_request(Method::Invite),
            transport,
            layer,
            user.clone(),
        )
        .await
        .unwrap();
        (ict, server, user)
    }

    #[tokio::test]
    async fn test_starts_in_calling() {
        let (ict, server, _) = sent_ict().await;

        assert_eq!(ict.state(), TransactionState::Calling);
        assert_eq!(server.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_provisional_enters_proceeding() {
        let (ict, _, user) = sent_ict().await;

        ict.receive_response(&incoming_response(180, Method::Invite))
            .await;

        assert_eq!(ict.state(), TransactionState::Proceeding);
        assert_eq!(user.responses(), vec![180]);
    }

    #[tokio::test]
    async fn test_2xx_enters_accepted_and_is_delivered() {
        let (ict, server, user) = sent_ict().await;

        ict.receive_response(&incoming_response(200, Method::Invite))
            .await;

        assert_eq!(ict.state(), TransactionState::Accepted);
        assert_eq!(user.responses(), vec![200]);
        // No ACK from the transaction for a 2xx.
        assert_eq!(server.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_2xx_retransmission_delivered_again() {
        let (ict, _, user) = sent_ict().await;

        ict.receive_response(&incoming_response(200, Method::Invite))
            .await;
        ict.receive_response(&incoming_response(200, Method::Invite))
            .await;

        assert_eq!(user.responses(), vec![200, 200]);
    }

    #[tokio::test]
    async fn test_rejection_acked_and_terminated_over_reliable() {
        let (ict, server, user) = sent_ict().await;

        ict.receive_response(&incoming_response(486, Method::Invite))
            .await;

        assert_eq!(user.responses(), vec![486]);
        let frames = server.sent_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].starts_with("ACK sip:"));

        // Timer D is zero on reliable transports.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ict.state(), TransactionState::Terminated);
    }

    #[tokio::test]
    async fn test_final_retransmission_reacks_without_delivery() {
        let (ict, server, user) = sent_ict().await;
        server.set_unreliable();

        ict.receive_response(&incoming_response(486, Method::Invite))
            .await;
        ict.receive_response(&incoming_response(486, Method::Invite))
            .await;

        assert_eq!(user.responses(), vec![486]);
        assert_eq!(server.sent_frames().len(), 3);
        assert_eq!(ict.state(), TransactionState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a_doubles_until_t2() {
        let (transport, server) = connected_transport().await;
        server.set_unreliable();
        let user = Arc::new(RecordingUser::default());
        let ict = InviteClientTransaction::send(
            outgoing_request(Method::Invite),
            transport,
            TransactionLayer::new(),
            user,
        )
        .await
        .unwrap();

        time::sleep(Duration::from_millis(501)).await;
        assert_eq!(ict.retransmit_count(), 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert_eq!(ict.retransmit_count(), 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert_eq!(ict.retransmit_count(), 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert_eq!(ict.retransmit_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b_times_out() {
        let (ict, _, user) = sent_ict().await;

        time::sleep(TIMER_B + Duration::from_millis(1)).await;

        assert!(user.timed_out());
        assert_eq!(ict.state(), TransactionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_m_terminates_accepted() {
        let (ict, _, _) = sent_ict().await;

        ict.receive_response(&incoming_response(200, Method::Invite))
            .await;
        time::sleep(TIMER_M + Duration::from_millis(1)).await;

        assert_eq!(ict.state(), TransactionState::Terminated);
    }

    #[tokio::test]
    async fn test_no_events_after_terminal_state() {
        let (ict, _, user) = sent_ict().await;

        ict.on_terminated();
        ict.receive_response(&incoming_response(180, Method::Invite))
            .await;

        assert!(user.responses().is_empty());
    }
}
