use std::cmp;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::error::{Error, Result};
use crate::message::{Method, Request, Response};
use crate::timer::{timer_k, T1, T2, TIMER_F};
use crate::transaction::{
    ClientTransaction, ClientTransactionUser, Role, Transaction, TransactionKey, TransactionLayer,
    TransactionState,
};
use crate::transport::Transport;

/// Non-INVITE client transaction (RFC 3261 section 17.1.2).
#[derive(Clone)]
pub struct NonInviteClientTransaction {
    tsx: Transaction,
}

impl NonInviteClientTransaction {
    /// Sends the request and registers the new transaction. Timer E
    /// drives retransmissions over unreliable transports, Timer F bounds
    /// the wait for a final response.
    pub async fn send(
        request: Request,
        transport: Transport,
        layer: TransactionLayer,
        user: Arc<dyn ClientTransactionUser>,
    ) -> Result<NonInviteClientTransaction> {
        assert!(
            !matches!(request.method, Method::Invite | Method::Ack),
            "invalid method for a non-INVITE client transaction: {}",
            request.method
        );
        let key = TransactionKey::for_outgoing(&request)
            .ok_or_else(|| Error::Validation("request without Via branch".into()))?;
        let tsx = Transaction::new(
            "NonInviteClientTransaction",
            key,
            Role::Uac,
            TransactionState::Trying,
            transport,
            layer.clone(),
        );
        tsx.set_client_user(user);

        let wire = request.encode();
        let nict = NonInviteClientTransaction { tsx };
        layer.register_client(ClientTransaction::NonInvite(nict.clone()));

        if let Err(error) = nict.send_wire(&wire).await {
            nict.notify_transport_error(&error);
            nict.on_terminated();
            return Err(error);
        }
        nict.remember_request(wire);

        tokio::spawn(nict.clone().retransmission_loop());
        Ok(nict)
    }

    fn awaiting_final(&self) -> bool {
        matches!(
            self.state(),
            TransactionState::Trying | TransactionState::Proceeding
        )
    }

    async fn retransmission_loop(self) {
        pin! {
            let timer_f = time::sleep(TIMER_F);
            let timer_e = if !self.reliable() {
                Either::Left(time::sleep(T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        loop {
            tokio::select! {
                _ = &mut timer_e, if self.awaiting_final() => {
                    match self.retransmit_request().await {
                        Ok(count) => {
                            let next = cmp::min(T1 * (1 << count), T2);
                            timer_e.set(Either::Left(time::sleep(next)));
                        }
                        Err(error) => {
                            log::info!("failed to retransmit request: {error}");
                        }
                    }
                }
                _ = &mut timer_f => {
                    if self.awaiting_final() {
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
            TransactionState::Trying if code.is_provisional() => {
                self.set_state(TransactionState::Proceeding);
                self.deliver_response(response);
            }
            TransactionState::Proceeding if code.is_provisional() => {
                self.deliver_response(response);
            }
            TransactionState::Trying | TransactionState::Proceeding => {
                self.set_state(TransactionState::Completed);
                self.deliver_response(response);
                // Timer K absorbs response retransmissions, then done.
                self.schedule_termination(timer_k(self.reliable()), TransactionState::Completed);
            }
            _ => {
                // Completed: response retransmissions are absorbed.
            }
        }
    }
}

impl Deref for NonInviteClientTransaction {
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

    async fn sent_nict() -> (
        NonInviteClientTransaction,
        crate::test_utils::MockServer,
        Arc<RecordingUser>,
    ) {
        let (transport, server) = connected_transport().await;
        let user = Arc::new(RecordingUser::default());
        let nict = NonInviteClientTransaction::send(
            outgoing_request(Method::Register),
            transport,
            TransactionLayer::new(),
            user.clone(),
        )
        .await
        .unwrap();
        (nict, server, user)
    }

    #[tokio::test]
    async fn test_starts_in_trying() {
        let (nict, server, _) = sent_nict().await;

        assert_eq!(nict.state(), TransactionState::Trying);
        assert_eq!(server.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_provisional_then_final() {
        let (nict, _, user) = sent_nict().await;

        nict.receive_response(&incoming_response(100, Method::Register))
            .await;
        assert_eq!(nict.state(), TransactionState::Proceeding);

        nict.receive_response(&incoming_response(200, Method::Register))
            .await;
        assert_eq!(user.responses(), vec![100, 200]);

        // Timer K is zero over a reliable transport.
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(nict.state(), TransactionState::Terminated);
    }

    #[tokio::test]
    async fn test_final_response_retransmission_absorbed() {
        let (nict, _, user) = sent_nict().await;
        nict.receive_response(&incoming_response(200, Method::Register))
            .await;

        nict.receive_response(&incoming_response(200, Method::Register))
            .await;

        assert_eq!(user.responses(), vec![200]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_e_retransmits() {
        let (transport, server) = connected_transport().await;
        server.set_unreliable();
        let user = Arc::new(RecordingUser::default());
        let nict = NonInviteClientTransaction::send(
            outgoing_request(Method::Register),
            transport,
            TransactionLayer::new(),
            user,
        )
        .await
        .unwrap();

        time::sleep(Duration::from_millis(501)).await;
        assert_eq!(nict.retransmit_count(), 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert_eq!(nict.retransmit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_f_times_out() {
        let (nict, _, user) = sent_nict().await;

        time::sleep(TIMER_F + Duration::from_millis(1)).await;

        assert!(user.timed_out());
        assert_eq!(nict.state(), TransactionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_k_over_unreliable() {
        let (transport, server) = connected_transport().await;
        server.set_unreliable();
        let user = Arc::new(RecordingUser::default());
        let nict = NonInviteClientTransaction::send(
            outgoing_request(Method::Register),
            transport,
            TransactionLayer::new(),
            user,
        )
        .await
        .unwrap();

        nict.receive_response(&incoming_response(200, Method::Register))
            .await;
        assert_eq!(nict.state(), TransactionState::Completed);

        time::sleep(crate::timer::T4 + Duration::from_millis(1)).await;
        assert_eq!(nict.state(), TransactionState::Terminated);
    }

    #[tokio::test]
    async fn test_layer_removes_terminated() {
        let (transport, _server) = connected_transport().await;
        let layer = TransactionLayer::new();
        let user = Arc::new(RecordingUser::default());
        let nict = NonInviteClientTransaction::send(
            outgoing_request(Method::Register),
            transport,
            layer.clone(),
            user,
        )
        .await
        .unwrap();
        assert_eq!(layer.client_count(), 1);

        nict.receive_response(&incoming_response(200, Method::Register))
            .await;
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(layer.client_count(), 0);
    }
}
