use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::{Method, Request, Response};
use crate::timer::timer_j;
use crate::transaction::{
    Role, ServerTransaction, ServerTransactionUser, Transaction, TransactionKey, TransactionLayer,
    TransactionState,
};
use crate::transport::Transport;

/// Non-INVITE server transaction (RFC 3261 section 17.2.2).
#[derive(Clone)]
pub struct NonInviteServerTransaction {
    tsx: Transaction,
}

impl NonInviteServerTransaction {
    pub fn new(
        request: &Request,
        transport: Transport,
        layer: TransactionLayer,
        user: Arc<dyn ServerTransactionUser>,
    ) -> Result<Self> {
        assert!(
            !matches!(request.method, Method::Invite | Method::Ack),
            "invalid method for a non-INVITE server transaction: {}",
            request.method
        );
        let key = TransactionKey::for_request(request)
            .ok_or_else(|| Error::Validation("request without RFC 3261 Via branch".into()))?;
        let tsx = Transaction::new(
            "NonInviteServerTransaction",
            key,
            Role::Uas,
            TransactionState::Trying,
            transport,
            layer.clone(),
        );
        tsx.set_server_user(user);

        let nist = NonInviteServerTransaction { tsx };
        layer.register_server(ServerTransaction::NonInvite(nist.clone()));
        Ok(nist)
    }

    /// Sends a response from the TU through the machine. Only legal
    /// until the final response went out.
    pub async fn respond(&self, response: Response) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            TransactionState::Trying | TransactionState::Proceeding
        ) {
            return Err(Error::Validation(format!(
                "transaction already answered (state {state})"
            )));
        }
        let code = response.status;
        let wire = response.encode();
        log::debug!("=> response {code} {}", response.reason);

        if let Err(error) = self.send_wire(&wire).await {
            self.notify_transport_error(&error);
            self.on_terminated();
            return Err(error);
        }
        self.remember_response(wire);

        if code.is_provisional() {
            if state == TransactionState::Trying {
                self.set_state(TransactionState::Proceeding);
            }
        } else {
            self.set_state(TransactionState::Completed);
            // Timer J absorbs request retransmissions, then done.
            self.schedule_termination(timer_j(self.reliable()), TransactionState::Completed);
        }
        Ok(())
    }

    /// Handles a retransmission of the request.
    pub async fn receive_request(&self, request: &Request) {
        let _ = request;
        match self.state() {
            TransactionState::Proceeding | TransactionState::Completed => {
                if let Err(error) = self.retransmit_last_response().await {
                    log::info!("failed to retransmit response: {error}");
                }
            }
            _ => {
                // Trying: nothing has been sent yet; absorb.
            }
        }
    }
}

impl Deref for NonInviteServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{connected_transport, incoming_request, RecordingUser};
    use crate::timer::TIMER_B;
    use tokio::time::{self, Duration};

    async fn new_nist() -> (
        NonInviteServerTransaction,
        crate::test_utils::MockServer,
        Arc<RecordingUser>,
    ) {
        let (transport, server) = connected_transport().await;
        let user = Arc::new(RecordingUser::default());
        let nist = NonInviteServerTransaction::new(
            &incoming_request(Method::Message),
            transport,
            TransactionLayer::new(),
            user.clone(),
        )
        .unwrap();
        (nist, server, user)
    }

    #[tokio::test]
    async fn test_provisional_enters_proceeding() {
        let (nist, _, _) = new_nist().await;

        let request = incoming_request(Method::Message);
        nist.respond(Response::reply_to(&request, 100)).await.unwrap();

        assert_eq!(nist.state(), TransactionState::Proceeding);
    }

    #[tokio::test]
    async fn test_final_completes_and_terminates_reliable() {
        let (nist, _, _) = new_nist().await;

        let request = incoming_request(Method::Message);
        nist.respond(Response::reply_to(&request, 200)).await.unwrap();
        assert_eq!(nist.state(), TransactionState::Completed);

        // Timer J is zero over a reliable transport.
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(nist.state(), TransactionState::Terminated);
    }

    #[tokio::test]
    async fn test_request_retransmission_resends_final() {
        let (transport, server) = connected_transport().await;
        server.set_unreliable();
        let user = Arc::new(RecordingUser::default());
        let request = incoming_request(Method::Message);
        let nist = NonInviteServerTransaction::new(
            &request,
            transport,
            TransactionLayer::new(),
            user,
        )
        .unwrap();
        nist.respond(Response::reply_to(&request, 200)).await.unwrap();

        nist.receive_request(&request).await;

        assert_eq!(server.sent_frames().len(), 2);
        assert_eq!(nist.state(), TransactionState::Completed);
    }

    #[tokio::test]
    async fn test_retransmission_before_any_response_absorbed() {
        let (nist, server, _) = new_nist().await;

        nist.receive_request(&incoming_request(Method::Message)).await;

        assert!(server.sent_frames().is_empty());
        assert_eq!(nist.state(), TransactionState::Trying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_j_over_unreliable() {
        let (transport, server) = connected_transport().await;
        server.set_unreliable();
        let user = Arc::new(RecordingUser::default());
        let request = incoming_request(Method::Message);
        let nist = NonInviteServerTransaction::new(
            &request,
            transport,
            TransactionLayer::new(),
            user,
        )
        .unwrap();
        nist.respond(Response::reply_to(&request, 200)).await.unwrap();

        time::sleep(TIMER_B + Duration::from_millis(1)).await;

        assert_eq!(nist.state(), TransactionState::Terminated);
    }
}
