use crate::message::{Method, Request, Response, BRANCH_MAGIC_COOKIE};

/// Identity of a transaction (RFC 3261 sections 17.1.3 and 17.2.3).
///
/// Client transactions match inbound responses on the top Via branch
/// plus the CSeq method; server transactions match inbound requests on
/// the top Via branch, its sent-by, and the method (with ACK matching
/// the INVITE transaction it acknowledges).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Client {
        branch: String,
        method: Method,
    },
    Server {
        branch: String,
        sent_by: String,
        method: Method,
    },
}

impl TransactionKey {
    pub fn client(branch: impl Into<String>, method: Method) -> Self {
        TransactionKey::Client {
            branch: branch.into(),
            method,
        }
    }

    pub fn server(branch: impl Into<String>, sent_by: impl Into<String>, method: Method) -> Self {
        TransactionKey::Server {
            branch: branch.into(),
            sent_by: sent_by.into(),
            method,
        }
    }

    /// The key under which a new client transaction registers itself.
    pub fn for_outgoing(request: &Request) -> Option<Self> {
        let branch = request.headers.via_branch()?;
        Some(TransactionKey::client(branch, request.method))
    }

    /// The key an inbound response is matched with.
    pub fn for_response(response: &Response) -> Option<Self> {
        let branch = response.headers.via_branch()?;
        let method = response.headers.cseq()?.method;
        Some(TransactionKey::client(branch, method))
    }

    /// The key an inbound request is matched with. ACK maps onto the
    /// INVITE server transaction.
    pub fn for_request(request: &Request) -> Option<Self> {
        let branch = request.headers.via_branch()?;
        if !branch.starts_with(BRANCH_MAGIC_COOKIE) {
            // Pre-RFC 3261 clients are out of scope; their requests are
            // handled statelessly.
            return None;
        }
        let sent_by = request.headers.via_sent_by()?;
        let method = match request.method {
            Method::Ack => Method::Invite,
            method => method,
        };
        Some(TransactionKey::server(branch, sent_by, method))
    }

    pub fn branch(&self) -> &str {
        match self {
            TransactionKey::Client { branch, .. } => branch,
            TransactionKey::Server { branch, .. } => branch,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            TransactionKey::Client { method, .. } => *method,
            TransactionKey::Server { method, .. } => *method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{parse_message, Uri};

    fn request(method: Method) -> Request {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut request = Request::new(method, uri);
        request
            .headers
            .push("Via", "SIP/2.0/WS client.invalid;branch=z9hG4bKabc");
        request.headers.push("CSeq", format!("1 {method}"));
        request
    }

    #[test]
    fn test_ack_matches_invite_server_transaction() {
        let invite = TransactionKey::for_request(&request(Method::Invite)).unwrap();
        let ack = TransactionKey::for_request(&request(Method::Ack)).unwrap();

        assert_eq!(invite, ack);
    }

    #[test]
    fn test_cancel_has_its_own_key() {
        let invite = TransactionKey::for_request(&request(Method::Invite)).unwrap();
        let cancel = TransactionKey::for_request(&request(Method::Cancel)).unwrap();

        assert_ne!(invite, cancel);
    }

    #[test]
    fn test_response_matches_on_branch_and_cseq_method() {
        let raw = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/WS client.invalid;branch=z9hG4bKabc\r\n\
            CSeq: 1 INVITE\r\n\
            Call-ID: x\r\n\
            From: <sip:a@h>;tag=1\r\n\
            To: <sip:b@h>;tag=2\r\n\
            \r\n";
        let message = parse_message(raw).unwrap();
        let response = message.as_response().unwrap();

        let key = TransactionKey::for_response(response).unwrap();
        assert_eq!(key, TransactionKey::client("z9hG4bKabc", Method::Invite));
    }

    #[test]
    fn test_missing_magic_cookie_is_unmatched() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut old = Request::new(Method::Invite, uri);
        old.headers.push("Via", "SIP/2.0/UDP host;branch=1234");
        old.headers.push("CSeq", "1 INVITE");

        assert!(TransactionKey::for_request(&old).is_none());
    }
}
