//! Dialog layer (RFC 3261 section 12).
//!
//! A dialog is the peer-to-peer relationship identified by Call-ID plus
//! the local and remote tags. Dialog usages (the INVITE session, any
//! subscriptions) share it; the dialog dies with its last usage.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::ServerRequest;
use crate::message::{Method, NameAddr, Request, Response, Uri};

/// Dialog states. A dialog is Early from a reliable provisional
/// response until the 2xx confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

/// Unique identifier of a dialog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    call_id: String,
    local_tag: String,
    remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        DialogId {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// The dialog an inbound request belongs to: our tag is in To,
    /// theirs in From.
    pub fn for_incoming_request(request: &Request) -> Option<Self> {
        Some(DialogId {
            call_id: request.headers.call_id()?.to_string(),
            local_tag: request.headers.to_tag()?,
            remote_tag: request.headers.from_tag()?,
        })
    }

    /// The dialog an inbound response belongs to: our tag is in From.
    pub fn for_incoming_response(response: &Response) -> Option<Self> {
        Some(DialogId {
            call_id: response.headers.call_id()?.to_string(),
            local_tag: response.headers.from_tag()?,
            remote_tag: response.headers.to_tag()?,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> &str {
        &self.remote_tag
    }
}

/// A feature sharing a dialog: the INVITE session or a subscription.
pub trait DialogUsage: Send + Sync {
    /// Whether this usage claims the in-dialog request.
    fn handles(&self, request: &Request) -> bool;

    /// An in-dialog request routed to this usage.
    fn receive_request(&self, request: ServerRequest);

    /// A response that matched the dialog but no transaction; in
    /// practice a retransmitted 2xx to INVITE that needs another ACK.
    fn receive_stray_response(&self, response: &Response) {
        let _ = response;
    }
}

struct DialogInner {
    id: DialogId,
    state: Mutex<DialogState>,
    /// Serialized name-addr of the local party, tag included.
    local_party: String,
    /// Serialized name-addr of the remote party, tag included.
    remote_party: String,
    local_cseq: AtomicU32,
    /// Last CSeq seen from the peer; zero until the first in-dialog
    /// request arrives.
    remote_cseq: AtomicU32,
    remote_target: Mutex<Uri>,
    /// Route headers for in-dialog requests, in emission order.
    route_set: Vec<String>,
    secure: bool,
    usages: Mutex<Vec<(String, Arc<dyn DialogUsage>)>>,
}

/// A SIP dialog.
#[derive(Clone)]
pub struct Dialog(Arc<DialogInner>);

impl Dialog {
    /// Creates the UAC side of a dialog from the request we sent and
    /// the dialog-establishing response (RFC 3261 section 12.1.2): the
    /// route set mirrors Record-Route in reverse, the remote target is
    /// the response Contact.
    pub fn new_uac(request: &Request, response: &Response) -> Option<Dialog> {
        let id = DialogId {
            call_id: request.headers.call_id()?.to_string(),
            local_tag: request.headers.from_tag()?,
            remote_tag: response.headers.to_tag()?,
        };
        let state = if response.status.is_provisional() {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };
        let mut route_set = response.headers.record_routes();
        route_set.reverse();
        let remote_target = contact_uri(response.headers.contact())
            .unwrap_or_else(|| request.uri.clone());
        let local_cseq = request.headers.cseq().map(|cseq| cseq.seq).unwrap_or(1);

        Some(Dialog(Arc::new(DialogInner {
            id,
            state: Mutex::new(state),
            local_party: request.headers.get("From")?.to_string(),
            remote_party: response.headers.get("To")?.to_string(),
            local_cseq: AtomicU32::new(local_cseq),
            remote_cseq: AtomicU32::new(0),
            remote_target: Mutex::new(remote_target),
            route_set,
            secure: request.uri.scheme() == crate::message::Scheme::Sips,
            usages: Mutex::new(Vec::new()),
        })))
    }

    /// Creates the UAS side of a dialog from an inbound request and our
    /// freshly minted local tag (RFC 3261 section 12.1.1): the route set
    /// keeps Record-Route order, the remote target is the request
    /// Contact.
    pub fn new_uas(request: &Request, local_tag: &str, state: DialogState) -> Option<Dialog> {
        if !request.method.can_establish_dialog() {
            return None;
        }
        let id = DialogId {
            call_id: request.headers.call_id()?.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: request.headers.from_tag()?,
        };
        let mut local = request.headers.to_header()?;
        if local.tag().is_none() {
            local.set_tag(local_tag);
        }
        let remote_target =
            contact_uri(request.headers.contact()).unwrap_or_else(|| request.uri.clone());
        let remote_cseq = request.headers.cseq().map(|cseq| cseq.seq).unwrap_or(0);

        Some(Dialog(Arc::new(DialogInner {
            id,
            state: Mutex::new(state),
            local_party: local.to_string(),
            remote_party: request.headers.get("From")?.to_string(),
            local_cseq: AtomicU32::new(0),
            remote_cseq: AtomicU32::new(remote_cseq),
            remote_target: Mutex::new(remote_target),
            route_set: request.headers.record_routes(),
            secure: request.uri.scheme() == crate::message::Scheme::Sips,
            usages: Mutex::new(Vec::new()),
        })))
    }

    pub fn id(&self) -> &DialogId {
        &self.0.id
    }

    pub fn state(&self) -> DialogState {
        *self.0.state.lock().expect("Lock failed")
    }

    pub fn secure(&self) -> bool {
        self.0.secure
    }

    /// Moves an early dialog to Confirmed. Idempotent.
    pub fn confirm(&self) {
        *self.0.state.lock().expect("Lock failed") = DialogState::Confirmed;
    }

    pub fn remote_target(&self) -> Uri {
        self.0.remote_target.lock().expect("Lock failed").clone()
    }

    /// Target refresh from a re-INVITE or its response.
    pub fn set_remote_target(&self, target: Uri) {
        *self.0.remote_target.lock().expect("Lock failed") = target;
    }

    pub fn route_set(&self) -> &[String] {
        &self.0.route_set
    }

    /// The next local CSeq number, strictly increasing in send order.
    pub fn next_local_cseq(&self) -> u32 {
        self.0.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn local_cseq(&self) -> u32 {
        self.0.local_cseq.load(Ordering::SeqCst)
    }

    /// Raises the local CSeq floor. Used when the dialog is created by
    /// an inbound NOTIFY after we already sent the SUBSCRIBE.
    pub(crate) fn set_local_cseq(&self, seq: u32) {
        self.0.local_cseq.fetch_max(seq, Ordering::SeqCst);
    }

    /// Checks the remote CSeq is monotonic and records it. Requests
    /// below the high-water mark must be dropped (RFC 3261 12.2.2).
    pub fn validate_remote_cseq(&self, seq: u32) -> bool {
        let seen = self.0.remote_cseq.load(Ordering::SeqCst);
        if seq < seen {
            return false;
        }
        self.0.remote_cseq.store(seq, Ordering::SeqCst);
        true
    }

    /// Builds an in-dialog request: Request-URI from the remote target,
    /// parties with their tags, the dialog Call-ID, the next CSeq and
    /// the route set.
    pub fn create_request(&self, method: Method) -> Request {
        self.build_request(method, self.next_local_cseq())
    }

    /// Builds the ACK for a 2xx; its CSeq number mirrors the INVITE.
    pub fn create_ack(&self, invite_cseq: u32) -> Request {
        self.build_request(Method::Ack, invite_cseq)
    }

    fn build_request(&self, method: Method, seq: u32) -> Request {
        let mut request = Request::new(method, self.remote_target());
        request.headers.push("Max-Forwards", "70");
        request.headers.push("To", &self.0.remote_party);
        request.headers.push("From", &self.0.local_party);
        request.headers.push("Call-ID", &self.0.id.call_id);
        request.headers.push("CSeq", format!("{seq} {method}"));
        for route in &self.0.route_set {
            request.headers.push("Route", route);
        }
        request
    }

    pub fn register_usage(&self, id: impl Into<String>, usage: Arc<dyn DialogUsage>) {
        self.0
            .usages
            .lock()
            .expect("Lock failed")
            .push((id.into(), usage));
    }

    /// Removes a usage. Returns true when it was the last one and the
    /// dialog should be destroyed.
    pub fn deregister_usage(&self, id: &str) -> bool {
        let mut usages = self.0.usages.lock().expect("Lock failed");
        usages.retain(|(usage_id, _)| usage_id != id);
        usages.is_empty()
    }

    pub fn usage_count(&self) -> usize {
        self.0.usages.lock().expect("Lock failed").len()
    }

    /// The usage claiming an in-dialog request, if any.
    pub fn usage_for(&self, request: &Request) -> Option<Arc<dyn DialogUsage>> {
        self.0
            .usages
            .lock()
            .expect("Lock failed")
            .iter()
            .find(|(_, usage)| usage.handles(request))
            .map(|(_, usage)| usage.clone())
    }

    pub fn usages(&self) -> Vec<Arc<dyn DialogUsage>> {
        self.0
            .usages
            .lock()
            .expect("Lock failed")
            .iter()
            .map(|(_, usage)| usage.clone())
            .collect()
    }
}

fn contact_uri(contact: Option<NameAddr>) -> Option<Uri> {
    contact.map(|contact| contact.uri().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{incoming_response, outgoing_request};

    fn uac_dialog() -> Dialog {
        let request = outgoing_request(Method::Invite);
        let mut response = incoming_response(200, Method::Invite);
        response
            .headers
            .push("Contact", "<sip:bob@gw.example.com>");
        response
            .headers
            .push("Record-Route", "<sip:p1.example.com;lr>");
        response
            .headers
            .push("Record-Route", "<sip:p2.example.com;lr>");
        Dialog::new_uac(&request, &response).unwrap()
    }

    #[test]
    fn test_uac_dialog_identity() {
        let dialog = uac_dialog();

        assert_eq!(dialog.id().local_tag(), "9fxced76sl");
        assert_eq!(dialog.id().remote_tag(), "as83kd9bs");
        assert_eq!(dialog.state(), DialogState::Confirmed);
    }

    #[test]
    fn test_uac_route_set_reversed() {
        let dialog = uac_dialog();

        assert_eq!(
            dialog.route_set(),
            ["<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]
        );
    }

    #[test]
    fn test_uas_route_set_in_order() {
        let mut request = crate::test_utils::incoming_request(Method::Invite);
        request
            .headers
            .push("Record-Route", "<sip:p1.example.com;lr>");
        request
            .headers
            .push("Record-Route", "<sip:p2.example.com;lr>");
        let dialog = Dialog::new_uas(&request, "local1", DialogState::Early).unwrap();

        assert_eq!(
            dialog.route_set(),
            ["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]
        );
        assert_eq!(dialog.state(), DialogState::Early);
    }

    #[test]
    fn test_early_response_creates_early_dialog() {
        let request = outgoing_request(Method::Invite);
        let response = incoming_response(180, Method::Invite);
        let dialog = Dialog::new_uac(&request, &response).unwrap();

        assert_eq!(dialog.state(), DialogState::Early);
        dialog.confirm();
        assert_eq!(dialog.state(), DialogState::Confirmed);
    }

    #[test]
    fn test_local_cseq_strictly_increasing() {
        let dialog = uac_dialog();

        let bye = dialog.create_request(Method::Bye);
        let info = dialog.create_request(Method::Info);

        let first = bye.headers.cseq().unwrap().seq;
        let second = info.headers.cseq().unwrap().seq;
        assert!(second > first);
    }

    #[test]
    fn test_remote_cseq_monotonic() {
        let dialog = uac_dialog();

        assert!(dialog.validate_remote_cseq(10));
        assert!(!dialog.validate_remote_cseq(9));
        assert!(dialog.validate_remote_cseq(10));
        assert!(dialog.validate_remote_cseq(11));
    }

    #[test]
    fn test_in_dialog_request_shape() {
        let dialog = uac_dialog();

        let bye = dialog.create_request(Method::Bye);

        assert_eq!(bye.uri.host(), "gw.example.com");
        assert!(bye.headers.get("To").unwrap().contains("tag=as83kd9bs"));
        assert!(bye.headers.get("From").unwrap().contains("tag=9fxced76sl"));
        assert_eq!(bye.headers.routes().len(), 2);
    }

    #[test]
    fn test_ack_mirrors_invite_cseq() {
        let dialog = uac_dialog();

        let ack = dialog.create_ack(1);

        let cseq = ack.headers.cseq().unwrap();
        assert_eq!(cseq.seq, 1);
        assert_eq!(cseq.method, Method::Ack);
    }

    struct NullUsage;

    impl DialogUsage for NullUsage {
        fn handles(&self, _request: &Request) -> bool {
            true
        }

        fn receive_request(&self, _request: ServerRequest) {}
    }

    #[test]
    fn test_last_usage_gone_destroys_dialog() {
        let dialog = uac_dialog();
        dialog.register_usage("session", Arc::new(NullUsage));
        dialog.register_usage("presence", Arc::new(NullUsage));

        assert!(!dialog.deregister_usage("session"));
        assert!(dialog.deregister_usage("presence"));
    }
}
