//! Server-side request handling: the reply surface a TU uses to answer
//! an inbound request through its server transaction.

use std::sync::Arc;

use crate::core::UserAgentCore;
use crate::error::{Error, Result};
use crate::message::{Body, Method, Request, Response};
use crate::transaction::{ServerTransaction, ServerTransactionUser};

/// Knobs for building a reply.
#[derive(Default)]
pub struct ReplyOptions {
    /// Overrides the default reason phrase.
    pub reason: Option<String>,
    /// The To tag for dialog-forming responses. Generated when absent
    /// and the reply needs one.
    pub to_tag: Option<String>,
    /// Opaque, pre-formatted header lines.
    pub extra_headers: Vec<String>,
    pub body: Option<Body>,
    /// Include the UA Contact (dialog-forming 1xx/2xx).
    pub contact: bool,
}

impl ReplyOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn with_header(mut self, line: impl Into<String>) -> Self {
        self.extra_headers.push(line.into());
        self
    }
}

/// An inbound request bound to its server transaction.
///
/// ACKs carry no transaction (nothing answers an ACK); reply attempts on
/// one fail with a validation error.
#[derive(Clone)]
pub struct ServerRequest {
    request: Arc<Request>,
    transaction: Option<ServerTransaction>,
    core: UserAgentCore,
}

impl ServerRequest {
    pub(crate) fn new(
        request: Request,
        transaction: Option<ServerTransaction>,
        core: UserAgentCore,
    ) -> Self {
        ServerRequest {
            request: Arc::new(request),
            transaction,
            core,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> Method {
        self.request.method
    }

    pub fn core(&self) -> &UserAgentCore {
        &self.core
    }

    pub(crate) fn transaction(&self) -> Option<&ServerTransaction> {
        self.transaction.as_ref()
    }

    /// Attaches the TU that will receive ACK/CANCEL/timeout events from
    /// the transaction.
    pub fn set_transaction_user(&self, user: Arc<dyn ServerTransactionUser>) {
        if let Some(transaction) = &self.transaction {
            transaction.set_user(user);
        }
    }

    pub async fn trying(&self) -> Result<()> {
        self.reply(100, ReplyOptions::new()).await
    }

    /// Sends a provisional response (101-199).
    pub async fn progress(&self, status: u16, options: ReplyOptions) -> Result<()> {
        debug_assert!((101..200).contains(&status));
        self.reply(status, options).await
    }

    /// Sends a 200, with the UA Contact included.
    pub async fn accept(&self, mut options: ReplyOptions) -> Result<()> {
        options.contact = true;
        self.reply(200, options).await
    }

    /// Sends a final non-2xx response.
    pub async fn reject(&self, status: u16) -> Result<()> {
        debug_assert!(status >= 300);
        self.reply(status, ReplyOptions::new()).await
    }

    pub async fn reply(&self, status: u16, options: ReplyOptions) -> Result<()> {
        let transaction = self
            .transaction
            .as_ref()
            .ok_or_else(|| Error::Validation("request cannot be replied to".into()))?;
        let response = self.build_reply(status, options);
        transaction.respond(response).await
    }

    /// Fire-and-forget reply for dispatch defaults.
    pub fn reply_in_background(&self, status: u16) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.reply(status, ReplyOptions::new()).await {
                log::warn!("failed to reply {status}: {error}");
            }
        });
    }

    fn build_reply(&self, status: u16, options: ReplyOptions) -> Response {
        let mut response = Response::reply_to(&self.request, status);
        if let Some(reason) = options.reason {
            response.reason = reason;
        }

        // 8.2.6.2: a tag goes into To on everything but a 100.
        if status > 100 && self.request.headers.to_tag().is_none() {
            if let Some(mut to) = self.request.headers.to_header() {
                let tag = options.to_tag.unwrap_or_else(crate::new_tag);
                to.set_tag(tag);
                response.headers.set("To", to.to_string());
            }
        }

        let config = self.core.config();
        if status == 405 {
            response
                .headers
                .push("Allow", crate::core::ALLOWED_METHODS);
        }
        if options.contact {
            response.headers.push("Contact", config.contact.to_string());
        }
        if let Some(supported) = self.core.supported_header() {
            response.headers.push("Supported", supported);
        }
        if let Some(user_agent) = &config.user_agent {
            response.headers.push("User-Agent", user_agent);
        }
        response.extra_headers = options.extra_headers;
        response.body = options.body;
        response
    }
}
