//! SIP message model.
//!
//! Requests, responses, headers, URIs and bodies, plus the line-oriented
//! parser adapter that turns wire text into typed messages.

use std::fmt::{self, Write};
use std::str::FromStr;

use enum_as_inner::EnumAsInner;

use crate::error::{Error, ParseError};

mod headers;
mod name_addr;
pub(crate) mod parser;
mod uri;

pub use headers::{Headers, SubscriptionStateValue};
pub use name_addr::NameAddr;
pub use parser::parse_message;
pub use uri::{Params, Scheme, Uri, UriBuilder};

/// The magic cookie every RFC 3261 Via branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

pub(crate) const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Subscribe,
    Notify,
    Publish,
    Message,
    Info,
    Refer,
    Update,
    Prack,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Refer => "REFER",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
        }
    }

    /// True for the methods whose success responses create a dialog.
    pub fn can_establish_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Notify)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            "CANCEL" => Ok(Method::Cancel),
            "REGISTER" => Ok(Method::Register),
            "OPTIONS" => Ok(Method::Options),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            "NOTIFY" => Ok(Method::Notify),
            "PUBLISH" => Ok(Method::Publish),
            "MESSAGE" => Ok(Method::Message),
            "INFO" => Ok(Method::Info),
            "REFER" => Ok(Method::Refer),
            "UPDATE" => Ok(Method::Update),
            "PRACK" => Ok(Method::Prack),
            other => Err(ParseError::new(format!("unknown method '{other}'")).into()),
        }
    }
}

/// A SIP response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_provisional(self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_redirect(self) -> bool {
        (300..400).contains(&self.0)
    }

    pub fn is_final(self) -> bool {
        self.0 >= 200
    }

    /// The default reason phrase for this code (RFC 3261 section 21).
    pub fn reason_phrase(self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            181 => "Call Is Being Forwarded",
            182 => "Queued",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Moved Temporarily",
            305 => "Use Proxy",
            380 => "Alternative Service",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            410 => "Gone",
            412 => "Conditional Request Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Unsupported URI Scheme",
            420 => "Bad Extension",
            421 => "Extension Required",
            422 => "Session Interval Too Small",
            423 => "Interval Too Brief",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            482 => "Loop Detected",
            483 => "Too Many Hops",
            484 => "Address Incomplete",
            485 => "Ambiguous",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            489 => "Bad Event",
            491 => "Request Pending",
            493 => "Undecipherable",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Server Time-out",
            505 => "Version Not Supported",
            513 => "Message Too Large",
            600 => "Busy Everywhere",
            603 => "Decline",
            604 => "Does Not Exist Anywhere",
            606 => "Not Acceptable",
            _ => "Unknown",
        }
    }
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        StatusCode(value)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The value of a `CSeq` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A message body with its content metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_disposition: Option<String>,
    pub content_type: String,
    pub content: String,
}

impl Body {
    pub fn new(content_type: impl Into<String>, content: impl Into<String>) -> Self {
        Body {
            content_disposition: None,
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    /// The UTF-8 byte length of the content, as carried in Content-Length.
    pub fn byte_len(&self) -> usize {
        self.content.len()
    }
}

/// A SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    /// Opaque, pre-formatted header lines serialized after `headers`.
    pub extra_headers: Vec<String>,
    pub body: Option<Body>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            extra_headers: Vec::new(),
            body: None,
        }
    }

    /// Serializes the request for the wire: request-line, headers, extra
    /// header lines, body framing headers, blank line, body.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(800);
        let _ = write!(out, "{} {} {SIP_VERSION}\r\n", self.method, self.uri);
        let _ = write!(out, "{}", self.headers);
        for line in &self.extra_headers {
            let _ = write!(out, "{line}\r\n");
        }
        encode_body(&mut out, self.body.as_ref());
        out
    }
}

/// A SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub extra_headers: Vec<String>,
    pub body: Option<Body>,
}

impl Response {
    pub fn new(status: impl Into<StatusCode>) -> Self {
        let status = status.into();
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            extra_headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_reason(status: impl Into<StatusCode>, reason: impl Into<String>) -> Self {
        Response {
            reason: reason.into(),
            ..Response::new(status)
        }
    }

    /// Builds a response to `request`: the Via chain, Record-Route set,
    /// From, To, Call-ID and CSeq are copied over (RFC 3261 section
    /// 8.2.6). The To tag, when one is due, is the caller's concern.
    pub fn reply_to(request: &Request, status: impl Into<StatusCode>) -> Self {
        let mut response = Response::new(status);
        for via in request.headers.get_all("Via") {
            response.headers.push("Via", via);
        }
        for record_route in request.headers.get_all("Record-Route") {
            response.headers.push("Record-Route", record_route);
        }
        if let Some(from) = request.headers.get("From") {
            response.headers.push("From", from);
        }
        if let Some(to) = request.headers.get("To") {
            response.headers.push("To", to);
        }
        if let Some(call_id) = request.headers.get("Call-ID") {
            response.headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = request.headers.get("CSeq") {
            response.headers.push("CSeq", cseq);
        }
        response
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(800);
        let _ = write!(out, "{SIP_VERSION} {} {}\r\n", self.status, self.reason);
        let _ = write!(out, "{}", self.headers);
        for line in &self.extra_headers {
            let _ = write!(out, "{line}\r\n");
        }
        encode_body(&mut out, self.body.as_ref());
        out
    }
}

fn encode_body(out: &mut String, body: Option<&Body>) {
    match body {
        Some(body) => {
            if let Some(disposition) = &body.content_disposition {
                let _ = write!(out, "Content-Disposition: {disposition}\r\n");
            }
            let _ = write!(out, "Content-Type: {}\r\n", body.content_type);
            let _ = write!(out, "Content-Length: {}\r\n\r\n", body.byte_len());
            out.push_str(&body.content);
        }
        None => {
            let _ = write!(out, "Content-Length: 0\r\n\r\n");
        }
    }
}

/// A SIP message, either a [`Request`] or a [`Response`].
#[derive(Debug, Clone, EnumAsInner)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(request) => &request.headers,
            SipMessage::Response(response) => &response.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(request) => &mut request.headers,
            SipMessage::Response(response) => &mut response.headers,
        }
    }

    pub fn body(&self) -> Option<&Body> {
        match self {
            SipMessage::Request(request) => request.body.as_ref(),
            SipMessage::Response(response) => response.body.as_ref(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SipMessage::Request(request) => request.encode(),
            SipMessage::Response(response) => response.encode(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(value: Request) -> Self {
        SipMessage::Request(value)
    }
}

impl From<Response> for SipMessage {
    fn from(value: Response) -> Self {
        SipMessage::Response(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_without_body() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut request = Request::new(Method::Options, uri);
        request.headers.push("Via", "SIP/2.0/WS host;branch=z9hG4bKx");
        request.headers.push("Max-Forwards", "70");

        let wire = request.encode();

        assert!(wire.starts_with("OPTIONS sip:bob@example.com SIP/2.0\r\n"));
        assert!(wire.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_encode_body_utf8_length() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut request = Request::new(Method::Message, uri);
        // 'é' is two bytes in UTF-8.
        request.body = Some(Body::new("text/plain", "café"));

        let wire = request.encode();

        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.contains("Content-Type: text/plain\r\n"));
        assert!(wire.ends_with("\r\ncafé"));
    }

    #[test]
    fn test_encode_response_status_line() {
        let response = Response::new(486);

        assert!(response.encode().starts_with("SIP/2.0 486 Busy Here\r\n"));
    }

    #[test]
    fn test_extra_headers_serialized_verbatim() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut request = Request::new(Method::Register, uri);
        request.extra_headers.push("X-Custom: 1".to_string());

        assert!(request.encode().contains("X-Custom: 1\r\n"));
    }
}
