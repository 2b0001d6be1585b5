//! Line-oriented SIP grammar front-end.
//!
//! Turns wire text into the typed message model. This is deliberately a
//! small adapter, not a full ABNF grammar: it understands start lines,
//! header lines (with folding and compact names) and the body split, and
//! parses individual header values on demand.

use std::str::FromStr;

use crate::error::{ParseError, Result};
use crate::message::name_addr::NameAddr;
use crate::message::uri::{Params, Scheme, Uri};
use crate::message::{Body, Headers, Method, Request, Response, SipMessage, SIP_VERSION};

/// Parses a complete SIP message.
pub fn parse_message(input: &str) -> Result<SipMessage> {
    let (head, raw_body) = match input.find("\r\n\r\n") {
        Some(at) => (&input[..at], &input[at + 4..]),
        None => (input.trim_end_matches("\r\n"), ""),
    };

    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ParseError::new("empty message"))?;

    let mut headers = Headers::new();
    let mut pending: Option<(String, String)> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header line.
            match pending.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(ParseError::new("continuation without header").into()),
            }
            continue;
        }
        if let Some((name, value)) = pending.take() {
            headers.push(name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("malformed header line '{line}'")))?;
        pending = Some((expand_header_name(name.trim()), value.trim().to_string()));
    }
    if let Some((name, value)) = pending.take() {
        headers.push(name, value);
    }

    let body = take_body(&mut headers, raw_body);

    if let Some(rest) = start_line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest
            .split_once(' ')
            .map(|(code, reason)| (code, reason.trim()))
            .unwrap_or((rest, ""));
        let code: u16 = code
            .parse()
            .map_err(|_| ParseError::new(format!("bad status code '{code}'")))?;
        return Ok(SipMessage::Response(Response {
            status: code.into(),
            reason: reason.to_string(),
            headers,
            extra_headers: Vec::new(),
            body,
        }));
    }

    let mut parts = start_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ParseError::new("missing method"))?;
    let uri = parts
        .next()
        .ok_or_else(|| ParseError::new("missing request-uri"))?;
    let version = parts
        .next()
        .ok_or_else(|| ParseError::new("missing SIP version"))?;
    if version != SIP_VERSION {
        return Err(ParseError::new(format!("unsupported version '{version}'")).into());
    }

    Ok(SipMessage::Request(Request {
        method: Method::from_str(method)?,
        uri: parse_uri(uri)?,
        headers,
        extra_headers: Vec::new(),
        body,
    }))
}

// Content framing headers move from the map into the Body so that
// re-encoding does not duplicate them.
fn take_body(headers: &mut Headers, raw_body: &str) -> Option<Body> {
    let content_type = headers.get("Content-Type").map(str::to_string);
    let content_disposition = headers.get("Content-Disposition").map(str::to_string);
    headers.remove("Content-Type");
    headers.remove("Content-Disposition");
    headers.remove("Content-Length");

    if raw_body.is_empty() {
        return None;
    }
    let content_type = content_type?;

    Some(Body {
        content_disposition,
        content_type,
        content: raw_body.to_string(),
    })
}

fn expand_header_name(name: &str) -> String {
    if name.len() != 1 {
        return name.to_string();
    }
    match name.to_ascii_lowercase().as_str() {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "e" => "Content-Encoding",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "k" => "Supported",
        "s" => "Subject",
        "o" => "Event",
        "u" => "Allow-Events",
        "r" => "Refer-To",
        "b" => "Referred-By",
        _ => return name.to_string(),
    }
    .to_string()
}

/// Parses a SIP or SIPS URI: `scheme:[user@]host[:port][;params][?headers]`.
pub fn parse_uri(input: &str) -> Result<Uri> {
    let input = input.trim();
    let (scheme, rest) = input
        .split_once(':')
        .ok_or_else(|| ParseError::new(format!("URI without scheme: '{input}'")))?;
    let scheme: Scheme = scheme.parse()?;

    let (rest, raw_headers) = match rest.split_once('?') {
        Some((rest, headers)) => (rest, Some(headers)),
        None => (rest, None),
    };

    let (addr, raw_params) = match rest.split_once(';') {
        Some((addr, params)) => (addr, Some(params)),
        None => (rest, None),
    };

    let (user, host_port) = match addr.rfind('@') {
        Some(at) => (Some(&addr[..at]), &addr[at + 1..]),
        None => (None, addr),
    };

    let (host, port) = split_host_port(host_port)?;
    if host.is_empty() {
        return Err(ParseError::new(format!("URI without host: '{input}'")).into());
    }

    let mut builder = Uri::builder().scheme(scheme).host(host);
    if let Some(user) = user {
        builder = builder.user(user);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    if let Some(raw) = raw_params {
        for (name, value) in parse_params(raw).iter() {
            builder = builder.param(name, value);
        }
    }
    if let Some(raw) = raw_headers {
        for pair in raw.split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            builder = builder.header(name, value);
        }
    }

    Ok(builder.build())
}

fn split_host_port(host_port: &str) -> Result<(&str, Option<u16>)> {
    if let Some(rest) = host_port.strip_prefix('[') {
        // IPv6 reference: [::1]:5060
        let end = rest
            .find(']')
            .ok_or_else(|| ParseError::new("unterminated IPv6 reference"))?;
        let host = &host_port[..end + 2];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(port) => Some(
                port.parse()
                    .map_err(|_| ParseError::new(format!("bad port '{port}'")))?,
            ),
            None => None,
        };
        return Ok((host, port));
    }
    match host_port.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ParseError::new(format!("bad port '{port}'")))?;
            Ok((host, Some(port)))
        }
        None => Ok((host_port, None)),
    }
}

/// Parses a name-addr or addr-spec header value.
///
/// With angle brackets, parameters after `>` belong to the header; in the
/// addr-spec form every `;` parameter belongs to the header as well
/// (RFC 3261 section 20.10).
pub fn parse_name_addr(input: &str) -> Result<NameAddr> {
    let input = input.trim();
    if let Some(lt) = input.find('<') {
        let gt = input[lt..]
            .find('>')
            .map(|at| lt + at)
            .ok_or_else(|| ParseError::new(format!("unterminated name-addr: '{input}'")))?;
        let display = input[..lt].trim().trim_matches('"').trim();
        let display = (!display.is_empty()).then(|| display.to_string());
        let uri = parse_uri(&input[lt + 1..gt])?;
        let params = match input[gt + 1..].trim_start().strip_prefix(';') {
            Some(raw) => parse_params(raw),
            None => Params::new(),
        };
        return Ok(NameAddr::from_parts(display, uri, params));
    }

    let (addr, params) = match input.split_once(';') {
        Some((addr, raw)) => (addr, parse_params(raw)),
        None => (input, Params::new()),
    };
    Ok(NameAddr::from_parts(None, parse_uri(addr)?, params))
}

pub(crate) fn parse_params(raw: &str) -> Params {
    let mut params = Params::new();
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((name, value)) => {
                params.set(name.trim(), Some(value.trim().trim_matches('"').to_string()));
            }
            None => params.set(part, None),
        }
    }
    params
}

/// Splits a header value into the part before the first `;` and its
/// parameters.
pub(crate) fn split_value_params(value: &str) -> (&str, Params) {
    match value.split_once(';') {
        Some((head, raw)) => (head, parse_params(raw)),
        None => (value, Params::new()),
    }
}

/// Splits a multi-valued header line at top-level commas, honoring angle
/// brackets and quoted strings.
pub(crate) fn split_comma_values(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0usize;
    for (at, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                let part = value[start..at].trim();
                if !part.is_empty() {
                    out.push(part.to_string());
                }
                start = at + 1;
            }
            _ => {}
        }
    }
    let part = value[start..].trim();
    if !part.is_empty() {
        out.push(part.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/WS client.invalid;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: <sip:bob@example.com>\r\n\
        From: \"Alice\" <sip:alice@example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn test_parse_request() {
        let message = parse_message(REQUEST).unwrap();
        let request = message.as_request().unwrap();

        assert_eq!(request.method, Method::Invite);
        assert_eq!(request.uri.user(), Some("bob"));
        assert_eq!(request.headers.cseq().unwrap().seq, 314159);
        assert_eq!(
            request.headers.via_branch().as_deref(),
            Some("z9hG4bK776asdhds")
        );

        let body = request.body.as_ref().unwrap();
        assert_eq!(body.content_type, "application/sdp");
        assert_eq!(body.content, "v=0\n");
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/WS client.invalid;branch=z9hG4bK776asdhds\r\n\
            To: <sip:bob@example.com>;tag=8321234356\r\n\
            From: <sip:alice@example.com>;tag=1928301774\r\n\
            Call-ID: a84b4c76e66710\r\n\
            CSeq: 314159 INVITE\r\n\
            Content-Length: 0\r\n\
            \r\n";
        let message = parse_message(raw).unwrap();
        let response = message.as_response().unwrap();

        assert_eq!(response.status.as_u16(), 180);
        assert_eq!(response.reason, "Ringing");
        assert_eq!(response.headers.to_tag().as_deref(), Some("8321234356"));
    }

    #[test]
    fn test_round_trip() {
        let message = parse_message(REQUEST).unwrap();
        let reparsed = parse_message(&message.encode()).unwrap();

        let a = message.as_request().unwrap();
        let b = reparsed.as_request().unwrap();
        assert_eq!(a.method, b.method);
        assert_eq!(a.uri, b.uri);
        assert_eq!(a.headers.len(), b.headers.len());
        assert_eq!(a.body, b.body);
    }

    #[test]
    fn test_compact_header_names() {
        let raw = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
            v: SIP/2.0/WS host;branch=z9hG4bKa\r\n\
            i: abc@host\r\n\
            f: <sip:alice@example.com>;tag=x\r\n\
            t: <sip:bob@example.com>\r\n\
            CSeq: 1 OPTIONS\r\n\
            \r\n";
        let message = parse_message(raw).unwrap();

        assert_eq!(message.headers().call_id(), Some("abc@host"));
        assert!(message.headers().via_branch().is_some());
    }

    #[test]
    fn test_folded_header() {
        let raw = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
            Subject: first\r\n\
            \tsecond\r\n\
            Call-ID: abc\r\n\
            \r\n";
        let message = parse_message(raw).unwrap();

        assert_eq!(message.headers().get("Subject"), Some("first second"));
    }

    #[test]
    fn test_malformed_start_line() {
        assert!(parse_message("BANANAS\r\n\r\n").is_err());
    }

    #[test]
    fn test_uri_with_ipv6_host() {
        let uri = parse_uri("sip:alice@[2001:db8::1]:5060;transport=ws").unwrap();

        assert_eq!(uri.host(), "[2001:db8::1]");
        assert_eq!(uri.port(), Some(5060));
        assert_eq!(uri.params().value_of("transport"), Some("ws"));
    }

    #[test]
    fn test_addr_spec_params_belong_to_header() {
        let addr = parse_name_addr("sip:alice@example.com;tag=abc").unwrap();

        assert_eq!(addr.tag(), Some("abc"));
        assert!(addr.uri().params().is_empty());
    }

    #[test]
    fn test_comma_split_honors_brackets() {
        let values = split_comma_values("<sip:a@h;lr>, <sip:b@h>, \"x,y\" <sip:c@h>");

        assert_eq!(values.len(), 3);
        assert_eq!(values[0], "<sip:a@h;lr>");
    }
}
