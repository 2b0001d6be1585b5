use std::fmt;

use crate::message::name_addr::NameAddr;
use crate::message::parser;
use crate::message::uri::Params;
use crate::message::{CSeq, Method};

/// An ordered, case-insensitive, multi-valued SIP header map.
///
/// Insertion order is preserved: it is semantically significant for Via,
/// Route, Record-Route and Path. Lookup compares header names
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header line after any existing values of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values of `name` with a single value. The new value
    /// takes the position of the first old one when present.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let first = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name));
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        let at = first.unwrap_or(self.entries.len());
        self.entries.insert(at, (name.to_string(), value.into()));
    }

    /// Inserts a header line before any existing values of the same name.
    /// Used for Via, where the newest hop goes on top.
    pub fn push_front(&mut self, name: &str, value: impl Into<String>) {
        let at = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
            .unwrap_or(0);
        self.entries.insert(at, (name.to_string(), value.into()));
    }

    /// The first value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Removes the topmost value of `name` only.
    pub fn remove_first(&mut self, name: &str) {
        if let Some(at) = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            self.entries.remove(at);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

/// The parsed value of a `Subscription-State` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateValue {
    /// `active`, `pending` or `terminated`.
    pub state: String,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

// Typed, parse-on-demand accessors for the headers the core routes on.
impl Headers {
    /// The `branch` parameter of the topmost Via.
    pub fn via_branch(&self) -> Option<String> {
        let via = self.get("Via")?;
        let (_, params) = parser::split_value_params(via);
        params.value_of("branch").map(str::to_string)
    }

    /// The sent-by (host[:port]) of the topmost Via.
    pub fn via_sent_by(&self) -> Option<String> {
        let via = self.get("Via")?;
        let (value, _) = parser::split_value_params(via);
        // "SIP/2.0/WS host:port" -> host:port
        value.split_whitespace().nth(1).map(str::to_string)
    }

    pub fn via_count(&self) -> usize {
        self.count("Via")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        let value = self.get("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method: Method = parts.next()?.parse().ok()?;
        Some(CSeq { seq, method })
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID")
    }

    pub fn from_header(&self) -> Option<NameAddr> {
        parser::parse_name_addr(self.get("From")?).ok()
    }

    pub fn to_header(&self) -> Option<NameAddr> {
        parser::parse_name_addr(self.get("To")?).ok()
    }

    pub fn contact(&self) -> Option<NameAddr> {
        parser::parse_name_addr(self.get("Contact")?).ok()
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_header()?.tag().map(str::to_string)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_header()?.tag().map(str::to_string)
    }

    pub fn expires(&self) -> Option<u32> {
        self.get("Expires")?.trim().parse().ok()
    }

    pub fn min_expires(&self) -> Option<u32> {
        self.get("Min-Expires")?.trim().parse().ok()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")?.trim().parse().ok()
    }

    /// The event-type of the `Event` header, without parameters.
    pub fn event(&self) -> Option<String> {
        let value = self.get("Event")?;
        let (event, _) = parser::split_value_params(value);
        Some(event.trim().to_string())
    }

    pub fn subscription_state(&self) -> Option<SubscriptionStateValue> {
        let value = self.get("Subscription-State")?;
        let (state, params) = parser::split_value_params(value);
        Some(SubscriptionStateValue {
            state: state.trim().to_ascii_lowercase(),
            expires: params.value_of("expires").and_then(|v| v.parse().ok()),
            reason: params.value_of("reason").map(str::to_string),
        })
    }

    pub fn sip_etag(&self) -> Option<&str> {
        self.get("SIP-ETag").map(str::trim)
    }

    /// Record-Route values, topmost first. Comma-separated values within
    /// one header line are split.
    pub fn record_routes(&self) -> Vec<String> {
        self.get_all("Record-Route")
            .flat_map(parser::split_comma_values)
            .collect()
    }

    pub fn routes(&self) -> Vec<String> {
        self.get_all("Route")
            .flat_map(parser::split_comma_values)
            .collect()
    }

    /// The first digest challenge found in `WWW-Authenticate` or
    /// `Proxy-Authenticate`, together with the response status class it
    /// belongs to (401 or 407).
    pub fn challenge(&self) -> Option<(&'static str, &str)> {
        if let Some(value) = self.get("WWW-Authenticate") {
            return Some(("Authorization", value));
        }
        if let Some(value) = self.get("Proxy-Authenticate") {
            return Some(("Proxy-Authorization", value));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Headers {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/WS client.invalid;branch=z9hG4bKabc123");
        headers.push("From", "<sip:alice@example.com>;tag=a73kszlfl");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "f81d4fae-7dec");
        headers.push("CSeq", "4711 INVITE");
        headers
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let headers = headers();

        assert_eq!(headers.get("call-id"), Some("f81d4fae-7dec"));
        assert_eq!(headers.get("CALL-ID"), Some("f81d4fae-7dec"));
    }

    #[test]
    fn test_order_preserved_for_multi_valued() {
        let mut headers = Headers::new();
        headers.push("Route", "<sip:p1.example.com;lr>");
        headers.push("Route", "<sip:p2.example.com;lr>");

        let routes: Vec<_> = headers.get_all("Route").collect();
        assert_eq!(routes, ["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]);
    }

    #[test]
    fn test_push_front_stacks_via() {
        let mut headers = headers();
        headers.push_front("Via", "SIP/2.0/WS edge.example.com;branch=z9hG4bKtop");

        assert_eq!(
            headers.via_branch().as_deref(),
            Some("z9hG4bKtop"),
        );
        assert_eq!(headers.via_count(), 2);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers = headers();
        headers.set("CSeq", "4712 ACK");

        assert_eq!(headers.get("CSeq"), Some("4712 ACK"));
        assert_eq!(headers.count("CSeq"), 1);
    }

    #[test]
    fn test_cseq_accessor() {
        let headers = headers();
        let cseq = headers.cseq().unwrap();

        assert_eq!(cseq.seq, 4711);
        assert_eq!(cseq.method, Method::Invite);
    }

    #[test]
    fn test_via_accessors() {
        let headers = headers();

        assert_eq!(headers.via_branch().as_deref(), Some("z9hG4bKabc123"));
        assert_eq!(headers.via_sent_by().as_deref(), Some("client.invalid"));
    }

    #[test]
    fn test_subscription_state() {
        let mut headers = Headers::new();
        headers.push("Subscription-State", "active;expires=3599");

        let state = headers.subscription_state().unwrap();
        assert_eq!(state.state, "active");
        assert_eq!(state.expires, Some(3599));
        assert_eq!(state.reason, None);
    }

    #[test]
    fn test_tags() {
        let headers = headers();

        assert_eq!(headers.from_tag().as_deref(), Some("a73kszlfl"));
        assert_eq!(headers.to_tag(), None);
    }
}
