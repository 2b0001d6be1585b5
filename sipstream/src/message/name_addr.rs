use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::message::uri::{Params, Uri};

/// A name-addr header value: optional display name, URI and header
/// parameters (notably `tag`).
///
/// # Examples
///
/// ```
/// use sipstream::message::NameAddr;
///
/// let addr: NameAddr = "\"Alice\" <sip:alice@example.com>;tag=88sja8x".parse().unwrap();
/// assert_eq!(addr.display_name(), Some("Alice"));
/// assert_eq!(addr.tag(), Some("88sja8x"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    display_name: Option<String>,
    uri: Uri,
    params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display_name(uri: Uri, display_name: impl Into<String>) -> Self {
        NameAddr {
            display_name: Some(display_name.into()),
            uri,
            params: Params::new(),
        }
    }

    pub(crate) fn from_parts(display_name: Option<String>, uri: Uri, params: Params) -> Self {
        NameAddr {
            display_name,
            uri,
            params,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The `tag` parameter, when present.
    pub fn tag(&self) -> Option<&str> {
        self.params.value_of("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.params.set("tag", Some(tag.into()));
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        self.params.set(name, value);
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        NameAddr::new(uri)
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::message::parser::parse_name_addr(s)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{name}\" <{}>", self.uri)?,
            None => write!(f, "<{}>", self.uri)?,
        }
        write!(f, "{}", self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_name() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let addr = NameAddr::with_display_name(uri, "Bob");

        assert_eq!(addr.to_string(), "\"Bob\" <sip:bob@example.com>");
    }

    #[test]
    fn test_tag_round_trip() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        let mut addr = NameAddr::new(uri);
        addr.set_tag("4ff2eab0");

        assert_eq!(addr.tag(), Some("4ff2eab0"));
        assert_eq!(addr.to_string(), "<sip:bob@example.com>;tag=4ff2eab0");
    }
}
