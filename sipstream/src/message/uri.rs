use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ParseError};

/// The scheme of a SIP URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    /// `sip:` scheme.
    Sip,
    /// `sips:` scheme (secure).
    Sips,
}

impl Scheme {
    /// Returns the scheme as written on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("sip") {
            Ok(Scheme::Sip)
        } else if s.eq_ignore_ascii_case("sips") {
            Ok(Scheme::Sips)
        } else {
            Err(ParseError::new(format!("unknown URI scheme '{s}'")).into())
        }
    }
}

/// An ordered collection of `;name=value` parameters.
///
/// Order is preserved because it is significant when serializing a URI
/// back onto the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, Option<String>)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter, replacing any previous one with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Looks a parameter up by name (case-insensitive).
    ///
    /// Returns `Some(None)` for a valueless parameter such as `;lr`.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Returns the value of a parameter, or `None` when absent or valueless.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<String>> {
        let pos = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            match value {
                Some(value) => write!(f, ";{name}={value}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

/// A SIP URI.
///
/// Immutable after construction; clone before mutating a stored one.
///
/// # Examples
///
/// ```
/// use sipstream::message::Uri;
///
/// let uri: Uri = "sip:alice@example.com:5060;transport=ws".parse().unwrap();
/// assert_eq!(uri.user(), Some("alice"));
/// assert_eq!(uri.host(), "example.com");
/// assert_eq!(uri.port(), Some(5060));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Uri {
    scheme: Scheme,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Params,
    headers: Vec<(String, String)>,
}

impl Uri {
    /// Creates a URI without user part, parameters or headers.
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Uri {
            scheme,
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> UriBuilder {
        UriBuilder::default()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The address-of-record form: scheme, user and host only.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}@{}", self.scheme, user, self.host),
            None => format!("{}:{}", self.scheme, self.host),
        }
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::message::parser::parse_uri(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.params)?;
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

// Comparison rules of RFC 3261 section 19.1.4: user is case-sensitive,
// host is not; a uri-parameter appearing in both must match; the
// transport, user, ttl, method and maddr parameters are significant even
// when present on only one side; headers must agree exactly.
impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        const SIGNIFICANT: [&str; 5] = ["transport", "user", "ttl", "method", "maddr"];

        if self.scheme != other.scheme
            || self.user != other.user
            || !self.host.eq_ignore_ascii_case(&other.host)
            || self.port != other.port
        {
            return false;
        }

        for name in SIGNIFICANT {
            let a = self.params.get(name);
            let b = other.params.get(name);
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    let matches = match (a, b) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => false,
                    };
                    if !matches {
                        return false;
                    }
                }
                _ => return false,
            }
        }

        for (name, value) in self.params.iter() {
            if SIGNIFICANT.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                continue;
            }
            if let Some(other_value) = other.params.get(name) {
                let matches = match (value, other_value) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => false,
                };
                if !matches {
                    return false;
                }
            }
        }

        if self.headers.len() != other.headers.len() {
            return false;
        }
        self.headers.iter().all(|(name, value)| {
            other
                .headers
                .iter()
                .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value)
        })
    }
}

impl Eq for Uri {}

/// Builder for a [`Uri`].
#[derive(Default)]
pub struct UriBuilder {
    scheme: Scheme,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Params,
    headers: Vec<(String, String)>,
}

impl UriBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(str::to_string));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> Uri {
        Uri {
            scheme: self.scheme,
            user: self.user,
            host: self.host,
            port: self.port,
            params: self.params,
            headers: self.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let uri = Uri::builder()
            .user("alice")
            .host("example.com")
            .port(5060)
            .param("transport", Some("ws"))
            .build();

        assert_eq!(uri.to_string(), "sip:alice@example.com:5060;transport=ws");
    }

    #[test]
    fn test_equality_host_case() {
        let a: Uri = "sip:alice@EXAMPLE.com".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_user_case_sensitive() {
        let a: Uri = "sip:Alice@example.com".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_significant_param_one_sided() {
        let a: Uri = "sip:alice@example.com;transport=tcp".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_other_param_one_sided() {
        // A non-significant parameter on only one side does not matter.
        let a: Uri = "sip:alice@example.com;newparam=5".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_param_value_mismatch() {
        let a: Uri = "sip:alice@example.com;foo=a".parse().unwrap();
        let b: Uri = "sip:alice@example.com;foo=b".parse().unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_headers_must_match() {
        let a: Uri = "sip:alice@example.com?subject=call".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();

        assert_ne!(a, b);
    }
}
