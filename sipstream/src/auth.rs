//! Digest access authentication (RFC 3261 section 22, MD5).

use std::fmt::Write;

use crate::message::parser::split_comma_values;
use crate::message::Method;
use crate::random_token;

/// Computes digest credentials for 401/407 challenges.
///
/// One instance lives per user-agent client; the nonce-count survives
/// across challenges so retried requests keep it monotonic.
pub struct DigestAuthentication {
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    qop: Option<&'static str>,
    cnonce: Option<String>,
    stale: bool,
    nc: u32,
}

impl DigestAuthentication {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        DigestAuthentication {
            username: username.into(),
            password: password.into(),
            realm: None,
            nonce: None,
            opaque: None,
            qop: None,
            cnonce: None,
            stale: false,
            nc: 0,
        }
    }

    /// True when the server marked the previous nonce stale; a retry with
    /// fresh credentials is then worth attempting even after a prior 401.
    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Digests the challenge of a 401/407 response.
    ///
    /// Returns `false` when the challenge cannot be answered: missing
    /// realm or nonce, a non-MD5 algorithm, or a qop list offering
    /// neither `auth` nor `auth-int`.
    pub fn authenticate(&mut self, challenge: &str) -> bool {
        let challenge = match challenge.trim().strip_prefix("Digest") {
            Some(rest) => rest,
            None => {
                log::warn!("challenge is not a digest challenge");
                return false;
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_list = None;
        let mut algorithm = None;
        let mut stale = false;

        for part in split_comma_values(challenge) {
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim().trim_matches('"')),
                None => continue,
            };
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "opaque" => opaque = Some(value.to_string()),
                "qop" => qop_list = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if let Some(algorithm) = &algorithm {
            if !algorithm.eq_ignore_ascii_case("md5") {
                log::warn!("challenge with unsupported algorithm '{algorithm}'");
                return false;
            }
        }

        let qop = match &qop_list {
            None => None,
            Some(list) => {
                let offered: Vec<&str> = list.split(',').map(str::trim).collect();
                if offered.iter().any(|q| q.eq_ignore_ascii_case("auth")) {
                    Some("auth")
                } else if offered.iter().any(|q| q.eq_ignore_ascii_case("auth-int")) {
                    Some("auth-int")
                } else {
                    log::warn!("challenge with unsupported qop '{list}'");
                    return false;
                }
            }
        };

        if realm.is_none() {
            log::warn!("challenge without realm");
            return false;
        }
        if nonce.is_none() {
            log::warn!("challenge without nonce");
            return false;
        }

        self.realm = realm;
        self.nonce = nonce;
        self.opaque = opaque;
        self.qop = qop;
        self.stale = stale;
        self.cnonce = Some(random_token(12));
        true
    }

    /// Produces the `Authorization`/`Proxy-Authorization` header value for
    /// a request. Must be called after a successful [`authenticate`].
    ///
    /// [`authenticate`]: DigestAuthentication::authenticate
    pub fn credentials(&mut self, method: Method, uri: &str, body: Option<&str>) -> String {
        let realm = self.realm.as_deref().unwrap_or_default();
        let nonce = self.nonce.as_deref().unwrap_or_default();
        let cnonce = self.cnonce.as_deref().unwrap_or_default();

        self.nc = self.nc.wrapping_add(1);
        if self.nc == 0 {
            self.nc = 1;
        }
        let nc = format!("{:08x}", self.nc);
        let response = self.response(method.as_str(), uri, body, &nc);

        let mut value = String::with_capacity(256);
        let _ = write!(
            value,
            "Digest algorithm=MD5, username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, realm, nonce, uri, response
        );
        if let Some(opaque) = &self.opaque {
            let _ = write!(value, ", opaque=\"{opaque}\"");
        }
        if let Some(qop) = self.qop {
            let _ = write!(value, ", qop={qop}, cnonce=\"{cnonce}\", nc={nc}");
        }
        value
    }

    // RFC 2617 section 3.2.2: HA1 = MD5(username:realm:password), HA2 =
    // MD5(method:uri) (body hash appended for auth-int), response =
    // MD5(HA1:nonce[:nc:cnonce:qop]:HA2).
    fn response(&self, method: &str, uri: &str, body: Option<&str>, nc: &str) -> String {
        let realm = self.realm.as_deref().unwrap_or_default();
        let nonce = self.nonce.as_deref().unwrap_or_default();
        let cnonce = self.cnonce.as_deref().unwrap_or_default();

        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, realm, self.password));
        let ha2 = match self.qop {
            Some("auth-int") => {
                let body_hash = md5_hex(body.unwrap_or(""));
                md5_hex(&format!("{method}:{uri}:{body_hash}"))
            }
            _ => md5_hex(&format!("{method}:{uri}")),
        };
        match self.qop {
            Some(qop) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
            None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str =
        "Digest realm=\"example.com\", nonce=\"ea9c8e88df84f1cec4341ae6cbe5a359\", \
         opaque=\"5ccc069c403ebaf9f0171e9517f40e41\", qop=\"auth,auth-int\"";

    #[test]
    fn test_accepts_md5_challenge() {
        let mut auth = DigestAuthentication::new("alice", "secret");

        assert!(auth.authenticate(CHALLENGE));
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let mut auth = DigestAuthentication::new("alice", "secret");

        assert!(!auth.authenticate("Digest realm=\"r\", nonce=\"n\", algorithm=SHA-256"));
    }

    #[test]
    fn test_rejects_missing_realm_or_nonce() {
        let mut auth = DigestAuthentication::new("alice", "secret");

        assert!(!auth.authenticate("Digest nonce=\"n\""));
        assert!(!auth.authenticate("Digest realm=\"r\""));
    }

    #[test]
    fn test_rejects_unusable_qop() {
        let mut auth = DigestAuthentication::new("alice", "secret");

        assert!(!auth.authenticate("Digest realm=\"r\", nonce=\"n\", qop=\"token\""));
    }

    #[test]
    fn test_prefers_auth_over_auth_int() {
        let mut auth = DigestAuthentication::new("alice", "secret");
        auth.authenticate(CHALLENGE);

        let value = auth.credentials(Method::Register, "sip:example.com", None);
        assert!(value.contains("qop=auth,"));
        assert!(!value.contains("auth-int"));
    }

    #[test]
    fn test_rfc2617_known_answer() {
        // RFC 2617 section 3.5: GET /dir/index.html by Mufasa against
        // realm "testrealm@host.com" with the pinned cnonce must yield
        // the published response digest. This covers the whole
        // HA1/HA2/response chain, field order and colons included.
        let mut auth = DigestAuthentication::new("Mufasa", "Circle Of Life");
        let ok = auth.authenticate(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        );
        assert!(ok);
        auth.cnonce = Some("0a4f113b".to_string());

        let response = auth.response("GET", "/dir/index.html", None, "00000001");

        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_credentials_header_carries_computed_response() {
        let mut auth = DigestAuthentication::new("Mufasa", "Circle Of Life");
        let ok = auth.authenticate(
            "Digest realm=\"testrealm@host.com\", qop=\"auth\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        );
        assert!(ok);
        auth.cnonce = Some("0a4f113b".to_string());
        let expected = auth.response("REGISTER", "sip:registrar.example.com", None, "00000001");

        let value = auth.credentials(Method::Register, "sip:registrar.example.com", None);

        assert!(value.starts_with("Digest algorithm=MD5, username=\"Mufasa\""));
        assert!(value.contains(&format!("response=\"{expected}\"")));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_nonce_count_increments() {
        let mut auth = DigestAuthentication::new("alice", "secret");
        auth.authenticate(CHALLENGE);

        let first = auth.credentials(Method::Register, "sip:example.com", None);
        let second = auth.credentials(Method::Register, "sip:example.com", None);

        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_stale_flag_parsed() {
        let mut auth = DigestAuthentication::new("alice", "secret");
        auth.authenticate("Digest realm=\"r\", nonce=\"n\", stale=true");

        assert!(auth.stale());
    }
}
