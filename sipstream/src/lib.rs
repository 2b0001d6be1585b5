//! # sipstream
//!
//! The signaling core of a SIP user agent over a reliable,
//! message-preserving stream transport (the RFC 7118 WebSocket binding
//! is the reference shape). It covers the message model, the four
//! RFC 3261 transaction machines, dialogs, digest authentication, the
//! transport connection state machine and the transaction-user layer:
//! sessions (INVITE), registrations, publications, subscriptions and
//! pager-mode messaging.
//!
//! Media handling, SDP negotiation and the transport's actual I/O stay
//! outside; they plug in through the [`session_description`] and
//! [`transport::Connector`] seams.

pub mod auth;
pub mod core;
pub mod dialog;
pub mod message;
pub mod session_description;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod ua;

pub(crate) mod error;
pub(crate) mod fsm;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, ParseError, Result, StateTransitionError, TransportError};
pub use ua::{UserAgent, UserAgentDelegate, UserAgentOptions, UserAgentState};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use rand::Rng;

/// A random lowercase-hex token of the given length.
pub(crate) fn random_token(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

/// A fresh from/to tag (RFC 3261 wants at least 32 bits of randomness;
/// 20 hex chars gives 80).
pub(crate) fn new_tag() -> String {
    random_token(20)
}

/// A fresh Via branch, magic cookie included.
pub(crate) fn new_branch() -> String {
    format!("{}{}", message::BRANCH_MAGIC_COOKIE, random_token(12))
}
