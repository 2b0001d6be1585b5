use std::fmt;

use thiserror::Error;

use crate::message::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Error on parsing an inbound message or a URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ParseError {
    /// Message in error
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ParseError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl From<&str> for ParseError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParseError {
    fn from(value: String) -> Self {
        Self { message: value }
    }
}

/// Errors surfaced by the transport state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("connect attempt timed out")]
    ConnectTimeout,

    #[error("connect attempt aborted")]
    ConnectAborted,
}

/// Illegal state machine transition or a reentrant transition loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    /// A transition was requested while another transition on the same
    /// object was still in flight.
    #[error("{0}: transition loop detected")]
    LoopDetected(&'static str),

    /// The requested transition is not part of the state machine.
    #[error("{object}: invalid transition {from} -> {to}")]
    Invalid {
        object: &'static str,
        from: String,
        to: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    /// A 401/407 persisting after a credential attempt, or a challenge
    /// that could not be parsed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transaction timer expiry (Timer B/F/H).
    #[error("transaction timed out")]
    Timeout,

    /// Final non-2xx response surfaced as an operation failure.
    #[error("request failed: {code} {reason}")]
    RequestFailure {
        code: StatusCode,
        reason: String,
    },

    /// Malformed outgoing request.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// True when the error is a reentrant transition loop.
    pub fn is_transition_loop(&self) -> bool {
        matches!(
            self,
            Error::StateTransition(StateTransitionError::LoopDetected(_))
        )
    }
}
