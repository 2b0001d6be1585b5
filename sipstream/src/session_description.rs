//! Session-description handler surface.
//!
//! Media negotiation is an external collaborator: the session machines
//! ask it for offers and answers and install remote descriptions, but
//! never look inside the SDP.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Body;

/// Offer/answer state of a handler, mirrored after the last
/// get/set/rollback call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdhState {
    /// No negotiation in progress; `get_description` yields an offer.
    Stable,
    /// We produced an offer and await the answer.
    HasLocalOffer,
    /// A remote offer is installed; `get_description` yields the answer.
    HasRemoteOffer,
}

/// Knobs for producing a description.
#[derive(Debug, Clone, Default)]
pub struct DescriptionOptions {
    /// Produce a hold (sendonly/inactive) description.
    pub hold: bool,
}

/// The per-dialog media collaborator.
#[async_trait]
pub trait SessionDescriptionHandler: Send + Sync {
    /// Produces an offer (Stable) or an answer (HasRemoteOffer).
    async fn get_description(&self, options: &DescriptionOptions) -> Result<Body>;

    /// Installs the remote description (their offer or their answer).
    async fn set_description(&self, content: &str, content_type: &str) -> Result<()>;

    /// Whether this handler understands bodies of `content_type`.
    fn has_description(&self, content_type: &str) -> bool;

    /// Discards a half-done negotiation (a re-offer the far end
    /// rejected).
    async fn rollback_description(&self) -> Result<()>;

    async fn send_dtmf(&self, tones: &str) -> Result<()>;

    fn state(&self) -> SdhState;

    /// Releases the handler. Idempotent.
    fn close(&self);
}

/// Creates a fresh handler for each session.
pub type SessionDescriptionHandlerFactory =
    std::sync::Arc<dyn Fn() -> std::sync::Arc<dyn SessionDescriptionHandler> + Send + Sync>;
