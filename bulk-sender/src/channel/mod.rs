//! Messaging channel abstraction.
//!
//! The engine only needs two delivery operations (`is_registered`, `send`)
//! plus session control. Session lifecycle arrives separately as a stream of
//! [`ChannelEvent`]s which the [`session`] monitor consumes, so the stream
//! outlives any reconnect of the underlying connection.
//!
//! ## Implementations
//!
//! - [`BridgeChannel`]: HTTP client for the WhatsApp bridge sidecar

pub mod bridge;
pub mod session;

use async_trait::async_trait;
use serde::Deserialize;

pub use bridge::{spawn_event_listener, BridgeChannel};
pub use session::{handle_channel_event, spawn_session_monitor, Session, SessionState};

/// Errors from a messaging channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The session is not linked or has been logged out.
    #[error("not connected to WhatsApp")]
    NotConnected,

    /// The bridge answered but reported a failure.
    #[error("bridge error: {0}")]
    Bridge(String),
}

/// Session lifecycle notifications emitted by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelEvent {
    /// A QR code must be scanned to link the session.
    QrReady { qr: String },
    Authenticated,
    /// The session can send messages.
    Ready,
    /// The session was logged out (remotely or by us).
    LoggedOut,
}

/// Delivery and session control for one messaging account.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Whether `chat_id` belongs to a registered account.
    async fn is_registered(&self, chat_id: &str) -> Result<bool, ChannelError>;

    /// Deliver `text` to `chat_id`.
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// End the session and discard its stored credentials.
    async fn logout(&self) -> Result<(), ChannelError>;

    /// Start a fresh session after a logout; a new `QrReady` follows.
    async fn reconnect(&self) -> Result<(), ChannelError>;
}
