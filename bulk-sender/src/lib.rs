//! Bulk sender - paced WhatsApp broadcasting with live progress.
//!
//! The library holds everything the `bulk-sender` binary wires together:
//! - `contacts`: the in-memory recipient list
//! - `spintax`: per-recipient message variation
//! - `events`: fan-out of progress and lifecycle events to observers
//! - `channel`: the WhatsApp bridge client and session tracking
//! - `engine`: the campaign runner
//! - `web`: the HTTP control surface and event stream
//!
//! ## Architecture
//!
//! ```text
//! Operator → Web API → BulkSendEngine → MessagingChannel → WhatsApp bridge
//!                 ↑            │
//!            ContactRegistry   └→ Broadcaster → /events observers
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod events;
pub mod spintax;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use channel::{
    BridgeChannel, ChannelError, ChannelEvent, MessagingChannel, Session, SessionState,
};
pub use config::Config;
pub use contacts::{Contact, ContactInput, ContactRegistry, ContactStatus, RegistryError};
pub use engine::{BulkSendEngine, CampaignStatus, StartError, StartRequest};
pub use events::{Broadcaster, Event, Subscription};
pub use web::AppState;
