//! Small helpers shared across modules.

pub mod address;

pub use address::{chat_id, normalize_address};
