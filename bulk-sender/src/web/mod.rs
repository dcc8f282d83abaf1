//! Web server module: control API and live event stream.
//!
//! This module provides a thin HTTP layer over the engine:
//! - Contact registry CRUD
//! - Campaign start/stop/status
//! - Channel status and authorized disconnect
//! - Server-sent events carrying every broadcast event

pub mod handlers;

use axum::{
    routing::{get, patch, post},
    Router,
};

pub use handlers::{AppState, HealthResponse, StartCampaignRequest};

/// Build the application router (without middleware layers).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/events", get(handlers::event_stream))
        .route(
            "/api/contacts",
            get(handlers::list_contacts)
                .put(handlers::replace_contacts)
                .post(handlers::add_contact)
                .delete(handlers::clear_contacts),
        )
        .route(
            "/api/contacts/:index",
            patch(handlers::edit_contact).delete(handlers::remove_contact),
        )
        .route("/api/campaign/start", post(handlers::start_campaign))
        .route("/api/campaign/stop", post(handlers::stop_campaign))
        .route("/api/campaign/status", get(handlers::campaign_status))
        .route("/api/channel/status", get(handlers::channel_status))
        .route("/api/channel/disconnect", post(handlers::disconnect_channel))
        .with_state(state)
}
