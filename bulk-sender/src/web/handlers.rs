//! HTTP handlers for the control API and the event stream.
//!
//! Every JSON response has the shape `{"success": bool, "error"?: string, ...}`.
//! Business rejections carry a 4xx/503 status, and so do bodies or paths the
//! extractors cannot decode; nothing here panics or lets an engine error
//! escape as a 500.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::auth::{bearer_token, verify_token, AuthError};
use crate::channel::{MessagingChannel, Session};
use crate::contacts::{ContactInput, ContactRegistry, RegistryError};
use crate::engine::{AddressingRules, BulkSendEngine, StartError, StartRequest};
use crate::events::Broadcaster;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ContactRegistry,
    pub broadcaster: Broadcaster,
    pub engine: BulkSendEngine,
    pub channel: Arc<dyn MessagingChannel>,
    pub session: Session,
}

impl AppState {
    /// Wire the registry, broadcaster and engine around a messaging channel.
    pub fn new(config: Config, channel: Arc<dyn MessagingChannel>, session: Session) -> Self {
        let registry = ContactRegistry::new(&config.country_code);
        let broadcaster = Broadcaster::new(registry.clone());
        let engine = BulkSendEngine::new(
            registry.clone(),
            broadcaster.clone(),
            Arc::clone(&channel),
            session.clone(),
            AddressingRules {
                country_code: config.country_code.clone(),
                chat_id_suffix: config.chat_id_suffix.clone(),
            },
        );

        Self {
            config: Arc::new(config),
            registry,
            broadcaster,
            engine,
            channel,
            session,
        }
    }
}

/// Build a `{"success": ...}` response, merging `data`'s fields in.
fn reply(status: StatusCode, error: Option<String>, data: Value) -> Response {
    let mut body = json!({ "success": error.is_none() });
    if let Some(error) = error {
        body["error"] = Value::String(error);
    }
    if let (Value::Object(body), Value::Object(data)) = (&mut body, data) {
        body.extend(data);
    }
    (status, Json(body)).into_response()
}

fn ok(data: Value) -> Response {
    reply(StatusCode::OK, None, data)
}

fn fail(status: StatusCode, error: impl ToString) -> Response {
    reply(status, Some(error.to_string()), Value::Null)
}

/// Malformed request bodies and paths get the same JSON shape as every
/// other failure.
fn rejected(status: StatusCode, detail: String) -> Response {
    warn!(status = %status, error = %detail, "request_rejected");
    fail(status, detail)
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    body.map(|Json(value)| value).map_err(|r| rejected(r.status(), r.body_text()))
}

fn path_index(path: Result<Path<usize>, PathRejection>) -> Result<usize, Response> {
    path.map(|Path(index)| index).map_err(|r| rejected(r.status(), r.body_text()))
}

fn registry_failure(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::Duplicate(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::EmptyAddress => StatusCode::BAD_REQUEST,
    };
    fail(status, e)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Event Stream
// =============================================================================

/// GET /events - server-sent event stream.
///
/// The first event is always `contactsUpdated` with the full contact list.
/// The subscription ends when the client disconnects.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.broadcaster.subscribe().await;
    info!(
        subscription = ?subscription.id(),
        observers = state.broadcaster.observer_count(),
        "event_stream_connected"
    );

    let stream = subscription.map(|event| {
        Ok::<_, Infallible>(
            SseEvent::default()
                .event(event.name())
                .data(event.data().to_string()),
        )
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// =============================================================================
// Contacts
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ReplaceContactsRequest {
    pub contacts: Vec<ContactInput>,
}

/// GET /api/contacts
pub async fn list_contacts(State(state): State<AppState>) -> Response {
    let contacts = state.registry.snapshot().await;
    ok(json!({ "contacts": contacts }))
}

/// PUT /api/contacts - merge an upload, or clear with an empty list.
pub async fn replace_contacts(
    State(state): State<AppState>,
    body: Result<Json<ReplaceContactsRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let incoming = request.contacts.len();
    let accepted = state.registry.replace_all(request.contacts).await;
    state.broadcaster.publish_contacts().await;

    ok(json!({ "accepted": accepted, "dropped": incoming - accepted }))
}

/// POST /api/contacts - add a single contact.
pub async fn add_contact(
    State(state): State<AppState>,
    body: Result<Json<ContactInput>, JsonRejection>,
) -> Response {
    let input = match json_body(body) {
        Ok(input) => input,
        Err(response) => return response,
    };

    match state.registry.append(input).await {
        Ok(contact) => {
            state.broadcaster.publish_contacts().await;
            ok(json!({ "contact": contact }))
        }
        Err(e) => {
            warn!(error = %e, "contact_add_rejected");
            registry_failure(e)
        }
    }
}

/// PATCH /api/contacts/:index
pub async fn edit_contact(
    State(state): State<AppState>,
    path: Result<Path<usize>, PathRejection>,
    body: Result<Json<ContactInput>, JsonRejection>,
) -> Response {
    let (index, input) = match (path_index(path), json_body(body)) {
        (Ok(index), Ok(input)) => (index, input),
        (Err(response), _) | (_, Err(response)) => return response,
    };
    match state.registry.edit_at(index, input).await {
        Ok(contact) => {
            state.broadcaster.publish_contacts().await;
            ok(json!({ "contact": contact }))
        }
        Err(e) => registry_failure(e),
    }
}

/// DELETE /api/contacts/:index
pub async fn remove_contact(
    State(state): State<AppState>,
    path: Result<Path<usize>, PathRejection>,
) -> Response {
    let index = match path_index(path) {
        Ok(index) => index,
        Err(response) => return response,
    };
    match state.registry.remove_at(index).await {
        Ok(contact) => {
            state.broadcaster.publish_contacts().await;
            ok(json!({ "contact": contact }))
        }
        Err(e) => registry_failure(e),
    }
}

/// DELETE /api/contacts
pub async fn clear_contacts(State(state): State<AppState>) -> Response {
    state.registry.clear().await;
    state.broadcaster.publish_contacts().await;
    ok(Value::Null)
}

// =============================================================================
// Campaign
// =============================================================================

/// Start payload. `delayMs` falls back to the configured default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCampaignRequest {
    pub template: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub use_spintax: bool,
    #[serde(default)]
    pub resume_from: usize,
}

/// POST /api/campaign/start
pub async fn start_campaign(
    State(state): State<AppState>,
    body: Result<Json<StartCampaignRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let request = StartRequest {
        template: request.template,
        delay_ms: request.delay_ms.unwrap_or(state.config.default_delay_ms),
        use_spintax: request.use_spintax,
        resume_from: request.resume_from,
    };

    match state.engine.start(request).await {
        Ok(status) => ok(json!({ "status": status })),
        Err(e) => {
            let status = match e {
                StartError::AlreadyRunning => StatusCode::CONFLICT,
                StartError::ChannelNotReady => StatusCode::SERVICE_UNAVAILABLE,
                StartError::NoContacts
                | StartError::EmptyMessage
                | StartError::InvalidResume { .. } => StatusCode::BAD_REQUEST,
            };
            fail(status, e)
        }
    }
}

/// POST /api/campaign/stop - idempotent.
pub async fn stop_campaign(State(state): State<AppState>) -> Response {
    let stopped = state.engine.stop();
    ok(json!({ "stopped": stopped, "status": state.engine.status() }))
}

/// GET /api/campaign/status
pub async fn campaign_status(State(state): State<AppState>) -> Response {
    ok(json!({ "status": state.engine.status() }))
}

// =============================================================================
// Channel
// =============================================================================

/// GET /api/channel/status
pub async fn channel_status(State(state): State<AppState>) -> Response {
    ok(json!({ "state": state.session.state() }))
}

/// POST /api/channel/disconnect - log the WhatsApp session out.
///
/// Requires a bearer token and is refused while a campaign is running.
pub async fn disconnect_channel(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let subject = match authorize(&state.config, header) {
        Ok(subject) => subject,
        Err(e) => {
            warn!(error = %e, "channel_disconnect_unauthorized");
            return fail(StatusCode::UNAUTHORIZED, e);
        }
    };

    if state.engine.is_running() {
        warn!(subject = %subject, "channel_disconnect_refused_campaign_running");
        return fail(
            StatusCode::CONFLICT,
            "cannot disconnect while sending is in progress",
        );
    }

    match state.channel.logout().await {
        Ok(()) => {
            info!(subject = %subject, "channel_disconnected");
            ok(Value::Null)
        }
        Err(e) => {
            error!(subject = %subject, error = %e, "channel_disconnect_failed");
            fail(StatusCode::BAD_GATEWAY, e)
        }
    }
}

fn authorize(config: &Config, header: Option<&str>) -> Result<String, AuthError> {
    let key = config
        .auth_signing_key
        .as_deref()
        .ok_or(AuthError::NotConfigured)?;
    let token = bearer_token(header)?;
    verify_token(key, token, config.auth_token_max_age)
}
