//! HTTP client for the WhatsApp bridge sidecar.
//!
//! The sidecar owns the browser session. This client talks to its JSON API
//! and long-polls `/events/poll` for lifecycle events.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChannelError, ChannelEvent, MessagingChannel};

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// How long the bridge may hold an event poll open.
const LONG_POLL: Duration = Duration::from_secs(60);

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// Response envelope from the bridge HTTP API.
#[derive(Debug, Deserialize)]
struct BridgeResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> BridgeResponse<T> {
    fn into_result(self) -> Result<Option<T>, ChannelError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ChannelError::Bridge(
                self.error.unwrap_or_else(|| "unknown bridge error".to_string()),
            ))
        }
    }
}

/// A lookup that succeeded but carried no answer is a bridge failure, never
/// "not registered".
fn registration_answer(data: Option<bool>) -> Result<bool, ChannelError> {
    data.ok_or_else(|| ChannelError::Bridge("registration lookup returned no data".to_string()))
}

/// Messaging channel backed by the bridge sidecar.
pub struct BridgeChannel {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeChannel {
    /// Create a client for the bridge at `base_url` with a per-request timeout.
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "bridge_client_build_failed_using_default");
                reqwest::Client::default()
            });
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Option<T>, ChannelError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::CONFLICT {
            return Err(ChannelError::NotConnected);
        }
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            warn!(%status, path, body = %body_text, "bridge_request_failed");
            return Err(ChannelError::Bridge(format!("HTTP {}", status.as_u16())));
        }

        let envelope: BridgeResponse<T> = resp.json().await?;
        envelope.into_result()
    }
}

#[async_trait]
impl MessagingChannel for BridgeChannel {
    async fn is_registered(&self, chat_id: &str) -> Result<bool, ChannelError> {
        let registered: Option<bool> = self
            .post("/is-registered", serde_json::json!({ "jid": chat_id }))
            .await?;
        registration_answer(registered)
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.post::<serde_json::Value>(
            "/send",
            serde_json::json!({ "jid": chat_id, "text": text }),
        )
        .await?;
        debug!(jid = chat_id, "bridge_message_sent");
        Ok(())
    }

    async fn logout(&self) -> Result<(), ChannelError> {
        self.post::<serde_json::Value>("/logout", serde_json::json!({})).await?;
        info!("bridge_logout_requested");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        self.post::<serde_json::Value>("/reconnect", serde_json::json!({})).await?;
        info!("bridge_reconnect_requested");
        Ok(())
    }
}

/// Doubling retry delay for the event listener, reset by any good poll.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: RETRY_INITIAL }
    }

    fn reset(&mut self) {
        self.next = RETRY_INITIAL;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RETRY_MAX);
        delay
    }
}

enum PollOutcome {
    /// Batch forwarded (possibly empty after an idle long-poll)
    Forwarded(usize),
    /// Nobody consumes lifecycle events anymore
    ReceiverGone,
}

/// Spawn a listener that forwards bridge lifecycle events to `event_tx`.
///
/// Returns immediately. Failed polls are retried after a doubling delay
/// that starts over once a poll succeeds. The task ends when the receiving
/// side is dropped.
pub fn spawn_event_listener(
    base_url: String,
    event_tx: mpsc::Sender<ChannelEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll_url = format!("{}/events/poll", base_url);
        let client = match reqwest::Client::builder().timeout(LONG_POLL).build() {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "bridge_event_client_build_failed");
                return;
            }
        };
        let mut backoff = Backoff::new();

        info!(url = %poll_url, "bridge_event_listener_started");

        loop {
            match poll_once(&client, &poll_url, &event_tx).await {
                Ok(PollOutcome::ReceiverGone) => {
                    info!("bridge_event_listener_stopped");
                    return;
                }
                Ok(PollOutcome::Forwarded(count)) => {
                    if count > 0 {
                        debug!(events = count, "bridge_events_forwarded");
                    }
                    backoff.reset();
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "bridge_event_poll_failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

/// One long-poll round trip. An expired long-poll counts as an empty batch.
async fn poll_once(
    client: &reqwest::Client,
    poll_url: &str,
    event_tx: &mpsc::Sender<ChannelEvent>,
) -> Result<PollOutcome, ChannelError> {
    let resp = match client.get(poll_url).send().await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => return Ok(PollOutcome::Forwarded(0)),
        Err(e) => return Err(e.into()),
    };

    let status = resp.status();
    if !status.is_success() {
        return Err(ChannelError::Bridge(format!("HTTP {}", status.as_u16())));
    }

    let events: Vec<ChannelEvent> = resp.json().await.map_err(|e| {
        warn!(error = %e, "bridge_event_batch_dropped");
        ChannelError::Bridge(format!("undecodable event batch: {}", e))
    })?;

    let count = events.len();
    for event in events {
        debug!(?event, "bridge_event_received");
        if event_tx.send(event).await.is_err() {
            return Ok(PollOutcome::ReceiverGone);
        }
    }
    Ok(PollOutcome::Forwarded(count))
}
