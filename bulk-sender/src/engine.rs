//! Bulk send engine - paces one campaign through the messaging channel.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle → Running → Completed | Stopped → (next start) Running
//! ```
//!
//! A campaign freezes its roster (contact identities, in registry order) at
//! start. Each step resolves the next identity against the live registry, so
//! name edits are seen and removed contacts are skipped without a send or a
//! delay. Steps run on a single worker task, one after another, separated by
//! the configured delay. `stop()` cancels cooperatively: an in-flight channel
//! call finishes, the next step never starts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{MessagingChannel, Session};
use crate::contacts::{ContactRegistry, ContactStatus};
use crate::events::{Broadcaster, DeliveryOutcome, DeliveryStatus, Event, ProgressEvent};
use crate::spintax;
use crate::util::{chat_id, normalize_address};

/// Addressing rules applied on every delivery attempt.
#[derive(Debug, Clone)]
pub struct AddressingRules {
    pub country_code: String,
    pub chat_id_suffix: String,
}

/// Parameters of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub template: String,
    pub delay_ms: u64,
    #[serde(default)]
    pub use_spintax: bool,
    /// Roster index of the first contact to attempt
    #[serde(default)]
    pub resume_from: usize,
}

/// Reasons a campaign cannot start. None of them change engine state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("sending already in progress")]
    AlreadyRunning,

    #[error("no contacts to send to")]
    NoContacts,

    #[error("message is empty")]
    EmptyMessage,

    #[error("WhatsApp is not connected")]
    ChannelNotReady,

    #[error("cannot resume from {resume_from}: only {total} contacts")]
    InvalidResume { resume_from: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignPhase {
    Idle,
    Running,
    Completed,
    Stopped,
}

/// Snapshot of the engine for the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatus {
    pub running: bool,
    pub sent_count: usize,
    pub total: usize,
    pub phase: CampaignPhase,
}

struct Campaign {
    template: String,
    use_spintax: bool,
    delay: Duration,
    /// Identity keys in send order
    roster: Vec<String>,
    cursor: AtomicUsize,
    cancel: CancellationToken,
}

impl Campaign {
    fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn advance(&self) {
        self.cursor.fetch_add(1, Ordering::SeqCst);
    }

    fn total(&self) -> usize {
        self.roster.len()
    }
}

type WorkerDone = Shared<BoxFuture<'static, ()>>;

struct EngineState {
    phase: CampaignPhase,
    campaign: Option<Arc<Campaign>>,
    /// Completes when the most recent worker task has exited
    worker: Option<WorkerDone>,
}

struct EngineInner {
    registry: ContactRegistry,
    broadcaster: Broadcaster,
    channel: Arc<dyn MessagingChannel>,
    session: Session,
    rules: AddressingRules,
    state: Mutex<EngineState>,
}

enum StepOutcome {
    Attempted,
    Skipped,
    Cancelled,
}

/// The single campaign runner of a process. Cloning is cheap.
#[derive(Clone)]
pub struct BulkSendEngine {
    inner: Arc<EngineInner>,
}

impl BulkSendEngine {
    pub fn new(
        registry: ContactRegistry,
        broadcaster: Broadcaster,
        channel: Arc<dyn MessagingChannel>,
        session: Session,
        rules: AddressingRules,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                broadcaster,
                channel,
                session,
                rules,
                state: Mutex::new(EngineState {
                    phase: CampaignPhase::Idle,
                    campaign: None,
                    worker: None,
                }),
            }),
        }
    }

    /// Start a campaign over the current registry contents.
    ///
    /// Returns as soon as the worker is scheduled; progress is reported only
    /// through the broadcaster.
    pub async fn start(&self, request: StartRequest) -> Result<CampaignStatus, StartError> {
        let inner = &self.inner;
        let snapshot = inner.registry.snapshot().await;

        let mut state = inner.state();

        if state.phase == CampaignPhase::Running {
            warn!("campaign_start_rejected_already_running");
            return Err(StartError::AlreadyRunning);
        }
        if snapshot.is_empty() {
            return Err(StartError::NoContacts);
        }
        if request.template.trim().is_empty() {
            return Err(StartError::EmptyMessage);
        }
        if !inner.session.is_ready() {
            warn!(session = ?inner.session.state(), "campaign_start_rejected_channel_not_ready");
            return Err(StartError::ChannelNotReady);
        }
        if request.resume_from >= snapshot.len() {
            return Err(StartError::InvalidResume {
                resume_from: request.resume_from,
                total: snapshot.len(),
            });
        }

        let campaign = Arc::new(Campaign {
            template: request.template,
            use_spintax: request.use_spintax,
            delay: Duration::from_millis(request.delay_ms),
            roster: snapshot
                .iter()
                .map(|c| inner.registry.identity(&c.address))
                .collect(),
            cursor: AtomicUsize::new(request.resume_from),
            cancel: CancellationToken::new(),
        });

        info!(
            total = campaign.total(),
            resume_from = request.resume_from,
            delay_ms = request.delay_ms,
            use_spintax = campaign.use_spintax,
            "campaign_started"
        );

        let previous = state.worker.take();
        let worker_inner = Arc::clone(inner);
        let worker_campaign = Arc::clone(&campaign);
        let task = tokio::spawn(async move {
            // The previous worker may still be finishing an in-flight step
            if let Some(previous) = previous {
                previous.await;
            }
            worker_inner.run(worker_campaign).await;
        });

        state.worker = Some(task.map(|_| ()).boxed().shared());
        state.phase = CampaignPhase::Running;
        state.campaign = Some(campaign);

        Ok(status_of(&state))
    }

    /// Stop the running campaign. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state();

        let campaign = match (&state.phase, &state.campaign) {
            (CampaignPhase::Running, Some(campaign)) => Arc::clone(campaign),
            _ => return false,
        };

        campaign.cancel.cancel();
        state.phase = CampaignPhase::Stopped;

        info!(sent = campaign.cursor(), total = campaign.total(), "campaign_stopped");

        self.inner.broadcaster.publish(Event::SendProgress(ProgressEvent {
            sent: campaign.cursor(),
            total: campaign.total(),
            current_address: None,
            current_name: None,
            status: "Stopped".to_string(),
        }));

        true
    }

    pub fn status(&self) -> CampaignStatus {
        status_of(&self.inner.state())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().phase == CampaignPhase::Running
    }

    /// Wait until the most recently started worker has exited.
    pub async fn wait_idle(&self) {
        let worker = self.inner.state().worker.clone();
        if let Some(worker) = worker {
            worker.await;
        }
    }
}

fn status_of(state: &EngineState) -> CampaignStatus {
    let (sent_count, total) = state
        .campaign
        .as_ref()
        .map(|c| (c.cursor(), c.total()))
        .unwrap_or((0, 0));

    CampaignStatus {
        running: state.phase == CampaignPhase::Running,
        sent_count,
        total,
        phase: state.phase,
    }
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>, campaign: Arc<Campaign>) {
        loop {
            if campaign.cancel.is_cancelled() {
                info!(sent = campaign.cursor(), "campaign_worker_exited_after_stop");
                return;
            }

            if campaign.cursor() >= campaign.total() {
                self.complete(&campaign);
                return;
            }

            match self.step(&campaign).await {
                StepOutcome::Attempted => {}
                StepOutcome::Skipped => continue,
                StepOutcome::Cancelled => return,
            }

            tokio::select! {
                _ = campaign.cancel.cancelled() => {
                    info!(sent = campaign.cursor(), "campaign_worker_exited_after_stop");
                    return;
                }
                _ = sleep(campaign.delay) => {}
            }
        }
    }

    /// Attempt delivery to the contact under the cursor.
    async fn step(&self, campaign: &Campaign) -> StepOutcome {
        let cursor = campaign.cursor();
        let total = campaign.total();
        let key = &campaign.roster[cursor];

        let contact = match self.registry.find(key).await {
            Some(contact) => contact,
            None => {
                warn!(cursor = cursor, identity = %key, "campaign_contact_removed_skipped");
                campaign.advance();
                return StepOutcome::Skipped;
            }
        };

        let message = if campaign.use_spintax {
            spintax::expand(&campaign.template)
        } else {
            campaign.template.clone()
        };

        let label = contact
            .display_name
            .clone()
            .unwrap_or_else(|| contact.address.clone());

        let progress = Event::SendProgress(ProgressEvent {
            sent: cursor,
            total,
            current_address: Some(contact.address.clone()),
            current_name: contact.display_name.clone(),
            status: format!("Sending to {}...", label),
        });
        if !self.publish_if_active(campaign, progress) {
            return StepOutcome::Cancelled;
        }

        self.registry
            .set_status(&contact.address, ContactStatus::Sending)
            .await;
        self.broadcaster.publish_contacts().await;

        let normalized = normalize_address(&contact.address, &self.rules.country_code);
        let chat = chat_id(&normalized, &self.rules.chat_id_suffix);

        info!(cursor = cursor, total = total, chat_id = %chat, "campaign_sending");

        let delivered = match self.channel.is_registered(&chat).await {
            Ok(false) => {
                warn!(chat_id = %chat, "contact_not_registered");
                false
            }
            Err(e) => {
                error!(chat_id = %chat, error = %e, "contact_registration_check_failed");
                false
            }
            Ok(true) => match self.channel.send(&chat, &message).await {
                Ok(()) => {
                    info!(chat_id = %chat, "contact_send_succeeded");
                    true
                }
                Err(e) => {
                    error!(chat_id = %chat, error = %e, "contact_send_failed");
                    false
                }
            },
        };

        let (contact_status, delivery_status) = if delivered {
            (ContactStatus::Sent, DeliveryStatus::Sent)
        } else {
            (ContactStatus::Failed, DeliveryStatus::Failed)
        };

        self.registry
            .set_status(&contact.address, contact_status)
            .await;
        campaign.advance();

        self.broadcaster.publish(Event::MessageStatus(DeliveryOutcome {
            address: contact.address,
            name: contact.display_name,
            message,
            status: delivery_status,
            timestamp: Utc::now(),
        }));
        self.broadcaster.publish_contacts().await;

        StepOutcome::Attempted
    }

    /// Publish a progress event unless the campaign was stopped meanwhile.
    /// Holding the state lock orders it against `stop()`'s own event.
    fn publish_if_active(&self, campaign: &Campaign, event: Event) -> bool {
        let _state = self.state();
        if campaign.cancel.is_cancelled() {
            return false;
        }
        self.broadcaster.publish(event);
        true
    }

    fn complete(&self, campaign: &Arc<Campaign>) {
        let mut state = self.state();
        if campaign.cancel.is_cancelled() {
            return;
        }

        let is_current = state
            .campaign
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, campaign));
        if is_current {
            state.phase = CampaignPhase::Completed;
        }

        info!(sent = campaign.cursor(), total = campaign.total(), "campaign_completed");

        self.broadcaster.publish(Event::SendProgress(ProgressEvent {
            sent: campaign.cursor(),
            total: campaign.total(),
            current_address: None,
            current_name: None,
            status: "Completed".to_string(),
        }));
    }
}
