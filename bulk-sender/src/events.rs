//! Event fan-out to observers.
//!
//! The [`Broadcaster`] knows nothing about transports: observers subscribe and
//! receive an ordered stream of [`Event`]s. The web layer turns one such
//! subscription into a server-sent event stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::contacts::{Contact, ContactRegistry};

/// Live progress of the running campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Contacts attempted so far (the campaign cursor)
    pub sent: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_name: Option<String>,
    /// Human readable status: "Sending to X...", "Completed", "Stopped"
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Result of one delivery attempt, for history display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

/// Everything observers can be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// QR payload to scan for linking the channel session
    Qr(String),
    Ready,
    Authenticated,
    SendProgress(ProgressEvent),
    ContactsUpdated(Vec<Contact>),
    MessageStatus(DeliveryOutcome),
    WhatsappLogout,
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Qr(_) => "qr",
            Event::Ready => "ready",
            Event::Authenticated => "authenticated",
            Event::SendProgress(_) => "sendProgress",
            Event::ContactsUpdated(_) => "contactsUpdated",
            Event::MessageStatus(_) => "messageStatus",
            Event::WhatsappLogout => "whatsappLogout",
        }
    }

    /// JSON payload of the event.
    pub fn data(&self) -> Value {
        match self {
            Event::Qr(qr) => Value::String(qr.clone()),
            Event::Ready => Value::String("Connected".to_string()),
            Event::Authenticated | Event::WhatsappLogout => Value::Null,
            Event::SendProgress(progress) => serde_json::to_value(progress).unwrap_or(Value::Null),
            Event::ContactsUpdated(contacts) => serde_json::json!({ "contacts": contacts }),
            Event::MessageStatus(outcome) => serde_json::to_value(outcome).unwrap_or(Value::Null),
        }
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out notifier shared by the engine, the channel session and the web
/// layer. Cloning is cheap.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

type ObserverMap = HashMap<SubscriptionId, mpsc::UnboundedSender<Event>>;

struct BroadcasterInner {
    registry: ContactRegistry,
    observers: Mutex<ObserverMap>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster that bootstraps new observers from `registry`.
    pub fn new(registry: ContactRegistry) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                registry,
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn observers(&self) -> MutexGuard<'_, ObserverMap> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every current observer. Observers that went away
    /// are dropped. Returns the number of observers reached.
    pub fn publish(&self, event: Event) -> usize {
        let name = event.name();
        let mut observers = self.observers();
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
        let reached = observers.len();
        debug!(event = name, observers = reached, "event_published");
        reached
    }

    /// Publish the current registry contents as `contactsUpdated`.
    pub async fn publish_contacts(&self) -> usize {
        let contacts = self.inner.registry.snapshot().await;
        self.publish(Event::ContactsUpdated(contacts))
    }

    /// Register a new observer. Its first event is always a
    /// `contactsUpdated` carrying the full registry snapshot.
    pub async fn subscribe(&self) -> Subscription {
        let contacts = self.inner.registry.snapshot().await;
        let (tx, rx) = mpsc::unbounded_channel();
        // rx is alive, so this cannot fail
        let _ = tx.send(Event::ContactsUpdated(contacts));

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.observers();
        observers.insert(id, tx);
        debug!(subscription = id.0, observers = observers.len(), "observer_subscribed");

        Subscription {
            id,
            events: rx,
            broadcaster: self.clone(),
        }
    }

    /// Remove an observer. Unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.observers().remove(&id).is_some() {
            debug!(subscription = id.0, "observer_unsubscribed");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers().len()
    }
}

/// One observer's ordered event stream. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<Event>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactInput;

    fn progress(sent: usize) -> Event {
        Event::SendProgress(ProgressEvent {
            sent,
            total: 3,
            current_address: None,
            current_name: None,
            status: "Completed".to_string(),
        })
    }

    #[tokio::test]
    async fn test_subscribe_bootstraps_with_snapshot() {
        let registry = ContactRegistry::new("92");
        registry
            .append(ContactInput::new("03001111111", Some("Ali")))
            .await
            .unwrap();
        let broadcaster = Broadcaster::new(registry);

        let mut sub = broadcaster.subscribe().await;
        match sub.try_recv() {
            Some(Event::ContactsUpdated(contacts)) => {
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].address, "03001111111");
            }
            other => panic!("expected contactsUpdated, got {:?}", other),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_all_in_order() {
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        let mut a = broadcaster.subscribe().await;
        let mut b = broadcaster.subscribe().await;
        a.try_recv();
        b.try_recv();

        assert_eq!(broadcaster.publish(progress(0)), 2);
        assert_eq!(broadcaster.publish(progress(1)), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.try_recv(), Some(progress(0)));
            assert_eq!(sub.try_recv(), Some(progress(1)));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        assert_eq!(broadcaster.publish(progress(0)), 0);

        let mut late = broadcaster.subscribe().await;
        assert!(matches!(late.try_recv(), Some(Event::ContactsUpdated(_))));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        let a = broadcaster.subscribe().await;
        let b = broadcaster.subscribe().await;
        assert_eq!(broadcaster.observer_count(), 2);

        broadcaster.unsubscribe(a.id());
        assert_eq!(broadcaster.observer_count(), 1);

        drop(b);
        assert_eq!(broadcaster.observer_count(), 0);
        assert_eq!(broadcaster.publish(Event::Ready), 0);
    }

    #[test]
    fn test_event_names_and_payloads() {
        assert_eq!(Event::Ready.name(), "ready");
        assert_eq!(Event::Ready.data(), Value::String("Connected".to_string()));
        assert_eq!(Event::WhatsappLogout.name(), "whatsappLogout");
        assert_eq!(Event::Qr("abc".to_string()).data(), Value::String("abc".to_string()));

        let data = progress(2).data();
        assert_eq!(data["sent"], 2);
        assert_eq!(data["total"], 3);
        assert!(data.get("currentAddress").is_none());

        let outcome = Event::MessageStatus(DeliveryOutcome {
            address: "03001111111".to_string(),
            name: None,
            message: "Hi".to_string(),
            status: DeliveryStatus::Failed,
            timestamp: Utc::now(),
        });
        assert_eq!(outcome.name(), "messageStatus");
        assert_eq!(outcome.data()["status"], "failed");
    }
}
