//! Session state tracking for the messaging channel.
//!
//! The monitor task owns the lifecycle event receiver, mirrors each event
//! into [`Session`] and onto the broadcaster, and asks the channel for a
//! fresh session after a logout.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::{ChannelEvent, MessagingChannel};
use crate::events::{Broadcaster, Event};

/// Where the channel session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    AwaitingScan,
    Authenticated,
    Ready,
}

/// Shared view of the session state. Cloning is cheap.
#[derive(Clone)]
pub struct Session {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn set(&self, state: SessionState) {
        self.tx.send_replace(state);
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

/// Apply one lifecycle event: update the session, notify observers, and
/// reconnect after a logout.
pub async fn handle_channel_event(
    event: ChannelEvent,
    channel: &dyn MessagingChannel,
    session: &Session,
    broadcaster: &Broadcaster,
) {
    match event {
        ChannelEvent::QrReady { qr } => {
            info!(qr_length = qr.len(), "channel_qr_ready");
            session.set(SessionState::AwaitingScan);
            broadcaster.publish(Event::Qr(qr));
        }
        ChannelEvent::Authenticated => {
            info!("channel_authenticated");
            session.set(SessionState::Authenticated);
            broadcaster.publish(Event::Authenticated);
        }
        ChannelEvent::Ready => {
            info!("channel_ready");
            session.set(SessionState::Ready);
            broadcaster.publish(Event::Ready);
        }
        ChannelEvent::LoggedOut => {
            warn!("channel_logged_out");
            session.set(SessionState::Disconnected);
            broadcaster.publish(Event::WhatsappLogout);

            if let Err(e) = channel.reconnect().await {
                error!(error = %e, "channel_reconnect_failed");
            }
        }
    }
}

/// Spawn the task that consumes lifecycle events until the sender side closes.
pub fn spawn_session_monitor(
    channel: Arc<dyn MessagingChannel>,
    session: Session,
    broadcaster: Broadcaster,
    mut events: mpsc::Receiver<ChannelEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_channel_event(event, channel.as_ref(), &session, &broadcaster).await;
        }
        info!("session_monitor_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::contacts::ContactRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ReconnectCounter {
        reconnects: AtomicUsize,
    }

    #[async_trait]
    impl MessagingChannel for ReconnectCounter {
        async fn is_registered(&self, _chat_id: &str) -> Result<bool, ChannelError> {
            Ok(true)
        }
        async fn send(&self, _chat_id: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn logout(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), ChannelError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_updates_state_and_publishes() {
        let channel = ReconnectCounter::default();
        let session = Session::new();
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        let mut sub = broadcaster.subscribe().await;
        sub.try_recv();

        assert_eq!(session.state(), SessionState::Disconnected);

        handle_channel_event(
            ChannelEvent::QrReady { qr: "2@xyz".to_string() },
            &channel,
            &session,
            &broadcaster,
        )
        .await;
        assert_eq!(session.state(), SessionState::AwaitingScan);
        assert_eq!(sub.try_recv(), Some(Event::Qr("2@xyz".to_string())));

        handle_channel_event(ChannelEvent::Authenticated, &channel, &session, &broadcaster).await;
        handle_channel_event(ChannelEvent::Ready, &channel, &session, &broadcaster).await;
        assert!(session.is_ready());
        assert_eq!(sub.try_recv(), Some(Event::Authenticated));
        assert_eq!(sub.try_recv(), Some(Event::Ready));
    }

    #[tokio::test]
    async fn test_logout_reconnects() {
        let channel = ReconnectCounter::default();
        let session = Session::new();
        session.set(SessionState::Ready);
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        let mut sub = broadcaster.subscribe().await;
        sub.try_recv();

        handle_channel_event(ChannelEvent::LoggedOut, &channel, &session, &broadcaster).await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(sub.try_recv(), Some(Event::WhatsappLogout));
        assert_eq!(channel.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_monitor_survives_repeated_reconnects() {
        let channel = Arc::new(ReconnectCounter::default());
        let session = Session::new();
        let broadcaster = Broadcaster::new(ContactRegistry::new("92"));
        let (tx, rx) = mpsc::channel(8);
        let mut watcher = session.watch();

        let handle = spawn_session_monitor(channel.clone(), session.clone(), broadcaster, rx);

        for _ in 0..2 {
            tx.send(ChannelEvent::Ready).await.unwrap();
            tx.send(ChannelEvent::LoggedOut).await.unwrap();
        }
        tx.send(ChannelEvent::Ready).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(session.is_ready());
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), SessionState::Ready);
        assert_eq!(channel.reconnects.load(Ordering::SeqCst), 2);
    }
}
