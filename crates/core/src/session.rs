//! Conversation Session Management
//!
//! Owns the single live session with the external conversation service.
//! Every created session gets a new generation number, and everything the
//! session reports back (stream events and send failures) is tagged with it
//! so the coordinator can drop leftovers from a session it already replaced.

use crate::models::Topic;
use crate::prompt::opening_turn;
use crate::stream::{ConversationEvent, StreamEvent};
use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// The event feed of one chat session.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ConversationEvent>> + Send>>;

/// Bound of the channel between session feeds and the coordinator.
pub const SESSION_EVENT_BUFFER: usize = 64;

/// A factory for chat sessions on an external conversation service.
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn create_session(&self, system_prompt: &str) -> Result<Arc<dyn ChatSession>>;
}

/// One conversation on the external service.
#[async_trait]
pub trait ChatSession: Send + Sync {
    /// Submits a human turn. The avatar's reply arrives on the event stream.
    async fn send_message(&self, text: &str) -> Result<()>;

    /// Opens the session's event feed. Dropping the stream unsubscribes.
    fn subscribe(&self) -> Result<EventStream>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Message is blank")]
    BlankMessage,
    #[error("No active conversation session")]
    NoSession,
    #[error("Failed to create conversation session: {0:#}")]
    Create(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    Stream(StreamEvent),
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn ChatSession>,
    feed: JoinHandle<()>,
    sends: Vec<JoinHandle<()>>,
}

pub struct SessionManager {
    service: Arc<dyn ConversationService>,
    system_prompt: Arc<String>,
    events_tx: mpsc::Sender<SessionEvent>,
    active: Option<ActiveSession>,
    generation: u64,
}

impl SessionManager {
    /// Creates a manager and the receiving end of its tagged event channel.
    pub fn new(
        service: Arc<dyn ConversationService>,
        system_prompt: Arc<String>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let manager = Self {
            service,
            system_prompt,
            events_tx,
            active: None,
            generation: 0,
        };
        (manager, events_rx)
    }

    /// The generation of the current session, or of the last one destroyed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Whether an event belongs to the live session.
    pub fn is_current(&self, event: &SessionEvent) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == event.generation)
    }

    /// Replaces any existing session with a new one for `topic`, subscribes to
    /// it, and sends the opening turn.
    pub async fn create(&mut self, topic: &Topic) -> Result<u64, SessionError> {
        self.destroy();
        self.generation += 1;
        let generation = self.generation;

        let session = self
            .service
            .create_session(&self.system_prompt)
            .await
            .map_err(SessionError::Create)?;
        let stream = session.subscribe().map_err(SessionError::Create)?;
        let feed = spawn_feed(generation, stream, self.events_tx.clone());

        self.active = Some(ActiveSession {
            generation,
            session,
            feed,
            sends: Vec::new(),
        });
        info!(
            generation,
            topic = %topic.topic,
            subject = %topic.subject,
            "Conversation session created"
        );

        self.send(&opening_turn(topic))?;
        Ok(generation)
    }

    /// Forwards a human turn without waiting for the service. A failure is
    /// reported back as [`SessionEventKind::SendFailed`]. The send task lives
    /// only as long as the session does.
    pub fn send(&mut self, text: &str) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::BlankMessage);
        }
        let active = self.active.as_mut().ok_or(SessionError::NoSession)?;
        active.sends.retain(|handle| !handle.is_finished());

        let session = active.session.clone();
        let generation = active.generation;
        let events_tx = self.events_tx.clone();
        let text = text.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = session.send_message(&text).await {
                error!(generation, error = ?e, "Failed to send message");
                let event = SessionEvent {
                    generation,
                    kind: SessionEventKind::SendFailed(format!("{e:#}")),
                };
                let _ = events_tx.send(event).await;
            }
        });
        active.sends.push(handle);
        Ok(())
    }

    /// Unsubscribes from the live session and cancels its in-flight sends.
    /// Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(active) = self.active.take() {
            active.feed.abort();
            for send in &active.sends {
                send.abort();
            }
            info!(generation = active.generation, "Conversation session destroyed");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pumps one session's feed into the shared channel, tagging each event.
fn spawn_feed(
    generation: u64,
    mut stream: EventStream,
    events_tx: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("session_feed", generation);
    tokio::spawn(
        async move {
            while let Some(item) = stream.next().await {
                let events = match item {
                    Ok(event) => event.into_stream_events(),
                    Err(e) => {
                        warn!(error = ?e, "Conversation stream error");
                        vec![StreamEvent::Error(format!("{e:#}"))]
                    }
                };
                for event in events {
                    let tagged = SessionEvent {
                        generation,
                        kind: SessionEventKind::Stream(event),
                    };
                    if events_tx.send(tagged).await.is_err() {
                        debug!("Session event receiver dropped; stopping feed");
                        return;
                    }
                }
            }
            debug!("Conversation stream ended");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct FakeSession {
        sent: Mutex<Vec<String>>,
        feed: Mutex<Option<mpsc::UnboundedReceiver<Result<ConversationEvent>>>>,
        fail_sends: bool,
        hang_sends: bool,
        cancelled_sends: AtomicUsize,
    }

    /// Counts sends whose future was dropped before completing.
    struct CancelGuard<'a>(&'a AtomicUsize);

    impl Drop for CancelGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChatSession for FakeSession {
        async fn send_message(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            if self.hang_sends {
                let _guard = CancelGuard(&self.cancelled_sends);
                std::future::pending::<()>().await;
            }
            if self.fail_sends {
                Err(anyhow!("network down"))
            } else {
                Ok(())
            }
        }

        fn subscribe(&self) -> Result<EventStream> {
            let rx = self
                .feed
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("already subscribed"))?;
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }
    }

    /// Hands out sessions and keeps the sending half of each feed.
    #[derive(Default)]
    struct FakeService {
        sessions: Mutex<Vec<(Arc<FakeSession>, mpsc::UnboundedSender<Result<ConversationEvent>>)>>,
        fail_create: bool,
        fail_sends: bool,
        hang_sends: bool,
    }

    #[async_trait]
    impl ConversationService for FakeService {
        async fn create_session(&self, _system_prompt: &str) -> Result<Arc<dyn ChatSession>> {
            if self.fail_create {
                return Err(anyhow!("unauthorized"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Arc::new(FakeSession {
                sent: Mutex::new(Vec::new()),
                feed: Mutex::new(Some(rx)),
                fail_sends: self.fail_sends,
                hang_sends: self.hang_sends,
                cancelled_sends: AtomicUsize::new(0),
            });
            self.sessions.lock().unwrap().push((session.clone(), tx));
            Ok(session)
        }
    }

    impl FakeService {
        fn session(
            &self,
            i: usize,
        ) -> (Arc<FakeSession>, mpsc::UnboundedSender<Result<ConversationEvent>>) {
            self.sessions.lock().unwrap()[i].clone()
        }
    }

    fn manager(service: Arc<FakeService>) -> (SessionManager, mpsc::Receiver<SessionEvent>) {
        SessionManager::new(service, Arc::new("persona".to_string()))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_create_sends_opening_turn() {
        let service = Arc::new(FakeService::default());
        let (mut manager, _rx) = manager(service.clone());

        let generation = manager.create(&Topic::new("Velocity", "Physics")).await.unwrap();
        assert_eq!(generation, 1);
        assert!(manager.is_active());
        settle().await;

        let (session, _) = service.session(0);
        assert_eq!(
            *session.sent.lock().unwrap(),
            vec![
                "I am trying to learn about Velocity in Physics. I know nothing about it."
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_generation() {
        let service = Arc::new(FakeService::default());
        let (mut manager, mut rx) = manager(service.clone());
        manager.create(&Topic::new("a", "b")).await.unwrap();

        let (_, feed) = service.session(0);
        feed.send(Ok(ConversationEvent::fragment("hi"))).unwrap();
        feed.send(Ok(ConversationEvent::terminal("end_turn"))).unwrap();
        feed.send(Err(anyhow!("throttled"))).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            SessionEvent {
                generation: 1,
                kind: SessionEventKind::Stream(StreamEvent::Fragment("hi".to_string())),
            }
        );
        assert!(manager.is_current(&first));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            SessionEventKind::Stream(StreamEvent::Terminal { .. })
        ));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            SessionEventKind::Stream(StreamEvent::Error(e)) if e.contains("throttled")
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_blank_and_missing_session() {
        let service = Arc::new(FakeService::default());
        let (mut manager, _rx) = manager(service);

        assert!(matches!(manager.send("hello"), Err(SessionError::NoSession)));
        manager.create(&Topic::new("a", "b")).await.unwrap();
        assert!(matches!(manager.send("   \n"), Err(SessionError::BlankMessage)));
        assert!(manager.send("hello").is_ok());
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_as_event() {
        let service = Arc::new(FakeService {
            fail_sends: true,
            ..Default::default()
        });
        let (mut manager, mut rx) = manager(service);
        let result = manager.create(&Topic::new("a", "b")).await;
        assert!(result.is_ok());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 1);
        assert!(
            matches!(event.kind, SessionEventKind::SendFailed(e) if e.contains("network down"))
        );
    }

    #[tokio::test]
    async fn test_destroy_cancels_in_flight_sends() {
        let service = Arc::new(FakeService {
            hang_sends: true,
            ..Default::default()
        });
        let (mut manager, _rx) = manager(service.clone());
        manager.create(&Topic::new("a", "b")).await.unwrap();
        manager.send("still streaming").unwrap();
        settle().await;

        let (session, _) = service.session(0);
        assert_eq!(session.sent.lock().unwrap().len(), 2);
        assert_eq!(session.cancelled_sends.load(Ordering::SeqCst), 0);

        manager.create(&Topic::new("c", "d")).await.unwrap();
        settle().await;
        assert_eq!(session.cancelled_sends.load(Ordering::SeqCst), 2);

        let (replacement, _) = service.session(1);
        assert_eq!(replacement.cancelled_sends.load(Ordering::SeqCst), 0);
        manager.destroy();
        settle().await;
        assert_eq!(replacement.cancelled_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_session() {
        let service = Arc::new(FakeService {
            fail_create: true,
            ..Default::default()
        });
        let (mut manager, _rx) = manager(service);

        let err = manager.create(&Topic::new("a", "b")).await.unwrap_err();
        assert!(matches!(err, SessionError::Create(_)));
        assert!(err.to_string().contains("unauthorized"));
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_recreate_replaces_session_and_stales_old_events() {
        let service = Arc::new(FakeService::default());
        let (mut manager, mut rx) = manager(service.clone());

        manager.create(&Topic::new("a", "b")).await.unwrap();
        let (_, old_feed) = service.session(0);
        old_feed.send(Ok(ConversationEvent::fragment("old"))).unwrap();
        let old_event = rx.recv().await.unwrap();

        manager.create(&Topic::new("c", "d")).await.unwrap();
        assert_eq!(manager.generation(), 2);
        assert!(!manager.is_current(&old_event));

        // The old feed is unsubscribed: nothing it sends reaches the channel.
        let _ = old_feed.send(Ok(ConversationEvent::fragment("late")));
        let (_, new_feed) = service.session(1);
        new_feed.send(Ok(ConversationEvent::fragment("new"))).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 2);
        assert!(manager.is_current(&event));
        assert_eq!(
            event.kind,
            SessionEventKind::Stream(StreamEvent::Fragment("new".to_string()))
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let service = Arc::new(FakeService::default());
        let (mut manager, _rx) = manager(service);
        manager.create(&Topic::new("a", "b")).await.unwrap();

        manager.destroy();
        manager.destroy();
        assert!(!manager.is_active());
        assert!(matches!(manager.send("hello"), Err(SessionError::NoSession)));
    }
}
