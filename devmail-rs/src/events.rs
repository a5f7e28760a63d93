//! Store event notifications
//!
//! Handlers registered with [`EventBus::on`] are dispatched as independent
//! tasks on every emit, so a slow or panicking subscriber never holds up the
//! store. [`EventBus::subscribe`] additionally exposes every event as a
//! broadcast stream for fan-out consumers such as a WebSocket layer.

use crate::model::Email;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const BROADCAST_CAPACITY: usize = 100;

pub type EventHandler = Arc<dyn Fn(Arc<Email>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::New => write!(f, "new"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for EventKind {
    type Err = crate::error::MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(EventKind::New),
            "delete" => Ok(EventKind::Delete),
            other => Err(crate::error::MailError::Validation(format!(
                "unknown event: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub email: Arc<Email>,
}

pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Register a handler for one kind of event
    pub async fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Arc<Email>) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Dispatch to every registered handler without waiting for any of them
    pub async fn emit(&self, kind: EventKind, email: Arc<Email>) {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned().unwrap_or_default()
        };

        debug!(
            "Emitting '{}' for {} to {} handler(s)",
            kind,
            email.id,
            snapshot.len()
        );

        for handler in snapshot {
            let email = email.clone();
            tokio::spawn(async move {
                handler(email);
            });
        }

        // No subscribers is not an error
        let _ = self.sender.send(Event { kind, email });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn email(id: &str) -> Arc<Email> {
        Arc::new(Email {
            id: id.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::New.to_string(), "new");
        assert_eq!("DELETE".parse::<EventKind>().unwrap(), EventKind::Delete);
        assert!("update".parse::<EventKind>().is_err());
    }

    #[tokio::test]
    async fn test_handlers_receive_matching_events() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let new_tx = tx.clone();
        bus.on(EventKind::New, move |email| {
            let _ = new_tx.send(format!("new:{}", email.id));
        })
        .await;
        bus.on(EventKind::Delete, move |email| {
            let _ = tx.send(format!("delete:{}", email.id));
        })
        .await;

        bus.emit(EventKind::New, email("a1")).await;
        bus.emit(EventKind::Delete, email("b2")).await;

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["delete:b2".to_string(), "new:a1".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_affect_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::New, |_| panic!("handler failure")).await;
        let counter = count.clone();
        bus.on(EventKind::New, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.emit(EventKind::New, email("x")).await;
        bus.emit(EventKind::New, email("y")).await;

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscribe_stream() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        bus.emit(EventKind::New, email("s1")).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::New);
        assert_eq!(event.email.id, "s1");
    }
}
