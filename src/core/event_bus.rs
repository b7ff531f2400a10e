//! Topic-based publish/subscribe for metadata elements
//!
//! Consumers (hand widgets, vitals bars, the prompt line, ...) subscribe to a
//! topic string such as `metadata/left` or `metadata/progressBar/health`.
//! Handlers are async closures; each one runs in its own task so a panic or
//! error in one handler never reaches its siblings or the publisher.

use crate::data::Element;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Arc<Element>) -> HandlerFuture + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// One queued publication
#[derive(Clone, Debug)]
pub struct Publication {
    pub topic: String,
    pub payload: Arc<Element>,
}

/// Outcome of a single publish
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Sender half used by the ingestion pipeline; never blocks
pub type PublishSender = mpsc::UnboundedSender<Publication>;

#[derive(Default)]
pub struct EventBus {
    /// topic -> handlers in subscription order
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Handler)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(Arc<Element>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler =
            Arc::new(move |payload| -> HandlerFuture { Box::pin(handler(payload)) });
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        tracing::debug!("Subscribed #{} to '{}'", id, topic);

        Subscription {
            topic: topic.to_string(),
            id,
        }
    }

    /// Remove a subscription. Safe to call any number of times; returns
    /// whether a handler was actually removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&subscription.topic) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.topic);
        }
        if removed {
            tracing::debug!(
                "Unsubscribed #{} from '{}'",
                subscription.id,
                subscription.topic
            );
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map(|l| l.len()).unwrap_or(0)
    }

    /// Invoke every handler for `topic` in subscription order, waiting for
    /// each to finish. Failures are logged and counted, never propagated.
    pub async fn publish(&self, topic: &str, payload: Arc<Element>) -> PublishReport {
        // Snapshot so handlers can (un)subscribe without deadlocking
        let handlers: Vec<(u64, Handler)> = match self.lock().get(topic) {
            Some(list) => list.clone(),
            None => return PublishReport::default(),
        };

        let mut report = PublishReport::default();
        for (id, handler) in handlers {
            let payload = Arc::clone(&payload);
            let task = tokio::spawn(async move { handler(payload).await });

            match task.await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!("Handler #{} for '{}' failed: {:#}", id, topic, e);
                }
                Err(e) if e.is_panic() => {
                    report.failed += 1;
                    tracing::error!("Handler #{} for '{}' panicked", id, topic);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Handler #{} for '{}' was cancelled: {}", id, topic, e);
                }
            }
        }

        report
    }

    /// Move publication off the caller's path: returns a sender the parser
    /// side can push to without waiting, and the task draining it in order.
    /// The task ends once every sender is dropped.
    pub fn spawn_dispatcher(self: Arc<Self>) -> (PublishSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Publication>();
        let handle = tokio::spawn(async move {
            while let Some(publication) = rx.recv().await {
                self.publish(&publication.topic, publication.payload).await;
            }
            tracing::debug!("Event dispatcher stopped");
        });
        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(text: &str) -> Arc<Element> {
        Arc::new(Element::text_run(text, None))
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe("metadata/left", move |payload| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(format!("{}:{}", n, payload.plain_text()));
                    anyhow::Ok(())
                }
            });
        }

        let report = bus.publish("metadata/left", element("a sword")).await;
        assert_eq!(report, PublishReport { delivered: 3, failed: 0 });
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["0:a sword", "1:a sword", "2:a sword"]
        );
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        bus.subscribe("metadata/prompt", |payload| async move {
            if !payload.plain_text().is_empty() {
                panic!("widget exploded");
            }
            anyhow::Ok(())
        });
        bus.subscribe("metadata/prompt", |_| async {
            Err::<(), _>(anyhow::anyhow!("widget gone"))
        });
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("metadata/prompt", move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
        }

        let report = bus.publish("metadata/prompt", element(">")).await;
        assert_eq!(report, PublishReport { delivered: 1, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let sub = {
            let hits = Arc::clone(&hits);
            bus.subscribe("metadata/right", move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
        };
        assert_eq!(sub.topic(), "metadata/right");

        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.subscriber_count("metadata/right"), 0);

        let report = bus.publish("metadata/right", element("a shield")).await;
        assert_eq!(report, PublishReport::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("metadata/progressBar/health", move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
        }

        bus.publish("metadata/progressBar/mana", element("mana")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.publish("metadata/progressBar/health", element("health")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order_then_stops() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe("metadata/prompt", move |payload| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(payload.plain_text());
                    anyhow::Ok(())
                }
            });
        }

        let (tx, handle) = Arc::clone(&bus).spawn_dispatcher();
        for text in ["R>", "H>", ">"] {
            tx.send(Publication {
                topic: "metadata/prompt".to_string(),
                payload: element(text),
            })
            .expect("dispatcher alive");
        }
        drop(tx);
        handle.await.expect("dispatcher task");

        assert_eq!(*seen.lock().unwrap(), vec!["R>", "H>", ">"]);
    }
}
