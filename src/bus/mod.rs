//! Internal event bus
//!
//! Process-local topic pub-sub between the reconciliation engine and the
//! streaming gateway. Publishing enqueues onto unbounded per-subscriber
//! channels, so a slow SSE client can never stall reconciliation. There
//! is no persistence: a subscriber attached after a publish never sees it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::types::DomainEvent;

/// Canonical topic names: `new-charity` and `donation:<charityId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Global feed of newly created charities.
    pub fn new_charity() -> Self {
        Topic("new-charity".to_string())
    }

    /// Per-charity donation feed.
    pub fn donations(charity_id: &str) -> Self {
        Topic(format!("donation:{charity_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<HashMap<Topic, HashMap<u64, mpsc::UnboundedSender<DomainEvent>>>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable bus handle; clones share one subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber of `topic`, in publish
    /// order. Subscribers whose receiving side is gone are pruned.
    pub fn publish(&self, topic: &Topic, event: DomainEvent) {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .expect("bus registry poisoned");
        if let Some(handlers) = subscribers.get_mut(topic) {
            handlers.retain(|_, tx| tx.send(event.clone()).is_ok());
            if handlers.is_empty() {
                subscribers.remove(topic);
            }
        }
    }

    /// Register for `topic`. Cancellation happens explicitly via
    /// [`Subscription::cancel`] or implicitly when the subscription drops.
    pub fn subscribe(&self, topic: &Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .subscribers
            .lock()
            .expect("bus registry poisoned")
            .entry(topic.clone())
            .or_default()
            .insert(id, tx);
        Subscription {
            rx,
            guard: SubscriptionGuard {
                bus: self.clone(),
                topic: topic.clone(),
                id: Some(id),
            },
        }
    }

    /// Live subscriber count for a topic (gateway lifecycle logging).
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .subscribers
            .lock()
            .expect("bus registry poisoned")
            .get(topic)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, topic: &Topic, id: u64) {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .expect("bus registry poisoned");
        if let Some(handlers) = subscribers.get_mut(topic) {
            handlers.remove(&id);
            if handlers.is_empty() {
                subscribers.remove(topic);
            }
        }
    }
}

/// Removes the subscriber entry exactly once, on cancel or drop.
pub struct SubscriptionGuard {
    bus: EventBus,
    topic: Topic,
    id: Option<u64>,
}

impl SubscriptionGuard {
    /// Idempotent: later calls (and the eventual drop) are no-ops.
    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.unsubscribe(&self.topic, id);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One subscriber's end of a topic.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<DomainEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    /// Next event, or `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(&mut self) {
        self.guard.cancel();
    }

    /// Split into the raw receiver and its guard so a consumer stream can
    /// own the guard for its own lifetime (the SSE gateway does this).
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<DomainEvent>, SubscriptionGuard) {
        (self.rx, self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Charity, CharityStatus, DomainEvent};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn charity_event(id: &str) -> DomainEvent {
        let now = Utc::now();
        DomainEvent::NewCharity {
            charity: Charity {
                id: id.to_string(),
                owner_wallet: "0xabc".to_string(),
                title: "Test".to_string(),
                description: String::new(),
                target: None,
                deadline: None,
                amount_collected: Decimal::ZERO,
                image: String::new(),
                status: CharityStatus::Active,
                owner: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let topic = Topic::new_charity();
        let mut sub = bus.subscribe(&topic);

        for id in ["1", "2", "3"] {
            bus.publish(&topic, charity_event(id));
        }
        for expected in ["1", "2", "3"] {
            match sub.recv().await {
                Some(DomainEvent::NewCharity { charity }) => assert_eq!(charity.id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_removes_the_subscriber() {
        let bus = EventBus::new();
        let topic = Topic::donations("7");
        let mut sub = bus.subscribe(&topic);
        assert_eq!(bus.subscriber_count(&topic), 1);

        sub.cancel();
        sub.cancel();
        assert_eq!(bus.subscriber_count(&topic), 0);

        bus.publish(&topic, charity_event("7"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let bus = EventBus::new();
        let topic = Topic::new_charity();
        let sub = bus.subscribe(&topic);
        drop(sub);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
