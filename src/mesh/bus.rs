//! Multi-consumer fan-out queue for manager events.
//!
//! Every subscriber owns an unbounded queue, so a slow consumer never blocks
//! the publisher or any other consumer. Events published before a subscriber
//! attaches are not replayed to it.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    task::{Context, Poll},
};

use n0_future::Stream;
use tokio::sync::mpsc;

type Queue<T> = mpsc::UnboundedSender<anyhow::Result<T>>;

struct Registry<T> {
    subscribers: HashMap<u64, Queue<T>>,
    closed: bool,
}

/// Publishes events to every currently attached [`EventSubscription`].
pub struct EventBus<T> {
    registry: Arc<Mutex<Registry<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                subscribers: HashMap::new(),
                closed: false,
            })),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new independent consumer.
    ///
    /// Subscribing to a bus that was already closed yields a handle whose
    /// stream ends immediately.
    pub fn subscribe(&self) -> EventSubscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        if !registry.closed {
            registry.subscribers.insert(id, tx);
        }
        EventSubscription {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every attached subscriber. Never blocks.
    pub fn publish(&self, event: T) {
        let mut registry = self.lock();
        // Receivers that were dropped without unsubscribing are pruned here.
        registry
            .subscribers
            .retain(|_, queue| queue.send(Ok(event.clone())).is_ok());
    }

    /// Terminate one subscriber's stream with `error`.
    ///
    /// Items already queued are still delivered; the error is yielded after
    /// them and the stream ends.
    pub fn fail(&self, subscriber: u64, error: anyhow::Error) {
        if let Some(queue) = self.lock().subscribers.remove(&subscriber) {
            let _ = queue.send(Err(error));
        }
    }

    /// Cleanly end every subscriber's stream and refuse new ones.
    pub fn close_all(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        registry.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An independent consumer handle over an [`EventBus`].
///
/// Yields `Ok(event)` items until the bus is closed, the handle is
/// unsubscribed, or the bus fails this handle with an error (yielded as a
/// final `Err`).
pub struct EventSubscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<anyhow::Result<T>>,
    registry: Weak<Mutex<Registry<T>>>,
}

impl<T> EventSubscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<anyhow::Result<T>> {
        self.receiver.recv().await
    }

    /// Detach from the bus. Events already queued are still yielded, then the
    /// stream ends.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
    }
}

impl<T> Stream for EventSubscription<T> {
    type Item = anyhow::Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for EventSubscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use n0_future::StreamExt as _;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1u32);
        bus.publish(2u32);

        assert_eq!(a.recv().await.unwrap().unwrap(), 1);
        assert_eq!(a.recv().await.unwrap().unwrap(), 2);
        assert_eq!(b.next().await.unwrap().unwrap(), 1);
        assert_eq!(b.next().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn late_subscribers_only_see_future_events() {
        let bus = EventBus::new();
        bus.publish("early");
        let mut late = bus.subscribe();
        bus.publish("late");
        bus.close_all();

        assert_eq!(late.recv().await.unwrap().unwrap(), "late");
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_all_ends_streams_after_draining() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(7u8);
        bus.close_all();

        assert_eq!(sub.recv().await.unwrap().unwrap(), 7);
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);

        // Subscribing after close yields an already-ended stream.
        let mut after = bus.subscribe();
        assert!(after.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_detaches_only_that_handle() {
        let bus = EventBus::new();
        let mut kept = bus.subscribe();
        let mut gone = bus.subscribe();

        gone.unsubscribe();
        bus.publish(3i64);

        assert!(gone.recv().await.is_none());
        assert_eq!(kept.recv().await.unwrap().unwrap(), 3);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn fail_raises_on_the_next_read() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let mut other = bus.subscribe();
        bus.publish(1u16);
        bus.fail(sub.id(), anyhow::anyhow!("boom"));
        bus.publish(2u16);

        assert_eq!(sub.recv().await.unwrap().unwrap(), 1);
        let err = sub.recv().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(sub.recv().await.is_none());

        assert_eq!(other.recv().await.unwrap().unwrap(), 1);
        assert_eq!(other.recv().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn dropped_handles_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(0u8);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
