use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use relay_core::ids::SessionKey;
use relay_core::wire::WireEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Typed in-process pub/sub addressed by (tenant, session).
///
/// Delivery is ordered per session and best-effort: with no subscriber the
/// events buffer up to the queue bound; on overflow the oldest droppable
/// progress event is shed first, and `markdown`, `form_request` and
/// `workflow_finish` are never shed. The bus does not persist anything;
/// durability is the checkpointer's job.
pub struct EventBus {
    channels: DashMap<SessionKey, SessionChannel>,
    capacity: usize,
}

struct SessionChannel {
    subscribers: Vec<Arc<SubscriberQueue>>,
    /// Events published before the first subscriber attached.
    pending: VecDeque<WireEvent>,
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<WireEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: WireEvent, capacity: usize) {
        push_bounded(&mut self.queue.lock(), event, capacity);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

/// Apply the overflow policy: at capacity, shed the oldest droppable
/// progress event; if nothing is sheddable and the newcomer is itself
/// droppable, drop the newcomer; critical events always get through.
fn push_bounded(queue: &mut VecDeque<WireEvent>, event: WireEvent, capacity: usize) {
    if queue.len() >= capacity {
        if let Some(pos) = queue.iter().position(|e| e.is_droppable()) {
            queue.remove(pos);
            debug!("event queue full, shed oldest progress event");
        } else if event.is_droppable() {
            debug!("event queue full of critical events, dropped incoming progress");
            return;
        }
    }
    queue.push_back(event);
}

/// Independent cursor over one session's event feed.
pub struct EventStream {
    queue: Arc<SubscriberQueue>,
}

impl EventStream {
    /// Next event, in publish order. Returns None once the session is
    /// closed and the queue is drained.
    pub async fn next(&self) -> Option<WireEvent> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.queue.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Relaxed) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking poll, for tests and draining.
    pub fn try_next(&self) -> Option<WireEvent> {
        self.queue.queue.lock().pop_front()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Relaxed);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Publish an event to a session. Ordered with respect to other
    /// publishes for the same session; no cross-session ordering.
    pub fn publish(&self, key: &SessionKey, event: WireEvent) {
        let mut channel = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| SessionChannel {
                subscribers: Vec::new(),
                pending: VecDeque::new(),
            });

        channel
            .subscribers
            .retain(|s| !s.closed.load(Ordering::Relaxed));

        if channel.subscribers.is_empty() {
            let capacity = self.capacity;
            push_bounded(&mut channel.pending, event, capacity);
        } else {
            for subscriber in &channel.subscribers {
                subscriber.push(event.clone(), self.capacity);
            }
        }
    }

    /// Attach a subscriber. The first subscriber inherits events buffered
    /// while nobody was listening; later subscribers start at the point of
    /// subscription (each holds an independent cursor).
    pub fn subscribe(&self, key: &SessionKey) -> EventStream {
        let mut channel = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| SessionChannel {
                subscribers: Vec::new(),
                pending: VecDeque::new(),
            });

        let queue = Arc::new(SubscriberQueue::new());
        if !channel.pending.is_empty() {
            let mut q = queue.queue.lock();
            q.extend(channel.pending.drain(..));
            drop(q);
            queue.notify.notify_one();
        }
        channel.subscribers.push(Arc::clone(&queue));
        EventStream { queue }
    }

    /// Tear down a session's feed: wakes subscribers, which see end-of-stream
    /// after draining.
    pub fn close(&self, key: &SessionKey) {
        if let Some((_, channel)) = self.channels.remove(key) {
            for subscriber in channel.subscribers {
                subscriber.close();
            }
        }
    }

    pub fn subscriber_count(&self, key: &SessionKey) -> usize {
        self.channels
            .get(key)
            .map(|c| {
                c.subscribers
                    .iter()
                    .filter(|s| !s.closed.load(Ordering::Relaxed))
                    .count()
            })
            .unwrap_or(0)
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
    use relay_core::forms::Form;
    use relay_core::ids::{SessionId, TenantId};

    fn key(n: &str) -> SessionKey {
        SessionKey::new(TenantId::from_raw("tenant_a"), SessionId::from_raw(n))
    }

    #[tokio::test]
    async fn delivery_is_ordered_per_session() {
        let bus = EventBus::new();
        let k = key("sess_1");
        let stream = bus.subscribe(&k);

        bus.publish(&k, WireEvent::progress("one"));
        bus.publish(&k, WireEvent::markdown("two"));
        bus.publish(&k, WireEvent::workflow_finish());

        assert_eq!(stream.next().await.unwrap(), WireEvent::progress("one"));
        assert_eq!(stream.next().await.unwrap(), WireEvent::markdown("two"));
        assert_eq!(stream.next().await.unwrap(), WireEvent::workflow_finish());
    }

    #[tokio::test]
    async fn events_buffer_until_first_subscriber() {
        let bus = EventBus::new();
        let k = key("sess_1");

        bus.publish(&k, WireEvent::markdown("early"));
        let stream = bus.subscribe(&k);
        assert_eq!(stream.next().await.unwrap(), WireEvent::markdown("early"));
    }

    #[tokio::test]
    async fn overflow_sheds_progress_but_never_critical_events() {
        let bus = EventBus::with_capacity(4);
        let k = key("sess_1");

        bus.publish(&k, WireEvent::progress("p0"));
        bus.publish(&k, WireEvent::markdown("m0"));
        bus.publish(&k, WireEvent::progress("p1"));
        bus.publish(&k, WireEvent::form_request(Form::new(vec![])));
        // Over capacity: p0 then p1 get shed, critical events survive.
        bus.publish(&k, WireEvent::markdown("m1"));
        bus.publish(&k, WireEvent::workflow_finish());

        let stream = bus.subscribe(&k);
        let mut kinds = Vec::new();
        while let Some(event) = stream.try_next() {
            kinds.push(event);
        }
        assert_eq!(kinds.len(), 4);
        assert!(kinds.iter().all(|e| !e.is_droppable()));
        assert!(kinds.contains(&WireEvent::markdown("m0")));
        assert!(kinds.contains(&WireEvent::markdown("m1")));
        assert!(kinds.contains(&WireEvent::workflow_finish()));
    }

    #[tokio::test]
    async fn full_queue_of_critical_events_drops_incoming_progress() {
        let bus = EventBus::with_capacity(2);
        let k = key("sess_1");

        bus.publish(&k, WireEvent::markdown("m0"));
        bus.publish(&k, WireEvent::markdown("m1"));
        bus.publish(&k, WireEvent::progress("late"));
        bus.publish(&k, WireEvent::markdown("m2"));

        let stream = bus.subscribe(&k);
        let mut events = Vec::new();
        while let Some(event) = stream.try_next() {
            events.push(event);
        }
        // Progress was dropped; a third markdown exceeded capacity but survived.
        assert_eq!(
            events,
            vec![
                WireEvent::markdown("m0"),
                WireEvent::markdown("m1"),
                WireEvent::markdown("m2"),
            ]
        );
    }

    #[tokio::test]
    async fn subscribers_have_independent_cursors() {
        let bus = EventBus::new();
        let k = key("sess_1");

        let first = bus.subscribe(&k);
        bus.publish(&k, WireEvent::markdown("a"));

        let second = bus.subscribe(&k);
        bus.publish(&k, WireEvent::markdown("b"));

        assert_eq!(first.next().await.unwrap(), WireEvent::markdown("a"));
        assert_eq!(first.next().await.unwrap(), WireEvent::markdown("b"));
        // The observer attached late and only sees what followed.
        assert_eq!(second.next().await.unwrap(), WireEvent::markdown("b"));
        assert!(second.try_next().is_none());
    }

    #[tokio::test]
    async fn close_ends_streams_after_drain() {
        let bus = EventBus::new();
        let k = key("sess_1");
        let stream = bus.subscribe(&k);

        bus.publish(&k, WireEvent::markdown("last"));
        bus.close(&k);

        assert_eq!(stream.next().await.unwrap(), WireEvent::markdown("last"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let k = key("sess_1");
        let stream = bus.subscribe(&k);
        assert_eq!(bus.subscriber_count(&k), 1);

        drop(stream);
        bus.publish(&k, WireEvent::markdown("x"));
        assert_eq!(bus.subscriber_count(&k), 0);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = EventBus::new();
        let a = key("sess_a");
        let b = key("sess_b");
        let stream_a = bus.subscribe(&a);
        let stream_b = bus.subscribe(&b);

        bus.publish(&a, WireEvent::markdown("for a"));
        assert_eq!(stream_a.next().await.unwrap(), WireEvent::markdown("for a"));
        assert!(stream_b.try_next().is_none());
    }
}
