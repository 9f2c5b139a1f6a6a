//! Publish/subscribe fan-out with per-subscriber bounded ring buffers.
//!
//! Publish never blocks and never waits for subscribers: each subscriber
//! owns a ring buffer, and when it falls behind the oldest events are
//! dropped and counted. Within one subscriber, delivery order equals
//! publication order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use iris_types::Event;

use crate::state::SnapshotCell;

/// Default ring-buffer capacity per subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct SubscriberShared {
    id: Uuid,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    lost: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberShared {
    /// Append an event, dropping the oldest entry on overflow.
    fn push(&self, event: Event) {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// A handle for receiving events in publication order.
///
/// Dropping the handle detaches it from the bus; the publisher prunes
/// detached subscribers lazily on the next publish.
pub struct Subscriber {
    shared: Arc<SubscriberShared>,
}

impl Subscriber {
    /// Subscriber id (used in logs).
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        let mut queue = match self.shared.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Event {
        loop {
            // Register interest before checking the queue so a push between
            // the check and the await is not missed.
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_recv() {
                return event;
            }
            notified.await;
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn lost_count(&self) -> u64 {
        self.shared.lost.load(Ordering::Relaxed)
    }

    /// Events currently buffered.
    pub fn buffered(&self) -> usize {
        match self.shared.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// The in-process event bus.
///
/// Cloning is cheap; all clones publish into the same fan-out set and share
/// one [`SnapshotCell`].
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberShared>>>>,
    snapshot: Arc<SnapshotCell>,
    capacity: usize,
}

impl EventBus {
    pub fn new(chat_history_limit: usize) -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY, chat_history_limit)
    }

    /// Create a bus with a non-default per-subscriber ring capacity.
    pub fn with_capacity(capacity: usize, chat_history_limit: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            snapshot: Arc::new(SnapshotCell::new(chat_history_limit)),
            capacity,
        }
    }

    /// The coalesced current-value cell backing `/state` and `/frame/latest`.
    pub fn snapshot_cell(&self) -> &SnapshotCell {
        &self.snapshot
    }

    /// Attach a new subscriber with an empty ring buffer.
    pub fn subscribe(&self) -> Subscriber {
        let shared = Arc::new(SubscriberShared {
            id: Uuid::new_v4(),
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            capacity: self.capacity,
            lost: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(Arc::clone(&shared));
        debug!(subscriber = %shared.id, total = subs.len(), "subscriber attached");
        Subscriber { shared }
    }

    /// Publish an event to every live subscriber and fold it into the
    /// coalesced state. Never blocks on slow consumers.
    pub fn publish(&self, event: Event) {
        self.snapshot.apply(&event);

        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
        match subs.len() {
            0 => {}
            1 => subs[0].push(event),
            n => {
                for sub in subs.iter().take(n - 1) {
                    sub.push(event.clone());
                }
                subs[n - 1].push(event);
            }
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
        subs.len()
    }
}
