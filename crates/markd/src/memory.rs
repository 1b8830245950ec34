/// In-process collaborator
/// Authoritative per-user rows with fan-out to live subscribers. Backs the
/// relay server and drives tests, including injected failures, duplicate
/// delivery and simulated outages.
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    Bookmark, BookmarkBackend, BookmarkId, LiveMessage, MarkdError, NewBookmark, RemoteEvent,
    Result, Subscription, SubscriptionSignal, UserId,
};

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    /// Newest first per user
    rows: HashMap<UserId, Vec<Bookmark>>,

    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,

    last_created: Option<DateTime<Utc>>,

    /// Users whose live channel is currently down; their events are lost
    offline: HashSet<UserId>,

    faults: Faults,
}

struct Subscriber {
    user_id: UserId,
    tx: mpsc::UnboundedSender<LiveMessage>,
}

#[derive(Default)]
struct Faults {
    failing_creates: usize,
    failing_deletes: usize,
    duplicate_delivery: bool,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a user's rows without notifying subscribers
    pub fn seed_rows(&self, user_id: &UserId, mut rows: Vec<Bookmark>) {
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut state = self.state.lock();
        if let Some(newest) = rows.first() {
            let last = state.last_created.get_or_insert(newest.created_at);
            *last = (*last).max(newest.created_at);
        }
        state.rows.insert(user_id.clone(), rows);
    }

    pub fn rows(&self, user_id: &UserId) -> Vec<Bookmark> {
        self.state
            .lock()
            .rows
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Live subscriptions currently registered for `user_id`
    pub fn subscriber_count(&self, user_id: &UserId) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|sub| &sub.user_id == user_id && !sub.tx.is_closed())
            .count()
    }

    /// Make the next `count` creates fail
    pub fn fail_next_creates(&self, count: usize) {
        self.state.lock().faults.failing_creates = count;
    }

    /// Make the next `count` deletes fail
    pub fn fail_next_deletes(&self, count: usize) {
        self.state.lock().faults.failing_deletes = count;
    }

    /// Deliver every live event twice
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().faults.duplicate_delivery = enabled;
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().faults.latency = latency;
    }

    /// Drop the live channel for `user_id`. Events produced until
    /// `restore` are never delivered.
    pub fn interrupt(&self, user_id: &UserId) {
        let mut state = self.state.lock();
        state.offline.insert(user_id.clone());
        state.signal(user_id, SubscriptionSignal::Dropped);
        info!(user = %user_id, "live channel interrupted");
    }

    /// Resubscribe after `interrupt`
    pub fn restore(&self, user_id: &UserId) {
        let mut state = self.state.lock();
        state.offline.remove(user_id);
        state.signal(user_id, SubscriptionSignal::Retrying);
        state.signal(user_id, SubscriptionSignal::Established);
        info!(user = %user_id, "live channel restored");
    }

    /// End every live stream for `user_id`, as a collaborator restart would
    pub fn close_subscriptions(&self, user_id: &UserId) {
        self.state
            .lock()
            .subscribers
            .retain(|_, sub| &sub.user_id != user_id);
        info!(user = %user_id, "live streams closed");
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().faults.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MemoryState {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_created {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(stamp);
        stamp
    }

    fn publish(&mut self, user_id: &UserId, event: RemoteEvent) {
        if self.offline.contains(user_id) {
            debug!(user = %user_id, bookmark = %event.id(), "channel down, event lost");
            return;
        }

        let copies = if self.faults.duplicate_delivery { 2 } else { 1 };
        let messages = vec![LiveMessage::Event(event); copies];
        self.send_to(user_id, &messages);
    }

    fn signal(&mut self, user_id: &UserId, signal: SubscriptionSignal) {
        self.send_to(user_id, &[LiveMessage::Signal(signal)]);
    }

    /// Closed receivers are pruned as a side effect
    fn send_to(&mut self, user_id: &UserId, messages: &[LiveMessage]) {
        self.subscribers.retain(|_, sub| {
            if &sub.user_id != user_id {
                return true;
            }
            messages
                .iter()
                .all(|message| sub.tx.send(message.clone()).is_ok())
        });
    }
}

#[async_trait]
impl BookmarkBackend for MemoryBackend {
    async fn initial_bookmarks(&self, user_id: &UserId) -> Result<Vec<Bookmark>> {
        self.simulate_latency().await;
        Ok(self.rows(user_id))
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        if !state.offline.contains(user_id) {
            let _ = tx.send(LiveMessage::Signal(SubscriptionSignal::Established));
        }
        state.subscribers.insert(
            id,
            Subscriber {
                user_id: user_id.clone(),
                tx,
            },
        );
        debug!(user = %user_id, subscriber = id, "subscribed");

        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        Ok(Subscription::new(rx, move || {
            if let Some(state) = weak.upgrade() {
                state.lock().subscribers.remove(&id);
                debug!(subscriber = id, "unsubscribed");
            }
        }))
    }

    async fn create_bookmark(&self, new: NewBookmark) -> Result<Bookmark> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if state.faults.failing_creates > 0 {
            state.faults.failing_creates -= 1;
            return Err(MarkdError::Request("insert rejected".to_string()));
        }

        if new.url.trim().is_empty() || new.title.trim().is_empty() {
            return Err(MarkdError::Request("url and title are required".to_string()));
        }

        let bookmark = Bookmark {
            id: BookmarkId::generate(),
            user_id: new.user_id.clone(),
            url: new.url,
            title: new.title,
            created_at: state.next_timestamp(),
        };

        state
            .rows
            .entry(new.user_id.clone())
            .or_default()
            .insert(0, bookmark.clone());
        state.publish(&new.user_id, RemoteEvent::Insert(bookmark.clone()));

        Ok(bookmark)
    }

    async fn delete_bookmark(&self, id: &BookmarkId, user_id: &UserId) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if state.faults.failing_deletes > 0 {
            state.faults.failing_deletes -= 1;
            return Err(MarkdError::Request("delete rejected".to_string()));
        }

        let removed = match state.rows.get_mut(user_id) {
            Some(rows) => {
                let before = rows.len();
                rows.retain(|row| &row.id != id);
                rows.len() != before
            }
            None => false,
        };

        // Deleting an absent row matches nothing and still succeeds
        if removed {
            state.publish(user_id, RemoteEvent::Delete { id: id.clone() });
        }

        Ok(())
    }
}
