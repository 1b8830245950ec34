/// Collaborator interface
/// Durable state, authorization and push delivery live behind this trait.
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::{Bookmark, BookmarkId, NewBookmark, RemoteEvent, Result, SubscriptionSignal, UserId};

/// Message delivered on a live subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMessage {
    Event(RemoteEvent),
    Signal(SubscriptionSignal),
}

/// Handle to a live subscription.
///
/// Delivery is at-least-once and only carries the subscribed user's rows.
/// Dropping the handle unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<LiveMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<LiveMessage>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Subscription with nothing to release on drop
    pub fn detached(rx: mpsc::UnboundedReceiver<LiveMessage>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Next message, or `None` once the collaborator closed the stream
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("releases_on_drop", &self.on_drop.is_some())
            .finish()
    }
}

#[async_trait]
pub trait BookmarkBackend: Send + Sync {
    /// Full snapshot for `user_id`, newest first
    async fn initial_bookmarks(&self, user_id: &UserId) -> Result<Vec<Bookmark>>;

    /// Open a live insert/delete stream for `user_id`
    async fn subscribe(&self, user_id: &UserId) -> Result<Subscription>;

    /// Persist a bookmark, returning the canonical record with its
    /// server-assigned id and timestamp
    async fn create_bookmark(&self, new: NewBookmark) -> Result<Bookmark>;

    async fn delete_bookmark(&self, id: &BookmarkId, user_id: &UserId) -> Result<()>;
}
