/// Event reconciliation
/// Single authority deciding whether a record enters or leaves the store,
/// whether the change came from a live event or from this session.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::{Bookmark, BookmarkId, BookmarkStore};

/// Insert/delete notification pushed by the live subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteEvent {
    Insert(Bookmark),
    Delete { id: BookmarkId },
}

impl RemoteEvent {
    pub fn id(&self) -> &BookmarkId {
        match self {
            RemoteEvent::Insert(bookmark) => &bookmark.id,
            RemoteEvent::Delete { id } => id,
        }
    }
}

/// Effect a merge had on the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Removed,
    /// Duplicate insert or delete of an absent id
    Unchanged,
}

impl Applied {
    pub fn changed(self) -> bool {
        self != Applied::Unchanged
    }
}

/// When a successfully deleted row leaves the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove as soon as the collaborator acknowledges; the echo is a no-op
    #[default]
    RemoveOnAck,

    /// Keep the row until the live delete event arrives
    AwaitEcho,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    store: BookmarkStore,

    /// Deletes issued by this session and not yet answered
    pending_deletes: HashSet<BookmarkId>,

    policy: DeletePolicy,
}

impl Reconciler {
    pub fn new(policy: DeletePolicy) -> Self {
        Self {
            store: BookmarkStore::new(),
            pending_deletes: HashSet::new(),
            policy,
        }
    }

    pub fn with_snapshot(snapshot: Vec<Bookmark>, policy: DeletePolicy) -> Self {
        let mut reconciler = Self::new(policy);
        reconciler.seed(snapshot);
        reconciler
    }

    /// Replace the store with a fresh snapshot.
    /// Pending delete markers survive; their requests are still in flight.
    pub fn seed(&mut self, snapshot: Vec<Bookmark>) {
        self.store.seed(snapshot);
    }

    /// Merge a live event into the store
    pub fn apply_remote(&mut self, event: RemoteEvent) -> Applied {
        match event {
            RemoteEvent::Insert(bookmark) => {
                let id = bookmark.id.clone();
                let applied = insert(&mut self.store, bookmark);
                if !applied.changed() {
                    debug!(bookmark = %id, "absorbed duplicate insert");
                }
                applied
            }
            RemoteEvent::Delete { id } => {
                let applied = remove(&mut self.store, &id);
                if !applied.changed() {
                    debug!(bookmark = %id, "delete for absent bookmark ignored");
                }
                applied
            }
        }
    }

    /// Add the canonical record returned by a successful local create
    pub fn confirm_created(&mut self, bookmark: Bookmark) -> Applied {
        insert(&mut self.store, bookmark)
    }

    /// Mark a local delete as in flight.
    ///
    /// Returns false if a delete for `id` is already pending, in which case no
    /// second request may be issued.
    pub fn begin_delete(&mut self, id: &BookmarkId) -> bool {
        self.pending_deletes.insert(id.clone())
    }

    /// Settle a local delete once the collaborator answered
    pub fn finish_delete(&mut self, id: &BookmarkId, succeeded: bool) -> Applied {
        self.pending_deletes.remove(id);

        if succeeded && self.policy == DeletePolicy::RemoveOnAck {
            remove(&mut self.store, id)
        } else {
            Applied::Unchanged
        }
    }

    pub fn is_pending(&self, id: &BookmarkId) -> bool {
        self.pending_deletes.contains(id)
    }

    pub fn store(&self) -> &BookmarkStore {
        &self.store
    }
}

fn insert(store: &mut BookmarkStore, bookmark: Bookmark) -> Applied {
    if store.insert_if_absent(bookmark) {
        Applied::Inserted
    } else {
        Applied::Unchanged
    }
}

fn remove(store: &mut BookmarkStore, id: &BookmarkId) -> Applied {
    if store.remove_by_id(id) {
        Applied::Removed
    } else {
        Applied::Unchanged
    }
}
