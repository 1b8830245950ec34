/// Ordered in-memory bookmark collection
/// Newest first, unique by id
use std::collections::HashSet;
use tracing::warn;

use crate::{Bookmark, BookmarkId};

#[derive(Debug, Clone, Default)]
pub struct BookmarkStore {
    /// Records sorted by `created_at` descending
    records: Vec<Bookmark>,

    /// Ids present in `records`
    index: HashSet<BookmarkId>,
}

impl BookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an initial snapshot
    pub fn from_snapshot(records: Vec<Bookmark>) -> Self {
        let mut store = Self::new();
        store.seed(records);
        store
    }

    /// Replace the whole content with `records`.
    ///
    /// Snapshots are expected newest-first. Duplicate ids keep their first
    /// occurrence, and an unsorted snapshot is sorted rather than trusted.
    pub fn seed(&mut self, records: Vec<Bookmark>) {
        self.records.clear();
        self.index.clear();

        for record in records {
            if self.index.insert(record.id.clone()) {
                self.records.push(record);
            }
        }

        if !is_newest_first(&self.records) {
            warn!("snapshot was not ordered newest-first, sorting");
            self.records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
    }

    /// Insert `record` unless its id is already present.
    ///
    /// Returns whether the record was inserted. A record at least as new as
    /// the current head is prepended; an older one (late delivery) is placed
    /// at its sorted position.
    pub fn insert_if_absent(&mut self, record: Bookmark) -> bool {
        if self.index.contains(&record.id) {
            return false;
        }

        let position = match self.records.first() {
            Some(head) if record.created_at < head.created_at => self
                .records
                .partition_point(|existing| existing.created_at > record.created_at),
            _ => 0,
        };

        self.index.insert(record.id.clone());
        self.records.insert(position, record);
        true
    }

    /// Remove the record with `id`. Returns whether anything was removed.
    pub fn remove_by_id(&mut self, id: &BookmarkId) -> bool {
        if !self.index.remove(id) {
            return false;
        }

        self.records.retain(|record| &record.id != id);
        true
    }

    pub fn contains(&self, id: &BookmarkId) -> bool {
        self.index.contains(id)
    }

    pub fn get(&self, id: &BookmarkId) -> Option<&Bookmark> {
        if !self.index.contains(id) {
            return None;
        }
        self.records.iter().find(|record| &record.id == id)
    }

    pub fn as_slice(&self) -> &[Bookmark] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn is_newest_first(records: &[Bookmark]) -> bool {
    records
        .windows(2)
        .all(|pair| pair[0].created_at >= pair[1].created_at)
}
