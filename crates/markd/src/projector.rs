/// Read-only projection of the store for display
use crate::Bookmark;

/// Filter `records` by a free-text query, preserving store order.
///
/// An empty query yields every record. Otherwise a record is kept when its
/// title or URL contains the query, ignoring case.
pub fn project<'a>(records: &'a [Bookmark], query: &str) -> Vec<&'a Bookmark> {
    if query.is_empty() {
        return records.iter().collect();
    }

    let needle = query.to_lowercase();
    records
        .iter()
        .filter(|record| record.matches_lowercase(&needle))
        .collect()
}

/// What to show when the projected list is empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyState {
    /// A search matched nothing
    NoResults { query: String },

    NothingSaved,
}

impl EmptyState {
    /// `None` when there is something to show
    pub fn for_projection(shown: usize, query: &str) -> Option<Self> {
        if shown > 0 {
            None
        } else if query.is_empty() {
            Some(EmptyState::NothingSaved)
        } else {
            Some(EmptyState::NoResults {
                query: query.to_string(),
            })
        }
    }

    pub fn message(&self) -> String {
        match self {
            EmptyState::NoResults { query } => format!("No results for \"{}\"", query),
            EmptyState::NothingSaved => "Nothing saved yet".to_string(),
        }
    }
}

/// Header line counting the whole store, not the filtered view
pub fn summary_line(total: usize) -> String {
    match total {
        0 => "No bookmarks yet".to_string(),
        1 => "1 bookmark saved".to_string(),
        n => format!("{} bookmarks saved", n),
    }
}
