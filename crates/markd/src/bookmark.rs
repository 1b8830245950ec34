/// Bookmark records as persisted by the collaborator
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BookmarkId, UserId};

/// Immutable bookmark record
///
/// Only whole-record insert and whole-record delete exist; there is no update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,

    /// Owner, filtered by the collaborator before delivery
    pub user_id: UserId,

    /// Absolute URL, always with a scheme
    pub url: String,

    pub title: String,

    /// Server-assigned creation time
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(
        id: BookmarkId,
        user_id: UserId,
        url: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            url: url.into(),
            title: title.into(),
            created_at,
        }
    }

    /// Case-insensitive substring match against title or URL.
    /// `needle` must already be lowercased.
    pub(crate) fn matches_lowercase(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle) || self.url.to_lowercase().contains(needle)
    }
}

/// Create request payload, produced by validating a draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub user_id: UserId,
    pub url: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bookmark_json_shape() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let bm = Bookmark::new(
            BookmarkId::from("1"),
            UserId::from("u"),
            "https://a.com",
            "A",
            created,
        );

        let json = serde_json::to_value(&bm).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["user_id"], "u");
        assert_eq!(json["created_at"], "2024-03-01T12:00:00Z");

        let back: Bookmark = serde_json::from_value(json).unwrap();
        assert_eq!(back, bm);
    }

    #[test]
    fn test_matches_title_or_url() {
        let bm = Bookmark::new(
            BookmarkId::from("1"),
            UserId::from("u"),
            "https://Docs.rs/tokio",
            "Tokio Docs",
            Utc::now(),
        );

        assert!(bm.matches_lowercase("docs.rs"));
        assert!(bm.matches_lowercase("tokio docs"));
        assert!(!bm.matches_lowercase("serde"));
    }
}
