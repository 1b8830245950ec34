/// WebSocket protocol between a remote client and the relay
use serde::{Deserialize, Serialize};

use crate::{Bookmark, BookmarkId, MarkdError, Result, UserId};

/// Correlates a reply with its request
pub type RequestId = u64;

/// Message types exchanged between client and relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    // Requests
    #[serde(rename = "fetch_snapshot")]
    FetchSnapshot {
        request_id: RequestId,
        user_id: UserId,
    },

    #[serde(rename = "create")]
    Create {
        request_id: RequestId,
        user_id: UserId,
        url: String,
        title: String,
    },

    #[serde(rename = "delete")]
    Delete {
        request_id: RequestId,
        id: BookmarkId,
        user_id: UserId,
    },

    // Replies
    #[serde(rename = "snapshot")]
    Snapshot {
        request_id: RequestId,
        bookmarks: Vec<Bookmark>,
    },

    #[serde(rename = "created")]
    Created {
        request_id: RequestId,
        bookmark: Bookmark,
    },

    #[serde(rename = "deleted")]
    Deleted { request_id: RequestId },

    #[serde(rename = "failed")]
    Failed {
        request_id: RequestId,
        message: String,
    },

    // Live channel
    #[serde(rename = "subscribe")]
    Subscribe { user_id: UserId },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { user_id: UserId },

    #[serde(rename = "subscribed")]
    Subscribed { user_id: UserId },

    /// The relay lost its upstream channel for this user
    #[serde(rename = "interrupted")]
    Interrupted { user_id: UserId },

    #[serde(rename = "insert")]
    Insert { bookmark: Bookmark },

    #[serde(rename = "remove")]
    Remove { id: BookmarkId, user_id: UserId },

    // Protocol errors not tied to a request
    #[serde(rename = "error")]
    Error { message: String },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Request id carried by a reply, if any
    pub fn reply_to(&self) -> Option<RequestId> {
        match self {
            WireMessage::Snapshot { request_id, .. }
            | WireMessage::Created { request_id, .. }
            | WireMessage::Deleted { request_id }
            | WireMessage::Failed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Turn a `failed` reply into a request error
    pub fn into_result(self) -> Result<Self> {
        match self {
            WireMessage::Failed { message, .. } => Err(MarkdError::Request(message)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_tagged_json_shape() {
        let msg = WireMessage::Delete {
            request_id: 7,
            id: BookmarkId::from("bm"),
            user_id: UserId::from("alice"),
        };

        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["id"], "bm");

        let ping = WireMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WireMessage::Ping);
    }

    #[test]
    fn test_insert_carries_full_record() {
        let bookmark = Bookmark::new(
            BookmarkId::from("1"),
            UserId::from("alice"),
            "https://a.com",
            "A",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        let text = WireMessage::Insert {
            bookmark: bookmark.clone(),
        }
        .to_json()
        .unwrap();

        assert_eq!(
            WireMessage::from_json(&text).unwrap(),
            WireMessage::Insert { bookmark }
        );
    }

    #[test]
    fn test_reply_correlation() {
        assert_eq!(WireMessage::Deleted { request_id: 3 }.reply_to(), Some(3));
        assert_eq!(WireMessage::Pong.reply_to(), None);

        let failed = WireMessage::Failed {
            request_id: 4,
            message: "nope".to_string(),
        };
        assert_eq!(
            failed.into_result(),
            Err(MarkdError::Request("nope".to_string()))
        );
    }

    #[test]
    fn test_unknown_type_is_serialization_error() {
        let err = WireMessage::from_json(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, MarkdError::Serialization(_)));
    }
}
