/// Two-step delete confirmation
/// `idle -> confirming -> idle`, reverting on its own after a fixed window.
/// Purely local; it never touches the store or the pending-delete markers.
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::BookmarkId;

/// Default time a delete stays armed
pub const DEFAULT_CONFIRM_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Idle,
    Confirming { armed_at: Instant },
}

/// Result of pressing delete on a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Press {
    /// First press, waiting for a second one
    Armed,

    /// Second press within the window; the delete should be issued
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct DeleteConfirmations {
    window: Duration,
    armed: HashMap<BookmarkId, Instant>,
}

impl DeleteConfirmations {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            armed: HashMap::new(),
        }
    }

    pub fn press(&mut self, id: &BookmarkId, now: Instant) -> Press {
        match self.state(id, now) {
            ConfirmState::Confirming { .. } => {
                self.armed.remove(id);
                Press::Confirmed
            }
            ConfirmState::Idle => {
                self.armed.insert(id.clone(), now);
                Press::Armed
            }
        }
    }

    pub fn state(&self, id: &BookmarkId, now: Instant) -> ConfirmState {
        match self.armed.get(id) {
            Some(&armed_at) if now.duration_since(armed_at) < self.window => {
                ConfirmState::Confirming { armed_at }
            }
            _ => ConfirmState::Idle,
        }
    }

    pub fn is_armed(&self, id: &BookmarkId, now: Instant) -> bool {
        matches!(self.state(id, now), ConfirmState::Confirming { .. })
    }

    /// Drop expired entries, returning the ids that went back to idle
    pub fn expire(&mut self, now: Instant) -> Vec<BookmarkId> {
        let window = self.window;
        let mut expired = Vec::new();

        self.armed.retain(|id, armed_at| {
            let keep = now.duration_since(*armed_at) < window;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });

        expired
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }
}

impl Default for DeleteConfirmations {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_WINDOW)
    }
}
