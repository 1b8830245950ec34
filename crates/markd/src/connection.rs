/// Live subscription lifecycle
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Status shown to the user and used to schedule a resync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Live,
    Disconnected,
}

impl ConnectionStatus {
    /// Badge text
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Live => "Live",
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => "Connecting...",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Lifecycle signal emitted by the collaborator's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionSignal {
    Established,
    Dropped,
    /// Automatic resubscription attempt
    Retrying,
}

/// Observed status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// Connection state machine
///
/// `connecting -> live -> disconnected -> connecting -> ...`, with no terminal
/// state. Only subscription signals move it; data events never do.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    status: ConnectionStatus,

    /// Set when events may have been pushed that neither the snapshot nor the
    /// channel delivered; cleared when the caller takes it after the next `Live`
    missed_events: bool,

    drops: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            missed_events: false,
            drops: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status == ConnectionStatus::Live
    }

    /// Number of times a live subscription was lost
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Feed a lifecycle signal. Returns the transition, if any.
    pub fn apply(&mut self, signal: SubscriptionSignal) -> Option<Transition> {
        use ConnectionStatus::*;

        let next = match (self.status, signal) {
            (Connecting, SubscriptionSignal::Established) => Live,
            (Live, SubscriptionSignal::Dropped) => Disconnected,
            // A resubscription attempt that failed before being established
            (Connecting, SubscriptionSignal::Dropped) => Disconnected,
            (Disconnected, SubscriptionSignal::Retrying) => Connecting,
            // Some transports report a restored channel without a retry signal
            (Disconnected, SubscriptionSignal::Established) => Live,
            (current, signal) => {
                debug!(status = %current, ?signal, "ignoring redundant subscription signal");
                return None;
            }
        };

        let transition = Transition {
            from: self.status,
            to: next,
        };

        if next == Disconnected {
            self.missed_events = true;
            if transition.from == Live {
                self.drops += 1;
            }
        }

        self.status = next;
        info!(from = %transition.from, to = %transition.to, "subscription status changed");

        Some(transition)
    }

    /// Record that the snapshot was taken before the channel went live, so
    /// anything pushed in between is unaccounted for
    pub fn mark_unsynced(&mut self) {
        self.missed_events = true;
    }

    /// True once after the subscription came back live following a drop or
    /// a `mark_unsynced`. Events pushed during the gap were never delivered.
    pub fn take_missed_events(&mut self) -> bool {
        if self.is_live() && self.missed_events {
            self.missed_events = false;
            true
        } else {
            false
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
