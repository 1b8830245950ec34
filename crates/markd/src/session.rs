/// Dashboard session
/// One reconciler, connection tracker and query per mounted dashboard, with
/// explicit construction and teardown.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    project, summary_line, Bookmark, BookmarkBackend, BookmarkDraft, BookmarkId,
    ConnectionStatus, ConnectionTracker, DeleteConfirmations, EmptyState, LiveMessage,
    MarkdError, Press, Reconciler, Result, SessionConfig, Subscription, UserId,
};

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// A delete for this id is already in flight; no request was issued
    AlreadyPending,
}

/// Result of pressing the delete button on a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePress {
    /// Waiting for a confirming second press
    Armed,
    Deleted,
    AlreadyPending,
}

/// Display-ready state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardView {
    pub status: ConnectionStatus,
    pub query: String,

    /// Size of the whole store
    pub total: usize,
    pub summary: String,

    /// Filtered rows in store order
    pub rows: Vec<BookmarkRow>,
    pub empty: Option<EmptyState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkRow {
    pub bookmark: Bookmark,

    /// Delete request in flight
    pub deleting: bool,

    /// First delete press registered, waiting for confirmation
    pub confirming: bool,
}

/// Cloneable handle to a live dashboard session
#[derive(Clone)]
pub struct DashboardSession {
    shared: Arc<Shared>,
}

struct Shared {
    user_id: UserId,
    backend: Arc<dyn BookmarkBackend>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    changes: watch::Sender<u64>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disarm_timers: Mutex<HashMap<BookmarkId, DisarmTimer>>,
    next_timer: AtomicU64,
}

/// Pending revert of an armed delete; `generation` tells a re-armed row's
/// timer apart from the one it replaced
struct DisarmTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct SessionState {
    active: bool,
    reconciler: Reconciler,
    tracker: ConnectionTracker,
    query: String,
    confirms: DeleteConfirmations,
    revision: u64,
}

impl DashboardSession {
    /// Fetch the snapshot, seed the store and start consuming live events.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(
        backend: Arc<dyn BookmarkBackend>,
        user_id: UserId,
        config: SessionConfig,
    ) -> Result<Self> {
        // Subscribe first so nothing pushed after the snapshot is read can slip by
        let mut subscription = backend.subscribe(&user_id).await?;
        let snapshot = backend.initial_bookmarks(&user_id).await?;

        let mut reconciler = Reconciler::with_snapshot(snapshot, config.delete_policy);
        let mut tracker = ConnectionTracker::new();
        while let Some(message) = subscription.try_recv() {
            match message {
                LiveMessage::Event(event) => {
                    reconciler.apply_remote(event);
                }
                LiveMessage::Signal(signal) => {
                    tracker.apply(signal);
                }
            }
        }

        // A channel that was not live before the snapshot returned may have
        // missed events; the first `Live` then triggers a resync
        if !tracker.is_live() {
            tracker.mark_unsynced();
        }

        info!(
            user = %user_id,
            bookmarks = reconciler.store().len(),
            status = %tracker.status(),
            "dashboard session opened"
        );

        let (changes, _) = watch::channel(0);
        let state = SessionState {
            active: true,
            reconciler,
            tracker,
            query: String::new(),
            confirms: DeleteConfirmations::new(config.confirm_window()),
            revision: 0,
        };

        let shared = Arc::new(Shared {
            user_id,
            backend,
            config,
            state: Mutex::new(state),
            changes,
            pump: Mutex::new(None),
            disarm_timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
        });

        let pump = tokio::spawn(run_pump(Arc::downgrade(&shared), subscription));
        *shared.pump.lock() = Some(pump);

        Ok(Self { shared })
    }

    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().tracker.status()
    }

    /// Revision counter bumped on every visible change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Current store content, newest first
    pub fn bookmarks(&self) -> Result<Vec<Bookmark>> {
        let state = self.shared.active_state()?;
        Ok(state.reconciler.store().as_slice().to_vec())
    }

    pub fn is_deleting(&self, id: &BookmarkId) -> bool {
        self.shared.state.lock().reconciler.is_pending(id)
    }

    pub fn set_query(&self, query: impl Into<String>) -> Result<()> {
        let query = query.into();
        let mut state = self.shared.active_state()?;
        if state.query != query {
            state.query = query;
            self.shared.bump(&mut state);
        }
        Ok(())
    }

    /// Project the store through the current query
    pub fn view(&self) -> Result<DashboardView> {
        let state = self.shared.active_state()?;
        let now = Instant::now();
        let store = state.reconciler.store();

        let rows: Vec<BookmarkRow> = project(store.as_slice(), &state.query)
            .into_iter()
            .map(|bookmark| BookmarkRow {
                deleting: state.reconciler.is_pending(&bookmark.id),
                confirming: state.confirms.is_armed(&bookmark.id, now),
                bookmark: bookmark.clone(),
            })
            .collect();

        Ok(DashboardView {
            status: state.tracker.status(),
            query: state.query.clone(),
            total: store.len(),
            summary: summary_line(store.len()),
            empty: EmptyState::for_projection(rows.len(), &state.query),
            rows,
        })
    }

    /// Validate and persist a bookmark, then add the canonical record without
    /// waiting for the live echo.
    ///
    /// Validation failures never issue a request. A failed request leaves the
    /// store untouched.
    pub async fn create(&self, draft: &BookmarkDraft) -> Result<Bookmark> {
        self.shared.ensure_active()?;
        let new = draft.validate(&self.shared.user_id)?;

        let bookmark = self
            .shared
            .backend
            .create_bookmark(new)
            .await
            .map_err(|e| {
                warn!(user = %self.shared.user_id, error = %e, "create failed");
                e
            })?;

        let mut state = self.shared.active_state()?;
        if state.reconciler.confirm_created(bookmark.clone()).changed() {
            self.shared.bump(&mut state);
        }
        debug!(bookmark = %bookmark.id, "created");

        Ok(bookmark)
    }

    /// Issue a delete unless one is already pending for `id`.
    ///
    /// The pending marker clears on any answer. On failure the row stays.
    pub async fn delete(&self, id: &BookmarkId) -> Result<DeleteOutcome> {
        {
            let mut state = self.shared.active_state()?;
            if !state.reconciler.begin_delete(id) {
                debug!(bookmark = %id, "delete already in flight");
                return Ok(DeleteOutcome::AlreadyPending);
            }
            self.shared.bump(&mut state);
        }

        let result = self
            .shared
            .backend
            .delete_bookmark(id, &self.shared.user_id)
            .await;

        {
            let mut state = self.shared.state.lock();
            if state.active {
                state.reconciler.finish_delete(id, result.is_ok());
                self.shared.bump(&mut state);
            }
        }

        match result {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                warn!(bookmark = %id, error = %e, "delete failed");
                Err(e)
            }
        }
    }

    /// Two-step delete: the first press arms the row, a second press within
    /// the confirmation window deletes it.
    pub async fn press_delete(&self, id: &BookmarkId) -> Result<DeletePress> {
        let press = {
            let mut state = self.shared.active_state()?;
            if state.reconciler.is_pending(id) {
                return Ok(DeletePress::AlreadyPending);
            }
            let press = state.confirms.press(id, Instant::now());
            self.shared.bump(&mut state);
            press
        };

        match press {
            Press::Armed => {
                self.schedule_disarm(id);
                Ok(DeletePress::Armed)
            }
            Press::Confirmed => {
                if let Some(timer) = self.shared.disarm_timers.lock().remove(id) {
                    timer.handle.abort();
                }
                match self.delete(id).await? {
                    DeleteOutcome::Deleted => Ok(DeletePress::Deleted),
                    DeleteOutcome::AlreadyPending => Ok(DeletePress::AlreadyPending),
                }
            }
        }
    }

    /// Tear down: stop the live subscription, cancel confirmation timers and
    /// discard the store. In-flight requests finish but no longer touch state.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.confirms.clear();
            state.reconciler = Reconciler::new(self.shared.config.delete_policy);
            self.shared.bump(&mut state);
        }

        self.shared.abort_timers();

        let pump = self.shared.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        info!(user = %self.shared.user_id, "dashboard session closed");
    }

    fn schedule_disarm(&self, id: &BookmarkId) {
        let window = self.shared.config.confirm_window();
        let generation = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.shared);
        let timer_id = id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };

            {
                let mut timers = shared.disarm_timers.lock();
                if timers
                    .get(&timer_id)
                    .is_some_and(|timer| timer.generation == generation)
                {
                    timers.remove(&timer_id);
                }
            }

            let mut state = shared.state.lock();
            if !state.active {
                return;
            }
            if !state.confirms.expire(Instant::now()).is_empty() {
                shared.bump(&mut state);
            }
        });

        let timer = DisarmTimer { generation, handle };
        if let Some(previous) = self.shared.disarm_timers.lock().insert(id.clone(), timer) {
            previous.handle.abort();
        }
    }
}

impl Shared {
    fn active_state(&self) -> Result<parking_lot::MutexGuard<'_, SessionState>> {
        let state = self.state.lock();
        if state.active {
            Ok(state)
        } else {
            Err(MarkdError::SessionClosed)
        }
    }

    fn ensure_active(&self) -> Result<()> {
        self.active_state().map(|_| ())
    }

    fn bump(&self, state: &mut SessionState) {
        state.revision += 1;
        self.changes.send_replace(state.revision);
    }

    /// Apply one live message. Returns whether a snapshot re-fetch is due.
    fn handle_live(&self, message: LiveMessage) -> bool {
        let mut state = self.state.lock();
        if !state.active {
            return false;
        }

        match message {
            LiveMessage::Event(event) => {
                if state.reconciler.apply_remote(event).changed() {
                    self.bump(&mut state);
                }
                false
            }
            LiveMessage::Signal(signal) => {
                if state.tracker.apply(signal).is_some() {
                    self.bump(&mut state);
                }
                let missed = state.tracker.take_missed_events();
                if missed && !self.config.resync_on_reconnect {
                    warn!(
                        user = %self.user_id,
                        drops = state.tracker.drops(),
                        "events pushed while disconnected were not recovered"
                    );
                }
                missed && self.config.resync_on_reconnect
            }
        }
    }

    async fn resync(&self) {
        match self.backend.initial_bookmarks(&self.user_id).await {
            Ok(snapshot) => {
                let mut state = self.state.lock();
                if !state.active {
                    return;
                }
                info!(user = %self.user_id, bookmarks = snapshot.len(), "resynced after reconnect");
                state.reconciler.seed(snapshot);
                self.bump(&mut state);
            }
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "resync after reconnect failed");
            }
        }
    }

    fn abort_timers(&self) {
        for (_, timer) in self.disarm_timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        for (_, timer) in self.disarm_timers.get_mut().drain() {
            timer.handle.abort();
        }
    }
}

/// Consume the live stream in delivery order until the session goes away
async fn run_pump(shared: Weak<Shared>, mut subscription: Subscription) {
    while let Some(message) = subscription.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        if shared.handle_live(message) {
            shared.resync().await;
        }
    }

    debug!("live stream ended");
}
