/// Dashboard sessions against in-process and relayed collaborators
/// Multi-device sync, failure handling and recovery after outages
use chrono::{Duration as ChronoDuration, Utc};
use markd::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn alice() -> UserId {
    UserId::from("alice")
}

async fn open_with(backend: Arc<dyn BookmarkBackend>, config: SessionConfig) -> DashboardSession {
    DashboardSession::open(backend, alice(), config)
        .await
        .unwrap()
}

async fn open(backend: &MemoryBackend) -> DashboardSession {
    open_with(Arc::new(backend.clone()), SessionConfig::default()).await
}

/// Wait for the session to reach a state, re-checking on every change
async fn wait_until(session: &DashboardSession, check: impl Fn(&DashboardView) -> bool) {
    let mut changes = session.changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check(&session.view().unwrap()) {
                return;
            }
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("session never reached the expected state");
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn titles(session: &DashboardSession) -> Vec<String> {
    session
        .bookmarks()
        .unwrap()
        .into_iter()
        .map(|b| b.title)
        .collect()
}

/// Create from "another device": straight on the collaborator
async fn create_elsewhere(backend: &MemoryBackend, url: &str, title: &str) -> Bookmark {
    backend
        .create_bookmark(NewBookmark {
            user_id: alice(),
            url: url.to_string(),
            title: title.to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_insert_echo_and_failed_delete_walkthrough() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;
    assert_eq!(
        session.view().unwrap().empty,
        Some(EmptyState::NothingSaved)
    );

    // Remote insert into an empty store
    let bm1 = create_elsewhere(&backend, "https://a.com", "A").await;
    wait_until(&session, |view| view.total == 1).await;

    // Local create, then its echo changes nothing
    let bm2 = session
        .create(&BookmarkDraft::new("https://b.com", "B"))
        .await
        .unwrap();
    assert_eq!(titles(&session), vec!["B", "A"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(titles(&session), vec!["B", "A"]);

    // Failed delete clears the marker and keeps the row
    backend.fail_next_deletes(1);
    assert!(session.delete(&bm1.id).await.is_err());
    assert!(!session.is_deleting(&bm1.id));
    assert_eq!(titles(&session), vec!["B", "A"]);

    // Remote delete with nothing pending
    backend.delete_bookmark(&bm1.id, &alice()).await.unwrap();
    wait_until(&session, |view| view.total == 1).await;
    assert_eq!(session.bookmarks().unwrap()[0].id, bm2.id);
}

#[tokio::test]
async fn test_query_matches_url_case_insensitively() {
    let backend = MemoryBackend::new();
    let now = Utc::now();
    backend.seed_rows(
        &alice(),
        vec![
            Bookmark::new(BookmarkId::from("1"), alice(), "https://a.com", "First", now),
            Bookmark::new(
                BookmarkId::from("2"),
                alice(),
                "https://b.com",
                "Second",
                now + ChronoDuration::seconds(1),
            ),
        ],
    );

    let session = open(&backend).await;
    session.set_query("A.COM").unwrap();

    let view = session.view().unwrap();
    assert_eq!(view.total, 2);
    assert_eq!(view.summary, "2 bookmarks saved");
    assert_eq!(view.rows.len(), 1);
    assert_eq!(view.rows[0].bookmark.id, BookmarkId::from("1"));
    assert_eq!(view.empty, None);
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let backend = MemoryBackend::new();
    backend.set_duplicate_delivery(true);
    let session = open(&backend).await;

    let bm = create_elsewhere(&backend, "https://a.com", "A").await;
    create_elsewhere(&backend, "https://b.com", "B").await;
    wait_until(&session, |view| view.total == 2).await;

    backend.delete_bookmark(&bm.id, &alice()).await.unwrap();
    wait_until(&session, |view| view.total == 1).await;
    assert_eq!(titles(&session), vec!["B"]);
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let backend = MemoryBackend::new();
    let laptop = open(&backend).await;
    let phone = open(&backend).await;

    let bm = laptop
        .create(&BookmarkDraft::new("rust-lang.org", "").with_guessed_title())
        .await
        .unwrap();
    assert_eq!(bm.title, "rust-lang.org");
    assert_eq!(bm.url, "https://rust-lang.org");

    wait_until(&phone, |view| view.total == 1).await;
    assert_eq!(phone.bookmarks().unwrap(), laptop.bookmarks().unwrap());

    phone.delete(&bm.id).await.unwrap();
    wait_until(&laptop, |view| view.total == 0).await;
    assert_eq!(
        laptop.view().unwrap().empty,
        Some(EmptyState::NothingSaved)
    );
}

#[tokio::test]
async fn test_concurrent_delete_issues_one_request() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    let bm = session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap();

    backend.set_latency(Some(Duration::from_millis(50)));

    let other = session.clone();
    let (first, second) = tokio::join!(session.delete(&bm.id), other.delete(&bm.id));

    assert_eq!(first.unwrap(), DeleteOutcome::Deleted);
    assert_eq!(second.unwrap(), DeleteOutcome::AlreadyPending);
    assert!(session.bookmarks().unwrap().is_empty());
    assert!(!session.is_deleting(&bm.id));
}

#[tokio::test]
async fn test_pending_delete_is_visible_in_view() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    let bm = session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap();

    backend.set_latency(Some(Duration::from_millis(100)));
    let deleting = {
        let session = session.clone();
        let id = bm.id.clone();
        tokio::spawn(async move { session.delete(&id).await })
    };

    wait_until(&session, |view| view.rows.first().map_or(false, |row| row.deleting)).await;
    assert_eq!(deleting.await.unwrap().unwrap(), DeleteOutcome::Deleted);
    assert!(session.view().unwrap().rows.is_empty());
}

#[tokio::test]
async fn test_failed_create_leaves_store_unchanged() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap();

    backend.fail_next_creates(1);
    let err = session
        .create(&BookmarkDraft::new("https://b.com", "B"))
        .await
        .unwrap_err();

    assert!(matches!(err, MarkdError::Request(_)));
    assert_eq!(titles(&session), vec!["A"]);
}

#[tokio::test]
async fn test_await_echo_policy_keeps_row_until_event() {
    let backend = MemoryBackend::new();
    let session = open_with(
        Arc::new(backend.clone()),
        SessionConfig {
            delete_policy: DeletePolicy::AwaitEcho,
            ..SessionConfig::default()
        },
    )
    .await;
    let bm = session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap();

    session.delete(&bm.id).await.unwrap();
    wait_until(&session, |view| view.total == 0).await;
}

#[tokio::test]
async fn test_resync_recovers_events_missed_during_outage() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;

    backend.interrupt(&alice());
    wait_until(&session, |view| {
        view.status == ConnectionStatus::Disconnected
    })
    .await;

    create_elsewhere(&backend, "https://lost.com", "Lost").await;
    backend.restore(&alice());

    wait_until(&session, |view| view.total == 1).await;
    assert_eq!(session.status(), ConnectionStatus::Live);
    assert_eq!(titles(&session), vec!["Lost"]);
}

#[tokio::test]
async fn test_missed_events_stay_lost_without_resync() {
    let backend = MemoryBackend::new();
    let session = open_with(
        Arc::new(backend.clone()),
        SessionConfig {
            resync_on_reconnect: false,
            ..SessionConfig::default()
        },
    )
    .await;
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;

    backend.interrupt(&alice());
    create_elsewhere(&backend, "https://lost.com", "Lost").await;
    backend.restore(&alice());

    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.bookmarks().unwrap().is_empty());
    assert_eq!(backend.rows(&alice()).len(), 1);
}

#[tokio::test]
async fn test_close_unsubscribes_and_discards_state() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    assert_eq!(backend.subscriber_count(&alice()), 1);

    session.close().await;

    assert!(!session.is_active());
    assert_eq!(backend.subscriber_count(&alice()), 0);
    assert!(matches!(
        session.bookmarks().unwrap_err(),
        MarkdError::SessionClosed
    ));

    // Closing twice is harmless
    session.close().await;
}

#[tokio::test]
async fn test_create_in_flight_at_close_does_not_touch_state() {
    let backend = MemoryBackend::new();
    let session = open(&backend).await;
    backend.set_latency(Some(Duration::from_millis(50)));

    let creating = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .create(&BookmarkDraft::new("https://a.com", "A"))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    session.close().await;

    let err = creating.await.unwrap().unwrap_err();
    assert_eq!(err, MarkdError::SessionClosed);
    // The collaborator still persisted it
    assert_eq!(backend.rows(&alice()).len(), 1);
}

async fn start_relay(backend: &MemoryBackend) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = Relay::new(Arc::new(backend.clone()));
    tokio::spawn(async move { relay.serve(listener).await });

    format!("ws://{}", addr)
}

async fn connect(url: &str) -> Arc<RemoteBackend> {
    let config = RemoteConfig {
        request_timeout_ms: 2_000,
        ..RemoteConfig::with_url(url)
    };
    Arc::new(RemoteBackend::connect(config).await.unwrap())
}

#[tokio::test]
async fn test_session_over_relay() {
    let backend = MemoryBackend::new();
    let url = start_relay(&backend).await;
    let remote = connect(&url).await;
    assert!(remote.is_connected());

    let session = open_with(remote.clone(), SessionConfig::default()).await;
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;

    let bm = session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap();
    assert_eq!(backend.rows(&alice()), vec![bm.clone()]);

    create_elsewhere(&backend, "https://b.com", "B").await;
    wait_until(&session, |view| view.total == 2).await;
    assert_eq!(titles(&session), vec!["B", "A"]);

    session.delete(&bm.id).await.unwrap();
    assert_eq!(titles(&session), vec!["B"]);
    assert_eq!(backend.rows(&alice()).len(), 1);
}

#[tokio::test]
async fn test_relay_reports_collaborator_failures() {
    let backend = MemoryBackend::new();
    let url = start_relay(&backend).await;
    let session = open_with(connect(&url).await, SessionConfig::default()).await;

    backend.fail_next_creates(1);
    let err = session
        .create(&BookmarkDraft::new("https://a.com", "A"))
        .await
        .unwrap_err();

    assert_eq!(err, MarkdError::Request("insert rejected".to_string()));
    assert!(session.bookmarks().unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_forwards_outages_and_resyncs() {
    let backend = MemoryBackend::new();
    let url = start_relay(&backend).await;
    let session = open_with(connect(&url).await, SessionConfig::default()).await;
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;

    backend.interrupt(&alice());
    wait_until(&session, |view| {
        view.status == ConnectionStatus::Disconnected
    })
    .await;

    create_elsewhere(&backend, "https://lost.com", "Lost").await;
    backend.restore(&alice());

    wait_until(&session, |view| view.total == 1).await;
    assert_eq!(session.status(), ConnectionStatus::Live);
}

#[tokio::test]
async fn test_remote_recovers_from_lost_socket() {
    let backend = MemoryBackend::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Relay::new(Arc::new(backend.clone()));
    let server = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.serve(listener).await })
    };

    let config = RemoteConfig {
        request_timeout_ms: 5_000,
        reconnect_initial_ms: 300,
        reconnect_max_ms: 300,
        ..RemoteConfig::with_url(format!("ws://{}", addr))
    };
    let remote = Arc::new(RemoteBackend::connect(config).await.unwrap());
    let session = Arc::new(open_with(remote.clone(), SessionConfig::default()).await);
    wait_until(&session, |view| view.status == ConnectionStatus::Live).await;

    // Hold a create inside the relay while its socket goes away
    backend.set_latency(Some(Duration::from_secs(5)));
    let creating = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .create(&BookmarkDraft::new("https://a.com", "A"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.abort();
    let _ = server.await;

    let err = creating.await.unwrap().unwrap_err();
    assert!(matches!(err, MarkdError::Network(_)));
    backend.set_latency(None);

    wait_until(&session, |view| {
        view.status == ConnectionStatus::Disconnected
    })
    .await;
    assert!(!remote.is_connected());
    assert!(session.bookmarks().unwrap().is_empty());

    create_elsewhere(&backend, "https://gap.com", "Gap").await;

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move { relay.serve(listener).await });

    wait_until(&session, |view| {
        view.status == ConnectionStatus::Live && view.total == 1
    })
    .await;
    assert_eq!(titles(&session), vec!["Gap"]);
    assert!(remote.is_connected());
}

#[tokio::test]
async fn test_closing_remote_session_unsubscribes_upstream() {
    let backend = MemoryBackend::new();
    let url = start_relay(&backend).await;
    let session = open_with(connect(&url).await, SessionConfig::default()).await;

    eventually(|| backend.subscriber_count(&alice()) == 1).await;
    session.close().await;
    eventually(|| backend.subscriber_count(&alice()) == 0).await;
}

#[tokio::test]
async fn test_connect_to_missing_relay_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = RemoteBackend::connect(RemoteConfig::with_url(format!("ws://{}", addr)))
        .await
        .unwrap_err();
    assert!(matches!(err, MarkdError::Network(_)));
}
