/// WebSocket collaborator client
/// Talks to a relay, correlating replies by request id and reconnecting with
/// backoff. Live subscribers see the socket's lifecycle as subscription signals.
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    Bookmark, BookmarkBackend, BookmarkId, LiveMessage, MarkdError, NewBookmark, RemoteConfig,
    RemoteEvent, RequestId, Result, Subscription, SubscriptionSignal, UserId, WireMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RemoteBackend {
    inner: Arc<RemoteInner>,
    supervisor: JoinHandle<()>,
}

struct RemoteInner {
    config: RemoteConfig,

    /// Writer for the current socket, `None` while disconnected
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,

    pending: Mutex<HashMap<RequestId, oneshot::Sender<WireMessage>>>,
    next_request: AtomicU64,

    subscribers: Mutex<HashMap<u64, RemoteSubscriber>>,
    next_subscriber: AtomicU64,
}

struct RemoteSubscriber {
    user_id: UserId,
    tx: mpsc::UnboundedSender<LiveMessage>,
}

impl RemoteBackend {
    /// Connect to the relay at `config.url`. Only the first connection
    /// attempt is reported; later losses are retried in the background.
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| MarkdError::Network(format!("{}: {}", config.url, e)))?;
        info!(url = %config.url, "connected to relay");

        let inner = Arc::new(RemoteInner {
            config,
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        });
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), ws));

        Ok(Self { inner, supervisor })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outgoing.lock().is_some()
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> WireMessage) -> Result<WireMessage> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);

        if let Err(e) = self.inner.send(build(request_id)) {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.request_timeout(), rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(MarkdError::Network("connection lost before reply".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(MarkdError::Network(format!("request {} timed out", request_id)))
            }
        }
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("url", &self.inner.config.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RemoteInner {
    fn send(&self, msg: WireMessage) -> Result<()> {
        let json = msg.to_json()?;
        match self.outgoing.lock().as_ref() {
            Some(tx) => tx
                .send(Message::Text(json))
                .map_err(|_| MarkdError::Network("not connected to relay".to_string())),
            None => Err(MarkdError::Network("not connected to relay".to_string())),
        }
    }

    /// Deliver to subscribers of `user_id`, or to everyone when `None`
    fn notify(&self, user_id: Option<&UserId>, message: LiveMessage) {
        self.subscribers.lock().retain(|_, sub| {
            if user_id.map_or(false, |user| user != &sub.user_id) {
                return true;
            }
            sub.tx.send(message.clone()).is_ok()
        });
    }

    fn subscribed_users(&self) -> BTreeSet<UserId> {
        self.subscribers
            .lock()
            .values()
            .map(|sub| sub.user_id.clone())
            .collect()
    }

    fn has_subscriber(&self, user_id: &UserId) -> bool {
        self.subscribers
            .lock()
            .values()
            .any(|sub| &sub.user_id == user_id)
    }

    /// Waiters see their sender dropped and report a lost connection
    fn fail_pending(&self) {
        let failed = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if failed > 0 {
            warn!(requests = failed, "abandoned in-flight requests");
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match WireMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("unreadable message from relay: {}", e);
                return;
            }
        };

        if let Some(request_id) = message.reply_to() {
            match self.pending.lock().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(message);
                }
                None => debug!(request_id, "reply for unknown request"),
            }
            return;
        }

        match message {
            WireMessage::Subscribed { user_id } => self.notify(
                Some(&user_id),
                LiveMessage::Signal(SubscriptionSignal::Established),
            ),
            WireMessage::Interrupted { user_id } => self.notify(
                Some(&user_id),
                LiveMessage::Signal(SubscriptionSignal::Dropped),
            ),
            WireMessage::Insert { bookmark } => {
                let user_id = bookmark.user_id.clone();
                self.notify(
                    Some(&user_id),
                    LiveMessage::Event(RemoteEvent::Insert(bookmark)),
                );
            }
            WireMessage::Remove { id, user_id } => self.notify(
                Some(&user_id),
                LiveMessage::Event(RemoteEvent::Delete { id }),
            ),
            WireMessage::Error { message } => warn!("relay reported: {}", message),
            WireMessage::Pong => {}
            other => debug!(?other, "unexpected message from relay"),
        }
    }
}

/// Own the socket for the backend's lifetime, reconnecting after every loss
async fn supervise(inner: Weak<RemoteInner>, mut ws: WsStream) {
    loop {
        {
            let Some(inner) = inner.upgrade() else { return };
            run_socket(&inner, ws).await;
            inner.fail_pending();
            inner.notify(None, LiveMessage::Signal(SubscriptionSignal::Dropped));
            warn!(url = %inner.config.url, "lost connection to relay");
        }

        let mut attempt = 0u32;
        ws = loop {
            let Some(strong) = inner.upgrade() else { return };
            let delay = strong.config.reconnect_delay(attempt);
            let url = strong.config.url.clone();
            drop(strong);

            tokio::time::sleep(delay).await;

            let Some(strong) = inner.upgrade() else { return };
            strong.notify(None, LiveMessage::Signal(SubscriptionSignal::Retrying));
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(attempt, "reconnected to relay");
                    break ws;
                }
                Err(e) => {
                    debug!(attempt, "reconnect failed: {}", e);
                    strong.notify(None, LiveMessage::Signal(SubscriptionSignal::Dropped));
                    attempt = attempt.saturating_add(1);
                }
            }
        };
    }
}

async fn run_socket(inner: &RemoteInner, ws: WsStream) {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!("failed to send message: {}", e);
                break;
            }
        }
    });

    *inner.outgoing.lock() = Some(tx);

    for user_id in inner.subscribed_users() {
        let _ = inner.send(WireMessage::Subscribe { user_id });
    }

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.dispatch(&text),
            Ok(Message::Close(_)) => {
                debug!("relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("relay socket error: {}", e);
                break;
            }
        }
    }

    *inner.outgoing.lock() = None;
    send_task.abort();
}

#[async_trait]
impl BookmarkBackend for RemoteBackend {
    async fn initial_bookmarks(&self, user_id: &UserId) -> Result<Vec<Bookmark>> {
        let user_id = user_id.clone();
        match self
            .request(|request_id| WireMessage::FetchSnapshot {
                request_id,
                user_id,
            })
            .await?
        {
            WireMessage::Snapshot { bookmarks, .. } => Ok(bookmarks),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(
            id,
            RemoteSubscriber {
                user_id: user_id.clone(),
                tx,
            },
        );

        // While disconnected the subscriber waits for the resubscribe on reconnect
        if let Err(e) = self.inner.send(WireMessage::Subscribe {
            user_id: user_id.clone(),
        }) {
            debug!(user = %user_id, "subscribe deferred: {}", e);
        }

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            let Some(inner) = weak.upgrade() else { return };
            let removed = inner.subscribers.lock().remove(&id);
            if let Some(sub) = removed {
                if !inner.has_subscriber(&sub.user_id) {
                    let _ = inner.send(WireMessage::Unsubscribe {
                        user_id: sub.user_id,
                    });
                }
            }
        }))
    }

    async fn create_bookmark(&self, new: NewBookmark) -> Result<Bookmark> {
        match self
            .request(|request_id| WireMessage::Create {
                request_id,
                user_id: new.user_id,
                url: new.url,
                title: new.title,
            })
            .await?
        {
            WireMessage::Created { bookmark, .. } => Ok(bookmark),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn delete_bookmark(&self, id: &BookmarkId, user_id: &UserId) -> Result<()> {
        let (id, user_id) = (id.clone(), user_id.clone());
        match self
            .request(|request_id| WireMessage::Delete {
                request_id,
                id,
                user_id,
            })
            .await?
        {
            WireMessage::Deleted { .. } => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn unexpected_reply(reply: WireMessage) -> MarkdError {
    MarkdError::Request(format!("unexpected reply: {:?}", reply))
}
