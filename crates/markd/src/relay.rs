/// WebSocket relay
/// Exposes a `BookmarkBackend` to remote clients over `WireMessage`
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::{
    BookmarkBackend, LiveMessage, MarkdError, NewBookmark, RemoteEvent, Result,
    SubscriptionSignal, UserId, WireMessage,
};

type Tx = mpsc::UnboundedSender<Message>;

/// Live forwards of one connection, by subscribed user
type Forwards = HashMap<UserId, JoinHandle<()>>;

#[derive(Clone)]
pub struct Relay {
    backend: Arc<dyn BookmarkBackend>,
}

impl Relay {
    pub fn new(backend: Arc<dyn BookmarkBackend>) -> Self {
        Self { backend }
    }

    /// Accept connections until the listener fails.
    ///
    /// Connections belong to the returned future: dropping or aborting it
    /// closes every socket it accepted.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("relay listening on: {}", addr);
        }

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) =
                        accepted.map_err(|e| MarkdError::Network(e.to_string()))?;
                    debug!("new connection from: {}", addr);

                    let relay = self.clone();
                    connections.spawn(async move { relay.handle_connection(stream, addr).await });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    pub async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        info!("WebSocket connection established: {}", addr);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("failed to send message: {}", e);
                    break;
                }
            }
        });

        let mut tasks = ConnectionTasks {
            send_task,
            forwards: Forwards::new(),
        };
        let forwards = &mut tasks.forwards;

        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("error receiving message from {}: {}", addr, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    if let Err(e) = self.handle_text(&text, &tx, forwards).await {
                        warn!("error handling message from {}: {}", addr, e);
                        let _ = send(
                            &tx,
                            &WireMessage::Error {
                                message: e.to_string(),
                            },
                        );
                    }
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(_) => {
                    debug!("client requested close");
                    break;
                }
                _ => {}
            }
        }

        drop(tasks);
        info!("connection closed: {}", addr);
    }

    async fn handle_text(&self, text: &str, tx: &Tx, forwards: &mut Forwards) -> Result<()> {
        let msg = WireMessage::from_json(text)?;

        match msg {
            WireMessage::FetchSnapshot {
                request_id,
                user_id,
            } => {
                let reply = match self.backend.initial_bookmarks(&user_id).await {
                    Ok(bookmarks) => WireMessage::Snapshot {
                        request_id,
                        bookmarks,
                    },
                    Err(e) => failed(request_id, e),
                };
                send(tx, &reply)
            }

            WireMessage::Create {
                request_id,
                user_id,
                url,
                title,
            } => {
                let new = NewBookmark {
                    user_id,
                    url,
                    title,
                };
                let reply = match self.backend.create_bookmark(new).await {
                    Ok(bookmark) => WireMessage::Created {
                        request_id,
                        bookmark,
                    },
                    Err(e) => failed(request_id, e),
                };
                send(tx, &reply)
            }

            WireMessage::Delete {
                request_id,
                id,
                user_id,
            } => {
                let reply = match self.backend.delete_bookmark(&id, &user_id).await {
                    Ok(()) => WireMessage::Deleted { request_id },
                    Err(e) => failed(request_id, e),
                };
                send(tx, &reply)
            }

            WireMessage::Subscribe { user_id } => {
                match forwards.get(&user_id) {
                    Some(forward) if !forward.is_finished() => {
                        return send(tx, &WireMessage::Subscribed { user_id });
                    }
                    Some(_) => debug!(user = %user_id, "upstream stream ended, resubscribing"),
                    None => {}
                }

                let subscription = self.backend.subscribe(&user_id).await?;
                let forward = tokio::spawn(forward_live(subscription, user_id.clone(), tx.clone()));
                forwards.insert(user_id, forward);
                Ok(())
            }

            WireMessage::Unsubscribe { user_id } => {
                if let Some(forward) = forwards.remove(&user_id) {
                    forward.abort();
                    debug!(user = %user_id, "unsubscribed");
                }
                Ok(())
            }

            WireMessage::Ping => send(tx, &WireMessage::Pong),

            WireMessage::Pong => Ok(()),

            other => Err(MarkdError::Request(format!(
                "unexpected message from client: {:?}",
                other
            ))),
        }
    }
}

/// Per-connection tasks, aborted together when the connection ends or its
/// handler is cancelled
struct ConnectionTasks {
    send_task: JoinHandle<()>,
    forwards: Forwards,
}

impl Drop for ConnectionTasks {
    fn drop(&mut self) {
        for (_, forward) in self.forwards.drain() {
            forward.abort();
        }
        self.send_task.abort();
    }
}

/// Push a backend subscription onto the socket until either side goes away
async fn forward_live(mut subscription: crate::Subscription, user_id: UserId, tx: Tx) {
    while let Some(message) = subscription.recv().await {
        let wire = match message {
            LiveMessage::Event(RemoteEvent::Insert(bookmark)) => WireMessage::Insert { bookmark },
            LiveMessage::Event(RemoteEvent::Delete { id }) => WireMessage::Remove {
                id,
                user_id: user_id.clone(),
            },
            LiveMessage::Signal(SubscriptionSignal::Established) => WireMessage::Subscribed {
                user_id: user_id.clone(),
            },
            LiveMessage::Signal(SubscriptionSignal::Dropped) => WireMessage::Interrupted {
                user_id: user_id.clone(),
            },
            LiveMessage::Signal(SubscriptionSignal::Retrying) => continue,
        };

        if send(&tx, &wire).is_err() {
            break;
        }
    }
}

fn failed(request_id: u64, error: MarkdError) -> WireMessage {
    warn!(request_id, error = %error, "request failed");
    let message = match error {
        MarkdError::Request(message) => message,
        other => other.to_string(),
    };
    WireMessage::Failed {
        request_id,
        message,
    }
}

fn send(tx: &Tx, msg: &WireMessage) -> Result<()> {
    let json = msg.to_json()?;
    tx.send(Message::Text(json))
        .map_err(|e| MarkdError::Network(e.to_string()))
}
