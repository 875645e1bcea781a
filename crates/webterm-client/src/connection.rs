//! Shared WebSocket connection with reply routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use webterm_protocol::{ClientMessage, Reply, Request, ServerMessage, SessionId};

use crate::{Error, Result};

/// Messages the server pushes for one session: `data`, `title` and `kill`.
///
/// Yields None once the session is killed or the connection is lost.
pub type Subscription = mpsc::UnboundedReceiver<ServerMessage>;

struct Answer {
    reply: Reply,
    subscription: Option<Subscription>,
}

/// Demultiplexing state shared with the reader task.
#[derive(Default)]
struct Routes {
    pending: Mutex<HashMap<u64, oneshot::Sender<Answer>>>,
    subscribers: Mutex<HashMap<SessionId, Vec<mpsc::UnboundedSender<ServerMessage>>>>,
    closed: AtomicBool,
}

impl Routes {
    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::Reply { seq, reply } => {
                let Some(waiter) = self.pending.lock().remove(&seq) else {
                    tracing::debug!(seq, "reply nobody is waiting for");
                    return;
                };
                // Subscribe before handing the reply over so no output
                // produced right after the spawn is lost.
                let subscription = match &reply {
                    Reply::Spawned { session_id } => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.subscribers
                            .lock()
                            .entry(*session_id)
                            .or_default()
                            .push(tx);
                        Some(rx)
                    }
                    _ => None,
                };
                let _ = waiter.send(Answer {
                    reply,
                    subscription,
                });
            }
            ServerMessage::Kill { session_id } => {
                if let Some(subscribers) = self.subscribers.lock().remove(&session_id) {
                    for tx in subscribers {
                        let _ = tx.send(ServerMessage::Kill { session_id });
                    }
                }
            }
            ServerMessage::Data { session_id, .. } | ServerMessage::Title { session_id, .. } => {
                let mut subscribers = self.subscribers.lock();
                if let Some(list) = subscribers.get_mut(&session_id) {
                    list.retain(|tx| tx.send(message.clone()).is_ok());
                    if list.is_empty() {
                        subscribers.remove(&session_id);
                    }
                }
            }
        }
    }

    /// Fail every waiter and end every subscription.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
        self.subscribers.lock().clear();
    }
}

struct Shared {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    next_seq: AtomicU64,
    routes: Arc<Routes>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        tracing::debug!("closing server connection");
        self.reader.abort();
        self.writer.abort();
    }
}

/// A WebSocket connection to a webterm server.
///
/// Cheap to clone. The socket is closed when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection to `url`, e.g. "ws://127.0.0.1:8080/ws".
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();
        tracing::info!(url, "connected to server");

        let routes = Arc::new(Routes::default());
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to encode request: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    tracing::debug!("websocket send error: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_routes = Arc::clone(&routes);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let parsed = match frame {
                    Ok(Message::Text(text)) => serde_json::from_str::<ServerMessage>(&text),
                    Ok(Message::Binary(data)) => serde_json::from_slice::<ServerMessage>(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("websocket error: {e}");
                        break;
                    }
                };
                match parsed {
                    Ok(message) => reader_routes.route(message),
                    Err(e) => tracing::warn!("invalid message from server: {e}"),
                }
            }
            tracing::info!("server connection closed");
            reader_routes.close();
        });

        Ok(Self {
            shared: Arc::new(Shared {
                outbound,
                next_seq: AtomicU64::new(1),
                routes,
                reader,
                writer,
            }),
        })
    }

    /// Whether the socket has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.routes.closed.load(Ordering::Acquire) || self.shared.outbound.is_closed()
    }

    /// Fire-and-forget request.
    pub fn send(&self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        tracing::trace!(">>> {request:?}");
        self.shared
            .outbound
            .send(ClientMessage::new(request))
            .map_err(|_| Error::Closed)
    }

    async fn request(&self, request: Request) -> Result<Answer> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.routes.pending.lock().insert(seq, tx);

        tracing::trace!(seq, ">>> {request:?}");
        if self
            .shared
            .outbound
            .send(ClientMessage::with_seq(seq, request))
            .is_err()
        {
            self.shared.routes.pending.lock().remove(&seq);
            return Err(Error::Closed);
        }
        rx.await.map_err(|_| Error::Closed)
    }

    /// Start a new session and subscribe to its output.
    pub async fn spawn(&self) -> Result<(SessionId, Subscription)> {
        let Answer {
            reply,
            subscription,
        } = self.request(Request::Spawn).await?;
        match (reply, subscription) {
            (Reply::Spawned { session_id }, Some(subscription)) => Ok((session_id, subscription)),
            (Reply::SpawnFailed { message }, _) => Err(Error::SpawnFailed(message)),
            (reply, _) => Err(Error::UnexpectedReply(reply)),
        }
    }

    /// Foreground process name of a session, "unknown" if it does not exist.
    pub async fn process_name(&self, session_id: SessionId) -> Result<String> {
        match self.request(Request::Process { session_id }).await?.reply {
            Reply::Process { name } => Ok(name),
            reply => Err(Error::UnexpectedReply(reply)),
        }
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

/// Hands out one shared [`Connection`] for as long as anyone holds it.
///
/// The connection is opened on first use and torn down when the last holder
/// drops it; the next [`acquire`](Self::acquire) opens a fresh one.
pub struct ConnectionHub {
    url: String,
    current: tokio::sync::Mutex<Weak<Shared>>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            current: tokio::sync::Mutex::new(Weak::new()),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The live shared connection, opening one if there is none.
    pub async fn acquire(&self) -> Result<Connection> {
        let mut current = self.current.lock().await;
        if let Some(shared) = current.upgrade() {
            let connection = Connection { shared };
            if !connection.is_closed() {
                return Ok(connection);
            }
        }

        let connection = Connection::connect(&self.url).await?;
        *current = connection.downgrade();
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_reply_subscribes_before_delivery() {
        let routes = Routes::default();
        let (tx, rx) = oneshot::channel();
        routes.pending.lock().insert(3, tx);

        let session_id = SessionId(5);
        routes.route(ServerMessage::Reply {
            seq: 3,
            reply: Reply::Spawned { session_id },
        });
        // Output that arrives before the caller even looks at the reply
        routes.route(ServerMessage::Data {
            session_id,
            data: b"$ ".to_vec(),
        });

        let mut subscription = rx.await.unwrap().subscription.unwrap();
        assert_eq!(
            subscription.recv().await,
            Some(ServerMessage::Data {
                session_id,
                data: b"$ ".to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn test_kill_ends_subscription() {
        let routes = Routes::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes.subscribers.lock().insert(SessionId(1), vec![tx]);

        routes.route(ServerMessage::Kill {
            session_id: SessionId(1),
        });
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Kill {
                session_id: SessionId(1)
            })
        );
        assert_eq!(rx.recv().await, None);
        assert!(routes.subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let routes = Routes::default();
        let (tx, rx) = mpsc::unbounded_channel();
        routes.subscribers.lock().insert(SessionId(1), vec![tx]);
        drop(rx);

        routes.route(ServerMessage::Data {
            session_id: SessionId(1),
            data: vec![1],
        });
        assert!(routes.subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let routes = Routes::default();
        let (tx, rx) = oneshot::channel();
        routes.pending.lock().insert(1, tx);

        routes.close();
        assert!(rx.await.is_err());
        assert!(routes.closed.load(Ordering::Acquire));
    }
}
