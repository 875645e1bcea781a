//! Connection router: the server's event loop.
//!
//! One task owns the [`SessionRegistry`] and the connection table. Requests
//! from connections, events from PTY processes and sweep ticks all arrive as
//! messages and are applied one at a time, so no two mutations of a session
//! ever interleave.
//!
//! Every hop is bounded. PTY output waits for the loop, and the loop never
//! waits for a client: a connection whose queue is full is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webterm_config::DisconnectPolicy;
use webterm_protocol::{ClientMessage, Reply, Request, ServerMessage, SessionId, UNKNOWN_PROCESS};

use crate::liveness::LivenessSweeper;
use crate::pty::{Dimensions, PtyEvent, PtyEvents, PtyProcess, SpawnError, SpawnOptions};
use crate::registry::{SessionEvent, SessionRegistry};

/// Session events buffered between the forwarders and the loop.
const EVENT_CAPACITY: usize = 1024;

/// Identifies one client connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The server task is gone.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("server is not running")]
pub struct ServerClosed;

#[derive(Debug)]
enum Command {
    Connect {
        id: ConnectionId,
        outbound: mpsc::Sender<ServerMessage>,
    },
    Request {
        id: ConnectionId,
        message: ClientMessage,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// A shell started off the loop, on its way back to the spawner.
struct SpawnFinished {
    connection: ConnectionId,
    seq: Option<u64>,
    result: Result<(PtyProcess, PtyEvents, Dimensions), SpawnError>,
}

/// Tunables for the server loop.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Template for every spawned shell.
    pub spawn: SpawnOptions,
    pub max_sessions: Option<usize>,
    /// Attach spawners to the oldest session once `max_sessions` is reached.
    pub share: bool,
    pub on_disconnect: DisconnectPolicy,
    pub sweeper: LivenessSweeper,
    /// Messages queued for one connection before it is dropped as stalled.
    pub outbound_capacity: usize,
}

impl ServerOptions {
    #[must_use]
    pub fn from_config(config: &webterm_config::Config) -> Self {
        Self {
            spawn: SpawnOptions::from_config(config),
            max_sessions: config.sessions.max,
            share: config.sessions.share,
            on_disconnect: config.sessions.on_disconnect,
            sweeper: LivenessSweeper::from_config(&config.liveness),
            outbound_capacity: config.server.outbound_capacity,
        }
    }
}

/// Cheap handle for opening connections to a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_connection: Arc<AtomicU64>,
    outbound_capacity: usize,
}

impl ServerHandle {
    /// Register a new client connection.
    #[must_use]
    pub fn connect(&self) -> Connection {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (outbound, messages) = mpsc::channel(self.outbound_capacity);
        // If the server is gone `messages` yields None straight away.
        let _ = self.commands.send(Command::Connect { id, outbound });
        Connection {
            requests: RequestSender {
                id,
                commands: self.commands.clone(),
            },
            messages,
        }
    }
}

/// One client's view of the server: a request sink and a message stream.
#[derive(Debug)]
pub struct Connection {
    requests: RequestSender,
    messages: mpsc::Receiver<ServerMessage>,
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.requests.id
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), ServerClosed> {
        self.requests.send(message)
    }

    /// Next message for this client. None once the server has dropped it.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.messages.recv().await
    }

    /// Separate the halves so they can be driven from different tasks.
    #[must_use]
    pub fn split(self) -> (RequestSender, mpsc::Receiver<ServerMessage>) {
        (self.requests, self.messages)
    }
}

/// Sending half of a [`Connection`]. Dropping it disconnects the client.
#[derive(Debug)]
pub struct RequestSender {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl RequestSender {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), ServerClosed> {
        self.commands
            .send(Command::Request {
                id: self.id,
                message,
            })
            .map_err(|_| ServerClosed)
    }
}

impl Drop for RequestSender {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Disconnect { id: self.id });
    }
}

struct ConnectionState {
    outbound: mpsc::Sender<ServerMessage>,
    sessions: HashSet<SessionId>,
}

impl ConnectionState {
    /// Queue `message`. False if the client is too far behind to take it.
    fn deliver(&self, message: ServerMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            // Already gone; the disconnect is on its way.
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }
}

/// The server loop. Construct with [`Server::new`] and drive with [`Server::run`].
pub struct Server {
    options: ServerOptions,
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, ConnectionState>,
    owners: HashMap<SessionId, HashSet<ConnectionId>>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events_rx: mpsc::Receiver<SessionEvent>,
    spawns_tx: mpsc::UnboundedSender<SpawnFinished>,
    spawns_rx: mpsc::UnboundedReceiver<SpawnFinished>,
    pending_spawns: usize,
    stalled: Vec<ConnectionId>,
}

impl Server {
    #[must_use]
    pub fn new(options: ServerOptions) -> (Self, ServerHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (spawns_tx, spawns_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(events_tx, options.max_sessions);
        let handle = ServerHandle {
            commands: commands_tx,
            next_connection: Arc::new(AtomicU64::new(1)),
            outbound_capacity: options.outbound_capacity.max(1),
        };
        let server = Self {
            options,
            registry,
            connections: HashMap::new(),
            owners: HashMap::new(),
            commands_rx,
            events_rx,
            spawns_tx,
            spawns_rx,
            pending_spawns: 0,
            stalled: Vec::new(),
        };
        (server, handle)
    }

    /// Run until every [`ServerHandle`] and [`Connection`] is dropped.
    /// Remaining sessions are destroyed on the way out.
    pub async fn run(mut self) {
        let mut ticker = self.options.sweeper.ticker();

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_session_event(event),
                Some(finished) = self.spawns_rx.recv() => self.spawn_finished(finished),
                _ = ticker.tick() => self.sweep(Instant::now()),
            }
            self.drop_stalled();
        }

        tracing::info!(sessions = self.registry.len(), "server loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { id, outbound } => {
                tracing::debug!(connection = %id, "client connected");
                self.connections.insert(
                    id,
                    ConnectionState {
                        outbound,
                        sessions: HashSet::new(),
                    },
                );
            }
            Command::Request { id, message } => self.handle_request(id, message),
            Command::Disconnect { id } => self.handle_disconnect(id),
        }
    }

    fn handle_request(&mut self, connection: ConnectionId, message: ClientMessage) {
        let ClientMessage { seq, request } = message;
        if !self.connections.contains_key(&connection) {
            tracing::debug!(%connection, ?seq, "request from dropped connection ignored");
            return;
        }
        tracing::debug!(%connection, ?seq, "<<< {request:?}");

        match request {
            Request::Spawn => self.spawn(connection, seq),
            Request::Data { session_id, data } => match self.registry.lookup(session_id) {
                Some(session) => session.process().write(Bytes::from(data)),
                None => tracing::debug!(session = %session_id, "data for unknown session ignored"),
            },
            Request::Resize {
                session_id,
                cols,
                rows,
            } => match self.registry.lookup_mut(session_id) {
                Some(session) => {
                    if let Err(e) = session.resize(cols, rows) {
                        tracing::warn!(session = %session_id, "resize rejected: {e}");
                    }
                }
                None => tracing::debug!(session = %session_id, "resize for unknown session ignored"),
            },
            Request::Process { session_id } => {
                let name = self
                    .registry
                    .lookup(session_id)
                    .map(|session| session.process().process_name())
                    .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
                self.reply(connection, seq, Reply::Process { name });
            }
            Request::Ping { session_id } => {
                if !self.registry.touch_liveness(session_id, Instant::now()) {
                    tracing::debug!(session = %session_id, "ping for unknown session ignored");
                }
            }
            Request::Destroy { session_id } => self.remove_session(session_id),
        }
    }

    /// Start a shell on the blocking pool; the reply goes out from
    /// [`spawn_finished`](Self::spawn_finished).
    fn spawn(&mut self, connection: ConnectionId, seq: Option<u64>) {
        if let Err(e) = self.registry.ensure_capacity(self.pending_spawns) {
            if self.options.share
                && let Some(session_id) = self.registry.oldest()
            {
                tracing::info!(session = %session_id, %connection, "attaching to shared session");
                self.attach(connection, session_id);
                self.reply(connection, seq, Reply::Spawned { session_id });
            } else {
                tracing::warn!(%connection, "spawn failed: {e}");
                self.reply(
                    connection,
                    seq,
                    Reply::SpawnFailed {
                        message: e.to_string(),
                    },
                );
            }
            return;
        }

        self.pending_spawns += 1;
        let options = self.options.spawn.clone();
        let finished = self.spawns_tx.clone();
        tokio::spawn(async move {
            let spawned = tokio::task::spawn_blocking(move || -> Result<_, SpawnError> {
                let dimensions = Dimensions::new(options.cols, options.rows)?;
                let (process, events) = PtyProcess::spawn(options)?;
                Ok((process, events, dimensions))
            })
            .await;
            let result = spawned.unwrap_or_else(|e| Err(SpawnError::Io(std::io::Error::other(e))));
            // If the loop has stopped, dropping the message destroys the process
            let _ = finished.send(SpawnFinished {
                connection,
                seq,
                result,
            });
        });
    }

    fn spawn_finished(&mut self, finished: SpawnFinished) {
        let SpawnFinished {
            connection,
            seq,
            result,
        } = finished;
        self.pending_spawns = self.pending_spawns.saturating_sub(1);

        let (process, events, dimensions) = match result {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(%connection, "spawn failed: {e}");
                self.reply(
                    connection,
                    seq,
                    Reply::SpawnFailed {
                        message: e.to_string(),
                    },
                );
                return;
            }
        };
        if !self.connections.contains_key(&connection) {
            // Nobody ever learned its id
            tracing::debug!(%connection, pid = %process.pid(), "spawner left, discarding shell");
            return;
        }

        let session_id = self
            .registry
            .insert(process, events, dimensions, Instant::now());
        self.attach(connection, session_id);
        self.reply(connection, seq, Reply::Spawned { session_id });
    }

    fn attach(&mut self, connection: ConnectionId, session_id: SessionId) {
        if let Some(state) = self.connections.get_mut(&connection) {
            state.sessions.insert(session_id);
            self.owners.entry(session_id).or_default().insert(connection);
        }
    }

    fn handle_session_event(&mut self, SessionEvent { session_id, event }: SessionEvent) {
        // Output still in flight from a session that was already removed.
        if self.registry.lookup(session_id).is_none() {
            return;
        }

        match event {
            PtyEvent::Data(data) => self.broadcast(
                session_id,
                ServerMessage::Data {
                    session_id,
                    data: data.to_vec(),
                },
            ),
            PtyEvent::TitleChanged(title) => {
                self.broadcast(session_id, ServerMessage::Title { session_id, title });
            }
            PtyEvent::Exited { code } => {
                tracing::info!(session = %session_id, code, "shell exited");
                self.remove_session(session_id);
            }
        }
    }

    fn handle_disconnect(&mut self, connection: ConnectionId) {
        let Some(state) = self.connections.remove(&connection) else {
            return;
        };
        tracing::debug!(%connection, sessions = state.sessions.len(), "client disconnected");

        for session_id in state.sessions {
            let orphaned = match self.owners.get_mut(&session_id) {
                Some(owners) => {
                    owners.remove(&connection);
                    owners.is_empty()
                }
                None => true,
            };
            if !orphaned {
                continue;
            }
            self.owners.remove(&session_id);
            if self.options.on_disconnect == DisconnectPolicy::Destroy {
                self.registry.destroy_session(session_id);
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        for session_id in self.options.sweeper.sweep(&mut self.registry, now) {
            self.session_removed(session_id);
        }
    }

    /// Destroy a session, if it still exists, and tell its owners.
    fn remove_session(&mut self, session_id: SessionId) {
        if self.registry.destroy_session(session_id) {
            self.session_removed(session_id);
        }
    }

    /// Send `kill` to every owner and forget the ownership.
    fn session_removed(&mut self, session_id: SessionId) {
        let Some(owners) = self.owners.remove(&session_id) else {
            return;
        };
        for connection in owners {
            if let Some(state) = self.connections.get_mut(&connection) {
                state.sessions.remove(&session_id);
                tracing::debug!(%connection, ">>> kill {session_id}");
                if !state.deliver(ServerMessage::Kill { session_id }) {
                    self.stalled.push(connection);
                }
            }
        }
    }

    fn broadcast(&mut self, session_id: SessionId, message: ServerMessage) {
        let Some(owners) = self.owners.get(&session_id) else {
            return;
        };
        for connection in owners {
            if let Some(state) = self.connections.get(connection)
                && !state.deliver(message.clone())
            {
                self.stalled.push(*connection);
            }
        }
    }

    fn reply(&mut self, connection: ConnectionId, seq: Option<u64>, reply: Reply) {
        if let Some(state) = self.connections.get(&connection) {
            let message = ServerMessage::Reply {
                seq: seq.unwrap_or(0),
                reply,
            };
            if !state.deliver(message) {
                self.stalled.push(connection);
            }
        }
    }

    /// Disconnect every client that could not keep up, as if it had gone away.
    /// Its queued messages are still delivered before its stream ends.
    fn drop_stalled(&mut self) {
        let mut stalled = std::mem::take(&mut self.stalled);
        stalled.sort_unstable_by_key(|id| id.0);
        stalled.dedup();
        for connection in stalled {
            if self.connections.contains_key(&connection) {
                tracing::warn!(
                    %connection,
                    capacity = self.options.outbound_capacity,
                    "client is not reading, dropping connection"
                );
                self.handle_disconnect(connection);
            }
        }
    }
}
