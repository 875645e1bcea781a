//! Shared protocol types for webterm terminal sessions.
//!
//! Every message is one JSON object carried in one WebSocket text frame and
//! tagged by its `type` field.

/// Name reported for the foreground process of a session that does not exist.
pub const UNKNOWN_PROCESS: &str = "unknown";

/// Path of the message connection endpoint.
pub const WS_PATH: &str = "/ws";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;

/// Identifier clients use to address a session.
///
/// Assigned by the server from a counter that never repeats within one server
/// process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client requests to the server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start a new shell session with the server's defaults.
    Spawn,
    /// Write raw input to a session.
    Data { session_id: SessionId, data: Vec<u8> },
    /// Resize a session's terminal.
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    /// Ask for the session's foreground process name.
    Process { session_id: SessionId },
    /// Liveness signal.
    Ping { session_id: SessionId },
    /// Tear the session down.
    Destroy { session_id: SessionId },
}

impl Request {
    /// The session this request addresses, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Request::Spawn => None,
            Request::Data { session_id, .. }
            | Request::Resize { session_id, .. }
            | Request::Process { session_id }
            | Request::Ping { session_id }
            | Request::Destroy { session_id } => Some(*session_id),
        }
    }

    /// Whether the server answers this request with a [`ServerMessage::Reply`].
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Spawn | Request::Process { .. })
    }
}

/// A request plus the sequence number its reply will carry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

impl ClientMessage {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self { seq: None, request }
    }

    #[must_use]
    pub fn with_seq(seq: u64, request: Request) -> Self {
        Self {
            seq: Some(seq),
            request,
        }
    }
}

/// Messages pushed from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to a `spawn` or `process` request. `seq` echoes the request's
    /// sequence number, or 0 when the request carried none.
    Reply { seq: u64, reply: Reply },
    /// Output produced by a session's process.
    Data { session_id: SessionId, data: Vec<u8> },
    /// The session's foreground process changed.
    Title { session_id: SessionId, title: String },
    /// The session was removed; clients must drop their local state for it.
    Kill { session_id: SessionId },
}

impl ServerMessage {
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ServerMessage::Reply { reply, .. } => match reply {
                Reply::Spawned { session_id } => Some(*session_id),
                Reply::SpawnFailed { .. } | Reply::Process { .. } => None,
            },
            ServerMessage::Data { session_id, .. }
            | ServerMessage::Title { session_id, .. }
            | ServerMessage::Kill { session_id } => Some(*session_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Session created.
    Spawned { session_id: SessionId },
    /// The shell could not be started.
    SpawnFailed { message: String },
    /// Foreground process name, or [`UNKNOWN_PROCESS`].
    Process { name: String },
}
