//! Client library for webterm sessions.
//!
//! A [`ConnectionHub`] hands out one shared WebSocket [`Connection`] per
//! server; every terminal window drives its own session through a
//! [`SessionProxy`] on top of it.

mod connection;
mod proxy;

pub use connection::{Connection, ConnectionHub, Subscription};
pub use proxy::{ProxyEvent, ProxyOptions, SessionProxy, grid_for_pixels};
pub use webterm_protocol::{Reply, Request, ServerMessage, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection to the server was lost")]
    Closed,
    #[error("server could not start a shell: {0}")]
    SpawnFailed(String),
    #[error("no live session; reconnect to start a new one")]
    NoSession,
    #[error("unexpected reply from server: {0:?}")]
    UnexpectedReply(Reply),
}

pub type Result<T> = std::result::Result<T, Error>;
