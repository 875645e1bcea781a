//! One terminal window's view of its server-side session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webterm_protocol::{Request, ServerMessage, SessionId};

use crate::connection::{Connection, ConnectionHub, Subscription};
use crate::{Error, Result};

/// What a window needs to know about its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Raw bytes for the terminal renderer.
    Output(Vec<u8>),
    /// New window title.
    Title(String),
    /// The session is gone; the window is defunct until reconnected.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    pub poll_interval: Duration,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            cell_width: 7,
            cell_height: 14,
        }
    }
}

impl ProxyOptions {
    #[must_use]
    pub fn from_config(config: &webterm_config::ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            cell_width: config.cell_width,
            cell_height: config.cell_height,
        }
    }

    #[must_use]
    pub fn grid(&self, width: u32, height: u32) -> (u16, u16) {
        grid_for_pixels(width, height, self.cell_width, self.cell_height)
    }
}

/// Character grid `(cols, rows)` for a window of `width` x `height` pixels.
/// Each dimension is at least 1.
#[must_use]
pub fn grid_for_pixels(width: u32, height: u32, cell_width: u32, cell_height: u32) -> (u16, u16) {
    let cells = |pixels: u32, cell: u32| {
        let n = pixels / cell.max(1);
        u16::try_from(n).unwrap_or(u16::MAX).max(1)
    };
    (cells(width, cell_width), cells(height, cell_height))
}

/// State shared between the proxy and its background tasks.
#[derive(Debug)]
struct WindowState {
    session_id: Option<SessionId>,
    grid: (u16, u16),
    last_title: Option<String>,
}

impl WindowState {
    fn new(grid: (u16, u16)) -> Self {
        Self {
            session_id: None,
            grid,
            last_title: None,
        }
    }

    /// Title for the current process name, or None if it did not change.
    fn title_for(&mut self, name: &str) -> Option<String> {
        let (cols, rows) = self.grid;
        let title = format!("{name} [{cols}x{rows}]");
        if self.last_title.as_deref() == Some(title.as_str()) {
            return None;
        }
        self.last_title = Some(title.clone());
        Some(title)
    }
}

/// Drives one session on behalf of one terminal window.
///
/// Output, title changes and session loss arrive through
/// [`next_event`](Self::next_event). Dropping the proxy destroys the session.
pub struct SessionProxy {
    hub: Arc<ConnectionHub>,
    options: ProxyOptions,
    connection: Option<Connection>,
    state: Arc<Mutex<WindowState>>,
    events_tx: mpsc::UnboundedSender<ProxyEvent>,
    events: mpsc::UnboundedReceiver<ProxyEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxy")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SessionProxy {
    /// Spawn a session for a window of `width` x `height` pixels.
    pub async fn open(
        hub: Arc<ConnectionHub>,
        options: ProxyOptions,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut proxy = Self {
            hub,
            options,
            connection: None,
            state: Arc::new(Mutex::new(WindowState::new(options.grid(width, height)))),
            events_tx,
            events,
            tasks: Vec::new(),
        };
        proxy.start().await?;
        Ok(proxy)
    }

    async fn start(&mut self) -> Result<SessionId> {
        let connection = self.hub.acquire().await?;
        let (session_id, subscription) = connection.spawn().await?;

        let (cols, rows) = {
            let mut state = self.state.lock();
            state.session_id = Some(session_id);
            state.last_title = None;
            state.grid
        };
        connection.send(Request::Resize {
            session_id,
            cols,
            rows,
        })?;
        tracing::info!(session = %session_id, cols, rows, "session opened");

        self.tasks.push(tokio::spawn(forward(
            session_id,
            subscription,
            Arc::clone(&self.state),
            self.events_tx.clone(),
        )));
        self.tasks.push(tokio::spawn(poll(
            session_id,
            connection.clone(),
            self.options.poll_interval,
            Arc::clone(&self.state),
            self.events_tx.clone(),
        )));
        self.connection = Some(connection);
        Ok(session_id)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session_id
    }

    /// The session is gone and no input will be delivered.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        self.session_id().is_none()
    }

    #[must_use]
    pub fn grid(&self) -> (u16, u16) {
        self.state.lock().grid
    }

    fn live(&self) -> Result<(&Connection, SessionId)> {
        match (&self.connection, self.session_id()) {
            (Some(connection), Some(session_id)) => Ok((connection, session_id)),
            _ => Err(Error::NoSession),
        }
    }

    /// Keystrokes, sent as-is. The server's echo is the only echo.
    pub fn send_input(&self, data: &[u8]) -> Result<()> {
        let (connection, session_id) = self.live()?;
        connection.send(Request::Data {
            session_id,
            data: data.to_vec(),
        })
    }

    /// Recompute the grid for a new window size. A resize is sent only when
    /// the grid actually changed; returns whether it did.
    pub fn resize_pixels(&mut self, width: u32, height: u32) -> Result<bool> {
        let grid = self.options.grid(width, height);
        self.resize_grid(grid.0, grid.1)
    }

    /// Like [`resize_pixels`](Self::resize_pixels) for callers that already
    /// know their grid.
    pub fn resize_grid(&mut self, cols: u16, rows: u16) -> Result<bool> {
        let grid = (cols.max(1), rows.max(1));
        {
            let mut state = self.state.lock();
            if state.grid == grid {
                return Ok(false);
            }
            state.grid = grid;
        }
        if let Ok((connection, session_id)) = self.live() {
            tracing::debug!(session = %session_id, cols = grid.0, rows = grid.1, "resize");
            connection.send(Request::Resize {
                session_id,
                cols: grid.0,
                rows: grid.1,
            })?;
        }
        Ok(true)
    }

    /// Next event for the window. Never returns None while the proxy lives.
    pub async fn next_event(&mut self) -> Option<ProxyEvent> {
        self.events.recv().await
    }

    /// Destroy the session and drop local state. The shared connection is
    /// released; it closes once no other window holds it.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let session_id = self.state.lock().session_id.take();
        if let (Some(connection), Some(session_id)) = (self.connection.take(), session_id) {
            tracing::info!(session = %session_id, "closing session");
            let _ = connection.send(Request::Destroy { session_id });
        }
    }

    /// Like [`close`](Self::close), but returns only once the server has
    /// handled the destroy.
    pub async fn close_and_wait(&mut self) -> Result<()> {
        let connection = self.connection.clone();
        let session_id = self.session_id();
        self.close();
        if let (Some(connection), Some(session_id)) = (connection, session_id) {
            // Requests on one connection are handled in order
            connection.process_name(session_id).await?;
        }
        Ok(())
    }

    /// Start over with a fresh session, on a fresh connection if the old one
    /// is gone. Any session still held is destroyed first.
    pub async fn reconnect(&mut self) -> Result<SessionId> {
        self.close();
        self.start().await
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relay server pushes for one session to the window.
async fn forward(
    session_id: SessionId,
    mut subscription: Subscription,
    state: Arc<Mutex<WindowState>>,
    events: mpsc::UnboundedSender<ProxyEvent>,
) {
    while let Some(message) = subscription.recv().await {
        let event = match message {
            ServerMessage::Data { data, .. } => ProxyEvent::Output(data),
            ServerMessage::Title { title, .. } => match state.lock().title_for(&title) {
                Some(title) => ProxyEvent::Title(title),
                None => continue,
            },
            ServerMessage::Kill { .. } => break,
            ServerMessage::Reply { .. } => continue,
        };
        if events.send(event).is_err() {
            return;
        }
    }

    // Killed by the server or connection lost
    let mut guard = state.lock();
    if guard.session_id == Some(session_id) {
        guard.session_id = None;
        drop(guard);
        tracing::info!(session = %session_id, "session ended");
        let _ = events.send(ProxyEvent::Closed);
    }
}

/// Keep the session alive and the title current.
async fn poll(
    session_id: SessionId,
    connection: Connection,
    interval: Duration,
    state: Arc<Mutex<WindowState>>,
    events: mpsc::UnboundedSender<ProxyEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if state.lock().session_id != Some(session_id) {
            return;
        }
        if connection.send(Request::Ping { session_id }).is_err() {
            return;
        }
        let name = match connection.process_name(session_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(session = %session_id, "process query failed: {e}");
                return;
            }
        };
        let title = state.lock().title_for(&name);
        if let Some(title) = title
            && events.send(ProxyEvent::Title(title)).is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_for_pixels() {
        assert_eq!(grid_for_pixels(700, 420, 7, 14), (100, 30));
        assert_eq!(grid_for_pixels(706, 427, 7, 14), (100, 30));
    }

    #[test]
    fn test_grid_is_at_least_one_cell() {
        assert_eq!(grid_for_pixels(0, 0, 7, 14), (1, 1));
        assert_eq!(grid_for_pixels(6, 13, 7, 14), (1, 1));
        assert_eq!(grid_for_pixels(100, 100, 0, 0), (100, 100));
    }

    #[test]
    fn test_grid_saturates() {
        assert_eq!(grid_for_pixels(u32::MAX, 14, 1, 14), (u16::MAX, 1));
    }

    #[test]
    fn test_identical_titles_are_suppressed() {
        let mut state = WindowState::new((80, 30));
        assert_eq!(state.title_for("zsh").as_deref(), Some("zsh [80x30]"));
        assert_eq!(state.title_for("zsh"), None);
        assert_eq!(state.title_for("vim").as_deref(), Some("vim [80x30]"));

        state.grid = (100, 40);
        assert_eq!(state.title_for("vim").as_deref(), Some("vim [100x40]"));
        assert_eq!(state.title_for("vim"), None);
    }
}
