//! Session registry: the single owner of every PTY process.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use webterm_protocol::SessionId;

use crate::pty::{
    Dimensions, InvalidDimensions, PtyEvent, PtyEvents, PtyProcess, SpawnError, SpawnOptions,
};

/// A PTY event tagged with the session that produced it.
#[derive(Debug)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub event: PtyEvent,
}

/// One live shell.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    process: PtyProcess,
    last_liveness: Instant,
    dimensions: Dimensions,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    #[must_use]
    pub fn last_liveness(&self) -> Instant {
        self.last_liveness
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Resize the PTY and remember the new size.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), InvalidDimensions> {
        self.process.resize(cols, rows)?;
        self.dimensions = Dimensions::new(cols, rows)?;
        Ok(())
    }
}

/// Maps session ids to their processes.
///
/// Removing an entry always destroys its process, and a process is only
/// destroyed by removing its entry.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
    max_sessions: Option<usize>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Output of every session is forwarded to `events_tx`. A full channel
    /// stops reading from the PTYs until it drains.
    #[must_use]
    pub fn new(events_tx: mpsc::Sender<SessionEvent>, max_sessions: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            max_sessions,
            events_tx,
        }
    }

    /// Spawn a shell and register it. Returns once the process is started,
    /// not once the shell is ready for input.
    pub fn create_session(
        &mut self,
        options: SpawnOptions,
        now: Instant,
    ) -> Result<SessionId, SpawnError> {
        self.ensure_capacity(0)?;
        let dimensions = Dimensions::new(options.cols, options.rows)?;
        let (process, events) = PtyProcess::spawn(options)?;
        Ok(self.insert(process, events, dimensions, now))
    }

    /// Fails if `pending` more sessions would not fit under the limit.
    pub fn ensure_capacity(&self, pending: usize) -> Result<(), SpawnError> {
        match self.max_sessions {
            Some(max) if self.sessions.len() + pending >= max => {
                Err(SpawnError::LimitReached(max))
            }
            _ => Ok(()),
        }
    }

    /// Register an already spawned process and start forwarding its events.
    pub fn insert(
        &mut self,
        process: PtyProcess,
        mut events: PtyEvents,
        dimensions: Dimensions,
        now: Instant,
    ) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if events_tx
                    .send(SessionEvent {
                        session_id: id,
                        event,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tracing::info!(session = %id, pid = %process.pid(), "session created");
        self.sessions.insert(
            id,
            Session {
                id,
                process,
                last_liveness: now,
                dimensions,
            },
        );
        id
    }

    #[must_use]
    pub fn lookup(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn lookup_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Record a liveness signal. Returns false if the session does not exist.
    pub fn touch_liveness(&mut self, id: SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.last_liveness = session.last_liveness.max(now);
                true
            }
            None => false,
        }
    }

    /// Remove the session and destroy its process. Returns false if it was
    /// already gone.
    pub fn destroy_session(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        session.process.destroy();
        tracing::info!(session = %id, "session destroyed");
        true
    }

    /// Snapshot of the current ids.
    #[must_use]
    pub fn all_session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Sessions whose last liveness signal is at least `timeout` old.
    #[must_use]
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_liveness) >= timeout)
            .map(|s| s.id)
            .collect()
    }

    /// The longest-lived session.
    #[must_use]
    pub fn oldest(&self) -> Option<SessionId> {
        self.sessions.keys().min().copied()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.max_sessions
            .is_some_and(|max| self.sessions.len() >= max)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for id in self.all_session_ids() {
            self.destroy_session(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> SpawnOptions {
        let mut options = SpawnOptions::new(vec!["/bin/sh".to_string()]);
        options.kill_grace = Duration::from_millis(200);
        options
    }

    fn registry(max: Option<usize>) -> (SessionRegistry, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (SessionRegistry::new(tx, max), rx)
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (mut registry, _events) = registry(None);
        let now = Instant::now();
        let a = registry.create_session(sh(), now).unwrap();
        let b = registry.create_session(sh(), now).unwrap();
        assert_ne!(a, b);

        registry.destroy_session(a);
        let c = registry.create_session(sh(), now).unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (mut registry, _events) = registry(None);
        let id = registry.create_session(sh(), Instant::now()).unwrap();
        assert!(registry.destroy_session(id));
        assert!(!registry.destroy_session(id));
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_touch_absent_session_does_not_create_it() {
        let (mut registry, _events) = registry(None);
        assert!(!registry.touch_liveness(SessionId(99), Instant::now()));
        assert!(registry.lookup(SessionId(99)).is_none());
    }

    #[tokio::test]
    async fn test_liveness_never_goes_backwards() {
        let (mut registry, _events) = registry(None);
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let id = registry.create_session(sh(), later).unwrap();
        assert!(registry.touch_liveness(id, start));
        assert_eq!(registry.lookup(id).unwrap().last_liveness(), later);
    }

    #[tokio::test]
    async fn test_expired() {
        let (mut registry, _events) = registry(None);
        let timeout = Duration::from_secs(60);
        let start = Instant::now();
        let id = registry.create_session(sh(), start).unwrap();

        assert!(registry.expired(start, timeout).is_empty());
        assert!(registry.expired(start + Duration::from_secs(59), timeout).is_empty());
        assert_eq!(registry.expired(start + timeout, timeout), vec![id]);

        registry.touch_liveness(id, start + timeout);
        assert!(registry.expired(start + timeout, timeout).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_during_snapshot_iteration() {
        let (mut registry, _events) = registry(None);
        let now = Instant::now();
        for _ in 0..3 {
            registry.create_session(sh(), now).unwrap();
        }
        let ids = registry.all_session_ids();
        for id in &ids {
            assert!(registry.destroy_session(*id));
            // a second pass over the same snapshot is harmless
            assert!(!registry.destroy_session(*id));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (mut registry, _events) = registry(Some(1));
        let now = Instant::now();
        let id = registry.create_session(sh(), now).unwrap();
        assert!(registry.is_full());
        assert!(matches!(
            registry.create_session(sh(), now),
            Err(SpawnError::LimitReached(1))
        ));
        assert_eq!(registry.oldest(), Some(id));

        registry.destroy_session(id);
        assert!(registry.create_session(sh(), now).is_ok());
    }

    #[tokio::test]
    async fn test_pending_spawns_count_toward_limit() {
        let (mut registry, _events) = registry(Some(2));
        assert!(registry.ensure_capacity(1).is_ok());
        assert!(matches!(
            registry.ensure_capacity(2),
            Err(SpawnError::LimitReached(2))
        ));

        let options = sh();
        let dimensions = Dimensions::new(options.cols, options.rows).unwrap();
        let (process, events) = PtyProcess::spawn(options).unwrap();
        registry.insert(process, events, dimensions, Instant::now());
        assert!(registry.ensure_capacity(0).is_ok());
        assert!(registry.ensure_capacity(1).is_err());
    }

    #[tokio::test]
    async fn test_resize_updates_dimensions() {
        let (mut registry, _events) = registry(None);
        let id = registry.create_session(sh(), Instant::now()).unwrap();
        let session = registry.lookup_mut(id).unwrap();

        assert!(session.resize(0, 10).is_err());
        assert_eq!(session.dimensions(), Dimensions::new(80, 30).unwrap());

        session.resize(100, 40).unwrap();
        assert_eq!(session.dimensions(), Dimensions::new(100, 40).unwrap());
        assert_eq!(session.process().size(), (100, 40));
    }

    #[tokio::test]
    async fn test_events_are_tagged() {
        let (mut registry, mut events) = registry(None);
        let id = registry.create_session(sh(), Instant::now()).unwrap();
        registry
            .lookup(id)
            .unwrap()
            .process()
            .write(bytes::Bytes::from_static(b"exit 0\n"));

        let exited = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(SessionEvent { session_id, event }) = events.recv().await {
                assert_eq!(session_id, id);
                if let PtyEvent::Exited { code } = event {
                    return code;
                }
            }
            -1
        })
        .await
        .unwrap();
        assert_eq!(exited, 0);
    }
}
