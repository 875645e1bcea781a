//! Idle-session eviction.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use webterm_protocol::SessionId;

use crate::registry::SessionRegistry;

/// Destroys sessions that have not been pinged within `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct LivenessSweeper {
    interval: Duration,
    timeout: Duration,
}

impl LivenessSweeper {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    #[must_use]
    pub fn from_config(config: &webterm_config::LivenessConfig) -> Self {
        Self::new(config.sweep_interval(), config.timeout())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Timer driving [`sweep`](Self::sweep). A late tick is not made up for.
    #[must_use]
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Destroy every session idle for at least the timeout and return their ids.
    ///
    /// Works from a snapshot, so sessions destroyed elsewhere in the meantime
    /// are simply skipped.
    pub fn sweep(&self, registry: &mut SessionRegistry, now: Instant) -> Vec<SessionId> {
        registry
            .expired(now, self.timeout)
            .into_iter()
            .filter(|&id| {
                let removed = registry.destroy_session(id);
                if removed {
                    tracing::info!(session = %id, timeout = ?self.timeout, "session timed out");
                }
                removed
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::SpawnOptions;

    fn sh() -> SpawnOptions {
        let mut options = SpawnOptions::new(vec!["/bin/sh".to_string()]);
        options.kill_grace = Duration::from_millis(200);
        options
    }

    #[tokio::test]
    async fn test_fresh_ping_survives_sweep() {
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let mut registry = SessionRegistry::new(tx, None);
        let sweeper = LivenessSweeper::new(Duration::from_secs(1), Duration::from_secs(60));

        let start = Instant::now();
        let id = registry.create_session(sh(), start).unwrap();
        let later = start + Duration::from_secs(120);
        registry.touch_liveness(id, later);

        assert!(sweeper.sweep(&mut registry, later).is_empty());
        assert!(registry.lookup(id).is_some());
    }

    #[tokio::test]
    async fn test_stale_session_evicted() {
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let mut registry = SessionRegistry::new(tx, None);
        let sweeper = LivenessSweeper::new(Duration::from_secs(1), Duration::from_secs(60));

        let start = Instant::now();
        let stale = registry.create_session(sh(), start).unwrap();
        let fresh = registry.create_session(sh(), start).unwrap();
        let now = start + Duration::from_secs(60);
        registry.touch_liveness(fresh, now);

        assert_eq!(sweeper.sweep(&mut registry, now), vec![stale]);
        assert!(registry.lookup(stale).is_none());
        assert!(registry.lookup(fresh).is_some());

        // Already gone: nothing to do on the next tick
        assert!(sweeper.sweep(&mut registry, now).is_empty());
    }
}
