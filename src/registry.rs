//! Bookkeeping for live terminal sessions.
//!
//! The registry owns no transports. Each relay owns its own transport and
//! registers a cancellation token here; removing a session fires the token,
//! which is the one shutdown signal the relay listens for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// One live interactive session.
#[derive(Clone)]
pub struct TerminalSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub host: String,
    pub port: u16,
    pub cols: u16,
    pub rows: u16,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Serializable view of a session for listing APIs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub host: String,
    pub port: u16,
    pub cols: u16,
    pub rows: u16,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl TerminalSession {
    pub fn new(user_id: Uuid, server_id: Uuid, host: String, port: u16, cols: u16, rows: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            server_id,
            host,
            port,
            cols,
            rows,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// The one-shot shutdown signal shared with the owning relay.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flip to `Closed` and fire the cancellation token. Idempotent.
    pub fn close(&mut self) {
        self.status = SessionStatus::Closed;
        self.cancel.cancel();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            user_id: self.user_id,
            server_id: self.server_id,
            host: self.host.clone(),
            port: self.port,
            cols: self.cols,
            rows: self.rows,
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Concurrency-safe directory of live sessions.
///
/// One coarse lock over the whole map; session counts are small relative
/// to per-session throughput, and no byte moves through here.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, TerminalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, session: TerminalSession) {
        let id = session.id;
        self.sessions.write().insert(id, session);
        tracing::debug!("Session {} registered", id);
    }

    pub fn get(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().get(&id).map(TerminalSession::info)
    }

    /// Remove a session and fire its cancellation token. Safe to call for
    /// ids that were already removed.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.sessions.write().remove(&id);
        match removed {
            Some(mut session) => {
                session.close();
                tracing::debug!("Session {} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn list_by_user(&self, user_id: Uuid) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(TerminalSession::info)
            .collect()
    }

    pub fn list_by_server(&self, server_id: Uuid) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.server_id == server_id)
            .map(TerminalSession::info)
            .collect()
    }

    pub fn find_active_by_user_and_server(
        &self,
        user_id: Uuid,
        server_id: Uuid,
    ) -> Option<SessionInfo> {
        self.sessions
            .read()
            .values()
            .find(|s| {
                s.user_id == user_id
                    && s.server_id == server_id
                    && s.status == SessionStatus::Active
            })
            .map(TerminalSession::info)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Record a resize so inspection APIs report current dimensions.
    pub fn update_size(&self, id: Uuid, cols: u16, rows: u16) {
        if let Some(session) = self.sessions.write().get_mut(&id) {
            session.cols = cols;
            session.rows = rows;
        }
    }

    /// Evict sessions older than `max_age`, firing their tokens. Returns
    /// how many were evicted.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(12));
        let expired: Vec<Uuid> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.id)
            .collect();

        for id in &expired {
            tracing::warn!("Evicting session {} past max age", id);
            self.remove(*id);
        }
        expired.len()
    }

    /// Background sweep bounding resource leakage if a relay wedges.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        max_age: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_older_than(max_age);
                if evicted > 0 {
                    tracing::info!("Session sweeper evicted {} stale sessions", evicted);
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: Uuid, server_id: Uuid) -> TerminalSession {
        TerminalSession::new(user_id, server_id, "example.com".into(), 22, 80, 24)
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let registry = SessionRegistry::new();
        let s = session(Uuid::new_v4(), Uuid::new_v4());
        let id = s.id;

        registry.add(s);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(id).is_some());

        assert!(registry.remove(id));
        assert_eq!(registry.count(), 0);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let s = session(Uuid::new_v4(), Uuid::new_v4());
        let id = s.id;
        registry.add(s);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.remove(Uuid::new_v4()));
    }

    #[test]
    fn close_is_idempotent_and_flips_status() {
        let mut s = session(Uuid::new_v4(), Uuid::new_v4());
        let token = s.cancel_token();

        s.close();
        s.close();

        assert_eq!(s.status, SessionStatus::Closed);
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_fires_cancellation_token() {
        let registry = SessionRegistry::new();
        let s = session(Uuid::new_v4(), Uuid::new_v4());
        let id = s.id;
        let token = s.cancel_token();
        registry.add(s);

        assert!(!token.is_cancelled());
        registry.remove(id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn lists_filter_by_user_and_server() {
        let registry = SessionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let server1 = Uuid::new_v4();
        let server2 = Uuid::new_v4();

        registry.add(session(alice, server1));
        registry.add(session(alice, server2));
        registry.add(session(bob, server1));

        assert_eq!(registry.list_by_user(alice).len(), 2);
        assert_eq!(registry.list_by_user(bob).len(), 1);
        assert_eq!(registry.list_by_server(server1).len(), 2);
        assert_eq!(registry.list_by_server(server2).len(), 1);
    }

    #[test]
    fn find_active_matches_user_and_server_pair() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let server = Uuid::new_v4();

        assert!(registry.find_active_by_user_and_server(user, server).is_none());

        registry.add(session(user, server));
        let found = registry
            .find_active_by_user_and_server(user, server)
            .expect("found");
        assert_eq!(found.user_id, user);
        assert_eq!(found.server_id, server);

        assert!(
            registry
                .find_active_by_user_and_server(user, Uuid::new_v4())
                .is_none()
        );
    }

    #[test]
    fn update_size_changes_reported_dimensions() {
        let registry = SessionRegistry::new();
        let s = session(Uuid::new_v4(), Uuid::new_v4());
        let id = s.id;
        registry.add(s);

        registry.update_size(id, 120, 40);
        let info = registry.get(id).expect("present");
        assert_eq!((info.cols, info.rows), (120, 40));
    }

    #[test]
    fn sweep_evicts_only_expired_sessions() {
        let registry = SessionRegistry::new();
        let fresh = session(Uuid::new_v4(), Uuid::new_v4());
        let fresh_id = fresh.id;
        registry.add(fresh);

        let mut stale = session(Uuid::new_v4(), Uuid::new_v4());
        stale.created_at = Utc::now() - chrono::Duration::hours(13);
        let stale_id = stale.id;
        let stale_token = stale.cancel_token();
        registry.add(stale);

        let evicted = registry.sweep_older_than(Duration::from_secs(12 * 3600));
        assert_eq!(evicted, 1);
        assert!(registry.get(fresh_id).is_some());
        assert!(registry.get(stale_id).is_none());
        assert!(stale_token.is_cancelled());
    }

    #[test]
    fn concurrent_add_remove_keeps_count_consistent() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let s = session(Uuid::new_v4(), Uuid::new_v4());
                    let id = s.id;
                    registry.add(s);
                    assert!(registry.get(id).is_some());
                    assert!(registry.remove(id));
                    assert!(registry.get(id).is_none());
                }
            }));
        }
        for handle in handles {
            handle.join().expect("no panics");
        }

        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn session_info_serializes_for_listing_api() {
        let s = session(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(s.info()).expect("serialize");
        assert_eq!(json["status"], "active");
        assert_eq!(json["host"], "example.com");
        assert_eq!(json["cols"], 80);
    }
}
