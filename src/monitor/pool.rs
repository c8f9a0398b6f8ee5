//! Reference-counted pool of shared monitoring connections.
//!
//! Monitor streams for the same (user, server) pair share one SSH
//! connection. Each viewer holds one reference; the underlying transport
//! closes exactly once, when the last reference is released or on an
//! explicit force-close.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::error::SshError;

/// Pool entries are shared per (user, server), never across users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub user_id: Uuid,
    pub server_id: Uuid,
}

impl PoolKey {
    pub fn new(user_id: Uuid, server_id: Uuid) -> Self {
        Self { user_id, server_id }
    }
}

/// A transport the pool can health-check and close.
#[async_trait]
pub trait ManagedTransport: Send + Sync + 'static {
    async fn is_connected(&self) -> bool;
    async fn close(&self);
}

/// Dials a new monitoring transport for a pool key.
#[async_trait]
pub trait MonitorConnector: Send + Sync + 'static {
    type Transport: ManagedTransport;

    async fn connect(&self, user_id: Uuid, server_id: Uuid)
    -> Result<Self::Transport, SshError>;
}

/// One shared connection plus its reference count.
///
/// The count has its own lock so retain/release never contends with
/// unrelated pool entries.
pub struct PooledConnection<T> {
    key: PoolKey,
    transport: T,
    refs: Mutex<u32>,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
}

impl<T: ManagedTransport> PooledConnection<T> {
    fn new(key: PoolKey, transport: T) -> Self {
        let now = Utc::now();
        Self {
            key,
            transport,
            refs: Mutex::new(0),
            closed: AtomicBool::new(false),
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn ref_count(&self) -> u32 {
        *self.refs.lock()
    }

    fn retain(&self) -> u32 {
        let mut refs = self.refs.lock();
        *refs += 1;
        *self.last_used.lock() = Utc::now();
        *refs
    }

    fn release(&self) -> u32 {
        let mut refs = self.refs.lock();
        *refs = refs.saturating_sub(1);
        *refs
    }

    /// Close the transport at most once, no matter how many triggers fire.
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.close().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolEntryStats {
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub ref_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub entries: Vec<PoolEntryStats>,
}

pub struct ConnectionPool<C: MonitorConnector> {
    connector: C,
    connections: RwLock<HashMap<PoolKey, Arc<PooledConnection<C::Transport>>>>,
}

impl<C: MonitorConnector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get the shared connection for `key`, dialing a new one if none is
    /// live. The returned reference must be paired with exactly one
    /// [`ConnectionPool::release`].
    pub async fn acquire(
        &self,
        key: PoolKey,
    ) -> Result<Arc<PooledConnection<C::Transport>>, SshError> {
        // Bound on its own statement so the read guard drops before any
        // await and before evict_if_same takes the write lock.
        let current = self.connections.read().get(&key).cloned();
        if let Some(existing) = current {
            if existing.transport.is_connected().await {
                existing.retain();
                return Ok(existing);
            }
            // Stale entry; evict it before dialing fresh.
            tracing::info!(
                "Monitor connection for user {} server {} is dead; reconnecting",
                key.user_id,
                key.server_id
            );
            self.evict_if_same(&key, &existing);
            existing.close().await;
        }

        let transport = self.connector.connect(key.user_id, key.server_id).await?;
        let fresh = Arc::new(PooledConnection::new(key, transport));

        // Re-check under the write lock; a concurrent acquire may have
        // inserted while we were dialing.
        let race_loser = {
            let mut map = self.connections.write();
            match map.get(&key).cloned() {
                Some(existing) => Some(existing),
                None => {
                    map.insert(key, Arc::clone(&fresh));
                    None
                }
            }
        };

        match race_loser {
            None => {
                fresh.retain();
                Ok(fresh)
            }
            Some(existing) => {
                fresh.close().await;
                existing.retain();
                Ok(existing)
            }
        }
    }

    /// Drop one reference on the connection the caller holds. The transport
    /// closes when its count hits zero. Releasing by handle rather than by
    /// key means a stale holder can never decrement a replacement entry
    /// dialed after its own connection died.
    pub async fn release(&self, conn: &Arc<PooledConnection<C::Transport>>) {
        let remaining = conn.release();
        if remaining == 0 {
            self.evict_if_same(&conn.key, conn);
            conn.close().await;
            tracing::debug!(
                "Closed idle monitor connection for user {} server {}",
                conn.key.user_id,
                conn.key.server_id
            );
        }
    }

    /// Administrative close regardless of the reference count. Pollers
    /// holding references observe a dead transport on next use.
    pub async fn force_close(&self, key: PoolKey) -> bool {
        let removed = self.connections.write().remove(&key);
        match removed {
            Some(conn) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let map = self.connections.read();
        let entries = map
            .values()
            .map(|conn| PoolEntryStats {
                user_id: conn.key.user_id,
                server_id: conn.key.server_id,
                ref_count: conn.ref_count(),
                created_at: conn.created_at,
                last_used: *conn.last_used.lock(),
            })
            .collect();
        PoolStats {
            connections: map.len(),
            entries,
        }
    }

    fn evict_if_same(&self, key: &PoolKey, conn: &Arc<PooledConnection<C::Transport>>) {
        let mut map = self.connections.write();
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, conn) {
                map.remove(key);
            }
        }
    }
}
