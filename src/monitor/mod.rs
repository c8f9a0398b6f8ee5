//! Background monitoring: pooled SSH connections and metrics polling.

pub mod collector;
pub mod pool;

pub use collector::{Collector, MetricSample};
pub use pool::{ConnectionPool, ManagedTransport, MonitorConnector, PoolKey, PoolStats};

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::directory::ServerDirectory;
use crate::error::SshError;
use crate::ssh::{SshClient, Transport};

#[async_trait]
impl ManagedTransport for Transport {
    async fn is_connected(&self) -> bool {
        Transport::is_connected(self).await
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

/// Dials monitoring transports by resolving the (user, server) pair
/// through the server directory.
pub struct SshMonitorConnector {
    directory: Arc<dyn ServerDirectory>,
    client: SshClient,
}

impl SshMonitorConnector {
    pub fn new(directory: Arc<dyn ServerDirectory>, client: SshClient) -> Self {
        Self { directory, client }
    }
}

#[async_trait]
impl MonitorConnector for SshMonitorConnector {
    type Transport = Transport;

    async fn connect(&self, user_id: Uuid, server_id: Uuid) -> Result<Transport, SshError> {
        let descriptor = self
            .directory
            .resolve(user_id, server_id)
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: server_id.to_string(),
                port: 0,
                reason: e.to_string(),
            })?;
        self.client.connect(descriptor).await
    }
}

/// The pool type the server composes over.
pub type MonitorPool = ConnectionPool<SshMonitorConnector>;
