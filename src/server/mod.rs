//! HTTP/WebSocket surface: terminal relay, monitor streams, and the REST
//! inspection API.

pub mod api;
pub mod monitor;
pub mod protocol;
pub mod terminal;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, MonitorConfig};
use crate::directory::ServerDirectory;
use crate::hostkeys::{HostKeyStore, HostKeyVerifier};
use crate::monitor::{ConnectionPool, MonitorPool, SshMonitorConnector};
use crate::registry::SessionRegistry;
use crate::ssh::{HostKeyPolicy, SshClient};

/// Everything the handlers share. No globals; one of these per process,
/// built in main and cloned into the router.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<dyn ServerDirectory>,
    pub terminal_client: Arc<SshClient>,
    pub verifier: Arc<HostKeyVerifier>,
    pub pool: Arc<MonitorPool>,
    pub monitor: MonitorConfig,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn HostKeyStore>,
        directory: Arc<dyn ServerDirectory>,
    ) -> Self {
        let verifier = Arc::new(HostKeyVerifier::new(store));

        let terminal_policy = if config.ssh.insecure_accept_any_host_key {
            HostKeyPolicy::InsecureAcceptAny
        } else {
            HostKeyPolicy::Tofu(Arc::clone(&verifier))
        };
        // Pooled monitor connections verify by default; opting out is a
        // distinct, logged decision.
        let monitor_policy = if config.monitor.verify_host_keys
            && !config.ssh.insecure_accept_any_host_key
        {
            HostKeyPolicy::Tofu(Arc::clone(&verifier))
        } else {
            tracing::warn!("Monitor connections will not verify host keys");
            HostKeyPolicy::InsecureAcceptAny
        };

        let terminal_client = Arc::new(SshClient::new(
            config.ssh.connect_timeout_secs,
            config.ssh.keepalive_interval_secs,
            terminal_policy,
        ));
        let monitor_client = SshClient::new(
            config.ssh.connect_timeout_secs,
            config.ssh.keepalive_interval_secs,
            monitor_policy,
        );

        let pool = Arc::new(ConnectionPool::new(SshMonitorConnector::new(
            Arc::clone(&directory),
            monitor_client,
        )));

        Self {
            registry: Arc::new(SessionRegistry::new()),
            directory,
            terminal_client,
            verifier,
            pool,
            monitor: config.monitor.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/terminal/:server_id", get(terminal::terminal_handler))
        .route("/ws/monitor/:server_id", get(monitor::monitor_handler))
        .route("/api/sessions", get(api::list_sessions))
        .route(
            "/api/sessions/:id",
            get(api::get_session).delete(api::close_session),
        )
        .route("/api/pool/stats", get(api::pool_stats))
        .route(
            "/api/hostkeys",
            get(api::list_host_keys).delete(api::delete_host_key),
        )
        .route("/api/hostkeys/trust", post(api::trust_host_key))
        .route("/api/hostkeys/revoke", post(api::revoke_host_key))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::hostkeys::MemoryHostKeyStore;

    pub(crate) fn test_state() -> AppState {
        let config = AppConfig::default();
        AppState::new(
            &config,
            Arc::new(MemoryHostKeyStore::new()),
            Arc::new(MemoryDirectory::new()),
        )
    }

    #[test]
    fn state_builds_from_default_config() {
        let state = test_state();
        assert_eq!(state.registry.count(), 0);
        assert_eq!(state.pool.stats().connections, 0);
    }

    #[test]
    fn router_builds_without_panicking() {
        let _ = router(test_state());
    }
}
