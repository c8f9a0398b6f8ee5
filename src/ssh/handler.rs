use std::future::Future;
use std::sync::Arc;

use russh::client::Handler;
use russh::keys::PublicKey;

use crate::error::SshError;
use crate::hostkeys::{HostKeyVerifier, fingerprint_of};
use crate::security_log;

/// How a connection decides whether to accept the server's host key.
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Trust-on-first-use backed by the persistent trust store.
    Tofu(Arc<HostKeyVerifier>),
    /// Accept any key. Explicit opt-in only; every use is audit-logged.
    InsecureAcceptAny,
}

/// russh client handler; its only job is gating the handshake on the
/// host key policy.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy.clone();
        let key = server_public_key.clone();

        async move {
            match policy {
                HostKeyPolicy::InsecureAcceptAny => {
                    security_log::log_insecure_hostkey_policy(&host, port, &fingerprint_of(&key));
                    Ok(true)
                }
                HostKeyPolicy::Tofu(verifier) => {
                    // The trust store does file IO; keep it off the reactor.
                    tokio::task::spawn_blocking(move || verifier.verify(&host, port, &key))
                        .await
                        .map_err(|e| {
                            SshError::HostKeyVerification(format!("host key check failed: {e}"))
                        })??;
                    Ok(true)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkeys::test_keys::{KEY1, KEY2, parse};
    use crate::hostkeys::{HostKeyStore, MemoryHostKeyStore, TrustStatus};

    #[tokio::test]
    async fn insecure_policy_accepts_any_key() {
        let mut handler =
            ClientHandler::new("example.com".into(), 22, HostKeyPolicy::InsecureAcceptAny);
        assert!(handler.check_server_key(&parse(KEY1)).await.expect("accept"));
        assert!(handler.check_server_key(&parse(KEY2)).await.expect("accept"));
    }

    #[tokio::test]
    async fn tofu_policy_trusts_first_key_and_rejects_a_change() {
        let store = Arc::new(MemoryHostKeyStore::new());
        let verifier = Arc::new(HostKeyVerifier::new(store.clone()));
        let mut handler = ClientHandler::new(
            "example.com".into(),
            22,
            HostKeyPolicy::Tofu(verifier),
        );

        assert!(handler.check_server_key(&parse(KEY1)).await.expect("first"));
        let err = handler
            .check_server_key(&parse(KEY2))
            .await
            .expect_err("mismatch");
        assert!(matches!(err, SshError::HostKeyMismatch { .. }));

        let record = store.find("example.com", 22).unwrap().expect("stored");
        assert_eq!(record.status, TrustStatus::Changed);
    }
}
