use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Config};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::directory::TransportDescriptor;
use crate::error::SshError;
use crate::security_log;

use super::auth::ResolvedAuth;
use super::handler::{ClientHandler, HostKeyPolicy};
use super::transport::Transport;

/// SSH client for establishing authenticated connections.
pub struct SshClient {
    config: Arc<Config>,
    policy: HostKeyPolicy,
    connect_timeout: Duration,
}

impl SshClient {
    pub fn new(connect_timeout_secs: u64, keepalive_interval_secs: u64, policy: HostKeyPolicy) -> Self {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = if keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(keepalive_interval_secs))
        };

        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            policy,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        }
    }

    /// Dial, verify the host key, and authenticate.
    ///
    /// One timeout bounds the whole sequence, so a server that accepts TCP
    /// but stalls mid-handshake still fails within the deadline.
    pub async fn connect(&self, descriptor: TransportDescriptor) -> Result<Transport, SshError> {
        let addr = format!("{}:{}", descriptor.host, descriptor.port);
        let deadline = self.connect_timeout;

        match timeout(deadline, self.establish(descriptor)).await {
            Ok(result) => result,
            Err(_) => Err(SshError::Timeout(addr)),
        }
    }

    async fn establish(&self, descriptor: TransportDescriptor) -> Result<Transport, SshError> {
        let TransportDescriptor {
            host,
            port,
            username,
            auth,
        } = descriptor;

        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: host.clone(),
                port,
                reason: e.to_string(),
            })?;

        let handler = ClientHandler::new(host.clone(), port, self.policy.clone());
        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| classify_handshake_error(e, &host, port))?;

        let auth = ResolvedAuth::resolve(auth)?;
        self.authenticate(&mut handle, &username, auth, &host, port)
            .await?;

        Ok(Transport::new(handle, host, port, username))
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
        auth: ResolvedAuth,
        host: &str,
        port: u16,
    ) -> Result<(), SshError> {
        let method_name = auth.method_name();
        security_log::log_auth_attempt(host, port, username, method_name);

        let auth_result = match auth {
            ResolvedAuth::Password(password) => {
                // Use expose_secret() only at the point of authentication
                match handle
                    .authenticate_password(username, password.expose_secret())
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        let reason = e.to_string();
                        security_log::log_auth_failure(host, port, username, method_name, &reason);
                        return Err(SshError::AuthenticationFailed(reason));
                    }
                }
            }
            ResolvedAuth::PublicKey(key) => {
                match handle.authenticate_publickey(username, key).await {
                    Ok(result) => result,
                    Err(e) => {
                        let reason = e.to_string();
                        security_log::log_auth_failure(host, port, username, method_name, &reason);
                        return Err(SshError::AuthenticationFailed(reason));
                    }
                }
            }
        };

        if !auth_result.success() {
            let reason = "Authentication rejected by server";
            security_log::log_auth_failure(host, port, username, method_name, reason);
            return Err(SshError::AuthenticationFailed(reason.to_string()));
        }

        security_log::log_auth_success(host, port, username, method_name);
        Ok(())
    }
}

/// Handshake failures surface through the handler's error type. Host key
/// and authentication rejections already carry their own taxonomy and must
/// not be flattened into a retryable connectivity error; only wrap what is
/// genuinely connectivity-shaped.
fn classify_handshake_error(e: SshError, host: &str, port: u16) -> SshError {
    match e {
        e @ (SshError::HostKeyMismatch { .. }
        | SshError::HostKeyVerification(_)
        | SshError::AuthenticationFailed(_)) => e,
        e => SshError::ConnectionFailed {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_expected_keepalive_interval() {
        let client = SshClient::new(30, 60, HostKeyPolicy::InsecureAcceptAny);
        assert_eq!(
            client.config.keepalive_interval,
            Some(Duration::from_secs(60))
        );
        assert_eq!(client.config.keepalive_max, 3);
    }

    #[test]
    fn zero_keepalive_sets_none_interval() {
        let client = SshClient::new(30, 0, HostKeyPolicy::InsecureAcceptAny);
        assert_eq!(client.config.keepalive_interval, None);
    }

    #[test]
    fn config_has_inactivity_timeout() {
        let client = SshClient::new(30, 60, HostKeyPolicy::InsecureAcceptAny);
        assert_eq!(
            client.config.inactivity_timeout,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn connect_timeout_is_carried() {
        let client = SshClient::new(5, 60, HostKeyPolicy::InsecureAcceptAny);
        assert_eq!(client.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn host_key_mismatch_survives_handshake_error_mapping() {
        let err = classify_handshake_error(
            SshError::HostKeyMismatch {
                host: "example.com".into(),
                port: 22,
                old_fingerprint: "SHA256:old".into(),
                new_fingerprint: "SHA256:new".into(),
                key_type: "ssh-ed25519".into(),
            },
            "example.com",
            22,
        );
        assert_eq!(err.code(), "host_key_changed");
        assert!(!err.is_retryable());

        let err = classify_handshake_error(
            SshError::HostKeyVerification("revoked".into()),
            "example.com",
            22,
        );
        assert_eq!(err.code(), "host_key_rejected");
    }

    #[test]
    fn auth_rejection_survives_handshake_error_mapping() {
        let err = classify_handshake_error(
            SshError::AuthenticationFailed("denied".into()),
            "example.com",
            22,
        );
        assert_eq!(err.code(), "auth_failed");
        assert!(!err.is_retryable());
    }

    #[test]
    fn protocol_errors_map_to_connection_failed() {
        let err = classify_handshake_error(
            SshError::Russh("banner exchange failed".into()),
            "example.com",
            22,
        );
        assert_eq!(err.code(), "unreachable");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn connect_to_refused_port_is_connection_failed() {
        use crate::directory::{AuthMaterial, TransportDescriptor};
        use secrecy::SecretString;

        let client = SshClient::new(5, 0, HostKeyPolicy::InsecureAcceptAny);
        let descriptor = TransportDescriptor {
            host: "127.0.0.1".to_string(),
            // Reserved port, nothing listens here.
            port: 1,
            username: "nobody".to_string(),
            auth: AuthMaterial::Password(SecretString::from("x")),
        };

        let err = client.connect(descriptor).await.expect_err("must fail");
        assert!(
            matches!(err, SshError::ConnectionFailed { .. } | SshError::Timeout(_)),
            "unexpected error: {err:?}"
        );
        assert!(err.is_retryable());
    }
}
