use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Config as SshConfig, Server as _};
use russh::{MethodKind, MethodSet};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::auth::UserProvider;
use crate::config::Access;
use crate::error::Result;
use crate::hostkey;
use crate::ssh_handler::{EngineState, SshServer};

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Base directory for persisted state (the host key lives under it).
    pub base_path: PathBuf,
    pub ssh_dir: String,
    pub key_file: String,
    /// How long in-flight sessions may run after shutdown is requested.
    pub grace: Duration,
    pub auth_rejection_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 2022,
            base_path: PathBuf::from("."),
            ssh_dir: hostkey::DEFAULT_SSH_DIR.to_string(),
            key_file: hostkey::DEFAULT_KEY_FILE.to_string(),
            grace: Duration::from_secs(60),
            auth_rejection_time: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Count of live sessions, used to drain gracefully on shutdown.
pub struct SessionGauge {
    active: AtomicUsize,
    notify: Notify,
}

impl SessionGauge {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            gauge: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits up to `grace` for every session to finish. Returns whether the
    /// gauge reached zero in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;

        while self.active() > 0 {
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.active() == 0;
            }
        }

        true
    }
}

impl Default for SessionGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the gauge when the session it tracks ends.
pub struct SessionGuard {
    gauge: Arc<SessionGauge>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        self.gauge.notify.notify_waiters();
    }
}

/// SFTP server: host-key lifecycle, accept loop and graceful shutdown.
pub struct Server {
    config: ServerConfig,
    provider: Arc<dyn UserProvider>,
    accesses: HashMap<String, Access>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn UserProvider>,
        accesses: Vec<Access>,
    ) -> Self {
        Self {
            config,
            provider,
            accesses: accesses.into_iter().map(|a| (a.user.clone(), a)).collect(),
        }
    }

    /// Binds the listener and serves until SIGTERM, then drains in-flight
    /// sessions for at most the configured grace period.
    pub async fn run(self) -> Result<()> {
        let key = hostkey::load_or_generate(
            &self.config.base_path,
            &self.config.ssh_dir,
            &self.config.key_file,
        )?;

        let ssh_config = SshConfig {
            auth_rejection_time: self.config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            max_auth_attempts: 6,
            keys: vec![key],
            ..Default::default()
        };
        let ssh_config = Arc::new(ssh_config);

        let gauge = Arc::new(SessionGauge::new());
        let mut server = SshServer::new(Arc::new(EngineState {
            provider: self.provider,
            accesses: self.accesses,
            gauge: gauge.clone(),
        }));

        info!(
            host = %self.config.address,
            port = self.config.port,
            "sftp subsystem listening for connections",
        );

        tokio::select! {
            result = server.run_on_address(
                ssh_config,
                (self.config.address.as_str(), self.config.port),
            ) => {
                result?;
            }
            _ = shutdown_signal() => {
                info!("shutdown requested, no longer accepting connections");
            }
        }

        if gauge.drain(self.config.grace).await {
            info!("all sessions drained");
        } else {
            warn!(
                active = gauge.active(),
                "grace period expired with sessions still active",
            );
        }

        Ok(())
    }
}

/// Resolves on SIGTERM (or Ctrl-C for interactive runs).
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 2022);
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.grace, Duration::from_secs(60));
        assert_eq!(config.ssh_dir, ".ssh");
        assert_eq!(config.key_file, "id_rsa");
    }

    #[tokio::test]
    async fn gauge_drains_when_sessions_end() {
        let gauge = Arc::new(SessionGauge::new());
        let guard = gauge.enter();
        assert_eq!(gauge.active(), 1);

        let waiter = {
            let gauge = gauge.clone();
            tokio::spawn(async move { gauge.drain(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
        assert_eq!(gauge.active(), 0);
    }

    #[tokio::test]
    async fn gauge_drain_times_out_with_active_sessions() {
        let gauge = Arc::new(SessionGauge::new());
        let _guard = gauge.enter();

        assert!(!gauge.drain(Duration::from_millis(20)).await);
        assert_eq!(gauge.active(), 1);
    }

    #[tokio::test]
    async fn gauge_drain_is_immediate_when_idle() {
        let gauge = Arc::new(SessionGauge::new());
        assert!(gauge.drain(Duration::from_millis(1)).await);
    }
}
