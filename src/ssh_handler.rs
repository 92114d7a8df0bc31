use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::{AuthenticationRequest, UserProvider};
use crate::backend::{registry, NotifyBackend};
use crate::config::Access;
use crate::server::SessionGauge;
use crate::session::{SessionContext, SessionFs};
use crate::sftp_handler::SftpHandler;

/// Shared engine state handed to every connection.
pub struct EngineState {
    pub provider: Arc<dyn UserProvider>,
    pub accesses: HashMap<String, Access>,
    pub gauge: Arc<SessionGauge>,
}

/// Accepts connections and hands each one an independent session handler.
pub struct SshServer {
    state: Arc<EngineState>,
}

impl SshServer {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }
}

impl russh::server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, addr: Option<std::net::SocketAddr>) -> Self::Handler {
        info!(?addr, "new SSH connection");
        SshSession {
            state: self.state.clone(),
            peer: addr,
            extensions: None,
            channels: Arc::new(Mutex::new(HashMap::new())),
            _active: self.state.gauge.enter(),
        }
    }
}

/// Per-connection handler. A successful handshake attaches the
/// wire-contract string map; the subsystem start re-materializes it into a
/// typed session context and builds the user's backend before the first
/// request.
pub struct SshSession {
    state: Arc<EngineState>,
    peer: Option<std::net::SocketAddr>,
    extensions: Option<HashMap<String, String>>,
    channels: Arc<Mutex<HashMap<ChannelId, Channel<Msg>>>>,
    _active: crate::server::SessionGuard,
}

impl SshSession {
    async fn take_channel(&self, channel_id: ChannelId) -> Option<Channel<Msg>> {
        self.channels.lock().await.remove(&channel_id)
    }
}

impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let request = AuthenticationRequest {
            username: user.to_string(),
            secret: password.to_string(),
            peer: self.peer,
            session_id: Uuid::new_v4().to_string(),
            client_version: None,
        };

        match self.state.provider.login(&request).await {
            Ok(response) => {
                info!(user, peer = ?self.peer, "authentication successful");
                let ctx = SessionContext::new(
                    response.server,
                    user,
                    response.user.permissions,
                );
                self.extensions = Some(ctx.to_extensions());
                Ok(Auth::Accept)
            }
            Err(err) => {
                info!(user, peer = ?self.peer, %err, "authentication failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel_id = ?channel.id(), "opening session channel");
        self.channels.lock().await.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel_id, name, "subsystem request");

        if name != "sftp" {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        // Only values carried through the handshake extensions may cross
        // into serving.
        let ctx = self
            .extensions
            .as_ref()
            .and_then(SessionContext::from_extensions);
        let Some(ctx) = ctx else {
            error!(?channel_id, "sftp subsystem requested without an authenticated session");
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let ctx = Arc::new(ctx);

        let Some(access) = self.state.accesses.get(&ctx.username) else {
            error!(user = %ctx.username, "no access descriptor for authenticated user");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        // A fresh backend per channel, fully configured before the first
        // request is served.
        let backend = match registry::build(access, ctx.clone()) {
            Ok(backend) => Box::new(NotifyBackend::new(backend)),
            Err(err) => {
                error!(user = %ctx.username, %err, "could not build session backend");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };

        let Some(channel) = self.take_channel(channel_id).await else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;

        let handler = SftpHandler::new(SessionFs::new(backend, ctx.clone()));
        let guard = self.state.gauge.enter();
        let handle = session.handle();

        info!(session = %ctx.id, user = %ctx.username, "sftp subsystem starting");

        let worker = tokio::spawn(async move {
            russh_sftp::server::run(channel.into_stream(), handler).await;
        });

        // The watcher owns the drain guard so a panicking handler still
        // releases its session slot, and the panic is logged instead of
        // taking the engine down.
        tokio::spawn(async move {
            let _guard = guard;

            match worker.await {
                Ok(()) => debug!(session = %ctx.id, "sftp subsystem finished"),
                Err(err) if err.is_panic() => {
                    error!(session = %ctx.id, "sftp handler panicked")
                }
                Err(_) => {}
            }

            if let Err(err) = handle.close(channel_id).await {
                debug!(?channel_id, ?err, "channel already closed");
            }
        });

        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel_id, "channel EOF");
        session.close(channel_id)?;
        Ok(())
    }
}
