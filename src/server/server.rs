//! Listener supervision and server assembly
//!
//! Binds every configured FTP listener plus the administration listener,
//! filters peers before any TLS work, assigns session ids, and wires each
//! session's events into the autobanner, the registry, and the
//! administration fan-out.

use crate::admin::messages::{Message, SessionStarted, SessionStopped};
use crate::admin::types::{
    ListenerState, ListenerStatus, SecureState, SessionProgress, Timestamp,
};
use crate::auth::{Authenticator, RejectingImpersonator};
use crate::cert::{build_server_config, generate_self_signed, CertStore};
use crate::config::{Config, ConfigStore, ListenerConfig, TlsMode};
use crate::error::{FtpdError, Result};
use crate::ftp::session::{serve, SessionContext, SessionEvents};
use crate::logger::SessionLogger;
use crate::ratelimit::SessionGate;
use crate::server::admin_server::{self, AdminDeps, AdminHub};
use crate::server::autoban::AutoBanner;
use crate::server::registry::SessionRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The assembled server
pub struct Server {
    store: Arc<ConfigStore>,
    config_dir: PathBuf,
    registry: Arc<SessionRegistry>,
    autoban: Arc<AutoBanner>,
    hub: Arc<AdminHub>,
    cert_store: CertStore,
    acme_transport: Option<Arc<dyn crate::acme::AcmeTransport>>,
}

impl Server {
    /// Assemble a server around a configuration store
    pub fn new(store: Arc<ConfigStore>, config_dir: PathBuf) -> Self {
        let autoban = Arc::new(AutoBanner::new(store.snapshot().settings.autoban));
        let cert_store = CertStore::new(config_dir.join("certs"));
        Self {
            store,
            config_dir,
            registry: Arc::new(SessionRegistry::new()),
            autoban,
            hub: Arc::new(AdminHub::new()),
            cert_store,
            acme_transport: None,
        }
    }

    /// Wire in an external ACME transport
    pub fn with_acme_transport(mut self, transport: Arc<dyn crate::acme::AcmeTransport>) -> Self {
        self.acme_transport = Some(transport);
        self
    }

    /// The live session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ensure a TLS bundle exists, generating a self-signed one on first
    /// start
    async fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        let bundle = match self.cert_store.load_active().await? {
            Some(bundle) => bundle,
            None => {
                info!("no certificate installed; generating a self-signed one");
                let bundle = tokio::task::spawn_blocking(|| {
                    generate_self_signed("ftpd-rs", &["localhost".to_owned()])
                })
                .await
                .map_err(|e| FtpdError::Other(e.to_string()))??;
                self.cert_store.install(&bundle).await?;
                bundle
            }
        };
        let config = build_server_config(&bundle)?;
        Ok(TlsAcceptor::from(config))
    }

    /// Run until every listener stops (normally: forever)
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let snapshot = self.store.snapshot();
        let tls_acceptor = self.tls_acceptor().await?;
        let gate = SessionGate::new(snapshot.settings.max_sessions);

        let mut tasks = JoinSet::new();

        for listener_config in snapshot.listeners.clone() {
            let server = Arc::clone(&self);
            let acceptor = tls_acceptor.clone();
            let gate = gate.clone();
            tasks.spawn(async move {
                server.run_ftp_listener(listener_config, acceptor, gate).await;
            });
        }

        {
            let server = Arc::clone(&self);
            let acceptor = tls_acceptor.clone();
            tasks.spawn(async move {
                server.run_admin_listener(acceptor).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("listener task failed: {e}");
            }
        }
        Ok(())
    }

    async fn run_ftp_listener(
        self: Arc<Self>,
        listener_config: ListenerConfig,
        tls_acceptor: TlsAcceptor,
        gate: SessionGate,
    ) {
        let bind = SocketAddr::new(listener_config.address, listener_config.port);
        let listener = match crate::ftp::data::bind_reusable(bind) {
            Ok(listener) => listener,
            Err(e) => {
                error!(%bind, "cannot bind FTP listener: {e}");
                self.notify_listener(bind, ListenerState::Failed, e.to_string());
                return;
            }
        };
        let local = listener.local_addr().unwrap_or(bind);
        info!(%local, tls = ?listener_config.tls, "FTP listener started");
        self.notify_listener(local, ListenerState::Listening, String::new());

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(%local, "accept failed: {e}");
                    continue;
                }
            };

            // Filters and bans run before any TLS handshake.
            let snapshot = self.store.snapshot();
            if self.autoban.is_banned(peer.ip()) || !snapshot.settings.filter.admits(peer.ip()) {
                debug!(%peer, "connection refused by filter or ban");
                drop(stream);
                continue;
            }
            let Some(slot) = gate.try_enter() else {
                warn!(%peer, "session limit reached, refusing connection");
                drop(stream);
                continue;
            };

            self.spawn_session(
                stream,
                peer,
                local,
                listener_config.tls,
                tls_acceptor.clone(),
                snapshot,
                slot,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_session(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        tls_mode: TlsMode,
        tls_acceptor: TlsAcceptor,
        snapshot: Arc<Config>,
        slot: crate::ratelimit::SessionSlot,
    ) {
        let protocol = match tls_mode {
            TlsMode::Implicit => "FTPS",
            _ => "FTP",
        };
        let info = self
            .registry
            .register(peer, protocol, tls_mode == TlsMode::Implicit);
        let id = info.id;
        self.hub
            .broadcast(&Message::SessionStarted(SessionStarted { info }), None);

        let authenticator = Arc::new(Authenticator::new(
            snapshot.users.clone(),
            snapshot.groups.clone(),
            Arc::new(RejectingImpersonator),
        ));
        let events = Arc::new(ServerSessionEvents {
            registry: Arc::clone(&self.registry),
            autoban: Arc::clone(&self.autoban),
            hub: Arc::clone(&self.hub),
        });

        let ctx = SessionContext {
            id,
            peer,
            local_addr: local,
            tls_mode,
            tls_acceptor: Some(tls_acceptor),
            authenticator,
            config: snapshot,
            events,
        };

        let task = tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = serve(stream, ctx).await {
                SessionLogger::for_session(id).error(format!("session ended with error: {e}"));
            }
        });
        self.registry.attach_abort(id, task.abort_handle());

        // Cleanup runs in a watcher so a kicked (aborted) session still
        // leaves the registry.
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let _ = task.await;
            server.registry.remove(id);
            server
                .hub
                .broadcast(&Message::SessionStopped(SessionStopped { id }), None);
        });
    }

    async fn run_admin_listener(self: Arc<Self>, tls_acceptor: TlsAcceptor) {
        let snapshot = self.store.snapshot();
        let bind = SocketAddr::new(snapshot.admin.address, snapshot.admin.port);
        let listener = match crate::ftp::data::bind_reusable(bind) {
            Ok(listener) => listener,
            Err(e) => {
                error!(%bind, "cannot bind administration listener: {e}");
                return;
            }
        };
        info!(%bind, "administration listener started");

        let deps = Arc::new(AdminDeps {
            store: Arc::clone(&self.store),
            config_dir: self.config_dir.clone(),
            registry: Arc::clone(&self.registry),
            autoban: Arc::clone(&self.autoban),
            cert_store: self.cert_store.clone(),
            acme_transport: self.acme_transport.clone(),
            started: Timestamp::now(),
        });

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("administration accept failed: {e}");
                    continue;
                }
            };
            debug!(%peer, "administration connection");

            let acceptor = tls_acceptor.clone();
            let deps = Arc::clone(&deps);
            let hub = Arc::clone(&self.hub);
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => admin_server::run_session(tls, deps, hub).await,
                    Err(e) => debug!(%peer, "administration TLS handshake failed: {e}"),
                }
            });
        }
    }

    fn notify_listener(&self, addr: SocketAddr, state: ListenerState, detail: String) {
        self.hub.broadcast(
            &Message::ListenerStatus(ListenerStatus {
                address: addr.ip().to_string(),
                port: addr.port(),
                state,
                detail,
            }),
            None,
        );
    }
}

struct ServerSessionEvents {
    registry: Arc<SessionRegistry>,
    autoban: Arc<AutoBanner>,
    hub: Arc<AdminHub>,
}

impl SessionEvents for ServerSessionEvents {
    fn login_failed(&self, peer: std::net::IpAddr) {
        self.autoban.register_failure(peer);
    }

    fn logged_in(&self, session_id: u64, user: &str) {
        self.registry.set_username(session_id, user);
    }

    fn secure_state_changed(&self, session_id: u64, state: SecureState) {
        self.registry.set_secure_state(session_id, state);
    }

    fn progress(&self, progress: SessionProgress) {
        self.hub
            .broadcast(&Message::SessionProgress(progress), None);
    }
}
