//! Server side of the administration protocol
//!
//! Each administration session couples an inbound dispatch pipe with an
//! outbound queue pipe over one TLS stream. The forwarder mutates the
//! authoritative configuration, persists it, and broadcasts change
//! notifications to every other administration session through the hub.

use crate::acme::{self, AcmeTransport, ChallengeServing, OrderRequest, PollPolicy};
use crate::admin::messages::{
    AckQueueFull, AdminLogin, AdminLoginResult, CertificateResult, ConfigDocument, Empty,
    GenerateSelfSigned, KickSession, Message, OperationResult, ServerStatus, SessionList,
    StartAcmeOrder, SubscribeLog, UploadCertificate,
};
use crate::admin::types::{CertificateSummary, Timestamp};
use crate::admin::{
    outbox, Forwarder, FrameSink, Outbox, SessionShared, POST_LOGIN_FRAME_CAP, PROTOCOL_VERSION,
    QUEUE_FULL_THRESHOLD,
};
use crate::cert::{CertStore, CertificateExtra, PemBundle};
use crate::config::{self, Config, ConfigStore};
use crate::logger::{LogSink, LogSplitter};
use crate::pipeline::{Pipe, SocketReader, SocketWriter};
use crate::server::autoban::AutoBanner;
use crate::server::registry::SessionRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

/// Shared dependencies of every administration session
pub struct AdminDeps {
    /// Authoritative configuration
    pub store: Arc<ConfigStore>,
    /// Where the XML documents live
    pub config_dir: PathBuf,
    /// Live FTP sessions
    pub registry: Arc<SessionRegistry>,
    /// Failed-login state, reset on configuration changes
    pub autoban: Arc<AutoBanner>,
    /// Active certificate bundle
    pub cert_store: CertStore,
    /// External ACME transport, when wired up
    pub acme_transport: Option<Arc<dyn AcmeTransport>>,
    /// Server start time
    pub started: Timestamp,
}

/// Fan-out of notifications to connected administration sessions
#[derive(Default)]
pub struct AdminHub {
    sessions: Mutex<HashMap<u64, Outbox>>,
    next_id: AtomicU64,
}

impl AdminHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, outbox: Outbox) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, outbox);
        id
    }

    fn unregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Send a notification to every session, optionally skipping one
    ///
    /// Sessions that are not yet logged in silently drop the message (their
    /// sending set refuses it), as do sessions that went away.
    pub fn broadcast(&self, message: &Message, except: Option<u64>) {
        let targets: Vec<(u64, Outbox)> = self
            .lock()
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        for (id, outbox) in targets {
            if Some(id) == except {
                continue;
            }
            let _ = outbox.send(message.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Outbox>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct AdminLogForwarder {
    outbox: Outbox,
}

impl LogSink for AdminLogForwarder {
    fn write_line(&self, line: &crate::admin::types::LogLine) {
        let _ = self.outbox.send(Message::LogLine(line.clone()));
    }
}

/// One administration session's dispatcher
pub struct ServerForwarder {
    deps: Arc<AdminDeps>,
    hub: Arc<AdminHub>,
    hub_id: u64,
    outbox: Outbox,
    shared: Arc<SessionShared>,
    log_token: Option<u64>,
}

impl Drop for ServerForwarder {
    fn drop(&mut self) {
        if let Some(token) = self.log_token.take() {
            LogSplitter::global().unsubscribe(token);
        }
    }
}

impl ServerForwarder {
    fn send(&self, message: Message) -> io::Result<()> {
        self.outbox.send(message)
    }

    fn operation_result(&self, request_tag: u32, result: Result<(), String>) -> io::Result<()> {
        let (success, error) = match result {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e),
        };
        self.send(Message::OperationResult(OperationResult {
            request_tag,
            success,
            error,
        }))
    }

    async fn persist(&self, config: Config) -> Result<(), String> {
        self.deps
            .store
            .swap(config.clone())
            .map_err(|e| e.to_string())?;
        config::save_all(&self.deps.config_dir, &config)
            .await
            .map_err(|e| e.to_string())?;
        // The autobanner window resets whenever the configuration changes.
        self.deps.autoban.reset();
        Ok(())
    }

    async fn install_bundle(&self, bundle: &PemBundle) -> Result<CertificateExtra, String> {
        self.deps
            .cert_store
            .install(bundle)
            .await
            .map_err(|e| e.to_string())
    }

    fn certificate_result(&self, outcome: Result<CertificateExtra, String>) -> io::Result<()> {
        let message = match outcome {
            Ok(extra) => CertificateResult {
                success: true,
                error: String::new(),
                summary: Some(CertificateSummary {
                    fingerprint: extra.fingerprint.to_string(),
                    not_before: Timestamp((extra.not_before.max(0) as u64) * 1000),
                    not_after: Timestamp((extra.not_after.max(0) as u64) * 1000),
                    distinguished_name: extra.distinguished_name,
                    hostnames: extra.hostnames,
                }),
            },
            Err(error) => CertificateResult {
                success: false,
                error,
                summary: None,
            },
        };
        self.send(Message::CertificateResult(message))
    }
}

#[async_trait]
impl Forwarder for ServerForwarder {
    async fn on_admin_login(&mut self, message: AdminLogin) -> io::Result<()> {
        let snapshot = self.deps.store.snapshot();
        let ok = match snapshot.admin.password.clone() {
            Some(stored) => {
                let candidate = message.password;
                tokio::task::spawn_blocking(move || stored.verify(&candidate))
                    .await
                    .unwrap_or(false)
            }
            // No password configured: administration is unreachable.
            None => false,
        };

        if ok {
            self.shared.set_logged_in();
            self.send(Message::AdminLoginResult(AdminLoginResult {
                success: true,
                message: String::new(),
                protocol_major: PROTOCOL_VERSION.0,
                protocol_minor: PROTOCOL_VERSION.1,
            }))?;
            info!("administration login succeeded");
            Ok(())
        } else {
            error!("administration login failed");
            self.send(Message::AdminLoginResult(AdminLoginResult {
                success: false,
                message: "Login failed.".to_owned(),
                protocol_major: PROTOCOL_VERSION.0,
                protocol_minor: PROTOCOL_VERSION.1,
            }))?;
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "administration login failed",
            ))
        }
    }

    async fn on_ack_queue_full(&mut self, message: AckQueueFull) -> io::Result<()> {
        if message.success {
            // The peer caught up; our sends resume.
            self.shared.ack_received();
        } else {
            // The peer paused and wants the echo.
            self.shared.request_echo();
        }
        Ok(())
    }

    async fn on_get_settings(&mut self, _message: Empty) -> io::Result<()> {
        let snapshot = self.deps.store.snapshot();
        let xml =
            config::xml::settings_to_xml(&snapshot.listeners, &snapshot.settings, &snapshot.admin)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.send(Message::Settings(ConfigDocument { xml }))
    }

    async fn on_set_settings(&mut self, message: ConfigDocument) -> io::Result<()> {
        let result = async {
            let (listeners, settings, admin) =
                config::xml::settings_from_xml(&message.xml).map_err(|e| e.to_string())?;
            let mut next = (*self.deps.store.snapshot()).clone();
            next.listeners = listeners;
            next.settings = settings;
            next.admin = admin;
            self.persist(next).await
        }
        .await;

        if result.is_ok() {
            self.hub
                .broadcast(&Message::Settings(message.clone()), Some(self.hub_id));
        }
        self.operation_result(Message::SetSettings(message).tag(), result)
    }

    async fn on_get_users(&mut self, _message: Empty) -> io::Result<()> {
        let snapshot = self.deps.store.snapshot();
        let xml = config::xml::users_to_xml(&snapshot.users)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.send(Message::Users(ConfigDocument { xml }))
    }

    async fn on_set_users(&mut self, message: ConfigDocument) -> io::Result<()> {
        let result = async {
            let users = config::xml::users_from_xml(&message.xml).map_err(|e| e.to_string())?;
            let mut next = (*self.deps.store.snapshot()).clone();
            next.users = users;
            self.persist(next).await
        }
        .await;

        if result.is_ok() {
            self.hub
                .broadcast(&Message::Users(message.clone()), Some(self.hub_id));
        }
        self.operation_result(Message::SetUsers(message).tag(), result)
    }

    async fn on_get_groups(&mut self, _message: Empty) -> io::Result<()> {
        let snapshot = self.deps.store.snapshot();
        let xml = config::xml::groups_to_xml(&snapshot.groups)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.send(Message::Groups(ConfigDocument { xml }))
    }

    async fn on_set_groups(&mut self, message: ConfigDocument) -> io::Result<()> {
        let result = async {
            let groups = config::xml::groups_from_xml(&message.xml).map_err(|e| e.to_string())?;
            let mut next = (*self.deps.store.snapshot()).clone();
            next.groups = groups;
            self.persist(next).await
        }
        .await;

        if result.is_ok() {
            self.hub
                .broadcast(&Message::Groups(message.clone()), Some(self.hub_id));
        }
        self.operation_result(Message::SetGroups(message).tag(), result)
    }

    async fn on_list_sessions(&mut self, _message: Empty) -> io::Result<()> {
        self.send(Message::SessionList(SessionList {
            sessions: self.deps.registry.snapshot(),
        }))
    }

    async fn on_kick_session(&mut self, message: KickSession) -> io::Result<()> {
        let result = if self.deps.registry.kick(message.id) {
            Ok(())
        } else {
            Err(format!("no session with id {}", message.id))
        };
        self.operation_result(Message::KickSession(message).tag(), result)
    }

    async fn on_subscribe_log(&mut self, message: SubscribeLog) -> io::Result<()> {
        if message.enable {
            if self.log_token.is_none() {
                let sink = Arc::new(AdminLogForwarder {
                    outbox: self.outbox.clone(),
                });
                self.log_token = Some(LogSplitter::global().subscribe(sink));
            }
        } else if let Some(token) = self.log_token.take() {
            LogSplitter::global().unsubscribe(token);
        }
        self.operation_result(Message::SubscribeLog(message).tag(), Ok(()))
    }

    async fn on_generate_self_signed(&mut self, message: GenerateSelfSigned) -> io::Result<()> {
        let outcome = async {
            let bundle = tokio::task::spawn_blocking(move || {
                crate::cert::generate_self_signed(&message.distinguished_name, &message.hostnames)
            })
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
            self.install_bundle(&bundle).await
        }
        .await;
        self.certificate_result(outcome)
    }

    async fn on_upload_certificate(&mut self, message: UploadCertificate) -> io::Result<()> {
        let outcome = async {
            if !message.password.is_empty() {
                return Err("encrypted keys are not supported".to_owned());
            }
            let bundle = PemBundle {
                key_pem: message.key_pem,
                certs_pem: message.certs_pem,
            };
            self.install_bundle(&bundle).await
        }
        .await;
        self.certificate_result(outcome)
    }

    async fn on_start_acme_order(&mut self, message: StartAcmeOrder) -> io::Result<()> {
        let Some(transport) = self.deps.acme_transport.clone() else {
            return self.certificate_result(Err("no ACME transport is configured".to_owned()));
        };

        let request = OrderRequest {
            directory_url: message.directory_url,
            contacts: message.contacts,
            hostnames: message.hostnames,
            serving: ChallengeServing::Internal {
                bind: "0.0.0.0:80".parse().expect("static address"),
            },
            poll: PollPolicy::default(),
        };

        let outcome = match acme::provision(transport.as_ref(), &request).await {
            Ok(issued) => self.install_bundle(&issued.bundle).await,
            Err(e) => Err(e.to_string()),
        };
        self.certificate_result(outcome)
    }

    async fn on_get_server_status(&mut self, _message: Empty) -> io::Result<()> {
        let uptime_secs = Timestamp::now().0.saturating_sub(self.deps.started.0) / 1000;
        self.send(Message::ServerStatus(ServerStatus {
            uptime_secs,
            session_count: self.deps.registry.len() as u64,
            version: crate::ftp::SERVER_VERSION.to_owned(),
        }))
    }
}

/// Run one administration session over an established (TLS) stream
pub async fn run_session<S>(stream: S, deps: Arc<AdminDeps>, hub: Arc<AdminHub>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let shared = Arc::new(SessionShared::new());
    let (outbox_handle, outbox_source) = outbox(Arc::clone(&shared), QUEUE_FULL_THRESHOLD);
    let hub_id = hub.register(outbox_handle.clone());

    let forwarder = ServerForwarder {
        deps,
        hub: Arc::clone(&hub),
        hub_id,
        outbox: outbox_handle.clone(),
        shared: Arc::clone(&shared),
        log_token: None,
    };

    let (rh, wh) = tokio::io::split(stream);
    let outbound = tokio::spawn(async move {
        Pipe::new(8)
            .run(outbox_source, SocketWriter::new(wh))
            .await
    });

    // The reader must be able to buffer a whole post-login frame, or a
    // large configuration document could never assemble.
    let reader = SocketReader::with_limits(rh, POST_LOGIN_FRAME_CAP + 1024, 64 * 1024);
    let inbound = Pipe::new(8)
        .run(reader, FrameSink::new(forwarder, shared))
        .await;
    debug!(ending = ?inbound.ending, "administration inbound pipe finished");

    // Dropping the last outbox sender lets the outbound pipe drain its
    // queue and close the stream gracefully.
    hub.unregister(hub_id);
    drop(outbox_handle);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), outbound).await;
}
