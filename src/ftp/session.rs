//! Per-connection FTP session state machine
//!
//! Each session owns its control stream, parses commands through a
//! CRLF line-consumer pipe, and runs transfers through dedicated data
//! pipes. TLS can be implicit (from the first byte) or negotiated in place
//! via AUTH TLS; the stream is re-wrapped and the command loop re-entered,
//! carrying over any bytes the client pipelined behind the upgrade.

use crate::admin::types::{SecureState, SessionEntry, SessionProgress, Timestamp};
use crate::auth::{Authenticator, EffectiveUser};
use crate::config::{Config, TlsMode};
use crate::error::{FtpdError, Result};
use crate::ftp::ascii::AsciiLayer;
use crate::ftp::banner;
use crate::ftp::commands::{self, Command};
use crate::ftp::data::{
    bind_passive, epsv_reply_body, parse_eprt_arg, parse_port_arg, pasv_reply_body, PendingData,
};
use crate::ftp::listing::{self, ListingFormat, ListingSource};
use crate::ftp::replies::{codes, Reply};
use crate::logger::SessionLogger;
use crate::pipeline::pipe::{Ending, ErrorSource, Pipe};
use crate::pipeline::{
    Channel, DriveResult, Eol, FileReader, FileWriter, LineConsumer, LineDisposition, LineHandler,
    LockingBuffer, SocketReader, SocketWriter, Source,
};
use crate::ratelimit::TransferBudget;
use crate::tvfs::{EntryKind, Tvfs, WriteMode};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Server version string used in the banner's `%v` placeholder
pub const SERVER_VERSION: &str = concat!("ftpd-rs ", env!("CARGO_PKG_VERSION"));

const CONTROL_MAX_LINE: usize = 4096;

/// Object-safe stream bound used once TLS wrapping erases concrete types
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed control or data stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Hooks the server wires into every session
pub trait SessionEvents: Send + Sync {
    /// A login attempt failed; feeds the autobanner
    fn login_failed(&self, _peer: std::net::IpAddr) {}

    /// A user completed login
    fn logged_in(&self, _session_id: u64, _user: &str) {}

    /// The control channel's TLS state changed
    fn secure_state_changed(&self, _session_id: u64, _state: SecureState) {}

    /// Transfer progress on an open entry
    fn progress(&self, _progress: SessionProgress) {}
}

/// No-op events for tests and tooling
pub struct NullEvents;

impl SessionEvents for NullEvents {}

/// Everything a session needs from its server
pub struct SessionContext {
    /// Server-assigned session id
    pub id: u64,
    /// Control-connection peer
    pub peer: SocketAddr,
    /// Control-connection local address (PASV binds here)
    pub local_addr: SocketAddr,
    /// Listener TLS behaviour
    pub tls_mode: TlsMode,
    /// Acceptor for AUTH TLS / implicit TLS / PROT P, when configured
    pub tls_acceptor: Option<TlsAcceptor>,
    /// Authenticator shared with the server
    pub authenticator: Arc<Authenticator>,
    /// Configuration snapshot taken at accept time
    pub config: Arc<Config>,
    /// Event hooks
    pub events: Arc<dyn SessionEvents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterLoop {
    Quit,
    StartTls,
}

enum LoginState {
    Idle,
    NeedPassword(String),
    LoggedIn(Box<LoggedIn>),
}

struct LoggedIn {
    user: EffectiveUser,
    tvfs: Tvfs,
    inbound: TransferBudget,
    outbound: TransferBudget,
}

struct SessionState {
    ctx: SessionContext,
    logger: SessionLogger,
    login: LoginState,
    cwd: String,
    ascii: bool,
    rest: u64,
    rnfr: Option<String>,
    pending_data: Option<PendingData>,
    control_secure: bool,
    pbsz_done: bool,
    prot_private: bool,
    after: Option<AfterLoop>,
    entry_counter: u64,
    activity: Arc<ActivityClock>,
}

struct ActivityClock {
    last: Mutex<tokio::time::Instant>,
    authenticated: AtomicBool,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            last: Mutex::new(tokio::time::Instant::now()),
            authenticated: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = tokio::time::Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Run one FTP session to completion
pub async fn serve<S>(stream: S, ctx: SessionContext) -> Result<()>
where
    S: AsyncStream + 'static,
{
    let logger = SessionLogger::for_session(ctx.id);
    logger.status(format!("connected from {}", ctx.peer));

    let implicit = ctx.tls_mode == TlsMode::Implicit;
    let mut state = SessionState {
        logger,
        login: LoginState::Idle,
        cwd: "/".to_owned(),
        ascii: false,
        rest: 0,
        rnfr: None,
        pending_data: None,
        control_secure: implicit,
        pbsz_done: false,
        prot_private: false,
        after: None,
        entry_counter: 0,
        activity: Arc::new(ActivityClock::new()),
        ctx,
    };

    let mut stream: BoxedStream = if implicit {
        let acceptor = state
            .ctx
            .tls_acceptor
            .clone()
            .ok_or_else(|| FtpdError::Tls("implicit TLS listener without certificate".into()))?;
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| FtpdError::Tls(format!("implicit handshake failed: {e}")))?;
        state
            .ctx
            .events
            .secure_state_changed(state.ctx.id, SecureState::Secure);
        Box::new(tls)
    } else {
        Box::new(stream)
    };

    // Welcome banner before the first command.
    let banner_lines = banner::render(&state.ctx.config.settings.banner, SERVER_VERSION)
        .map_err(|e| FtpdError::Config(format!("invalid banner: {e}")))?;
    let banner_reply = if banner_lines.len() == 1 {
        Reply::new(codes::READY, banner_lines[0].clone())
    } else {
        Reply::multiline(
            codes::READY,
            banner_lines[0].clone(),
            banner_lines[1..].to_vec(),
        )
    };
    stream.write_all(banner_reply.to_wire().as_bytes()).await?;
    stream.flush().await?;

    loop {
        let (next_stream, leftover, after) = run_command_loop(stream, &mut state).await?;
        match after {
            Some(AfterLoop::StartTls) => {
                let acceptor = state
                    .ctx
                    .tls_acceptor
                    .clone()
                    .ok_or_else(|| FtpdError::Tls("AUTH TLS without certificate".into()))?;
                let prefixed = PrefixedStream::new(leftover, next_stream);
                let tls = acceptor
                    .accept(prefixed)
                    .await
                    .map_err(|e| FtpdError::Tls(format!("TLS upgrade failed: {e}")))?;
                state.control_secure = true;
                state.after = None;
                state
                    .ctx
                    .events
                    .secure_state_changed(state.ctx.id, SecureState::QuasiSecure);
                state.logger.status("control connection secured");
                stream = Box::new(tls);
            }
            _ => {
                state.logger.status("session closed");
                return Ok(());
            }
        }
    }
}

/// Run the command loop until QUIT, TLS upgrade, or stream end
async fn run_command_loop(
    stream: BoxedStream,
    state: &mut SessionState,
) -> Result<(BoxedStream, Vec<u8>, Option<AfterLoop>)> {
    let (rh, wh) = tokio::io::split(stream);

    let pipe = Pipe::new(8);
    let inbound_buffer = pipe.buffer().clone();
    let abort = pipe.abort_handle();

    // Idle watchdog: login timeout until authenticated, activity timeout
    // after.
    let activity = Arc::clone(&state.activity);
    let login_timeout = state.ctx.config.settings.login_timeout;
    let activity_timeout = state.ctx.config.settings.activity_timeout;
    let watchdog = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let limit = if activity.authenticated.load(Ordering::SeqCst) {
                activity_timeout
            } else {
                login_timeout
            };
            if activity.idle_for() >= limit {
                abort.abort();
                return;
            }
        }
    });

    let mut reader = SocketReader::new(rh);
    let handler = ControlHandler {
        state,
        writer: wh,
    };
    let mut consumer = LineConsumer::new(handler, Eol::CrLf, CONTROL_MAX_LINE);

    let outcome = pipe.run(&mut reader, &mut consumer).await;
    watchdog.abort();

    let leftover = {
        let b = inbound_buffer.lock();
        b.as_slice().to_vec()
    };

    let handler = consumer.into_handler();
    let mut wh = handler.writer;
    let state = handler.state;

    match &outcome.ending {
        Ending::Canceled => {}
        Ending::Eof => {
            debug!(session = state.ctx.id, "control connection closed by peer");
            state.after = None;
        }
        Ending::Aborted => {
            let _ = wh
                .write_all(
                    Reply::new(codes::SERVICE_NOT_AVAILABLE, "Timeout; closing control connection.")
                        .to_wire()
                        .as_bytes(),
                )
                .await;
            state.logger.warning("session timed out");
            state.after = None;
        }
        Ending::Failed(e) => {
            if e.is_overflow() {
                let _ = wh
                    .write_all(
                        Reply::new(codes::SYNTAX_ERROR, "Line too long.")
                            .to_wire()
                            .as_bytes(),
                    )
                    .await;
            }
            state.logger.error(format!("control connection error: {e}"));
            state.after = None;
        }
    }
    let _ = wh.flush().await;

    let rh = reader.into_inner();
    let stream = rh.unsplit(wh);
    let after = state.after;
    Ok((stream, leftover, after))
}

struct ControlHandler<'a, W> {
    state: &'a mut SessionState,
    writer: W,
}

#[async_trait]
impl<W> LineHandler for ControlHandler<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn on_line(&mut self, line: &[u8], _more: bool) -> io::Result<LineDisposition> {
        self.state.activity.touch();

        let Ok(text) = std::str::from_utf8(line) else {
            self.reply(Reply::new(codes::SYNTAX_ERROR, "Commands must be UTF-8."))
                .await?;
            return Ok(LineDisposition::Continue);
        };
        let command = commands::parse(text);
        if command.argument_is_secret() {
            self.state.logger.trace(format!("> {} ****", command.verb()));
        } else {
            self.state.logger.trace(format!("> {text}"));
        }

        let disposition = self.handle(command).await?;
        self.state.activity.touch();
        Ok(disposition)
    }
}

impl<W> ControlHandler<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn reply(&mut self, reply: Reply) -> io::Result<()> {
        self.state.logger.trace(format!("< {} {}", reply.code, reply.text));
        self.writer.write_all(reply.to_wire().as_bytes()).await?;
        self.writer.flush().await
    }

    fn logged_in(&mut self) -> Option<&mut LoggedIn> {
        match &mut self.state.login {
            LoginState::LoggedIn(li) => Some(li),
            _ => None,
        }
    }

    async fn handle(&mut self, command: Command) -> io::Result<LineDisposition> {
        // A require-tls listener refuses almost everything in plaintext.
        let require_tls = matches!(
            self.state.ctx.tls_mode,
            TlsMode::Explicit { require_tls: true }
        );
        if require_tls && !self.state.control_secure {
            let allowed = matches!(
                command,
                Command::Auth(_) | Command::Feat | Command::Help(_) | Command::Quit
            );
            if !allowed {
                self.reply(Reply::new(
                    codes::POLICY_REQUIRES_TLS,
                    "Policy requires TLS; use AUTH TLS first.",
                ))
                .await?;
                return Ok(LineDisposition::Continue);
            }
        }

        match command {
            Command::Auth(mechanism) => self.cmd_auth(&mechanism).await,
            Command::Pbsz(arg) => {
                if !self.state.control_secure {
                    self.reply(Reply::new(codes::BAD_SEQUENCE, "AUTH TLS first."))
                        .await?;
                } else if arg.trim() == "0" {
                    self.state.pbsz_done = true;
                    self.reply(Reply::new(codes::OK, "PBSZ=0")).await?;
                } else {
                    self.reply(Reply::new(codes::SYNTAX_ERROR_ARGS, "PBSZ must be 0."))
                        .await?;
                }
                Ok(LineDisposition::Continue)
            }
            Command::Prot(arg) => {
                if !self.state.pbsz_done {
                    self.reply(Reply::new(codes::BAD_SEQUENCE, "PBSZ 0 first."))
                        .await?;
                    return Ok(LineDisposition::Continue);
                }
                match arg.trim().to_ascii_uppercase().as_str() {
                    "P" => {
                        self.state.prot_private = true;
                        self.state
                            .ctx
                            .events
                            .secure_state_changed(self.state.ctx.id, SecureState::Secure);
                        self.reply(Reply::new(codes::OK, "Protection level set to P."))
                            .await?;
                    }
                    "C" => {
                        self.state.prot_private = false;
                        self.reply(Reply::new(codes::OK, "Protection level set to C."))
                            .await?;
                    }
                    _ => {
                        self.reply(Reply::new(
                            codes::NOT_IMPLEMENTED_FOR_PARAM,
                            "Only P and C are supported.",
                        ))
                        .await?;
                    }
                }
                Ok(LineDisposition::Continue)
            }

            Command::User(name) => self.cmd_user(name).await,
            Command::Pass(password) => self.cmd_pass(password).await,
            Command::Acct(_) => {
                self.reply(Reply::new(codes::SUPERFLUOUS, "ACCT not required."))
                    .await?;
                Ok(LineDisposition::Continue)
            }

            Command::Syst => {
                self.reply(Reply::new(codes::SYSTEM_TYPE, "UNIX Type: L8"))
                    .await?;
                Ok(LineDisposition::Continue)
            }
            Command::Feat => {
                let features = vec![
                    "AUTH TLS".to_owned(),
                    "PBSZ".to_owned(),
                    "PROT".to_owned(),
                    "EPRT".to_owned(),
                    "EPSV".to_owned(),
                    "MDTM".to_owned(),
                    "MLSD".to_owned(),
                    "REST STREAM".to_owned(),
                    "SIZE".to_owned(),
                    "UTF8".to_owned(),
                ];
                self.reply(Reply::multiline(codes::SYSTEM_STATUS, "Features:", features))
                    .await?;
                Ok(LineDisposition::Continue)
            }
            Command::Help(_) => {
                self.reply(Reply::new(codes::HELP, "Commands are per RFC 959/2228/3659."))
                    .await?;
                Ok(LineDisposition::Continue)
            }
            Command::Noop => {
                self.reply(Reply::new(codes::OK, "NOOP ok.")).await?;
                Ok(LineDisposition::Continue)
            }
            Command::Quit => {
                self.reply(Reply::new(codes::CLOSING, "Goodbye.")).await?;
                self.state.after = Some(AfterLoop::Quit);
                Ok(LineDisposition::Stop)
            }

            Command::Type(arg) => {
                match arg.trim().to_ascii_uppercase().as_str() {
                    "A" | "A N" => {
                        self.state.ascii = true;
                        self.reply(Reply::new(codes::OK, "Type set to A.")).await?;
                    }
                    "I" | "L 8" => {
                        self.state.ascii = false;
                        self.reply(Reply::new(codes::OK, "Type set to I.")).await?;
                    }
                    _ => {
                        self.reply(Reply::new(
                            codes::NOT_IMPLEMENTED_FOR_PARAM,
                            "Only types A and I are supported.",
                        ))
                        .await?;
                    }
                }
                Ok(LineDisposition::Continue)
            }
            Command::Stru(arg) => {
                if arg.trim().eq_ignore_ascii_case("F") {
                    self.reply(Reply::new(codes::OK, "Structure set to F.")).await?;
                } else {
                    self.reply(Reply::new(
                        codes::NOT_IMPLEMENTED_FOR_PARAM,
                        "Only structure F is supported.",
                    ))
                    .await?;
                }
                Ok(LineDisposition::Continue)
            }
            Command::Mode(arg) => {
                if arg.trim().eq_ignore_ascii_case("S") {
                    self.reply(Reply::new(codes::OK, "Mode set to S.")).await?;
                } else {
                    self.reply(Reply::new(
                        codes::NOT_IMPLEMENTED_FOR_PARAM,
                        "Only mode S is supported.",
                    ))
                    .await?;
                }
                Ok(LineDisposition::Continue)
            }

            Command::Pwd => {
                let cwd = self.state.cwd.clone();
                self.reply(Reply::new(
                    codes::PATH_CREATED,
                    format!("\"{}\" is the current directory.", cwd.replace('"', "\"\"")),
                ))
                .await?;
                Ok(LineDisposition::Continue)
            }
            Command::Cwd(path) => self.cmd_cwd(&path).await,
            Command::Cdup => self.cmd_cwd("..").await,

            Command::Mkd(path) => self.structure_op(&path, StructureOp::Mkd).await,
            Command::Rmd(path) => self.structure_op(&path, StructureOp::Rmd).await,
            Command::Dele(path) => self.structure_op(&path, StructureOp::Dele).await,
            Command::Rnfr(path) => self.cmd_rnfr(&path).await,
            Command::Rnto(path) => self.cmd_rnto(&path).await,

            Command::Size(path) => self.cmd_size(&path).await,
            Command::Mdtm(path) => self.cmd_mdtm(&path).await,
            Command::Stat(arg) => self.cmd_stat(arg).await,
            Command::Rest(arg) => {
                match arg.trim().parse::<u64>() {
                    Ok(offset) => {
                        self.state.rest = offset;
                        self.reply(Reply::new(
                            codes::PENDING_FURTHER_INFO,
                            format!("Restarting at {offset}."),
                        ))
                        .await?;
                    }
                    Err(_) => {
                        self.reply(Reply::new(codes::SYNTAX_ERROR_ARGS, "Bad REST offset."))
                            .await?;
                    }
                }
                Ok(LineDisposition::Continue)
            }

            Command::Pasv => self.cmd_pasv(false).await,
            Command::Epsv(arg) => {
                if arg.as_deref().is_some_and(|a| a.eq_ignore_ascii_case("ALL")) {
                    self.reply(Reply::new(codes::OK, "EPSV ALL ok.")).await?;
                    return Ok(LineDisposition::Continue);
                }
                self.cmd_pasv(true).await
            }
            Command::Port(arg) => self.cmd_port(parse_port_arg(&arg)).await,
            Command::Eprt(arg) => self.cmd_port(parse_eprt_arg(&arg)).await,

            Command::List(arg) => {
                self.cmd_listing(arg, ListingFormat::Long).await
            }
            Command::Nlst(arg) => self.cmd_listing(arg, ListingFormat::NamesOnly).await,
            Command::Mlsd(arg) => self.cmd_listing(arg, ListingFormat::Machine).await,

            Command::Retr(path) => self.cmd_retr(&path).await,
            Command::Stor(path) => self.cmd_stor(&path, WriteDisposition::Replace).await,
            Command::Appe(path) => self.cmd_stor(&path, WriteDisposition::Append).await,

            Command::Abor => {
                // Transfers run inside the command turn, so by the time an
                // ABOR line parses there is nothing left to abort.
                self.reply(Reply::new(codes::TRANSFER_COMPLETE, "Nothing to abort."))
                    .await?;
                Ok(LineDisposition::Continue)
            }

            Command::Unknown(verb) => {
                self.reply(Reply::new(
                    codes::SYNTAX_ERROR,
                    format!("Command {verb:?} not understood."),
                ))
                .await?;
                Ok(LineDisposition::Continue)
            }
        }
    }

    async fn cmd_auth(&mut self, mechanism: &str) -> io::Result<LineDisposition> {
        if !mechanism.trim().eq_ignore_ascii_case("TLS") {
            self.reply(Reply::new(
                codes::NOT_IMPLEMENTED_FOR_PARAM,
                "Only AUTH TLS is supported.",
            ))
            .await?;
            return Ok(LineDisposition::Continue);
        }
        if self.state.control_secure {
            self.reply(Reply::new(codes::BAD_SEQUENCE, "Already secured."))
                .await?;
            return Ok(LineDisposition::Continue);
        }
        if self.state.ctx.tls_acceptor.is_none()
            || self.state.ctx.tls_mode == TlsMode::Plain
        {
            self.reply(Reply::new(
                codes::POLICY_REQUIRES_TLS,
                "TLS is not available on this listener.",
            ))
            .await?;
            return Ok(LineDisposition::Continue);
        }
        self.reply(Reply::new(codes::AUTH_OK, "Proceeding with TLS handshake."))
            .await?;
        self.state.after = Some(AfterLoop::StartTls);
        Ok(LineDisposition::Stop)
    }

    async fn cmd_user(&mut self, name: String) -> io::Result<LineDisposition> {
        self.state.login = LoginState::NeedPassword(name.clone());
        let methods = self.state.ctx.authenticator.methods_for(&name);
        let text = if methods.iter().any(|m| m.token() == "none") {
            "Any password will do."
        } else {
            "Please specify the password."
        };
        self.reply(Reply::new(codes::NEED_PASSWORD, text)).await?;
        Ok(LineDisposition::Continue)
    }

    async fn cmd_pass(&mut self, password: String) -> io::Result<LineDisposition> {
        let LoginState::NeedPassword(name) = &self.state.login else {
            self.reply(Reply::new(codes::BAD_SEQUENCE, "Send USER first."))
                .await?;
            return Ok(LineDisposition::Continue);
        };
        let name = name.clone();

        match self
            .state
            .ctx
            .authenticator
            .login(&name, &password, self.state.ctx.peer.ip())
            .await
        {
            Ok(user) => {
                let mut tvfs = Tvfs::bind(&user.mount_table, &user.name, user.home());
                tvfs.prepare().await;

                let inbound = TransferBudget::unlimited()
                    .with_rate(user.rate_limits.inbound)
                    .with_rate(user.session_inbound_limit);
                let outbound = TransferBudget::unlimited()
                    .with_rate(user.rate_limits.outbound)
                    .with_rate(user.session_outbound_limit);

                self.state.logger.status(format!("user {name:?} logged in"));
                self.state.ctx.events.logged_in(self.state.ctx.id, &name);
                self.state.activity.authenticated.store(true, Ordering::SeqCst);
                self.state.login = LoginState::LoggedIn(Box::new(LoggedIn {
                    user,
                    tvfs,
                    inbound,
                    outbound,
                }));
                self.state.cwd = "/".to_owned();
                self.reply(Reply::new(codes::LOGGED_IN, "Login successful."))
                    .await?;
            }
            Err(failure) => {
                // One fixed wire reply for every cause; detail stays in the
                // log.
                self.state
                    .logger
                    .error(format!("login of {name:?} failed: {failure}"));
                self.state.ctx.events.login_failed(self.state.ctx.peer.ip());
                self.state.login = LoginState::Idle;
                self.reply(Reply::new(codes::NOT_LOGGED_IN, "Login incorrect."))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn require_login(&mut self) -> io::Result<bool> {
        if self.logged_in().is_some() {
            return Ok(true);
        }
        self.reply(Reply::new(codes::NOT_LOGGED_IN, "Please log in first."))
            .await?;
        Ok(false)
    }

    fn resolve_arg(&self, arg: &str) -> String {
        crate::tvfs::join_virtual(&self.state.cwd, arg)
    }

    async fn cmd_cwd(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        match li.tvfs.stat(&target).await {
            Ok(entry) if entry.is_dir() => {
                self.state.cwd = target.clone();
                self.reply(Reply::new(
                    codes::FILE_ACTION_OK,
                    format!("Directory changed to {target}."),
                ))
                .await?;
            }
            _ => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No such directory."))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn structure_op(&mut self, path: &str, op: StructureOp) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        let result = match op {
            StructureOp::Mkd => li.tvfs.make_dir(&target).await,
            StructureOp::Rmd => li.tvfs.remove_dir(&target).await,
            StructureOp::Dele => li.tvfs.remove_file(&target).await,
        };
        match result {
            Ok(()) => {
                let reply = match op {
                    StructureOp::Mkd => Reply::new(
                        codes::PATH_CREATED,
                        format!("\"{}\" created.", target.replace('"', "\"\"")),
                    ),
                    _ => Reply::new(codes::FILE_ACTION_OK, "Done."),
                };
                self.reply(reply).await?;
            }
            Err(e) => {
                self.state.logger.error(format!("{op:?} {target} failed: {e}"));
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, deny_text(&e)))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_rnfr(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        if li.tvfs.stat(&target).await.is_ok() {
            self.state.rnfr = Some(target);
            self.reply(Reply::new(codes::PENDING_FURTHER_INFO, "Ready for RNTO."))
                .await?;
        } else {
            self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No such file or directory."))
                .await?;
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_rnto(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let Some(from) = self.state.rnfr.take() else {
            self.reply(Reply::new(codes::BAD_SEQUENCE, "RNFR first."))
                .await?;
            return Ok(LineDisposition::Continue);
        };
        let to = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        match li.tvfs.rename(&from, &to).await {
            Ok(()) => {
                self.reply(Reply::new(codes::FILE_ACTION_OK, "Rename successful."))
                    .await?;
            }
            Err(e) => {
                self.state
                    .logger
                    .error(format!("rename {from} -> {to} failed: {e}"));
                self.reply(Reply::new(codes::NAME_NOT_ALLOWED, deny_text(&e)))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_size(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        match li.tvfs.stat(&target).await {
            Ok(entry) if entry.kind == EntryKind::File => {
                self.reply(Reply::new(codes::FILE_STATUS, entry.size.to_string()))
                    .await?;
            }
            _ => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No such file."))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_mdtm(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let li = self.logged_in().expect("checked login");
        match li.tvfs.stat(&target).await {
            Ok(entry) => match entry.modified {
                Some(modified) => {
                    self.reply(Reply::new(
                        codes::FILE_STATUS,
                        listing::mdtm_timestamp(modified),
                    ))
                    .await?;
                }
                None => {
                    self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No modification time."))
                        .await?;
                }
            },
            Err(_) => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No such file."))
                    .await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_stat(&mut self, arg: Option<String>) -> io::Result<LineDisposition> {
        match arg {
            None => {
                let user = match &self.state.login {
                    LoginState::LoggedIn(li) => li.user.name.clone(),
                    _ => "(none)".to_owned(),
                };
                let lines = vec![
                    format!("Connected from {}", self.state.ctx.peer),
                    format!("Logged in as {user}"),
                    format!("TYPE: {}", if self.state.ascii { "ASCII" } else { "Image" }),
                ];
                self.reply(Reply::multiline(codes::SYSTEM_STATUS, "Session status:", lines))
                    .await?;
            }
            Some(path) => {
                if !self.require_login().await? {
                    return Ok(LineDisposition::Continue);
                }
                let target = self.resolve_arg(&path);
                let li = self.logged_in().expect("checked login");
                match li.tvfs.list(&target).await {
                    Ok(entries) => {
                        let lines = listing::render(&entries, ListingFormat::Long);
                        self.reply(Reply::multiline(
                            codes::FILE_STATUS,
                            format!("Status of {target}:"),
                            lines,
                        ))
                        .await?;
                    }
                    Err(_) => {
                        self.reply(Reply::new(codes::FILE_UNAVAILABLE, "No such path."))
                            .await?;
                    }
                }
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_pasv(&mut self, extended: bool) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }

        let bind_ip = self.state.ctx.local_addr.ip();
        let range = self.state.ctx.config.settings.pasv_port_range;
        let (listener, addr) = match bind_passive(bind_ip, range).await {
            Ok(bound) => bound,
            Err(e) => {
                self.state.logger.error(format!("passive bind failed: {e}"));
                self.reply(Reply::new(codes::CANT_OPEN_DATA, "Cannot open data connection."))
                    .await?;
                return Ok(LineDisposition::Continue);
            }
        };

        // Advertised host: the override applies unless the peer is local
        // and the configuration says locals see the real address.
        let advertised_ip = {
            let settings = &self.state.ctx.config.settings;
            let peer_is_local = is_local_peer(self.state.ctx.peer.ip());
            match &settings.host_override {
                Some(host)
                    if !(peer_is_local && settings.do_not_override_host_if_peer_is_local) =>
                {
                    host.parse().unwrap_or(bind_ip)
                }
                _ => bind_ip,
            }
        };
        let advertised = SocketAddr::new(advertised_ip, addr.port());

        let body = if extended {
            Some(epsv_reply_body(addr.port()))
        } else {
            pasv_reply_body(advertised)
        };
        let Some(body) = body else {
            self.reply(Reply::new(
                codes::CANT_OPEN_DATA,
                "PASV needs IPv4; use EPSV.",
            ))
            .await?;
            return Ok(LineDisposition::Continue);
        };

        // A second PASV replaces any pending data connection.
        self.state.pending_data = Some(PendingData::Passive {
            listener,
            advertised,
        });
        let code = if extended {
            codes::EXTENDED_PASSIVE_MODE
        } else {
            codes::PASSIVE_MODE
        };
        self.reply(Reply::new(code, body)).await?;
        Ok(LineDisposition::Continue)
    }

    async fn cmd_port(&mut self, target: Option<SocketAddr>) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let Some(target) = target else {
            self.reply(Reply::new(codes::SYNTAX_ERROR_ARGS, "Bad endpoint."))
                .await?;
            return Ok(LineDisposition::Continue);
        };
        // The client may only direct data at itself.
        if target.ip() != self.state.ctx.peer.ip() {
            self.state.logger.warning(format!(
                "refused data endpoint {target} differing from control peer"
            ));
            self.reply(Reply::new(
                codes::SYNTAX_ERROR_ARGS,
                "Endpoint must match the control connection peer.",
            ))
            .await?;
            return Ok(LineDisposition::Continue);
        }
        self.state.pending_data = Some(PendingData::Active { target });
        self.reply(Reply::new(codes::OK, "PORT ok.")).await?;
        Ok(LineDisposition::Continue)
    }

    async fn open_data_stream(&mut self) -> io::Result<Option<BoxedStream>> {
        let Some(pending) = self.state.pending_data.take() else {
            self.reply(Reply::new(codes::CANT_OPEN_DATA, "Use PASV or PORT first."))
                .await?;
            return Ok(None);
        };

        let stream = match pending.establish(self.state.ctx.peer.ip()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.logger.error(format!("data connection failed: {e}"));
                self.reply(Reply::new(codes::CANT_OPEN_DATA, "Cannot open data connection."))
                    .await?;
                return Ok(None);
            }
        };

        if self.state.prot_private {
            let Some(acceptor) = self.state.ctx.tls_acceptor.clone() else {
                self.reply(Reply::new(codes::CANT_OPEN_DATA, "No TLS available."))
                    .await?;
                return Ok(None);
            };
            match acceptor.accept(stream).await {
                Ok(tls) => Ok(Some(Box::new(tls) as BoxedStream)),
                Err(e) => {
                    self.state
                        .logger
                        .error(format!("data TLS handshake failed: {e}"));
                    self.reply(Reply::new(codes::CANT_OPEN_DATA, "Data TLS handshake failed."))
                        .await?;
                    Ok(None)
                }
            }
        } else {
            Ok(Some(Box::new(stream) as BoxedStream))
        }
    }

    fn next_entry(&mut self, path: &str, size: u64) -> SessionEntry {
        self.state.entry_counter += 1;
        SessionEntry {
            entry_id: self.state.entry_counter,
            path: path.to_owned(),
            size,
            bytes_read: 0,
            bytes_written: 0,
            open_time: Timestamp::now(),
            last_read_time: None,
            last_written_time: None,
            read_bps: 0,
            write_bps: 0,
        }
    }

    async fn cmd_listing(
        &mut self,
        arg: Option<String>,
        format: ListingFormat,
    ) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }

        // Tolerate ls-style flags some clients send with LIST.
        let path = arg
            .as_deref()
            .map(|a| {
                a.split_whitespace()
                    .filter(|tok| !tok.starts_with('-'))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|p| !p.is_empty())
            .map(|p| self.resolve_arg(&p))
            .unwrap_or_else(|| self.state.cwd.clone());

        let li = self.logged_in().expect("checked login");
        let entries = match li.tvfs.list(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, deny_text(&e)))
                    .await?;
                return Ok(LineDisposition::Continue);
            }
        };
        let lines = listing::render(&entries, format);

        self.reply(Reply::new(codes::OPENING_DATA, "Here comes the directory listing."))
            .await?;
        let Some(data) = self.open_data_stream().await? else {
            return Ok(LineDisposition::Continue);
        };

        let (_unused, writer) = tokio::io::split(data);
        let outcome = Pipe::new(8)
            .run(ListingSource::new(lines), SocketWriter::new(writer))
            .await;

        if outcome.is_ok() {
            self.reply(Reply::new(codes::TRANSFER_COMPLETE, "Directory send ok."))
                .await?;
        } else {
            self.reply(Reply::new(codes::TRANSFER_ABORTED, "Listing aborted."))
                .await?;
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_retr(&mut self, path: &str) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let offset = std::mem::take(&mut self.state.rest);

        let li = self.logged_in().expect("checked login");
        let (file, entry) = match li.tvfs.open_read(&target, offset).await {
            Ok(opened) => opened,
            Err(e) => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, deny_text(&e)))
                    .await?;
                return Ok(LineDisposition::Continue);
            }
        };

        self.reply(Reply::new(
            codes::OPENING_DATA,
            format!("Opening data connection for {target} ({} bytes).", entry.size),
        ))
        .await?;
        let Some(data) = self.open_data_stream().await? else {
            return Ok(LineDisposition::Continue);
        };

        let data: BoxedStream = if self.state.ascii {
            Box::new(AsciiLayer::new(data))
        } else {
            data
        };
        let (_unused, writer) = tokio::io::split(data);

        let li = self.logged_in().expect("checked login");
        let budget = li.outbound.clone();
        let mut tracker = self.next_entry(&target, entry.size);
        tracker.bytes_read = offset;
        let session_id = self.state.ctx.id;
        let events = Arc::clone(&self.state.ctx.events);
        let activity = Arc::clone(&self.state.activity);

        let source = Throttled::new(FileReader::new(file), budget);
        let outcome = Channel::new(8)
            .run(source, SocketWriter::new(writer), |progress| {
                activity.touch();
                tracker.bytes_read = offset + progress.bytes_added;
                tracker.read_bps = progress.rate_bps;
                tracker.last_read_time = Some(Timestamp::now());
                events.progress(SessionProgress {
                    session_id,
                    entry: tracker.clone(),
                });
            })
            .await;

        match outcome.ending {
            Ending::Eof | Ending::Canceled => {
                self.state
                    .logger
                    .status(format!("sent {target} ({} bytes)", outcome.bytes_drained));
                self.reply(Reply::new(codes::TRANSFER_COMPLETE, "Transfer complete."))
                    .await?;
            }
            Ending::Aborted => {
                self.reply(Reply::new(codes::TRANSFER_ABORTED, "Transfer aborted."))
                    .await?;
            }
            Ending::Failed(e) => {
                self.state.logger.error(format!("RETR {target} failed: {e}"));
                // Network side failing is an abort; the file side is local.
                let reply = match e.source {
                    ErrorSource::Consumer => {
                        Reply::new(codes::TRANSFER_ABORTED, "Transfer aborted.")
                    }
                    ErrorSource::Adder => Reply::new(codes::LOCAL_ERROR, "Local read error."),
                };
                self.reply(reply).await?;
            }
        }
        Ok(LineDisposition::Continue)
    }

    async fn cmd_stor(
        &mut self,
        path: &str,
        disposition: WriteDisposition,
    ) -> io::Result<LineDisposition> {
        if !self.require_login().await? {
            return Ok(LineDisposition::Continue);
        }
        let target = self.resolve_arg(path);
        let offset = std::mem::take(&mut self.state.rest);
        let mode = match disposition {
            WriteDisposition::Append => WriteMode::Append,
            WriteDisposition::Replace if offset > 0 => WriteMode::Offset(offset),
            WriteDisposition::Replace => WriteMode::Truncate,
        };

        let li = self.logged_in().expect("checked login");
        let file = match li.tvfs.open_write(&target, mode).await {
            Ok(file) => file,
            Err(e) => {
                self.reply(Reply::new(codes::FILE_UNAVAILABLE, deny_text(&e)))
                    .await?;
                return Ok(LineDisposition::Continue);
            }
        };

        self.reply(Reply::new(codes::OPENING_DATA, "Ready to receive data."))
            .await?;
        let Some(data) = self.open_data_stream().await? else {
            return Ok(LineDisposition::Continue);
        };

        let data: BoxedStream = if self.state.ascii {
            Box::new(AsciiLayer::new(data))
        } else {
            data
        };
        let (reader, _unused) = tokio::io::split(data);

        let li = self.logged_in().expect("checked login");
        let budget = li.inbound.clone();
        let mut tracker = self.next_entry(&target, 0);
        let session_id = self.state.ctx.id;
        let events = Arc::clone(&self.state.ctx.events);
        let activity = Arc::clone(&self.state.activity);

        let source = Throttled::new(SocketReader::new(reader), budget);
        let outcome = Channel::new(8)
            .run(source, FileWriter::new(file), |progress| {
                activity.touch();
                tracker.bytes_written = progress.bytes_drained;
                tracker.write_bps = progress.rate_bps;
                tracker.last_written_time = Some(Timestamp::now());
                events.progress(SessionProgress {
                    session_id,
                    entry: tracker.clone(),
                });
            })
            .await;

        match outcome.ending {
            Ending::Eof | Ending::Canceled => {
                self.state
                    .logger
                    .status(format!("stored {target} ({} bytes)", outcome.bytes_drained));
                self.reply(Reply::new(codes::TRANSFER_COMPLETE, "Transfer complete."))
                    .await?;
            }
            Ending::Aborted => {
                self.reply(Reply::new(codes::TRANSFER_ABORTED, "Transfer aborted."))
                    .await?;
            }
            Ending::Failed(e) => {
                self.state.logger.error(format!("STOR {target} failed: {e}"));
                let reply = match e.source {
                    ErrorSource::Adder => Reply::new(codes::TRANSFER_ABORTED, "Transfer aborted."),
                    ErrorSource::Consumer => Reply::new(codes::LOCAL_ERROR, "Local write error."),
                };
                self.reply(reply).await?;
            }
        }
        Ok(LineDisposition::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StructureOp {
    Mkd,
    Rmd,
    Dele,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteDisposition {
    Replace,
    Append,
}

fn deny_text(e: &FtpdError) -> String {
    match e {
        FtpdError::PathNotFound(_) => "No such file or directory.".to_owned(),
        FtpdError::AccessDenied(_) => "Permission denied.".to_owned(),
        _ => "Requested action not taken.".to_owned(),
    }
}

fn is_local_peer(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local()
        }
        std::net::IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Source wrapper that charges a transfer budget for every byte moved
struct Throttled<S> {
    inner: S,
    budget: TransferBudget,
}

impl<S> Throttled<S> {
    fn new(inner: S, budget: TransferBudget) -> Self {
        Self { inner, budget }
    }
}

#[async_trait]
impl<S: Source> Source for Throttled<S> {
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        let before = buf.len();
        let drive = self.inner.fill(buf).await?;
        let after = buf.len();
        if after > before && self.budget.is_limited() {
            self.budget.charge((after - before) as u64).await;
        }
        Ok(drive)
    }

    fn wake_handle(&self) -> Option<Arc<tokio::sync::Notify>> {
        self.inner.wake_handle()
    }
}

/// Stream that first serves a byte prefix, then the wrapped stream
///
/// Used at TLS upgrade time: bytes the client pipelined behind the AUTH
/// reply belong to the handshake and must not be lost.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    /// Wrap `inner`, serving `prefix` before any fresh reads
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.pos += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
