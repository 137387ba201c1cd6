//! Authoritative configuration model
//!
//! Owned by the administration server; everything else reads immutable
//! snapshots. Validation is all-or-nothing: a change that fails any check
//! is rejected without partial application.

use crate::auth::{Group, PasswordHash, User};
use crate::error::{FtpdError, Result};
use crate::filter::AddressFilter;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// TLS behaviour of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plaintext only; AUTH TLS is refused
    Plain,
    /// Plaintext greeting, TLS via AUTH TLS
    Explicit {
        /// Refuse pre-AUTH commands other than AUTH/FEAT/HELP/QUIT
        require_tls: bool,
    },
    /// TLS from the first byte
    Implicit,
}

/// One FTP control listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Bind address
    pub address: IpAddr,
    /// Bind port
    pub port: u16,
    /// TLS behaviour
    pub tls: TlsMode,
}

/// Autoban thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutobanConfig {
    /// Failures that trigger a ban
    pub max_login_failures: u32,
    /// Window the failures must fall into
    pub login_failures_time_window: Duration,
    /// How long a banned peer stays banned
    pub ban_duration: Duration,
}

impl Default for AutobanConfig {
    fn default() -> Self {
        Self {
            max_login_failures: 3,
            login_failures_time_window: Duration::from_secs(60),
            ban_duration: Duration::from_secs(300),
        }
    }
}

/// Server-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    /// Multi-line welcome banner; `%v` expands to the server version
    pub banner: String,
    /// Passive port range; `None` lets the OS pick
    pub pasv_port_range: Option<(u16, u16)>,
    /// Host advertised in PASV replies instead of the local address
    pub host_override: Option<String>,
    /// Skip the override when the control peer is on a local network
    pub do_not_override_host_if_peer_is_local: bool,
    /// Accept-to-authentication deadline
    pub login_timeout: Duration,
    /// Idle deadline on the control channel
    pub activity_timeout: Duration,
    /// Autoban thresholds
    pub autoban: AutobanConfig,
    /// Connection-time address filter
    pub filter: AddressFilter,
    /// Concurrent session cap
    pub max_sessions: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            banner: "ftpd-rs %v ready.".to_owned(),
            pasv_port_range: Some((49152, 65534)),
            host_override: None,
            do_not_override_host_if_peer_is_local: true,
            login_timeout: Duration::from_secs(60),
            activity_timeout: Duration::from_secs(600),
            autoban: AutobanConfig::default(),
            filter: AddressFilter::allow_all(),
            max_sessions: 512,
        }
    }
}

/// Administration listener settings
#[derive(Debug, Clone, PartialEq)]
pub struct AdminSettings {
    /// Bind address
    pub address: IpAddr,
    /// Bind port
    pub port: u16,
    /// Administration password; `None` refuses all logins
    pub password: Option<PasswordHash>,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            address: IpAddr::from([127, 0, 0, 1]),
            port: 14148,
            password: None,
        }
    }
}

/// The complete authoritative configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// FTP control listeners
    pub listeners: Vec<ListenerConfig>,
    /// Server-wide settings
    pub settings: ServerSettings,
    /// User accounts
    pub users: Vec<User>,
    /// Groups users may reference
    pub groups: Vec<Group>,
    /// Administration channel
    pub admin: AdminSettings,
}

/// Whether two bind addresses collide on the same port
///
/// `0.0.0.0` and `::` are any-equivalent: they conflict with every
/// specific address of the same family.
pub fn hosts_conflict(a: IpAddr, b: IpAddr) -> bool {
    if a == b {
        return true;
    }
    let same_family = a.is_ipv4() == b.is_ipv4();
    same_family && (a.is_unspecified() || b.is_unspecified())
}

impl Config {
    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<()> {
        for (i, a) in self.listeners.iter().enumerate() {
            for b in &self.listeners[i + 1..] {
                if a.port == b.port && hosts_conflict(a.address, b.address) {
                    return Err(FtpdError::Config(format!(
                        "listeners conflict on port {}: {} and {}",
                        a.port, a.address, b.address
                    )));
                }
            }
            if a.port == self.admin.port && hosts_conflict(a.address, self.admin.address) {
                return Err(FtpdError::Config(format!(
                    "listener {}:{} conflicts with the administration port",
                    a.address, a.port
                )));
            }
        }

        for (i, user) in self.users.iter().enumerate() {
            if self.users[..i].iter().any(|u| u.name == user.name) {
                return Err(FtpdError::Config(format!("duplicate user {:?}", user.name)));
            }
            for group in &user.groups {
                if !self.groups.iter().any(|g| &g.name == group) {
                    return Err(FtpdError::Config(format!(
                        "user {:?} references unknown group {:?}",
                        user.name, group
                    )));
                }
            }
        }
        for (i, group) in self.groups.iter().enumerate() {
            if self.groups[..i].iter().any(|g| g.name == group.name) {
                return Err(FtpdError::Config(format!(
                    "duplicate group {:?}",
                    group.name
                )));
            }
        }

        if let Some((lo, hi)) = self.settings.pasv_port_range {
            if lo == 0 || lo > hi {
                return Err(FtpdError::Config(format!(
                    "invalid passive port range {lo}-{hi}"
                )));
            }
        }

        Ok(())
    }
}

/// Shared, atomically swappable configuration snapshot
///
/// Readers clone an `Arc` under a short read lock; an in-flight session
/// keeps its snapshot alive for as long as it needs it, so a swap never
/// disturbs running operations.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    /// Store an initial configuration
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Validate and install a new configuration
    pub fn swap(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }
}
