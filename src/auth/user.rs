//! Users, groups, and impersonation seams

use crate::auth::password::PasswordHash;
use crate::error::Result;
use crate::filter::AddressFilter;
use crate::tvfs::MountTable;
use async_trait::async_trait;

/// Reserved user name designating the server's own process user
pub const SYSTEM_USER_ALIAS: &str = "<system>";

/// An authentication method a user may log in with, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No credential beyond the name (anonymous-style accounts)
    None,
    /// Password verification against the stored hash
    Password,
}

impl AuthMethod {
    /// Wire token for the method list
    pub fn token(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
        }
    }
}

/// Transfer-rate budgets, in bytes per second; `None` is unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimits {
    /// Client-to-server budget
    pub inbound: Option<u64>,
    /// Server-to-client budget
    pub outbound: Option<u64>,
}

impl RateLimits {
    /// Take this limit where set, falling back to `other`
    pub fn or(self, other: RateLimits) -> RateLimits {
        RateLimits {
            inbound: self.inbound.or(other.inbound),
            outbound: self.outbound.or(other.outbound),
        }
    }
}

/// Credentials used to impersonate an OS account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpersonationCredentials {
    /// Windows username and password pair
    Windows {
        /// Account name
        username: String,
        /// Account password
        password: String,
    },
    /// POSIX user with an optional group override
    Posix {
        /// Account name
        user: String,
        /// Group to switch to instead of the account's primary group
        group: Option<String>,
    },
}

/// The result of acquiring impersonation for a login
#[derive(Debug, Clone, Default)]
pub struct ImpersonationToken {
    /// Home directory of the impersonated account, substituted for `:h`
    pub home: Option<String>,
}

/// Acquires impersonation tokens; the OS mechanism itself is an external
/// collaborator behind this seam
#[async_trait]
pub trait Impersonator: Send + Sync {
    /// Acquire a token for the given credentials
    async fn acquire(&self, credentials: &ImpersonationCredentials) -> Result<ImpersonationToken>;
}

/// Impersonator for builds without OS impersonation support: every attempt
/// fails with a distinct, loggable error
pub struct RejectingImpersonator;

#[async_trait]
impl Impersonator for RejectingImpersonator {
    async fn acquire(&self, _credentials: &ImpersonationCredentials) -> Result<ImpersonationToken> {
        Err(crate::error::FtpdError::Other(
            "impersonation is not supported on this build".to_owned(),
        ))
    }
}

/// No-op impersonator: every session runs as the server's process user,
/// with the process environment's home directory
pub struct ProcessUserImpersonator;

#[async_trait]
impl Impersonator for ProcessUserImpersonator {
    async fn acquire(&self, _credentials: &ImpersonationCredentials) -> Result<ImpersonationToken> {
        Ok(ImpersonationToken {
            home: std::env::var("HOME").ok().filter(|h| !h.is_empty()),
        })
    }
}

/// A configured user account
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// Login name; may be [`SYSTEM_USER_ALIAS`]
    pub name: String,
    /// Stored password; absent for method-`none` accounts
    pub password: Option<PasswordHash>,
    /// Acceptable methods in preference order
    pub methods: Vec<AuthMethod>,
    /// The user's own mount table
    pub mount_table: MountTable,
    /// Groups whose configuration composes into this user's, in order
    pub groups: Vec<String>,
    /// OS impersonation, when configured
    pub impersonation: Option<ImpersonationCredentials>,
    /// Per-user transfer budgets shared across the user's sessions
    pub rate_limits: RateLimits,
    /// Per-session inbound cap
    pub session_inbound_limit: Option<u64>,
    /// Per-session outbound cap
    pub session_outbound_limit: Option<u64>,
    /// Address filter applied at login
    pub filter: AddressFilter,
    /// Whether the account can log in at all
    pub enabled: bool,
}

impl User {
    /// A minimal enabled account with password authentication
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            methods: vec![AuthMethod::Password],
            mount_table: MountTable::default(),
            groups: Vec::new(),
            impersonation: None,
            rate_limits: RateLimits::default(),
            session_inbound_limit: None,
            session_outbound_limit: None,
            filter: AddressFilter::allow_all(),
            enabled: true,
        }
    }
}

/// A named bundle of configuration users can reference
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Mounts contributed to member users
    pub mount_table: MountTable,
    /// Address filter contributed to member users
    pub filter: AddressFilter,
    /// Rate limits contributed to member users
    pub rate_limits: RateLimits,
    /// Operator-facing description
    pub description: String,
}

impl Group {
    /// An empty group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_table: MountTable::default(),
            filter: AddressFilter::allow_all(),
            rate_limits: RateLimits::default(),
            description: String::new(),
        }
    }
}
