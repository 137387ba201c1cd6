//! Stepped login conversation and effective-configuration composition

use crate::auth::password::PasswordHash;
use crate::auth::user::{
    AuthMethod, Group, Impersonator, ImpersonationToken, RateLimits, User,
};
use crate::tvfs::MountTable;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error};

/// Why a login was refused
///
/// Logged with full detail; the wire reply collapses every variant into one
/// fixed code so nothing leaks to the client.
#[derive(Debug)]
pub enum LoginFailure {
    /// No such user
    UnknownUser,
    /// The account exists but is disabled
    Disabled,
    /// Password verification failed
    BadPassword,
    /// The peer address failed the user's or a group's filter
    Filtered(IpAddr),
    /// Impersonation token could not be acquired
    Impersonation(String),
}

impl std::fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginFailure::UnknownUser => write!(f, "unknown user"),
            LoginFailure::Disabled => write!(f, "account disabled"),
            LoginFailure::BadPassword => write!(f, "wrong password"),
            LoginFailure::Filtered(ip) => write!(f, "peer {ip} refused by filter"),
            LoginFailure::Impersonation(e) => write!(f, "impersonation failed: {e}"),
        }
    }
}

/// A logged-in user's composed configuration
///
/// The user's own settings union the referenced groups' in order, with
/// user-level values winning on conflict.
#[derive(Debug)]
pub struct EffectiveUser {
    /// Login name
    pub name: String,
    /// Composed mount table
    pub mount_table: MountTable,
    /// Composed shared transfer budgets
    pub rate_limits: RateLimits,
    /// Per-session inbound cap
    pub session_inbound_limit: Option<u64>,
    /// Per-session outbound cap
    pub session_outbound_limit: Option<u64>,
    /// Impersonation token, when the account impersonates
    pub token: Option<ImpersonationToken>,
}

impl EffectiveUser {
    /// Home directory for the `:h` placeholder
    pub fn home(&self) -> Option<&str> {
        self.token.as_ref().and_then(|t| t.home.as_deref())
    }
}

/// File-backed users and groups with stepped login
pub struct Authenticator {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    impersonator: Arc<dyn Impersonator>,
    dummy: PasswordHash,
}

impl Authenticator {
    /// Build from configured users and groups
    pub fn new(
        users: Vec<User>,
        groups: Vec<Group>,
        impersonator: Arc<dyn Impersonator>,
    ) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.name.clone(), u)).collect(),
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
            impersonator,
            dummy: PasswordHash::dummy(),
        }
    }

    /// Acceptable methods for a stated name, in order
    ///
    /// Unknown names get the same default answer a password-only account
    /// would, so the method list does not reveal which users exist.
    pub fn methods_for(&self, name: &str) -> Vec<AuthMethod> {
        match self.users.get(name) {
            Some(user) if !user.methods.is_empty() => user.methods.clone(),
            Some(_) => vec![AuthMethod::Password],
            None => vec![AuthMethod::Password],
        }
    }

    /// Whether the stated name may log in without a password
    pub fn allows_none(&self, name: &str) -> bool {
        self.methods_for(name).contains(&AuthMethod::None)
    }

    /// Run the password step and compose the effective configuration
    ///
    /// Verification work runs on the blocking pool; a missing user is
    /// verified against a dummy hash so timing does not reveal existence.
    pub async fn login(
        &self,
        name: &str,
        password: &str,
        peer: IpAddr,
    ) -> Result<EffectiveUser, LoginFailure> {
        let user = self.users.get(name);

        let stored = match user {
            Some(u) => u.password.clone().unwrap_or_else(|| self.dummy.clone()),
            None => self.dummy.clone(),
        };
        let candidate = password.to_owned();
        let password_ok = tokio::task::spawn_blocking(move || stored.verify(&candidate))
            .await
            .unwrap_or(false);

        let Some(user) = user else {
            return Err(LoginFailure::UnknownUser);
        };
        if !user.enabled {
            return Err(LoginFailure::Disabled);
        }

        let uses_none = user.methods.contains(&AuthMethod::None);
        if !uses_none && !password_ok {
            return Err(LoginFailure::BadPassword);
        }

        if !user.filter.admits(peer) {
            return Err(LoginFailure::Filtered(peer));
        }
        for group_name in &user.groups {
            if let Some(group) = self.groups.get(group_name) {
                if !group.filter.admits(peer) {
                    return Err(LoginFailure::Filtered(peer));
                }
            }
        }

        let mut mount_table = user.mount_table.clone();
        let mut rate_limits = user.rate_limits;
        for group_name in &user.groups {
            let Some(group) = self.groups.get(group_name) else {
                error!(user = %user.name, group = %group_name, "user references missing group");
                continue;
            };
            mount_table.merge(&group.mount_table);
            rate_limits = rate_limits.or(group.rate_limits);
        }

        // The `<system>` alias always runs as the server's process user;
        // its configuration never goes through the impersonator.
        let token = match &user.impersonation {
            Some(_) if user.name == crate::auth::user::SYSTEM_USER_ALIAS => None,
            Some(creds) => match self.impersonator.acquire(creds).await {
                Ok(token) => Some(token),
                Err(e) => return Err(LoginFailure::Impersonation(e.to_string())),
            },
            None => None,
        };

        debug!(user = %user.name, %peer, "login succeeded");
        Ok(EffectiveUser {
            name: user.name.clone(),
            mount_table,
            rate_limits,
            session_inbound_limit: user.session_inbound_limit,
            session_outbound_limit: user.session_outbound_limit,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::user::{ImpersonationCredentials, RejectingImpersonator};
    use crate::filter::AddressFilter;
    use crate::tvfs::{MountAccess, MountPoint, MountTable, PathFormat, Recursion};

    fn peer() -> IpAddr {
        "192.0.2.10".parse().expect("ip")
    }

    fn mount(v: &str, n: &str) -> MountPoint {
        MountPoint {
            virtual_path: v.to_owned(),
            native_path: n.to_owned(),
            access: MountAccess::ReadOnly,
            recursion: Recursion::ApplyPermissions,
            autocreate: false,
        }
    }

    fn authenticator(users: Vec<User>, groups: Vec<Group>) -> Authenticator {
        Authenticator::new(users, groups, Arc::new(RejectingImpersonator))
    }

    #[tokio::test]
    async fn test_password_login() {
        let mut user = User::new("alice");
        user.password = Some(PasswordHash::create("s3cret"));
        let auth = authenticator(vec![user], vec![]);

        assert!(auth.login("alice", "s3cret", peer()).await.is_ok());
        assert!(matches!(
            auth.login("alice", "wrong", peer()).await,
            Err(LoginFailure::BadPassword)
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_fails() {
        let auth = authenticator(vec![], vec![]);
        assert!(matches!(
            auth.login("ghost", "x", peer()).await,
            Err(LoginFailure::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn test_method_list_does_not_reveal_users() {
        let auth = authenticator(vec![User::new("real")], vec![]);
        assert_eq!(auth.methods_for("real"), auth.methods_for("ghost"));
    }

    #[tokio::test]
    async fn test_none_method_skips_password() {
        let mut user = User::new("anon");
        user.methods = vec![AuthMethod::None];
        let auth = authenticator(vec![user], vec![]);
        assert!(auth.login("anon", "whatever", peer()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_account() {
        let mut user = User::new("off");
        user.methods = vec![AuthMethod::None];
        user.enabled = false;
        let auth = authenticator(vec![user], vec![]);
        assert!(matches!(
            auth.login("off", "", peer()).await,
            Err(LoginFailure::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_group_composition_user_wins() {
        let mut user = User::new("member");
        user.methods = vec![AuthMethod::None];
        user.groups = vec!["staff".to_owned()];
        user.mount_table = MountTable::with_format(
            vec![mount("/pub", "/srv/user-pub")],
            PathFormat::Unix,
        )
        .expect("table");
        user.rate_limits = RateLimits {
            inbound: Some(500),
            outbound: None,
        };

        let mut group = Group::new("staff");
        group.mount_table = MountTable::with_format(
            vec![mount("/pub", "/srv/group-pub"), mount("/shared", "/srv/shared")],
            PathFormat::Unix,
        )
        .expect("table");
        group.rate_limits = RateLimits {
            inbound: Some(9),
            outbound: Some(1000),
        };

        let auth = authenticator(vec![user], vec![group]);
        let effective = auth.login("member", "", peer()).await.expect("login");

        // The user's /pub wins; the group contributes /shared.
        let natives: Vec<&str> = effective
            .mount_table
            .mounts()
            .iter()
            .map(|m| m.native_path.as_str())
            .collect();
        assert!(natives.contains(&"/srv/user-pub"));
        assert!(natives.contains(&"/srv/shared"));
        assert!(!natives.contains(&"/srv/group-pub"));
        assert_eq!(effective.rate_limits.inbound, Some(500));
        assert_eq!(effective.rate_limits.outbound, Some(1000));
    }

    #[tokio::test]
    async fn test_group_filter_applies() {
        let mut user = User::new("filtered");
        user.methods = vec![AuthMethod::None];
        user.groups = vec!["internal".to_owned()];

        let mut group = Group::new("internal");
        group.filter = AddressFilter {
            allowed: vec!["10.0.0.0/8".parse().expect("net")],
            disallowed: vec![],
        };

        let auth = authenticator(vec![user], vec![group]);
        assert!(matches!(
            auth.login("filtered", "", peer()).await,
            Err(LoginFailure::Filtered(_))
        ));
        assert!(auth
            .login("filtered", "", "10.2.3.4".parse().expect("ip"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_system_alias_never_impersonates() {
        use crate::auth::user::SYSTEM_USER_ALIAS;
        let mut user = User::new(SYSTEM_USER_ALIAS);
        user.methods = vec![AuthMethod::None];
        user.impersonation = Some(ImpersonationCredentials::Posix {
            user: "root".to_owned(),
            group: None,
        });
        // The rejecting impersonator would fail the login if it were
        // consulted.
        let auth = authenticator(vec![user], vec![]);
        let effective = auth
            .login(SYSTEM_USER_ALIAS, "", peer())
            .await
            .expect("login");
        assert!(effective.token.is_none());
    }

    #[tokio::test]
    async fn test_impersonation_failure_is_distinct() {
        let mut user = User::new("svc");
        user.methods = vec![AuthMethod::None];
        user.impersonation = Some(ImpersonationCredentials::Posix {
            user: "svc".to_owned(),
            group: None,
        });
        let auth = authenticator(vec![user], vec![]);
        assert!(matches!(
            auth.login("svc", "", peer()).await,
            Err(LoginFailure::Impersonation(_))
        ));
    }
}
