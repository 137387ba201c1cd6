//! Authentication: users, groups, passwords, impersonation
//!
//! Login is a stepped conversation: the client states a name, the server
//! answers with the acceptable methods for that name, then verifies the
//! credential. The effective configuration of a logged-in user is the union
//! of the user's own settings with those of each referenced group, user
//! values winning.

pub mod authenticator;
pub mod password;
pub mod user;

pub use authenticator::{Authenticator, EffectiveUser, LoginFailure};
pub use password::PasswordHash;
pub use user::{
    AuthMethod, Group, Impersonator, ImpersonationCredentials, ImpersonationToken,
    ProcessUserImpersonator, RateLimits, RejectingImpersonator, User, SYSTEM_USER_ALIAS,
};
