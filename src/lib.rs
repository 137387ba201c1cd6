#![doc = include_str!("../README.md")]

/// RFC 8555 certificate provisioning over HTTP-01
pub mod acme;
/// Administration protocol: framing, message table, session engine
pub mod admin;
/// Users, groups, passwords, impersonation
pub mod auth;
/// Certificates: sources, fingerprints, loading, installation
pub mod cert;
/// Configuration model, XML persistence, snapshots
pub mod config;
mod error;
/// Binary CIDR address filters
pub mod filter;
/// FTP protocol: session state machine, commands, replies, data channel
pub mod ftp;
/// HTTP/1.x message parsing for the internal challenge listener
pub mod http;
/// Operator-visible log splitter
pub mod logger;
/// Byte pipeline: buffers, pipes, channels, endpoints
pub mod pipeline;
/// Transfer-rate and session-count limiting
pub mod ratelimit;
/// Listener supervision and the administration server
pub mod server;
/// Transparent virtual filesystem
pub mod tvfs;

pub use acme::{AcmeTransport, ChallengeServing, OrderRequest};
pub use admin::{Forwarder, Message, Outbox, SessionShared, TagSet};
pub use auth::{Authenticator, Group, PasswordHash, User};
pub use cert::{CertStore, Fingerprint, PemBundle};
pub use config::{Config, ConfigStore, ListenerConfig, ServerSettings, TlsMode};
pub use error::{FtpdError, Result};
pub use filter::AddressFilter;
pub use ftp::{Reply, SessionContext, SERVER_VERSION};
pub use logger::{LogSink, LogSplitter, SessionLogger};
pub use pipeline::{Buffer, Channel, LockingBuffer, Pipe, Sink, Source};
pub use ratelimit::{SessionGate, SessionSlot, TransferBudget};
pub use server::{Server, SessionRegistry};
pub use tvfs::{MountAccess, MountPoint, MountTable, Recursion, Tvfs};
