//! Server error types

use thiserror::Error;

/// FTP server and administration protocol errors
#[derive(Error, Debug)]
pub enum FtpdError {
    /// IO error during network or filesystem operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during handshake or certificate handling
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation timed out
    #[error("Timeout")]
    Timeout,

    /// Malformed data received on a wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    ///
    /// The wire reply never distinguishes why; the detailed cause is logged
    /// server-side only.
    #[error("Authentication failed")]
    AuthFailed,

    /// Connection refused because the peer address is banned or filtered
    #[error("Address rejected: {0}")]
    AddressRejected(std::net::IpAddr),

    /// Virtual path does not resolve to an accessible native path
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Operation denied by the mount point's access mode
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Invalid configuration; the change is rejected as a whole
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate loading, parsing, or generation failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// ACME order could not be completed
    #[error("ACME error: {0}")]
    Acme(String),

    /// Connection closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using FtpdError
pub type Result<T> = std::result::Result<T, FtpdError>;
