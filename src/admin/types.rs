//! Typed payloads carried by administration messages

use crate::admin::wire::{wire_enum, wire_struct, WireDecode, WireEncode, WireError, WireReader};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The current time
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Back to a [`SystemTime`]
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        Self(
            t.duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }
}

impl WireEncode for Timestamp {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

impl WireDecode for Timestamp {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(u64::decode(r)?))
    }
}

wire_enum! {
    /// TLS state of a session's control connection
    pub enum SecureState {
        /// Plaintext
        Insecure = 0,
        /// TLS negotiated but PROT/PBSZ incomplete
        QuasiSecure = 1,
        /// Fully secured
        Secure = 2,
    }
}

impl Default for SecureState {
    fn default() -> Self {
        SecureState::Insecure
    }
}

wire_struct! {
    /// One live session as shown to administrators
    pub struct SessionInfo {
        /// Server-assigned session id
        pub id: u64,
        /// When the connection was accepted
        pub start_time: Timestamp,
        /// Peer address in text form
        pub peer_host: String,
        /// 4 or 6
        pub address_family: u8,
        /// Authenticated user, once known
        pub username: Option<String>,
        /// Protocol spoken ("FTP", "FTPS")
        pub protocol_name: String,
        /// TLS state
        pub secure_state: SecureState,
    }
}

wire_struct! {
    /// One open file within a session
    pub struct SessionEntry {
        /// Session-unique entry id
        pub entry_id: u64,
        /// Virtual path being transferred
        pub path: String,
        /// Size at open time
        pub size: u64,
        /// Bytes read so far
        pub bytes_read: u64,
        /// Bytes written so far
        pub bytes_written: u64,
        /// When the entry was opened
        pub open_time: Timestamp,
        /// Last read activity
        pub last_read_time: Option<Timestamp>,
        /// Last write activity
        pub last_written_time: Option<Timestamp>,
        /// Read rate, bytes per second
        pub read_bps: u64,
        /// Write rate, bytes per second
        pub write_bps: u64,
    }
}

wire_struct! {
    /// Progress update for one session entry
    pub struct SessionProgress {
        /// Owning session
        pub session_id: u64,
        /// The entry being updated
        pub entry: SessionEntry,
    }
}

wire_enum! {
    /// Severity of a forwarded log line
    pub enum LogSeverity {
        /// Errors an operator must see
        Error = 0,
        /// Conditions worth noticing
        Warning = 1,
        /// Routine session activity
        Status = 2,
        /// Protocol-level detail
        Trace = 3,
    }
}

impl Default for LogSeverity {
    fn default() -> Self {
        LogSeverity::Status
    }
}

wire_struct! {
    /// One log line forwarded to administration subscribers
    pub struct LogLine {
        /// When the line was produced
        pub time: Timestamp,
        /// Severity
        pub severity: LogSeverity,
        /// Originating session, when any
        pub session_id: Option<u64>,
        /// The rendered line
        pub message: String,
    }
}

wire_enum! {
    /// Lifecycle state of a configured listener
    pub enum ListenerState {
        /// Not yet bound
        Stopped = 0,
        /// Bound and accepting
        Listening = 1,
        /// Bind failed
        Failed = 2,
    }
}

wire_struct! {
    /// Status change of one listener
    pub struct ListenerStatus {
        /// Configured bind address
        pub address: String,
        /// Configured port
        pub port: u16,
        /// New state
        pub state: ListenerState,
        /// Human-readable detail for failures
        pub detail: String,
    }
}

impl Default for ListenerState {
    fn default() -> Self {
        ListenerState::Stopped
    }
}

wire_struct! {
    /// Certificate summary returned after provisioning operations
    pub struct CertificateSummary {
        /// Lowercase colon-separated SHA-256 fingerprint
        pub fingerprint: String,
        /// Start of validity
        pub not_before: Timestamp,
        /// End of validity
        pub not_after: Timestamp,
        /// Subject distinguished name
        pub distinguished_name: String,
        /// Parsed subjectAltName hostnames
        pub hostnames: Vec<String>,
    }
}
