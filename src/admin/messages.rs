//! The administration message table
//!
//! Every message the protocol can carry is declared exactly once in the
//! [`admin_messages!`] invocation below: its compile-time tag, payload
//! type, dispatcher method, and whether it may travel before login. The
//! table generates the [`Message`] enum, the per-tag metadata, and the
//! [`Forwarder`] dispatcher trait.

use crate::admin::types::{
    CertificateSummary, ListenerStatus, LogLine, SessionInfo, SessionProgress,
};
use crate::admin::wire::{wire_struct, WireDecode, WireEncode, WireError, WireReader};
use async_trait::async_trait;
use std::io;

wire_struct! {
    /// Payload-free message body
    pub struct Empty {}
}

wire_struct! {
    /// Client login request
    pub struct AdminLogin {
        /// Administration password
        pub password: String,
    }
}

wire_struct! {
    /// Server answer to [`AdminLogin`]
    pub struct AdminLoginResult {
        /// Whether the session is now authenticated
        pub success: bool,
        /// Failure detail; empty on success
        pub message: String,
        /// Server protocol version, major
        pub protocol_major: u32,
        /// Server protocol version, minor
        pub protocol_minor: u32,
    }
}

wire_struct! {
    /// Queue-full acknowledgement, sent when the outbound buffer passes its
    /// warning threshold and echoed back by the peer once it caught up
    pub struct AckQueueFull {
        /// True on the echo
        pub success: bool,
    }
}

wire_struct! {
    /// An XML configuration document in transit
    pub struct ConfigDocument {
        /// The serialized document
        pub xml: String,
    }
}

wire_struct! {
    /// Outcome of a void administration request
    pub struct OperationResult {
        /// Tag of the request this answers
        pub request_tag: u32,
        /// Whether the request was applied
        pub success: bool,
        /// Descriptive error; empty on success
        pub error: String,
    }
}

wire_struct! {
    /// Live session snapshot
    pub struct SessionList {
        /// All currently connected sessions
        pub sessions: Vec<SessionInfo>,
    }
}

wire_struct! {
    /// Request to disconnect one session
    pub struct KickSession {
        /// Session to disconnect
        pub id: u64,
    }
}

wire_struct! {
    /// A session appeared
    pub struct SessionStarted {
        /// The new session
        pub info: SessionInfo,
    }
}

wire_struct! {
    /// A session went away
    pub struct SessionStopped {
        /// The departed session's id
        pub id: u64,
    }
}

wire_struct! {
    /// Toggle log forwarding to this administration session
    pub struct SubscribeLog {
        /// True to receive log lines
        pub enable: bool,
    }
}

wire_struct! {
    /// Request to generate a self-signed certificate
    pub struct GenerateSelfSigned {
        /// Subject distinguished name
        pub distinguished_name: String,
        /// Hostnames for subjectAltName
        pub hostnames: Vec<String>,
    }
}

wire_struct! {
    /// Upload a PEM key and certificate chain
    pub struct UploadCertificate {
        /// PEM private key
        pub key_pem: String,
        /// PEM certificate chain
        pub certs_pem: String,
        /// Password for an encrypted key; empty if none
        pub password: String,
    }
}

wire_struct! {
    /// Start an ACME order for the given hostnames
    pub struct StartAcmeOrder {
        /// RFC 8555 directory URL
        pub directory_url: String,
        /// Account contacts (mailto: URLs)
        pub contacts: Vec<String>,
        /// Hostnames to certify
        pub hostnames: Vec<String>,
    }
}

wire_struct! {
    /// Outcome of a certificate operation
    pub struct CertificateResult {
        /// Whether the operation succeeded
        pub success: bool,
        /// Descriptive error; empty on success
        pub error: String,
        /// Installed certificate summary, when successful
        pub summary: Option<CertificateSummary>,
    }
}

wire_struct! {
    /// Server status snapshot
    pub struct ServerStatus {
        /// Seconds since the server started
        pub uptime_secs: u64,
        /// Currently connected sessions
        pub session_count: u64,
        /// Server version string
        pub version: String,
    }
}

/// Per-tag permission bitset (`sending_allowed` / `dispatching_allowed`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagSet(u64);

impl TagSet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every declared tag
    pub fn all() -> Self {
        let mut set = Self::empty();
        for tag in 0..Message::COUNT as u32 {
            set.insert(tag);
        }
        set
    }

    /// Only the tags allowed before login
    pub fn prelogin() -> Self {
        let mut set = Self::empty();
        for tag in 0..Message::COUNT as u32 {
            if Message::allowed_before_login(tag) {
                set.insert(tag);
            }
        }
        set
    }

    /// Add a tag
    pub fn insert(&mut self, tag: u32) {
        self.0 |= 1 << tag;
    }

    /// Test a tag
    pub fn contains(&self, tag: u32) -> bool {
        tag < Message::COUNT as u32 && self.0 & (1 << tag) != 0
    }
}

macro_rules! admin_messages {
    (
        $(
            $(#[$meta:meta])*
            $tag:literal => $variant:ident ( $payload:ty ) . $method:ident $(, $prelogin:ident)? ;
        )*
    ) => {
        /// A tagged administration message
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $(
                $(#[$meta])*
                $variant($payload),
            )*
        }

        impl Message {
            /// Number of declared message types
            pub const COUNT: usize = 0 $( + { let _ = $tag; 1 } )*;

            /// This message's compile-time tag
            pub fn tag(&self) -> u32 {
                match self {
                    $( Message::$variant(_) => $tag, )*
                }
            }

            /// Human-readable message name for logs
            pub fn name(&self) -> &'static str {
                match self {
                    $( Message::$variant(_) => stringify!($variant), )*
                }
            }

            /// Whether a tag may travel before login
            pub fn allowed_before_login(tag: u32) -> bool {
                match tag {
                    $( $tag => admin_messages!(@prelogin $($prelogin)?), )*
                    _ => false,
                }
            }

            /// Serialize the payload (tag and length framing excluded)
            pub fn encode_payload(&self, out: &mut Vec<u8>) {
                match self {
                    $( Message::$variant(p) => p.encode(out), )*
                }
            }

            /// Decode a payload for a received tag
            pub fn decode(tag: u32, payload: &[u8]) -> Result<Message, WireError> {
                let mut r = WireReader::new(payload);
                let message = match tag {
                    $( $tag => Message::$variant(<$payload>::decode(&mut r)?), )*
                    other => return Err(WireError::InvalidDiscriminant(u64::from(other))),
                };
                r.finish()?;
                Ok(message)
            }
        }

        /// Administration dispatcher: one method per message tag
        ///
        /// Tags arrive strictly in the order received; unknown tags never
        /// reach the forwarder (the session treats them as fatal). Default
        /// implementations reject the message so each side only implements
        /// what it handles.
        #[async_trait]
        pub trait Forwarder: Send {
            $(
                /// Handle one received message
                async fn $method(&mut self, message: $payload) -> io::Result<()> {
                    let _ = message;
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        concat!("unexpected message: ", stringify!($variant)),
                    ))
                }
            )*
        }

        /// Route a decoded message to its forwarder method
        pub async fn dispatch<F: Forwarder + ?Sized>(
            forwarder: &mut F,
            message: Message,
        ) -> io::Result<()> {
            match message {
                $( Message::$variant(p) => forwarder.$method(p).await, )*
            }
        }
    };

    (@prelogin prelogin) => { true };
    (@prelogin) => { false };
}

admin_messages! {
    /// Client login request
    0 => AdminLogin(AdminLogin).on_admin_login, prelogin;
    /// Server answer to the login request
    1 => AdminLoginResult(AdminLoginResult).on_admin_login_result, prelogin;
    /// Flow-control handshake
    2 => AckQueueFull(AckQueueFull).on_ack_queue_full, prelogin;
    /// Fetch the settings document
    3 => GetSettings(Empty).on_get_settings;
    /// Settings document (response and change notification)
    4 => Settings(ConfigDocument).on_settings;
    /// Replace the settings document
    5 => SetSettings(ConfigDocument).on_set_settings;
    /// Outcome of a void request
    6 => OperationResult(OperationResult).on_operation_result;
    /// Fetch the users document
    7 => GetUsers(Empty).on_get_users;
    /// Users document (response and change notification)
    8 => Users(ConfigDocument).on_users;
    /// Replace the users document
    9 => SetUsers(ConfigDocument).on_set_users;
    /// Fetch the groups document
    10 => GetGroups(Empty).on_get_groups;
    /// Groups document (response and change notification)
    11 => Groups(ConfigDocument).on_groups;
    /// Replace the groups document
    12 => SetGroups(ConfigDocument).on_set_groups;
    /// Fetch connected sessions
    13 => ListSessions(Empty).on_list_sessions;
    /// Connected-session snapshot
    14 => SessionList(SessionList).on_session_list;
    /// Disconnect one session
    15 => KickSession(KickSession).on_kick_session;
    /// A session connected
    16 => SessionStarted(SessionStarted).on_session_started;
    /// A session disconnected
    17 => SessionStopped(SessionStopped).on_session_stopped;
    /// Transfer progress within a session
    18 => SessionProgress(SessionProgress).on_session_progress;
    /// Toggle log forwarding
    19 => SubscribeLog(SubscribeLog).on_subscribe_log;
    /// A forwarded log line
    20 => LogLine(LogLine).on_log_line;
    /// A listener changed state
    21 => ListenerStatus(ListenerStatus).on_listener_status;
    /// Generate a self-signed certificate
    22 => GenerateSelfSigned(GenerateSelfSigned).on_generate_self_signed;
    /// Upload a certificate bundle
    23 => UploadCertificate(UploadCertificate).on_upload_certificate;
    /// Start an ACME order
    24 => StartAcmeOrder(StartAcmeOrder).on_start_acme_order;
    /// Outcome of a certificate operation
    25 => CertificateResult(CertificateResult).on_certificate_result;
    /// Fetch server status
    26 => GetServerStatus(Empty).on_get_server_status;
    /// Server status snapshot
    27 => ServerStatus(ServerStatus).on_server_status;
}

/// The response tag paired with a request tag, when the table defines one
pub fn response_of(tag: u32) -> Option<u32> {
    match tag {
        0 => Some(1),   // AdminLogin -> AdminLoginResult
        3 => Some(4),   // GetSettings -> Settings
        5 => Some(6),   // SetSettings -> OperationResult
        7 => Some(8),   // GetUsers -> Users
        9 => Some(6),   // SetUsers -> OperationResult
        10 => Some(11), // GetGroups -> Groups
        12 => Some(6),  // SetGroups -> OperationResult
        13 => Some(14), // ListSessions -> SessionList
        15 => Some(6),  // KickSession -> OperationResult
        22 => Some(25), // GenerateSelfSigned -> CertificateResult
        23 => Some(25), // UploadCertificate -> CertificateResult
        24 => Some(25), // StartAcmeOrder -> CertificateResult
        26 => Some(27), // GetServerStatus -> ServerStatus
        _ => None,
    }
}
