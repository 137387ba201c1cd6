//! Administration protocol: typed messages over a length-prefixed binary
//! framing on a TLS channel
//!
//! The message table lives in [`messages`]; both ends share it. A session
//! couples a [`FrameSink`](session::FrameSink) (inbound dispatch) with an
//! [`OutboxSource`](outbox::OutboxSource) (outbound queue) over two pipes.
//! Per-tag `sending_allowed` / `dispatching_allowed` bitsets gate what each
//! side may say before login, and a queue-full acknowledgement keeps a slow
//! peer from stalling the server.

pub mod messages;
pub mod outbox;
pub mod session;
pub mod types;
pub mod wire;

pub use messages::{dispatch, response_of, Forwarder, Message, TagSet};
pub use outbox::{encode_frame, outbox, Outbox, OutboxSource};
pub use session::{
    FrameSink, SessionShared, POST_LOGIN_FRAME_CAP, PRE_LOGIN_FRAME_CAP, PROTOCOL_VERSION,
    QUEUE_FULL_THRESHOLD,
};
pub use types::{
    CertificateSummary, ListenerState, ListenerStatus, LogLine, LogSeverity, SecureState,
    SessionEntry, SessionInfo, SessionProgress, Timestamp,
};
