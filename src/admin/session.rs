//! Administration session engine: shared state and inbound frame dispatch

use crate::admin::messages::{dispatch, Forwarder, Message, TagSet};
use crate::admin::wire::{WireError, WireReader};
use crate::pipeline::{Drive, DriveResult, LockingBuffer, Sink};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Frame cap before a successful login
pub const PRE_LOGIN_FRAME_CAP: usize = 4 * 1024;

/// Frame cap after login (configuration documents can be large)
pub const POST_LOGIN_FRAME_CAP: usize = 8 * 1024 * 1024;

/// Outbound backlog at which the queue-full handshake starts
pub const QUEUE_FULL_THRESHOLD: usize = 512 * 1024;

/// Protocol version sent in the login result
pub const PROTOCOL_VERSION: (u32, u32) = (2, 0);

/// State shared by a session's inbound dispatcher, outbound queue, and the
/// server-side forwarder
#[derive(Debug)]
pub struct SessionShared {
    sending_allowed: Mutex<TagSet>,
    dispatching_allowed: Mutex<TagSet>,
    max_frame: AtomicUsize,
    logged_in: AtomicBool,
    /// Our sends are paused until the peer echoes the queue-full message
    pub awaiting_ack: AtomicBool,
    /// The peer paused; we owe it an echo
    pub pending_echo: AtomicBool,
    resume: Arc<Notify>,
}

impl SessionShared {
    /// Fresh pre-login state: only the login handshake tags travel, frames
    /// are capped small
    pub fn new() -> Self {
        Self {
            sending_allowed: Mutex::new(TagSet::prelogin()),
            dispatching_allowed: Mutex::new(TagSet::prelogin()),
            max_frame: AtomicUsize::new(PRE_LOGIN_FRAME_CAP),
            logged_in: AtomicBool::new(false),
            awaiting_ack: AtomicBool::new(false),
            pending_echo: AtomicBool::new(false),
            resume: Arc::new(Notify::new()),
        }
    }

    /// Raise the caps and open every tag after a successful login
    pub fn set_logged_in(&self) {
        *self.lock_sending() = TagSet::all();
        *self.lock_dispatching() = TagSet::all();
        self.max_frame.store(POST_LOGIN_FRAME_CAP, Ordering::SeqCst);
        self.logged_in.store(true, Ordering::SeqCst);
    }

    /// Whether login completed
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Current sending permission set
    pub fn sending_allowed(&self) -> TagSet {
        *self.lock_sending()
    }

    /// Current dispatching permission set
    pub fn dispatching_allowed(&self) -> TagSet {
        *self.lock_dispatching()
    }

    /// Current frame cap
    pub fn max_frame(&self) -> usize {
        self.max_frame.load(Ordering::SeqCst)
    }

    /// The peer echoed the queue-full message: resume sending
    ///
    /// `notify_one` stores a permit, so a wake that lands before the
    /// outbound pipe parks is not lost.
    pub fn ack_received(&self) {
        self.awaiting_ack.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// The peer told us its queue is full: owe it an echo
    pub fn request_echo(&self) {
        self.pending_echo.store(true, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// Wake handle for the outbound source
    pub fn resume_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.resume)
    }

    fn lock_sending(&self) -> std::sync::MutexGuard<'_, TagSet> {
        self.sending_allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispatching(&self) -> std::sync::MutexGuard<'_, TagSet> {
        self.dispatching_allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipe sink parsing `[tag][length][payload]` frames and dispatching them
///
/// Unknown tags, oversize frames, and tags the `dispatching_allowed` set
/// does not cover are fatal protocol errors. Messages dispatch strictly in
/// the order received.
pub struct FrameSink<F> {
    forwarder: F,
    shared: Arc<SessionShared>,
    scratch: Vec<u8>,
}

impl<F: Forwarder> FrameSink<F> {
    /// Create a sink dispatching into `forwarder`
    pub fn new(forwarder: F, shared: Arc<SessionShared>) -> Self {
        Self {
            forwarder,
            shared,
            scratch: Vec::new(),
        }
    }

    /// Access the wrapped forwarder
    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    /// Take the forwarder back
    pub fn into_forwarder(self) -> F {
        self.forwarder
    }
}

#[async_trait]
impl<F: Forwarder> Sink for FrameSink<F> {
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        let (tag, consumed) = {
            let b = buf.lock();
            let data = b.as_slice();
            let mut r = WireReader::new(data);

            let tag = match r.read_varint() {
                Ok(v) => v,
                Err(WireError::UnexpectedEof) => return Ok(Drive::EndOfData),
                Err(e) => return Err(e.into()),
            };
            let len = match r.read_varint() {
                Ok(v) => v,
                Err(WireError::UnexpectedEof) => return Ok(Drive::EndOfData),
                Err(e) => return Err(e.into()),
            };

            let tag = u32::try_from(tag).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("unknown admin tag {tag}"))
            })?;
            if tag as usize >= Message::COUNT {
                error!(tag, "unknown administration message tag");
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown admin tag {tag}"),
                ));
            }

            let max = self.shared.max_frame() as u64;
            if len > max {
                error!(tag, len, max, "administration frame exceeds cap");
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "admin frame exceeds size cap",
                ));
            }

            let header = data.len() - r.remaining();
            let len = len as usize;
            if r.remaining() < len {
                return Ok(Drive::EndOfData);
            }

            if !self.shared.dispatching_allowed().contains(tag) {
                error!(tag, "message dispatched before being enabled");
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("dispatch of tag {tag} is not enabled"),
                ));
            }

            self.scratch.clear();
            self.scratch.extend_from_slice(&data[header..header + len]);
            (tag, header + len)
        };

        let message = Message::decode(tag, &self.scratch)?;
        debug!(tag, name = message.name(), "dispatching admin message");
        dispatch(&mut self.forwarder, message).await?;

        buf.lock().consume(consumed);
        Ok(Drive::Progress)
    }
}
