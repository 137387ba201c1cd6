//! Outbound administration message queue
//!
//! Messages enqueue through an [`Outbox`] handle and a pipe source
//! serializes them into the outbound buffer. When the serialized backlog
//! passes the warning threshold the source emits a single
//! `acknowledge_queue_full` and pauses until the peer echoes it back, so a
//! slow administration client never stalls the server behind TCP
//! back-pressure.

use crate::admin::messages::{AckQueueFull, Message};
use crate::admin::session::SessionShared;
use crate::pipeline::{Drive, DriveResult, LockingBuffer, Source};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Serialize a message with its `[tag][length][payload]` framing
pub fn encode_frame(message: &Message, out: &mut Vec<u8>) {
    use crate::admin::wire::write_varint;
    let mut payload = Vec::new();
    message.encode_payload(&mut payload);
    write_varint(out, u64::from(message.tag()));
    write_varint(out, payload.len() as u64);
    out.extend_from_slice(&payload);
}

/// Handle used to enqueue outbound messages
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<SessionShared>,
}

impl Outbox {
    /// Enqueue a message
    ///
    /// Refuses tags the session's `sending_allowed` set does not cover; a
    /// caller hitting this is a protocol bug, not a runtime condition.
    pub fn send(&self, message: Message) -> io::Result<()> {
        let tag = message.tag();
        if !self.shared.sending_allowed().contains(tag) {
            warn!(tag, name = message.name(), "message not allowed to be sent yet");
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("sending of {} is not enabled", message.name()),
            ));
        }
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "admin session closed"))
    }

    /// The shared session state
    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }
}

/// Pipe source draining the queue into the outbound buffer
pub struct OutboxSource {
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<SessionShared>,
    warn_threshold: usize,
    scratch: Vec<u8>,
}

/// Create a connected `(Outbox, OutboxSource)` pair
pub fn outbox(shared: Arc<SessionShared>, warn_threshold: usize) -> (Outbox, OutboxSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Outbox {
            tx,
            shared: Arc::clone(&shared),
        },
        OutboxSource {
            rx,
            shared,
            warn_threshold,
            scratch: Vec::new(),
        },
    )
}

#[async_trait]
impl Source for OutboxSource {
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        // The echo must go out even while our own sends are paused; the
        // peer is waiting for it to resume.
        if self.shared.pending_echo.swap(false, Ordering::SeqCst) {
            self.scratch.clear();
            encode_frame(&Message::AckQueueFull(AckQueueFull { success: true }), &mut self.scratch);
            buf.lock().append(&self.scratch);
            return Ok(Drive::Progress);
        }

        if self.shared.awaiting_ack.load(Ordering::SeqCst) {
            return Ok(Drive::WouldBlock);
        }

        if buf.len() >= self.warn_threshold {
            debug!("outbound backlog passed warning threshold, pausing sends");
            self.shared.awaiting_ack.store(true, Ordering::SeqCst);
            self.scratch.clear();
            encode_frame(
                &Message::AckQueueFull(AckQueueFull { success: false }),
                &mut self.scratch,
            );
            buf.lock().append(&self.scratch);
            return Ok(Drive::Progress);
        }

        match self.rx.recv().await {
            Some(message) => {
                self.scratch.clear();
                encode_frame(&message, &mut self.scratch);
                buf.lock().append(&self.scratch);
                Ok(Drive::Progress)
            }
            None => Ok(Drive::EndOfData),
        }
    }

    fn wake_handle(&self) -> Option<Arc<Notify>> {
        Some(self.shared.resume_handle())
    }
}
