//! Byte pipeline: shared buffer, endpoint seams, pipe, and adapters
//!
//! A [`Pipe`] couples exactly one [`Source`] (which fills the shared
//! [`LockingBuffer`]) to one [`Sink`] (which drains it), with loop fairness,
//! EOF draining, and error-source classification. [`Channel`] is a pipe with
//! a byte-rate monitor. Concrete endpoints live in the submodules: socket
//! halves, file reader/writer, and the line consumer.

pub mod buffer;
pub mod channel;
pub mod file;
pub mod line;
pub mod pipe;
pub mod socket;

pub use buffer::{Buffer, LockingBuffer};
pub use channel::{Channel, Progress, RateMonitor};
pub use file::{FileReader, FileWriter};
pub use line::{Eol, LineConsumer, LineDisposition, LineHandler};
pub use pipe::{AbortHandle, ErrorSource, Pipe, PipeError, PipeOutcome};
pub use socket::{SocketAdapter, SocketReader, SocketWriter};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

/// Outcome of driving an endpoint once
///
/// The conventions mirror the classic non-blocking status codes: `Progress`
/// is 0, `WouldBlock` is EAGAIN, `EndOfData` is ENODATA, `BufferFull` is
/// ENOBUFS, `Canceled` is ECANCELED. Fatal errors travel as `io::Error`
/// through the `Result` wrapper instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Made progress; the endpoint is ready for another turn
    Progress,
    /// Not ready; the endpoint signals its wake handle when it becomes ready
    WouldBlock,
    /// End of stream on the source side, or the sink needs bytes that are
    /// not in the buffer yet
    EndOfData,
    /// The buffer cannot take more bytes
    BufferFull,
    /// The sink decided it is done; the pipe stops without error
    Canceled,
}

/// Result of a single endpoint drive
pub type DriveResult = std::io::Result<Drive>;

/// The filling end of a pipe
///
/// `fill` appends bytes to the shared buffer. It may await readiness
/// internally; an endpoint that instead returns [`Drive::WouldBlock`] must
/// expose a wake handle the pipe can park on.
#[async_trait]
pub trait Source: Send {
    /// Append available bytes to the buffer
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult;

    /// Notify handle signalled when a `WouldBlock` endpoint becomes ready
    fn wake_handle(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// The draining end of a pipe
#[async_trait]
pub trait Sink: Send {
    /// Consume bytes from the front of the buffer
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult;

    /// Notify handle signalled when a `WouldBlock` endpoint becomes ready
    fn wake_handle(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Called once after the source reached EOF and the buffer drained,
    /// before the pipe reports completion
    ///
    /// Sinks that wrap a stream use this to flush and shut the stream down.
    async fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Source + ?Sized> Source for &mut T {
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        (**self).fill(buf).await
    }

    fn wake_handle(&self) -> Option<Arc<Notify>> {
        (**self).wake_handle()
    }
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for &mut T {
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        (**self).drain(buf).await
    }

    fn wake_handle(&self) -> Option<Arc<Notify>> {
        (**self).wake_handle()
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        (**self).finish().await
    }
}
