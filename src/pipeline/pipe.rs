//! One-shot byte mover between a source and a sink over a shared buffer

use crate::pipeline::{Drive, LockingBuffer, Sink, Source};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Which endpoint a pipe error originated from
///
/// The owning session decides what a failure means based on the side it
/// happened on: during an upload a sink-side fatal is a local error, a
/// source-side fatal is a network error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The filling end (adder)
    Adder,
    /// The draining end (consumer)
    Consumer,
}

/// Terminal pipe error with its originating side
#[derive(Debug)]
pub struct PipeError {
    /// Side the error came from
    pub source: ErrorSource,
    /// The underlying error
    pub error: io::Error,
}

impl PipeError {
    fn new(source: ErrorSource, error: io::Error) -> Self {
        Self { source, error }
    }

    fn overflow(source: ErrorSource) -> Self {
        Self::new(
            source,
            io::Error::new(io::ErrorKind::InvalidData, "buffer limit exceeded"),
        )
    }

    /// Whether this error is the buffer-limit overflow condition
    /// (oversize line, or a stalled sink against a full buffer)
    pub fn is_overflow(&self) -> bool {
        self.error.kind() == io::ErrorKind::InvalidData
    }
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self.source {
            ErrorSource::Adder => "adder",
            ErrorSource::Consumer => "consumer",
        };
        write!(f, "{} ({side} side)", self.error)
    }
}

/// How a pipe run ended
#[derive(Debug)]
pub enum Ending {
    /// Source reached end of stream and the drain policy was satisfied
    Eof,
    /// The sink canceled the pipe; not an error
    Canceled,
    /// The pipe was aborted through its [`AbortHandle`]
    Aborted,
    /// A terminal error on one of the two sides
    Failed(PipeError),
}

/// Result of a completed pipe run
#[derive(Debug)]
pub struct PipeOutcome {
    /// Total bytes the source put into the buffer
    pub bytes_added: u64,
    /// Total bytes the sink took out of the buffer
    pub bytes_drained: u64,
    /// How the run ended
    pub ending: Ending,
}

impl PipeOutcome {
    /// Whether the pipe completed without error (EOF or graceful cancel)
    pub fn is_ok(&self) -> bool {
        matches!(self.ending, Ending::Eof | Ending::Canceled)
    }
}

#[derive(Debug, Default)]
struct AbortState {
    flag: AtomicBool,
    notify: Notify,
}

/// Handle that aborts a running pipe from outside
///
/// Used by the session to tear a data transfer down on ABOR or on session
/// shutdown. Aborting is idempotent.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    /// Stop the pipe at its next await point
    pub fn abort(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}

/// A one-shot byte mover between exactly one source and one sink
///
/// The pipe drives each endpoint at most `max_num_loops` times per turn so
/// neither side can starve the other, drains remaining buffered bytes on
/// source EOF when `wait_for_empty_buffer_on_eof` is set, and classifies
/// terminal errors by side.
pub struct Pipe {
    buffer: LockingBuffer,
    max_num_loops: usize,
    wait_for_empty_buffer_on_eof: bool,
    abort: Arc<AbortState>,
}

impl Pipe {
    /// Create a pipe with the given fairness bound
    pub fn new(max_num_loops: usize) -> Self {
        Self {
            buffer: LockingBuffer::new(),
            max_num_loops: max_num_loops.max(1),
            wait_for_empty_buffer_on_eof: true,
            abort: Arc::new(AbortState::default()),
        }
    }

    /// Whether source EOF completes immediately or only after the sink
    /// drained the buffer (the default)
    pub fn wait_for_empty_buffer_on_eof(mut self, wait: bool) -> Self {
        self.wait_for_empty_buffer_on_eof = wait;
        self
    }

    /// Handle to abort this pipe from another task
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            state: Arc::clone(&self.abort),
        }
    }

    /// The shared buffer; exposed for endpoints that pre-seed data
    pub fn buffer(&self) -> &LockingBuffer {
        &self.buffer
    }

    /// Run the pipe to completion
    pub async fn run<S, K>(self, source: S, sink: K) -> PipeOutcome
    where
        S: Source,
        K: Sink,
    {
        self.run_observed(source, sink, |_, _| {}).await
    }

    /// Run the pipe, reporting `(bytes_added, bytes_drained)` deltas to the
    /// observer after every productive endpoint turn
    pub async fn run_observed<S, K, O>(self, mut source: S, mut sink: K, mut observe: O) -> PipeOutcome
    where
        S: Source,
        K: Sink,
        O: FnMut(u64, u64) + Send,
    {
        let mut bytes_added: u64 = 0;
        let mut bytes_drained: u64 = 0;

        // Turn state. `needs_more` means the sink saw the current bytes and
        // wants different (or just more) data; it clears when the source
        // makes progress. `full` clears when the sink makes progress.
        let mut source_eof = false;
        let mut source_full = false;
        let mut source_blocked = false;
        let mut sink_blocked = false;
        let mut sink_needs_more = false;
        let mut deferred_source_err: Option<io::Error> = None;

        macro_rules! finish {
            ($ending:expr) => {
                return PipeOutcome {
                    bytes_added,
                    bytes_drained,
                    ending: $ending,
                }
            };
        }

        loop {
            if self.abort.flag.load(Ordering::SeqCst) {
                finish!(Ending::Aborted);
            }

            // Sink phase.
            if !sink_blocked && !sink_needs_more && !self.buffer.is_empty() {
                let mut loops = 0;
                while loops < self.max_num_loops && !self.buffer.is_empty() {
                    loops += 1;
                    let before = self.buffer.len();
                    let drive = tokio::select! {
                        r = sink.drain(&self.buffer) => r,
                        _ = self.abort.notified() => finish!(Ending::Aborted),
                    };
                    let after = self.buffer.len();
                    if after < before {
                        let delta = (before - after) as u64;
                        bytes_drained += delta;
                        source_full = false;
                        observe(0, delta);
                    }

                    match drive {
                        Ok(Drive::Progress) => {}
                        Ok(Drive::WouldBlock) => {
                            if sink.wake_handle().is_none() {
                                finish!(Ending::Failed(PipeError::new(
                                    ErrorSource::Consumer,
                                    wake_contract_error(),
                                )));
                            }
                            sink_blocked = true;
                            break;
                        }
                        Ok(Drive::EndOfData) => {
                            sink_needs_more = true;
                            break;
                        }
                        Ok(Drive::BufferFull) => {
                            finish!(Ending::Failed(PipeError::overflow(ErrorSource::Consumer)));
                        }
                        Ok(Drive::Canceled) => finish!(Ending::Canceled),
                        Err(e) => {
                            finish!(Ending::Failed(PipeError::new(ErrorSource::Consumer, e)))
                        }
                    }
                }
            }

            // EOF completion: immediately if the drain policy allows it, or
            // once the buffer is empty, or when the sink cannot make use of
            // what is left.
            if source_eof
                && (!self.wait_for_empty_buffer_on_eof
                    || self.buffer.is_empty()
                    || sink_needs_more)
            {
                if let Err(e) = sink.finish().await {
                    finish!(Ending::Failed(PipeError::new(ErrorSource::Consumer, e)));
                }
                finish!(Ending::Eof);
            }

            // While the sink can still act on buffered bytes it keeps the
            // turn; filling may suspend on the peer and must not starve it.
            if !sink_blocked && !sink_needs_more && !self.buffer.is_empty() {
                continue;
            }

            // Source phase.
            if !source_eof && !source_blocked && !source_full {
                if let Some(e) = deferred_source_err.take() {
                    finish!(Ending::Failed(PipeError::new(ErrorSource::Adder, e)));
                }

                let mut loops = 0;
                while loops < self.max_num_loops {
                    loops += 1;
                    let before = self.buffer.len();
                    let drive = tokio::select! {
                        r = source.fill(&self.buffer) => r,
                        _ = self.abort.notified() => finish!(Ending::Aborted),
                    };
                    let after = self.buffer.len();
                    let progressed = after > before;
                    if progressed {
                        let delta = (after - before) as u64;
                        bytes_added += delta;
                        sink_needs_more = false;
                        observe(delta, 0);
                    }

                    match drive {
                        Ok(Drive::Progress) => {
                            // Fresh bytes: give the sink its turn before the
                            // next fill can suspend on the peer.
                            if !self.buffer.is_empty() {
                                break;
                            }
                        }
                        Ok(Drive::WouldBlock) => {
                            if source.wake_handle().is_none() {
                                finish!(Ending::Failed(PipeError::new(
                                    ErrorSource::Adder,
                                    wake_contract_error(),
                                )));
                            }
                            source_blocked = true;
                            break;
                        }
                        // EOF is not an error outside of the endpoint.
                        Ok(Drive::EndOfData) | Ok(Drive::Canceled) => {
                            source_eof = true;
                            break;
                        }
                        Ok(Drive::BufferFull) => {
                            if loops == 1 && sink_needs_more {
                                // The buffer is at capacity yet the sink cannot
                                // act on it: nobody can ever make progress.
                                finish!(Ending::Failed(PipeError::overflow(ErrorSource::Adder)));
                            }
                            source_full = true;
                            break;
                        }
                        Err(e) => {
                            if loops > 1 || progressed {
                                // Let the sink see the bytes from this turn;
                                // report on the next source turn.
                                deferred_source_err = Some(e);
                                break;
                            }
                            finish!(Ending::Failed(PipeError::new(ErrorSource::Adder, e)));
                        }
                    }
                }
            }

            // Park when neither side can run. Both runnability checks mirror
            // the phase guards above.
            let sink_runnable = !sink_blocked && !sink_needs_more && !self.buffer.is_empty();
            let source_runnable = deferred_source_err.is_some()
                || (!source_eof && !source_blocked && !source_full);
            if !sink_runnable && !source_runnable {
                if source_full && sink_needs_more {
                    finish!(Ending::Failed(PipeError::overflow(ErrorSource::Adder)));
                }
                if source_eof && sink_needs_more {
                    continue; // resolved by the EOF completion check
                }

                let source_wake = source_blocked.then(|| source.wake_handle()).flatten();
                let sink_wake = sink_blocked.then(|| sink.wake_handle()).flatten();
                match (source_wake, sink_wake) {
                    (Some(sw), Some(kw)) => {
                        tokio::select! {
                            _ = sw.notified() => source_blocked = false,
                            _ = kw.notified() => sink_blocked = false,
                            _ = self.abort.notified() => finish!(Ending::Aborted),
                        }
                    }
                    (Some(sw), None) => {
                        tokio::select! {
                            _ = sw.notified() => source_blocked = false,
                            _ = self.abort.notified() => finish!(Ending::Aborted),
                        }
                    }
                    (None, Some(kw)) => {
                        tokio::select! {
                            _ = kw.notified() => sink_blocked = false,
                            _ = self.abort.notified() => finish!(Ending::Aborted),
                        }
                    }
                    (None, None) => {
                        // Neither side blocked with a wake handle yet neither
                        // is runnable: the pipe is wedged.
                        finish!(Ending::Failed(PipeError::new(
                            ErrorSource::Adder,
                            io::Error::new(io::ErrorKind::Deadlock, "pipe cannot make progress"),
                        )));
                    }
                }
            }
        }
    }
}

impl AbortState {
    // Checks the flag only after arming the waiter, so an abort racing this
    // call can never be missed.
    async fn notified(&self) {
        let fut = self.notify.notified();
        tokio::pin!(fut);
        fut.as_mut().enable();
        if self.flag.load(Ordering::SeqCst) {
            return;
        }
        fut.await;
    }
}

fn wake_contract_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "endpoint returned WouldBlock without a wake handle",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Drive, DriveResult};
    use async_trait::async_trait;

    /// Source feeding fixed chunks, then EOF.
    struct ChunkSource {
        chunks: Vec<Vec<u8>>,
        next: usize,
    }

    impl ChunkSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self { chunks, next: 0 }
        }
    }

    #[async_trait]
    impl Source for ChunkSource {
        async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
            if self.next >= self.chunks.len() {
                return Ok(Drive::EndOfData);
            }
            buf.lock().append(&self.chunks[self.next]);
            self.next += 1;
            Ok(Drive::Progress)
        }
    }

    /// Sink collecting all bytes.
    #[derive(Default)]
    struct CollectSink {
        got: Vec<u8>,
        finished: bool,
    }

    #[async_trait]
    impl Sink for CollectSink {
        async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
            let mut b = buf.lock();
            self.got.extend_from_slice(b.as_slice());
            let n = b.len();
            b.consume(n);
            Ok(Drive::Progress)
        }

        async fn finish(&mut self) -> io::Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_moves_all_bytes() {
        let pipe = Pipe::new(4);
        let source = ChunkSource::new(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let outcome = pipe.run(source, CollectSink::default()).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.bytes_added, 11);
        assert_eq!(outcome.bytes_drained, 11);
    }

    #[tokio::test]
    async fn test_eof_drains_buffer_first() {
        // A sink that consumes one byte per turn: EOF must not cut the
        // remaining bytes off.
        struct ByteSink(Vec<u8>);

        #[async_trait]
        impl Sink for ByteSink {
            async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
                let mut b = buf.lock();
                if let Some(&byte) = b.as_slice().first() {
                    self.0.push(byte);
                    b.consume(1);
                }
                Ok(Drive::Progress)
            }
        }

        let pipe = Pipe::new(2);
        let source = ChunkSource::new(vec![b"abcdef".to_vec()]);
        let mut sink = ByteSink(Vec::new());
        let outcome = pipe.run(source, &mut sink).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.bytes_drained, 6);
        assert_eq!(sink.0, b"abcdef");
    }

    #[tokio::test]
    async fn test_no_wait_on_eof_completes_with_residue() {
        struct NeverSink;

        #[async_trait]
        impl Sink for NeverSink {
            async fn drain(&mut self, _buf: &LockingBuffer) -> DriveResult {
                Ok(Drive::EndOfData)
            }
        }

        let pipe = Pipe::new(4).wait_for_empty_buffer_on_eof(false);
        let source = ChunkSource::new(vec![b"leftover".to_vec()]);
        let outcome = pipe.run(source, NeverSink).await;
        assert!(matches!(outcome.ending, Ending::Eof));
        assert_eq!(outcome.bytes_drained, 0);
    }

    #[tokio::test]
    async fn test_sink_needing_more_at_eof_completes() {
        // Sink wants a terminator that never arrives; the source EOF must
        // still complete the pipe even with bytes left over.
        struct TerminatorSink;

        #[async_trait]
        impl Sink for TerminatorSink {
            async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
                let b = buf.lock();
                if b.as_slice().contains(&b'\n') {
                    unreachable!("test data has no terminator");
                }
                Ok(Drive::EndOfData)
            }
        }

        let pipe = Pipe::new(4);
        let source = ChunkSource::new(vec![b"no terminator".to_vec()]);
        let outcome = pipe.run(source, TerminatorSink).await;
        assert!(matches!(outcome.ending, Ending::Eof));
    }

    #[tokio::test]
    async fn test_sink_cancel_ends_without_error() {
        struct CancelSink;

        #[async_trait]
        impl Sink for CancelSink {
            async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
                let mut b = buf.lock();
                let n = b.len();
                b.consume(n);
                Ok(Drive::Canceled)
            }
        }

        let pipe = Pipe::new(4);
        let source = ChunkSource::new(vec![b"x".to_vec(), b"y".to_vec()]);
        let outcome = pipe.run(source, CancelSink).await;
        assert!(matches!(outcome.ending, Ending::Canceled));
    }

    #[tokio::test]
    async fn test_source_error_is_classified() {
        struct FailSource;

        #[async_trait]
        impl Source for FailSource {
            async fn fill(&mut self, _buf: &LockingBuffer) -> DriveResult {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }

        let pipe = Pipe::new(4);
        let outcome = pipe.run(FailSource, CollectSink::default()).await;
        match outcome.ending {
            Ending::Failed(e) => {
                assert_eq!(e.source, ErrorSource::Adder);
                assert_eq!(e.error.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sink_overflow_is_classified() {
        struct OverflowSink;

        #[async_trait]
        impl Sink for OverflowSink {
            async fn drain(&mut self, _buf: &LockingBuffer) -> DriveResult {
                Ok(Drive::BufferFull)
            }
        }

        let pipe = Pipe::new(4);
        let source = ChunkSource::new(vec![b"data".to_vec()]);
        let outcome = pipe.run(source, OverflowSink).await;
        match outcome.ending {
            Ending::Failed(e) => {
                assert_eq!(e.source, ErrorSource::Consumer);
                assert!(e.is_overflow());
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_stops_the_pipe() {
        struct SlowSource;

        #[async_trait]
        impl Source for SlowSource {
            async fn fill(&mut self, _buf: &LockingBuffer) -> DriveResult {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Drive::Progress)
            }
        }

        let pipe = Pipe::new(4);
        let handle = pipe.abort_handle();
        let run = tokio::spawn(pipe.run(SlowSource, CollectSink::default()));
        tokio::task::yield_now().await;
        handle.abort();
        let outcome = run.await.expect("pipe task panicked");
        assert!(matches!(outcome.ending, Ending::Aborted));
    }
}
