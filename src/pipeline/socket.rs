//! Socket endpoints: a source and a sink over the two halves of a stream
//!
//! The reader bounds how much it keeps in the pipe buffer and, once the
//! bound is hit, stays paused until the sink drains below a resume
//! threshold, so a slow consumer applies back-pressure to the peer instead
//! of ballooning memory. The writer drains the buffer to the stream and, on
//! [`finish`](crate::pipeline::Sink::finish), flushes and shuts the write
//! side down.

use crate::pipeline::{Drive, DriveResult, LockingBuffer, Sink, Source};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Default cap on bytes a reader keeps buffered
pub const DEFAULT_MAX_READABLE: usize = 128 * 1024;

/// Pairs a [`SocketReader`] and [`SocketWriter`] over one stream
pub struct SocketAdapter;

impl SocketAdapter {
    /// Split a stream into a pipe source and sink with default watermarks
    pub fn split<S>(stream: S) -> (SocketReader<ReadHalf<S>>, SocketWriter<WriteHalf<S>>)
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (rh, wh) = tokio::io::split(stream);
        (SocketReader::new(rh), SocketWriter::new(wh))
    }
}

/// Pipe source reading from a stream with watermark back-pressure
pub struct SocketReader<R> {
    inner: R,
    max_readable: usize,
    resume_at: usize,
    paused: bool,
    scratch: Vec<u8>,
}

impl<R> SocketReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create a reader with the default watermarks
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, DEFAULT_MAX_READABLE, DEFAULT_MAX_READABLE / 2)
    }

    /// Create a reader that buffers at most `max_readable` bytes and, after
    /// hitting that cap, resumes reading only once the buffer has drained
    /// to `resume_at` bytes or fewer
    pub fn with_limits(inner: R, max_readable: usize, resume_at: usize) -> Self {
        Self {
            inner,
            max_readable: max_readable.max(1),
            resume_at: resume_at.min(max_readable),
            paused: false,
            scratch: Vec::new(),
        }
    }

    /// Give the wrapped read half back
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R> Source for SocketReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        let len = buf.len();

        if self.paused {
            if len > self.resume_at {
                return Ok(Drive::BufferFull);
            }
            self.paused = false;
        }

        let headroom = self.max_readable.saturating_sub(len);
        if headroom == 0 {
            self.paused = true;
            return Ok(Drive::BufferFull);
        }

        let want = headroom.min(64 * 1024);
        if self.scratch.len() < want {
            self.scratch.resize(want, 0);
        }

        let read = self.inner.read(&mut self.scratch[..want]).await?;
        if read == 0 {
            return Ok(Drive::EndOfData);
        }

        buf.lock().append(&self.scratch[..read]);
        Ok(Drive::Progress)
    }
}

/// Pipe sink writing the buffer out to a stream
pub struct SocketWriter<W> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W> SocketWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a writer over the given write half
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    /// Give the wrapped write half back
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> Sink for SocketWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        // Copy out under the lock, write without it.
        self.scratch.clear();
        {
            let b = buf.lock();
            let chunk = b.as_slice();
            if chunk.is_empty() {
                return Ok(Drive::Progress);
            }
            let take = chunk.len().min(64 * 1024);
            self.scratch.extend_from_slice(&chunk[..take]);
        }

        let written = self.inner.write(&self.scratch).await?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "stream accepted no bytes",
            ));
        }
        buf.lock().consume(written);
        Ok(Drive::Progress)
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipe::{Ending, Pipe};

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let (reader, _unused_writer) = SocketAdapter::split(server);
        let (_unused_reader, mut writer_side) = tokio::io::split(client);

        let feeder = tokio::spawn(async move {
            writer_side.write_all(b"over the wire").await.expect("write");
            writer_side.shutdown().await.expect("shutdown");
        });

        struct Collect(Vec<u8>);

        #[async_trait]
        impl Sink for Collect {
            async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
                let mut b = buf.lock();
                self.0.extend_from_slice(b.as_slice());
                let n = b.len();
                b.consume(n);
                Ok(Drive::Progress)
            }
        }

        let mut sink = Collect(Vec::new());
        let outcome = Pipe::new(8).run(reader, &mut sink).await;
        feeder.await.expect("feeder task");
        assert!(matches!(outcome.ending, Ending::Eof));
        assert_eq!(sink.0, b"over the wire");
    }

    #[tokio::test]
    async fn test_reader_pauses_at_watermark() {
        let (client, server) = tokio::io::duplex(4096);
        let (rh, _wh) = tokio::io::split(server);
        let mut reader = SocketReader::with_limits(rh, 8, 4);
        let (_crh, mut cwh) = tokio::io::split(client);
        cwh.write_all(b"0123456789abcdef").await.expect("write");

        let buf = LockingBuffer::new();
        // Fill to the cap.
        while buf.len() < 8 {
            match reader.fill(&buf).await.expect("fill") {
                Drive::Progress => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        // At the cap: full, and stays full until drained to the threshold.
        assert_eq!(reader.fill(&buf).await.expect("fill"), Drive::BufferFull);
        buf.lock().consume(2);
        assert_eq!(reader.fill(&buf).await.expect("fill"), Drive::BufferFull);
        buf.lock().consume(4);
        assert_eq!(reader.fill(&buf).await.expect("fill"), Drive::Progress);
    }
}
