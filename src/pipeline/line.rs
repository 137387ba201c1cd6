//! Line-oriented pipe sink
//!
//! Scans the buffer once per drive for the first terminator and hands the
//! line (terminator excluded) to its handler. A line longer than the
//! configured maximum stops the pipe with a buffer-limit overflow; an
//! embedded NUL before the terminator is fatal.

use crate::pipeline::{Drive, DriveResult, LockingBuffer, Sink};
use async_trait::async_trait;
use std::io;

/// Line terminator accepted by a [`LineConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eol {
    /// Bare `\n`
    Lf,
    /// `\r\n`
    CrLf,
}

/// What the handler wants the consumer to do after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    /// Consume the line and keep going
    Continue,
    /// Stop the pipe gracefully; the line is not consumed
    Stop,
}

/// Receives each parsed line
#[async_trait]
pub trait LineHandler: Send {
    /// Called with the line excluding its terminator; `more_data_pending`
    /// is true when further bytes already sit behind the terminator
    async fn on_line(&mut self, line: &[u8], more_data_pending: bool)
        -> io::Result<LineDisposition>;
}

/// Pipe sink that emits a callback per terminated line
pub struct LineConsumer<H> {
    handler: H,
    eol: Eol,
    max_line_size: usize,
    scratch: Vec<u8>,
}

impl<H: LineHandler> LineConsumer<H> {
    /// Create a consumer for the given terminator and maximum line length
    pub fn new(handler: H, eol: Eol, max_line_size: usize) -> Self {
        Self {
            handler,
            eol,
            max_line_size,
            scratch: Vec::new(),
        }
    }

    /// Access the wrapped handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the wrapped handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Take the handler back
    pub fn into_handler(self) -> H {
        self.handler
    }
}

/// Length of the unterminated line content buffered so far
///
/// A trailing `\r` may yet become half of a CRLF terminator, so it does
/// not count as content. Used for the overflow check: only content beyond
/// the maximum is an overlong line.
pub fn pending_line_len(data: &[u8], eol: Eol) -> usize {
    match eol {
        Eol::CrLf if data.last() == Some(&b'\r') => data.len() - 1,
        _ => data.len(),
    }
}

/// Locate the first terminated line in `data`
///
/// Returns `Ok(Some((line_len, eol_len)))` when a full line is present,
/// `Ok(None)` when more bytes are needed, and an error on an embedded NUL.
pub fn find_line(data: &[u8], eol: Eol) -> io::Result<Option<(usize, usize)>> {
    let sentinel = match eol {
        Eol::Lf => b'\n',
        Eol::CrLf => b'\r',
    };

    let Some(pos) = data.iter().position(|&b| b == sentinel || b == 0) else {
        return Ok(None);
    };
    if data[pos] == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "NUL byte in line",
        ));
    }

    match eol {
        Eol::Lf => Ok(Some((pos, 1))),
        Eol::CrLf => {
            if pos + 1 >= data.len() {
                // CR is the last byte so far; the LF may still arrive.
                return Ok(None);
            }
            if data[pos + 1] == b'\n' {
                Ok(Some((pos, 2)))
            } else {
                // A CR not followed by LF never terminates a line.
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<H: LineHandler> Sink for LineConsumer<H> {
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        let (line_len, eol_len, more) = {
            let b = buf.lock();
            let data = b.as_slice();
            match find_line(data, self.eol)? {
                Some((line_len, eol_len)) => {
                    self.scratch.clear();
                    self.scratch.extend_from_slice(&data[..line_len]);
                    (line_len, eol_len, line_len + eol_len < data.len())
                }
                None => {
                    if pending_line_len(data, self.eol) > self.max_line_size {
                        return Ok(Drive::BufferFull);
                    }
                    return Ok(Drive::EndOfData);
                }
            }
        };

        let line = std::mem::take(&mut self.scratch);
        let disposition = self.handler.on_line(&line, more).await?;
        self.scratch = line;

        match disposition {
            LineDisposition::Continue => {
                buf.lock().consume(line_len + eol_len);
                Ok(Drive::Progress)
            }
            LineDisposition::Stop => Ok(Drive::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipe::{Ending, ErrorSource, Pipe};
    use crate::pipeline::Source;

    struct Feed(Vec<Vec<u8>>);

    #[async_trait]
    impl Source for Feed {
        async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
            if self.0.is_empty() {
                return Ok(Drive::EndOfData);
            }
            let chunk = self.0.remove(0);
            buf.lock().append(&chunk);
            Ok(Drive::Progress)
        }
    }

    #[derive(Default)]
    struct Record {
        lines: Vec<(String, bool)>,
        stop_on: Option<&'static str>,
    }

    #[async_trait]
    impl LineHandler for Record {
        async fn on_line(
            &mut self,
            line: &[u8],
            more_data_pending: bool,
        ) -> io::Result<LineDisposition> {
            let text = String::from_utf8_lossy(line).into_owned();
            if self.stop_on == Some(text.as_str()) {
                return Ok(LineDisposition::Stop);
            }
            self.lines.push((text, more_data_pending));
            Ok(LineDisposition::Continue)
        }
    }

    #[tokio::test]
    async fn test_crlf_lines() {
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 512);
        let feed = Feed(vec![b"USER alice\r\nPASS".to_vec(), b" s3cret\r\n".to_vec()]);
        let outcome = Pipe::new(8).run(feed, &mut consumer).await;
        assert!(outcome.is_ok());
        let lines = &consumer.handler().lines;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], ("USER alice".to_string(), true));
        assert_eq!(lines[1], ("PASS s3cret".to_string(), false));
    }

    #[tokio::test]
    async fn test_split_terminator_across_chunks() {
        // One source turn per loop so the sink really sees the dangling CR.
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 512);
        let feed = Feed(vec![b"NOOP\r".to_vec(), b"\n".to_vec()]);
        let outcome = Pipe::new(1).run(feed, &mut consumer).await;
        assert!(outcome.is_ok());
        assert_eq!(consumer.handler().lines, vec![("NOOP".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_lf_mode() {
        let mut consumer = LineConsumer::new(Record::default(), Eol::Lf, 512);
        let feed = Feed(vec![b"one\ntwo\n".to_vec()]);
        let outcome = Pipe::new(8).run(feed, &mut consumer).await;
        assert!(outcome.is_ok());
        assert_eq!(consumer.handler().lines.len(), 2);
    }

    #[tokio::test]
    async fn test_max_line_boundary() {
        // Exactly max_line_size bytes followed by the terminator is fine.
        let line = vec![b'a'; 18];
        let mut input = line.clone();
        input.extend_from_slice(b"\r\n");
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 18);
        let outcome = Pipe::new(8).run(Feed(vec![input]), &mut consumer).await;
        assert!(outcome.is_ok());
        assert_eq!(consumer.handler().lines.len(), 1);

        // One more byte without a terminator overflows.
        let long = vec![b'a'; 19];
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 18);
        let outcome = Pipe::new(8).run(Feed(vec![long]), &mut consumer).await;
        match outcome.ending {
            Ending::Failed(e) => {
                assert_eq!(e.source, ErrorSource::Consumer);
                assert!(e.is_overflow());
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_line_boundary_with_split_terminator() {
        // An exactly-max line whose CR arrives in one chunk and LF in the
        // next must not be mistaken for an overlong line.
        let mut first = vec![b'a'; 18];
        first.push(b'\r');
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 18);
        let feed = Feed(vec![first, b"\n".to_vec()]);
        let outcome = Pipe::new(1).run(feed, &mut consumer).await;
        assert!(outcome.is_ok(), "{:?}", outcome.ending);
        let lines = &consumer.handler().lines;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0.len(), 18);
    }

    #[tokio::test]
    async fn test_split_overflow_still_detected() {
        // One byte past the maximum, still unterminated, overflows even
        // with a dangling CR behind it.
        let mut first = vec![b'a'; 19];
        first.push(b'\r');
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 18);
        let outcome = Pipe::new(1).run(Feed(vec![first]), &mut consumer).await;
        match outcome.ending {
            Ending::Failed(e) => assert!(e.is_overflow()),
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nul_byte_is_fatal() {
        let mut consumer = LineConsumer::new(Record::default(), Eol::CrLf, 512);
        let outcome = Pipe::new(8)
            .run(Feed(vec![b"bad\0line\r\n".to_vec()]), &mut consumer)
            .await;
        match outcome.ending {
            Ending::Failed(e) => assert_eq!(e.source, ErrorSource::Consumer),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_disposition_cancels() {
        let handler = Record {
            stop_on: Some("QUIT"),
            ..Record::default()
        };
        let mut consumer = LineConsumer::new(handler, Eol::CrLf, 512);
        let feed = Feed(vec![b"NOOP\r\nQUIT\r\n".to_vec()]);
        let outcome = Pipe::new(8).run(feed, &mut consumer).await;
        assert!(matches!(outcome.ending, Ending::Canceled));
        assert_eq!(consumer.handler().lines.len(), 1);
    }
}
