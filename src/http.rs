//! HTTP/1.x message parsing as a pipe sink
//!
//! A line-consumer state machine: start line, headers, then an identity or
//! chunked body, optional trailer, end of message. Used by the internal
//! ACME challenge listener and small enough to share with anything else
//! that needs to speak a sliver of HTTP.

use crate::pipeline::line::{find_line, pending_line_len};
use crate::pipeline::{Drive, DriveResult, Eol, LockingBuffer, Sink};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use tracing::{error, trace};

/// Whether a parsed message is a request or a response
///
/// A request without `Content-Length` or `Transfer-Encoding` has no body; a
/// response without either runs until the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client-to-server message
    Request,
    /// Server-to-client message
    Response,
}

/// What to do once a full message has been parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlow {
    /// Parse the next message on the same connection
    Continue,
    /// Stop the pipe gracefully
    Stop,
}

/// Receives the pieces of a parsed message
#[async_trait]
pub trait MessageHandler: Send {
    /// The request or status line
    async fn on_start_line(&mut self, _line: &str) -> io::Result<()> {
        Ok(())
    }

    /// One header, split on the first `:`
    async fn on_header(&mut self, _key: &str, _value: &str) -> io::Result<()> {
        Ok(())
    }

    /// End of the header block, before any body bytes
    async fn on_end_of_headers(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// A run of body bytes (already de-chunked)
    async fn on_body_chunk(&mut self, _chunk: &[u8]) -> io::Result<()> {
        Ok(())
    }

    /// The message is complete
    async fn on_end_of_message(&mut self) -> io::Result<MessageFlow> {
        Ok(MessageFlow::Stop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    StartLine,
    Headers,
    Trailer,
    ChunkSize,
    EndOfChunk,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferEncoding {
    Identity,
    Chunked,
}

const LENGTH_UNSET: u64 = u64::MAX;

/// Pipe sink parsing HTTP/1.x messages
pub struct MessageConsumer<H> {
    handler: H,
    kind: MessageKind,
    max_line_size: usize,
    status: Status,
    transfer_encoding: TransferEncoding,
    remaining: u64,
    scratch: Vec<u8>,
}

impl<H: MessageHandler> MessageConsumer<H> {
    /// Create a consumer for the given message kind
    pub fn new(handler: H, kind: MessageKind, max_line_size: usize) -> Self {
        Self {
            handler,
            kind,
            max_line_size,
            status: Status::StartLine,
            transfer_encoding: TransferEncoding::Identity,
            remaining: LENGTH_UNSET,
            scratch: Vec::new(),
        }
    }

    /// Access the wrapped handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Take the handler back
    pub fn into_handler(self) -> H {
        self.handler
    }

    fn reset(&mut self) {
        self.status = Status::StartLine;
        self.transfer_encoding = TransferEncoding::Identity;
        self.remaining = LENGTH_UNSET;
    }

    fn fail(&self, msg: String) -> io::Error {
        error!("{msg}");
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }

    async fn end_of_message(&mut self) -> io::Result<MessageFlow> {
        self.reset();
        self.handler.on_end_of_message().await
    }

    /// Drive the state machine with one line; returns `Some(flow)` when the
    /// line completed a message
    async fn process_line(&mut self, line: &str) -> io::Result<Option<MessageFlow>> {
        trace!("[{:?}] {line}", self.status);

        match self.status {
            Status::StartLine => {
                self.status = Status::Headers;
                self.handler.on_start_line(line).await?;
                Ok(None)
            }

            Status::Headers | Status::Trailer => {
                if line.is_empty() {
                    if self.status == Status::Headers {
                        self.handler.on_end_of_headers().await?;

                        if self.transfer_encoding == TransferEncoding::Chunked {
                            if self.remaining != LENGTH_UNSET {
                                return Err(self.fail(
                                    "Content-Length and chunked Transfer-Encoding are not compatible"
                                        .into(),
                                ));
                            }
                            self.status = Status::ChunkSize;
                            return Ok(None);
                        }

                        if self.remaining == LENGTH_UNSET && self.kind == MessageKind::Request {
                            // A request with neither header has no body.
                            self.remaining = 0;
                        }

                        if self.remaining != 0 {
                            self.status = Status::Body;
                            return Ok(None);
                        }
                        // Fall through: the message ends here.
                    }

                    return Ok(Some(self.end_of_message().await?));
                }

                let Some(colon) = line.find(':') else {
                    return Err(self.fail(format!("Invalid header line: {line}")));
                };
                let key = &line[..colon];
                let value = line.get(colon + 2..).unwrap_or("");
                self.handler.on_header(key, value).await?;

                if key.eq_ignore_ascii_case("Transfer-Encoding") {
                    if value.eq_ignore_ascii_case("identity") {
                        self.transfer_encoding = TransferEncoding::Identity;
                    } else if value.eq_ignore_ascii_case("chunked") {
                        self.transfer_encoding = TransferEncoding::Chunked;
                    } else {
                        return Err(self.fail(format!("Unsupported Transfer-Encoding: {value}")));
                    }
                } else if key.eq_ignore_ascii_case("Content-Length") {
                    self.remaining = value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| self.fail(format!("Invalid Content-Length: {value}")))?;
                }

                Ok(None)
            }

            Status::ChunkSize => {
                let size = u64::from_str_radix(line.trim(), 16)
                    .map_err(|_| self.fail(format!("Invalid chunk size: {line}")))?;
                self.remaining = size;
                self.status = if size > 0 {
                    Status::Body
                } else {
                    Status::Trailer
                };
                Ok(None)
            }

            Status::EndOfChunk => {
                if !line.is_empty() {
                    return Err(self.fail(format!("Spurious data after end of chunk: {line}")));
                }
                self.status = Status::ChunkSize;
                Ok(None)
            }

            Status::Body => Err(self.fail("Invalid internal status".into())),
        }
    }
}

#[async_trait]
impl<H: MessageHandler> Sink for MessageConsumer<H> {
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        if self.status == Status::Body {
            self.scratch.clear();
            {
                let b = buf.lock();
                let data = b.as_slice();
                let take = (self.remaining.min(data.len() as u64)) as usize;
                self.scratch.extend_from_slice(&data[..take]);
            }
            if self.scratch.is_empty() {
                return Ok(Drive::EndOfData);
            }

            let chunk = std::mem::take(&mut self.scratch);
            self.handler.on_body_chunk(&chunk).await?;
            let consumed = chunk.len();
            self.scratch = chunk;

            buf.lock().consume(consumed);
            self.remaining -= consumed as u64;

            if self.remaining == 0 {
                if self.transfer_encoding == TransferEncoding::Chunked {
                    self.status = Status::EndOfChunk;
                } else {
                    return match self.end_of_message().await? {
                        MessageFlow::Continue => Ok(Drive::Progress),
                        MessageFlow::Stop => Ok(Drive::Canceled),
                    };
                }
            }
            return Ok(Drive::Progress);
        }

        // Line-oriented states.
        let (consumable, line) = {
            let b = buf.lock();
            let data = b.as_slice();
            match find_line(data, Eol::CrLf)? {
                Some((line_len, eol_len)) => {
                    let line = std::str::from_utf8(&data[..line_len])
                        .map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 header line")
                        })?
                        .to_owned();
                    (line_len + eol_len, line)
                }
                None => {
                    if pending_line_len(data, Eol::CrLf) > self.max_line_size {
                        return Ok(Drive::BufferFull);
                    }
                    return Ok(Drive::EndOfData);
                }
            }
        };

        let flow = self.process_line(&line).await?;
        buf.lock().consume(consumable);

        match flow {
            Some(MessageFlow::Stop) => Ok(Drive::Canceled),
            _ => Ok(Drive::Progress),
        }
    }
}

/// Header collection that folds duplicate names with `", "`
#[derive(Debug, Default, Clone)]
pub struct Headers {
    map: BTreeMap<String, String>,
}

impl Headers {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, concatenating onto any previous value of the same
    /// (case-insensitive) name
    pub fn insert(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        match self.map.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.map.insert(key, value.to_owned());
            }
        }
    }

    /// Look a header up by case-insensitive name
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipe::{Ending, Pipe};
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
    struct Capture {
        start: String,
        headers: Headers,
        body: Vec<u8>,
        complete: bool,
    }

    #[async_trait]
    impl MessageHandler for Capture {
        async fn on_start_line(&mut self, line: &str) -> io::Result<()> {
            self.start = line.to_owned();
            Ok(())
        }

        async fn on_header(&mut self, key: &str, value: &str) -> io::Result<()> {
            self.headers.insert(key, value);
            Ok(())
        }

        async fn on_body_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.body.extend_from_slice(chunk);
            Ok(())
        }

        async fn on_end_of_message(&mut self) -> io::Result<MessageFlow> {
            self.complete = true;
            Ok(MessageFlow::Stop)
        }
    }

    async fn parse(kind: MessageKind, raw: &[u8]) -> Capture {
        let mut consumer = MessageConsumer::new(Capture::default(), kind, 8192);
        let outcome = Pipe::new(8).run(Feed(vec![raw.to_vec()]), &mut consumer).await;
        assert!(outcome.is_ok(), "{:?}", outcome.ending);
        consumer.into_handler()
    }

    #[tokio::test]
    async fn test_get_request_without_body() {
        let got = parse(
            MessageKind::Request,
            b"GET /.well-known/acme-challenge/tok HTTP/1.1\r\nHost: ftp.example.com\r\n\r\n",
        )
        .await;
        assert!(got.complete);
        assert_eq!(got.start, "GET /.well-known/acme-challenge/tok HTTP/1.1");
        assert_eq!(got.headers.get("host"), Some("ftp.example.com"));
        assert!(got.body.is_empty());
    }

    #[tokio::test]
    async fn test_response_with_content_length() {
        let got = parse(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert!(got.complete);
        assert_eq!(got.body, b"hello");
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let got = parse(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
        assert!(got.complete);
        assert_eq!(got.body, b"wikipedia");
    }

    #[tokio::test]
    async fn test_zero_chunk_terminates() {
        let got = parse(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .await;
        assert!(got.complete);
        assert!(got.body.is_empty());
    }

    #[tokio::test]
    async fn test_content_length_with_chunked_is_invalid() {
        let mut consumer =
            MessageConsumer::new(Capture::default(), MessageKind::Response, 8192);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let outcome = Pipe::new(8)
            .run(Feed(vec![raw.to_vec()]), &mut consumer)
            .await;
        assert!(matches!(outcome.ending, Ending::Failed(_)));
    }

    #[tokio::test]
    async fn test_unsupported_transfer_encoding() {
        let mut consumer =
            MessageConsumer::new(Capture::default(), MessageKind::Response, 8192);
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n";
        let outcome = Pipe::new(8)
            .run(Feed(vec![raw.to_vec()]), &mut consumer)
            .await;
        assert!(matches!(outcome.ending, Ending::Failed(_)));
    }

    #[tokio::test]
    async fn test_chunk_size_overflow_detected() {
        let mut consumer =
            MessageConsumer::new(Capture::default(), MessageKind::Response, 8192);
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffffff\r\n";
        let outcome = Pipe::new(8)
            .run(Feed(vec![raw.to_vec()]), &mut consumer)
            .await;
        assert!(matches!(outcome.ending, Ending::Failed(_)));
    }

    #[test]
    fn test_headers_fold_duplicates() {
        let mut h = Headers::new();
        h.insert("Accept", "text/html");
        h.insert("accept", "application/json");
        assert_eq!(h.get("ACCEPT"), Some("text/html, application/json"));
    }
}
