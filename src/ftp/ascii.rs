//! TYPE A translation layer over a data stream
//!
//! On read, `CRLF` becomes `LF` and a lone `CR` passes through, including a
//! `CR` immediately before EOF. On write, every `LF` not already preceded
//! by `CR` gains one. Writes convert at most 128 KiB per call so a short
//! write on the underlying stream wastes only a bounded amount of
//! conversion work.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Cap on bytes converted per write call
pub const WRITE_CAP: usize = 128 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// ASCII-mode socket layer wrapping any stream
pub struct AsciiLayer<S> {
    inner: S,

    // Read side: transformed bytes waiting to be handed out, plus a CR seen
    // at the end of a chunk whose fate depends on the next byte.
    out_buf: Vec<u8>,
    out_pos: usize,
    pending_cr: bool,
    scratch: Box<[u8]>,

    // Write side: converted bytes not yet accepted by the inner stream.
    wbuf: Vec<u8>,
    wpos: usize,
    last_written: u8,
}

impl<S> AsciiLayer<S> {
    /// Wrap a stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            out_buf: Vec::new(),
            out_pos: 0,
            pending_cr: false,
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
            wbuf: Vec::new(),
            wpos: 0,
            last_written: 0,
        }
    }

    fn transform_read(&mut self, n: usize) {
        for i in 0..n {
            let b = self.scratch[i];
            if self.pending_cr {
                if b == b'\n' {
                    self.out_buf.push(b'\n');
                    self.pending_cr = false;
                } else {
                    self.out_buf.push(b'\r');
                    if b == b'\r' {
                        // Still holding a CR; its fate depends on the next byte.
                    } else {
                        self.out_buf.push(b);
                        self.pending_cr = false;
                    }
                }
            } else if b == b'\r' {
                self.pending_cr = true;
            } else {
                self.out_buf.push(b);
            }
        }
    }

    fn serve_out(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        let available = &self.out_buf[self.out_pos..];
        if available.is_empty() {
            return false;
        }
        let take = available.len().min(buf.remaining());
        buf.put_slice(&available[..take]);
        self.out_pos += take;
        if self.out_pos == self.out_buf.len() {
            self.out_buf.clear();
            self.out_pos = 0;
        }
        true
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AsciiLayer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.serve_out(buf) {
                return Poll::Ready(Ok(()));
            }

            let mut scratch_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch_buf))?;
            let n = scratch_buf.filled().len();

            if n == 0 {
                // EOF; a held CR is emitted verbatim.
                if this.pending_cr {
                    this.pending_cr = false;
                    this.out_buf.push(b'\r');
                    continue;
                }
                return Poll::Ready(Ok(()));
            }

            this.transform_read(n);
            // A chunk ending exactly in CR can produce zero output; read on
            // rather than signalling a bogus EOF.
        }
    }
}

impl<S: AsyncWrite + Unpin> AsciiLayer<S> {
    fn flush_wbuf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wpos < self.wbuf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf[self.wpos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                )));
            }
            self.wpos += n;
        }
        self.wbuf.clear();
        self.wpos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AsciiLayer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Converted bytes from the previous call must land first; until
        // they do, no new caller bytes are accepted.
        if !this.wbuf.is_empty() {
            ready!(this.flush_wbuf(cx))?;
        }

        let take = buf.len().min(WRITE_CAP);
        if take == 0 {
            return Poll::Ready(Ok(0));
        }
        for &b in &buf[..take] {
            if b == b'\n' && this.last_written != b'\r' {
                this.wbuf.push(b'\r');
            }
            this.wbuf.push(b);
            this.last_written = b;
        }

        // Opportunistic flush; leftovers stay buffered and are accepted
        // work as far as the caller is concerned.
        match this.flush_wbuf(cx) {
            Poll::Ready(Ok(())) | Poll::Pending => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.flush_wbuf(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.flush_wbuf(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_through(input: &[u8]) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (_r, mut w) = tokio::io::split(client);
        w.write_all(input).await.expect("write");
        w.shutdown().await.expect("shutdown");

        let mut layer = AsciiLayer::new(server);
        let mut out = Vec::new();
        layer.read_to_end(&mut out).await.expect("read");
        out
    }

    async fn write_through(input: &[u8]) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut layer = AsciiLayer::new(server);
        layer.write_all(input).await.expect("write");
        layer.flush().await.expect("flush");
        layer.shutdown().await.expect("shutdown");
        drop(layer);

        let (mut r, _w) = tokio::io::split(client);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.expect("read");
        out
    }

    #[tokio::test]
    async fn test_read_crlf_to_lf() {
        assert_eq!(read_through(b"line one\r\nline two\r\n").await, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn test_read_preserves_lone_cr() {
        assert_eq!(read_through(b"a\rb").await, b"a\rb");
        assert_eq!(read_through(b"a\r\rb").await, b"a\r\rb");
    }

    #[tokio::test]
    async fn test_read_cr_at_eof_is_emitted() {
        assert_eq!(read_through(b"ends with cr\r").await, b"ends with cr\r");
    }

    #[tokio::test]
    async fn test_read_crlf_split_handling() {
        // CR and LF in separate chunks collapse to one LF; the duplex
        // stream may or may not coalesce, the layer must not care.
        assert_eq!(read_through(b"x\r\ny").await, b"x\ny");
    }

    #[tokio::test]
    async fn test_write_adds_cr() {
        assert_eq!(write_through(b"one\ntwo\n").await, b"one\r\ntwo\r\n");
    }

    #[tokio::test]
    async fn test_write_keeps_existing_crlf() {
        assert_eq!(write_through(b"pre\r\nconverted\r\n").await, b"pre\r\nconverted\r\n");
    }

    #[tokio::test]
    async fn test_write_cr_memory_across_calls() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut layer = AsciiLayer::new(server);
        layer.write_all(b"ends in cr\r").await.expect("write");
        layer.write_all(b"\nmore\n").await.expect("write");
        layer.shutdown().await.expect("shutdown");
        drop(layer);

        let (mut r, _w) = tokio::io::split(client);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"ends in cr\r\nmore\r\n");
    }

    #[tokio::test]
    async fn test_round_trip_law() {
        // For input without lone CR: write(read(s)) == s.
        let original = b"mixed\r\ncontent\r\nwith lines\r\n";
        let read_back = read_through(original).await;
        assert_eq!(write_through(&read_back).await, original);
    }
}
