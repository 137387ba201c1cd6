//! File endpoints: stream a file into a pipe, or a pipe into a file

use crate::pipeline::{Drive, DriveResult, LockingBuffer, Sink, Source};
use async_trait::async_trait;
use std::io;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const CHUNK: usize = 64 * 1024;

/// Pipe source streaming a file's contents in bounded chunks
pub struct FileReader {
    file: File,
    scratch: Vec<u8>,
}

impl FileReader {
    /// Wrap an open file, reading from its current position
    pub fn new(file: File) -> Self {
        Self {
            file,
            scratch: vec![0; CHUNK],
        }
    }

    /// Wrap an open file positioned at `offset` (a resumed download)
    pub async fn with_offset(mut file: File, offset: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl Source for FileReader {
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        let read = self.file.read(&mut self.scratch).await?;
        if read == 0 {
            return Ok(Drive::EndOfData);
        }
        buf.lock().append(&self.scratch[..read]);
        Ok(Drive::Progress)
    }
}

/// Pipe sink writing the buffer into a file
pub struct FileWriter {
    file: File,
    scratch: Vec<u8>,
}

impl FileWriter {
    /// Wrap an open file, writing at its current position
    pub fn new(file: File) -> Self {
        Self {
            file,
            scratch: Vec::new(),
        }
    }

    /// Wrap an open file positioned at `offset` (a resumed upload)
    pub async fn with_offset(mut file: File, offset: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl Sink for FileWriter {
    async fn drain(&mut self, buf: &LockingBuffer) -> DriveResult {
        self.scratch.clear();
        {
            let b = buf.lock();
            let chunk = b.as_slice();
            if chunk.is_empty() {
                return Ok(Drive::Progress);
            }
            let take = chunk.len().min(CHUNK);
            self.scratch.extend_from_slice(&chunk[..take]);
        }

        self.file.write_all(&self.scratch).await?;
        buf.lock().consume(self.scratch.len());
        Ok(Drive::Progress)
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipe::{Ending, Pipe};
    use crate::pipeline::socket::SocketWriter;

    #[tokio::test]
    async fn test_file_to_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, b"file payload").await.expect("write fixture");

        let file = File::open(&path).await.expect("open");
        let (client, server) = tokio::io::duplex(1024);
        let (_rh, wh) = tokio::io::split(server);

        let run = tokio::spawn(Pipe::new(8).run(FileReader::new(file), SocketWriter::new(wh)));

        let mut received = Vec::new();
        let (mut crh, _cwh) = tokio::io::split(client);
        crh.read_to_end(&mut received).await.expect("read");
        let outcome = run.await.expect("pipe task");

        assert!(matches!(outcome.ending, Ending::Eof));
        assert_eq!(received, b"file payload");
    }

    #[tokio::test]
    async fn test_offset_read_skips_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rest.bin");
        tokio::fs::write(&path, b"0123456789").await.expect("write fixture");

        let file = File::open(&path).await.expect("open");
        let mut reader = FileReader::with_offset(file, 6).await.expect("seek");
        let buf = LockingBuffer::new();
        assert_eq!(reader.fill(&buf).await.expect("fill"), Drive::Progress);
        assert_eq!(buf.lock().as_slice(), b"6789");
        assert_eq!(reader.fill(&buf).await.expect("fill"), Drive::EndOfData);
    }

    #[tokio::test]
    async fn test_stream_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload.bin");
        let file = File::create(&path).await.expect("create");

        struct Feed(Option<Vec<u8>>);

        #[async_trait]
        impl Source for Feed {
            async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
                match self.0.take() {
                    Some(d) => {
                        buf.lock().append(&d);
                        Ok(Drive::Progress)
                    }
                    None => Ok(Drive::EndOfData),
                }
            }
        }

        let outcome = Pipe::new(8)
            .run(Feed(Some(b"stored bytes".to_vec())), FileWriter::new(file))
            .await;
        assert!(matches!(outcome.ending, Ending::Eof));

        let on_disk = tokio::fs::read(&path).await.expect("read back");
        assert_eq!(on_disk, b"stored bytes");
    }
}
