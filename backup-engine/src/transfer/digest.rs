//! Byte-counting, hashing stream wrappers.
//!
//! Backups hash file bytes on their way into the transform; restores hash
//! them on their way out, so both sides see the original bytes.

use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Size and SHA-256 of everything that passed through a wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    pub size: u64,
    pub hash: String,
}

#[derive(Default)]
struct Tally {
    bytes: u64,
    hasher: Sha256,
}

impl Tally {
    fn update(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.hasher.update(chunk);
    }

    fn finish(self) -> StreamDigest {
        StreamDigest {
            size: self.bytes,
            hash: format!("{:x}", self.hasher.finalize()),
        }
    }
}

/// Reader wrapper that tallies bytes read
pub struct DigestReader<R> {
    inner: R,
    tally: Tally,
}

impl<R: AsyncRead + Unpin> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            tally: Tally::default(),
        }
    }

    pub fn finish(self) -> StreamDigest {
        self.tally.finish()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.tally.update(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Writer wrapper that tallies bytes written
pub struct DigestWriter<W> {
    inner: W,
    tally: Tally,
}

impl<W: AsyncWrite + Unpin> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            tally: Tally::default(),
        }
    }

    pub fn finish(self) -> StreamDigest {
        self.tally.finish()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.tally.update(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reader_and_writer_agree() {
        let data = b"select count(*) from vt_insert_test".repeat(50);

        let mut reader = DigestReader::new(data.as_slice());
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        let read = reader.finish();

        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(&data).await.unwrap();
        writer.shutdown().await.unwrap();
        let written = writer.finish();

        assert_eq!(read, written);
        assert_eq!(read.size, data.len() as u64);
        assert_eq!(read.hash, sha256_hex(&data));
    }

    #[test]
    fn test_empty_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
