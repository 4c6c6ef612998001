//! Built-in zstd stage, run after the transform unless the backup records
//! `SkipCompress`.

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

#[derive(Debug, Clone, Copy)]
pub struct Compression {
    level: i32,
}

impl Compression {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Compressing sink. Shutting it down finishes the frame and shuts down `inner`.
    pub fn encoder<W: AsyncWrite>(&self, inner: W) -> ZstdEncoder<W> {
        ZstdEncoder::with_quality(inner, Level::Precise(self.level))
    }

    pub fn decoder<R: AsyncRead>(&self, inner: R) -> ZstdDecoder<BufReader<R>> {
        ZstdDecoder::new(BufReader::new(inner))
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_zstd_stage_roundtrip() {
        let data = b"0123456789".repeat(1000);
        let compression = Compression::default();

        let mut encoder = compression.encoder(Vec::new());
        encoder.write_all(&data).await.unwrap();
        encoder.shutdown().await.unwrap();
        let stored = encoder.into_inner();
        assert!(stored.len() < data.len());

        let mut decoder = compression.decoder(stored.as_slice());
        let mut restored = Vec::new();
        decoder.read_to_end(&mut restored).await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_corrupt_input_fails() {
        let mut decoder = Compression::default().decoder(&b"definitely not zstd"[..]);
        let mut out = Vec::new();
        assert!(decoder.read_to_end(&mut out).await.is_err());
    }
}
