//! Transform pipeline.
//!
//! Every file goes through one transform (an external hook, or a no-op when
//! no hook is configured) and then, unless the backup skips it, the
//! built-in zstd stage. Backups run the stages in order; restores run the
//! inverse stages in reverse order:
//!
//! ```text
//! encode: file -> transform(encode) -> [zstd compress]   -> slot
//! decode: slot -> [zstd decompress] -> transform(decode) -> file
//! ```

pub mod compression;
pub mod hook;

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub use compression::Compression;
pub use hook::{ExternalHook, HookDirectory};

pub type Input<'a> = &'a mut (dyn AsyncRead + Send + Unpin);
pub type Output<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Which way bytes flow through a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Backup: raw file bytes in, stored bytes out
    Encode,
    /// Restore: stored bytes in, raw file bytes out
    Decode,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Encode => "encode",
            Direction::Decode => "decode",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the file a transform is working on.
#[derive(Debug, Clone)]
pub struct FileContext {
    pub node_alias: String,
    pub backup_name: String,
    pub file_name: String,
}

/// A byte-stream filter that can be applied in either direction.
///
/// Implementations read `input` to EOF and write the transformed bytes to
/// `output`. Any error means the bytes already written to `output` are
/// garbage and must be discarded by the caller.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Name recorded in the MANIFEST ("" for the no-op transform).
    fn name(&self) -> &str;

    async fn filter(
        &self,
        direction: Direction,
        ctx: &FileContext,
        input: Input<'_>,
        output: Output<'_>,
    ) -> Result<()>;

    async fn encode(&self, ctx: &FileContext, input: Input<'_>, output: Output<'_>) -> Result<()> {
        self.filter(Direction::Encode, ctx, input, output).await
    }

    async fn decode(&self, ctx: &FileContext, input: Input<'_>, output: Output<'_>) -> Result<()> {
        self.filter(Direction::Decode, ctx, input, output).await
    }
}

/// The transform used when no hook is configured.
pub struct Passthrough;

#[async_trait]
impl Transform for Passthrough {
    fn name(&self) -> &str {
        ""
    }

    async fn filter(
        &self,
        _direction: Direction,
        _ctx: &FileContext,
        input: Input<'_>,
        output: Output<'_>,
    ) -> Result<()> {
        tokio::io::copy(input, output).await?;
        Ok(())
    }
}

/// Maps a hook name (as configured, or as read from a MANIFEST) to a transform.
pub trait TransformResolver: Send + Sync {
    fn resolve(&self, hook: &str) -> Result<Arc<dyn Transform>>;
}

/// Resolve `hook`, treating the empty name as the no-op transform.
pub fn resolve_transform(resolver: &dyn TransformResolver, hook: &str) -> Result<Arc<dyn Transform>> {
    if hook.is_empty() {
        Ok(Arc::new(Passthrough))
    } else {
        resolver.resolve(hook)
    }
}

/// The stages applied to one backup's files.
#[derive(Clone)]
pub struct Pipeline {
    transform: Arc<dyn Transform>,
    compression: Option<Compression>,
}

impl Pipeline {
    pub fn new(transform: Arc<dyn Transform>, compression: Option<Compression>) -> Self {
        Self {
            transform,
            compression,
        }
    }

    pub fn hook_name(&self) -> &str {
        self.transform.name()
    }

    /// True when the built-in compression stage is bypassed.
    pub fn skip_compress(&self) -> bool {
        self.compression.is_none()
    }

    /// Run raw file bytes from `input` into the slot sink `output`, then
    /// shut `output` down.
    pub async fn encode(&self, ctx: &FileContext, input: Input<'_>, output: Output<'_>) -> Result<()> {
        match &self.compression {
            Some(compression) => {
                let mut encoder = compression.encoder(output);
                self.transform.encode(ctx, input, &mut encoder).await?;
                encoder.shutdown().await?;
            }
            None => {
                self.transform.encode(ctx, input, output).await?;
                output.shutdown().await?;
            }
        }
        Ok(())
    }

    /// Run slot bytes from `input` back into raw file bytes on `output`,
    /// then shut `output` down.
    pub async fn decode(&self, ctx: &FileContext, input: Input<'_>, output: Output<'_>) -> Result<()> {
        match &self.compression {
            Some(compression) => {
                let mut decoder = compression.decoder(input);
                self.transform.decode(ctx, &mut decoder, output).await?;
            }
            None => {
                self.transform.decode(ctx, input, output).await?;
            }
        }
        output.shutdown().await?;
        Ok(())
    }
}
