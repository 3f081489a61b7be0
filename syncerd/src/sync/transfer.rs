use std::io;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use md5::Context;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download stream failed: {0}")]
    Source(Box<dyn std::error::Error + Send + Sync>),
    #[error("download size mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

/// What the vendor promised about a download, checked after the body is drained.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedContent<'a> {
    pub len: Option<u64>,
    pub md5: Option<&'a str>,
}

/// Drains `body` into a sibling `.partial` file, syncs it, then renames it over
/// `target`. On any failure the partial file is removed and `target` is untouched.
pub async fn write_stream_atomically<S, B, E>(
    body: S,
    expected: ExpectedContent<'_>,
    target: &Path,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let result = match write_partial(body, expected, &partial).await {
        Ok(written) => tokio::fs::rename(&partial, target)
            .await
            .map(|()| written)
            .map_err(TransferError::from),
        Err(err) => Err(err),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

async fn write_partial<S, B, E>(
    mut body: S,
    expected: ExpectedContent<'_>,
    partial: &Path,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = tokio::fs::File::create(partial).await?;
    let mut md5 = expected.md5.map(|_| Context::new());
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| TransferError::Source(Box::new(err)))?;
        let chunk = chunk.as_ref();
        file.write_all(chunk).await?;
        written += chunk.len() as u64;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(chunk);
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected_len) = expected.len
        && expected_len != written
    {
        return Err(TransferError::LengthMismatch {
            expected: expected_len,
            actual: written,
        });
    }
    if let (Some(expected_md5), Some(ctx)) = (expected.md5, md5) {
        let actual_md5 = format!("{:x}", ctx.compute());
        if actual_md5 != expected_md5.to_ascii_lowercase() {
            return Err(TransferError::IntegrityMismatch {
                expected_md5: expected_md5.to_ascii_lowercase(),
                actual_md5,
            });
        }
    }
    Ok(written)
}

pub async fn read_local(path: &Path) -> Result<Vec<u8>, TransferError> {
    Ok(tokio::fs::read(path).await?)
}

/// Lowercase hex MD5, the form Drive reports as `md5Checksum`.
pub fn content_md5(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

pub async fn local_md5(path: &Path) -> Result<String, TransferError> {
    Ok(content_md5(&read_local(path).await?))
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}
