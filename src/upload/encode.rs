//! Base64 transport encoding of upload content.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{Content, UploadCandidate};

/// Floor on the read timeout.
const MIN_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("timed out reading \"{name}\" after {}s; the file may be too large", .after.as_secs())]
    Timeout { name: String, after: Duration },
    #[error("failed to read \"{name}\": {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("\"{name}\" grew past the {limit}-byte upload limit after it was selected")]
    Oversize { name: String, limit: u64 },
    #[error("encoder task for \"{name}\" failed: {reason}")]
    Worker { name: String, reason: String },
}

impl EncodeError {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Timeout { name, .. }
            | Self::Io { name, .. }
            | Self::Oversize { name, .. }
            | Self::Worker { name, .. } => name,
        }
    }
}

/// Base64 payload plus the number of raw bytes it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub data: String,
    pub len: u64,
}

/// `max(30s, size / 1024 ms)`: about one millisecond per kilobyte, never
/// less than thirty seconds.
pub fn read_timeout(size: u64) -> Duration {
    MIN_READ_TIMEOUT.max(Duration::from_millis(size / 1024))
}

/// Read the candidate's bytes and return them base64-encoded.
///
/// At most `max_bytes` are accepted: the size recorded at selection time may
/// be stale, so the read itself stops one byte past the cap and a file that
/// grew beyond it fails with [`EncodeError::Oversize`].  The read is bounded
/// by [`read_timeout`].  The file handle lives only inside the read future,
/// so it is closed on success, error and timeout alike.
pub async fn encode(candidate: &UploadCandidate, max_bytes: u64) -> Result<Encoded, EncodeError> {
    let limit = read_timeout(candidate.size);
    let bytes = match &candidate.content {
        Content::Bytes(bytes) => bytes.to_vec(),
        Content::File(path) => read_file(&candidate.name, path, candidate.size, max_bytes, limit).await?,
    };
    let len = bytes.len() as u64;
    if len > max_bytes {
        return Err(EncodeError::Oversize {
            name: candidate.name.clone(),
            limit: max_bytes,
        });
    }
    debug!(name = %candidate.name, bytes = len, "read upload content");
    let data = encode_bytes(&candidate.name, bytes).await?;
    Ok(Encoded { data, len })
}

async fn read_file(
    name: &str,
    path: &Path,
    size_hint: u64,
    max_bytes: u64,
    limit: Duration,
) -> Result<Vec<u8>, EncodeError> {
    bounded(name, limit, async {
        let file = tokio::fs::File::open(path).await?;
        read_all(file.take(max_bytes.saturating_add(1)), size_hint.min(max_bytes)).await
    })
    .await
}

/// Run a read to completion within `limit`.  Dropping the future on timeout
/// drops whatever handle it owns.
async fn bounded<F>(name: &str, limit: Duration, read: F) -> Result<Vec<u8>, EncodeError>
where
    F: Future<Output = std::io::Result<Vec<u8>>>,
{
    match tokio::time::timeout(limit, read).await {
        Ok(result) => result.map_err(|source| EncodeError::Io {
            name: name.to_string(),
            source,
        }),
        Err(_) => Err(EncodeError::Timeout {
            name: name.to_string(),
            after: limit,
        }),
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R, size_hint: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(usize::try_from(size_hint).unwrap_or(0));
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Base64 on the blocking pool; a 100 MB file is ~133 MB of output.
async fn encode_bytes(name: &str, bytes: Vec<u8>) -> Result<String, EncodeError> {
    tokio::task::spawn_blocking(move || base64::engine::general_purpose::STANDARD.encode(bytes))
        .await
        .map_err(|e| EncodeError::Worker {
            name: name.to_string(),
            reason: e.to_string(),
        })
}
