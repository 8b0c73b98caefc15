//! Turning a batch of local files into a single commit.
//!
//! - [`classify`] decides whether a file may be uploaded at all.
//! - [`encode`] reads a file and produces the base64 payload for blob creation.
//! - [`commit`] drives the blob → tree → commit → ref pipeline.

pub mod classify;
pub mod commit;
pub mod encode;

use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Where a candidate's bytes come from.
#[derive(Debug, Clone)]
pub enum Content {
    /// A file on local disk, read when the candidate is encoded.
    File(PathBuf),
    /// Bytes already in memory (e.g. a multipart upload).
    Bytes(Bytes),
}

/// A file selected for upload, not yet validated.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    /// Name of the file inside the destination directory.
    pub name: String,
    /// Length in bytes at selection time.
    pub size: u64,
    pub content: Content,
}

impl UploadCandidate {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            content: Content::Bytes(bytes),
        }
    }

    /// Stat a local file.  The name is the path's final component.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        use std::io::{Error, ErrorKind};

        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} has no UTF-8 file name", path.display()),
                )
            })?
            .to_string();

        Ok(Self {
            name,
            size: meta.len(),
            content: Content::File(path.to_path_buf()),
        })
    }

    /// Override the name used in the repository.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
