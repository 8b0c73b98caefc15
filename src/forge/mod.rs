//! Forge backend abstraction layer.
//!
//! Provides the [`ForgeBackend`] trait that encapsulates every call the
//! browser and the commit pipeline make against the hosting API.  Callers
//! dispatch through this trait so that no forge-specific URL construction or
//! response parsing leaks outside this module.

pub mod github;
#[cfg(test)]
pub mod memory;
pub mod rate_limit;

use serde::{Deserialize, Serialize};

use crate::config::{BackendType, Config};
use crate::metrics::MetricsRegistry;
use crate::session::Session;

/// Hex object id as returned by the host (blob, tree or commit).
pub type ObjectId = String;

/// Git file mode for a regular, non-executable file.
pub const REGULAR_FILE_MODE: &str = "100644";

// ---------------------------------------------------------------------------
// Wire-level types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Submodule,
}

/// One row of a directory listing.  Listings are snapshots: a later listing
/// replaces the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub size: u64,
    pub sha: ObjectId,
}

impl DirectoryEntry {
    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Dir
    }
}

/// A new entry for `create_tree`: always a blob at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: &'static str,
    pub sha: ObjectId,
}

/// Raw bytes of a single file at some ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub name: String,
    pub path: String,
    pub sha: ObjectId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub private: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed call against the hosting API, classified by status where one was
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("authentication required: {0}")]
    Unauthorized(String),
    /// The host refused a ref update because the branch moved.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected upstream response: {0}")]
    Decode(String),
}

impl ForgeError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            _ => Self::Status { status, message },
        }
    }

    /// The HTTP status this error corresponds to, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::Conflict(_) => Some(409),
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the hosting API's repository contents and git data
/// endpoints.
#[async_trait::async_trait]
pub trait ForgeBackend: Send + Sync {
    /// Commit id the branch currently points at.  `NotFound` if the branch
    /// does not exist.
    async fn resolve_branch_tip(&self, owner: &str, repo: &str, branch: &str) -> ForgeResult<ObjectId>;

    /// Root tree id of a commit.
    async fn get_commit_tree(&self, owner: &str, repo: &str, commit: &str) -> ForgeResult<ObjectId>;

    /// Create a blob from base64 content and return its id.
    async fn create_blob(&self, owner: &str, repo: &str, encoded: &str) -> ForgeResult<ObjectId>;

    /// Create a tree layered over `base_tree` with `entries` added or replaced.
    async fn create_tree(
        &self,
        owner: &str,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> ForgeResult<ObjectId>;

    /// Create a commit object.
    async fn create_commit(
        &self,
        owner: &str,
        repo: &str,
        message: &str,
        tree: &str,
        parents: &[ObjectId],
    ) -> ForgeResult<ObjectId>;

    /// Move `branch` to `commit`.  With `force == false` the host rejects a
    /// non-fast-forward move.
    async fn update_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        commit: &str,
        force: bool,
    ) -> ForgeResult<()>;

    /// Entries of the directory at `path` (root when empty) on `branch`.
    async fn list_directory(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> ForgeResult<Vec<DirectoryEntry>>;

    /// Names of every branch in the repository.
    async fn list_branches(&self, owner: &str, repo: &str) -> ForgeResult<Vec<String>>;

    /// Raw content of the file at `path` on `branch`.
    async fn get_file(&self, owner: &str, repo: &str, path: &str, branch: &str) -> ForgeResult<FileContent>;

    /// The user the session token belongs to.
    async fn authenticated_user(&self) -> ForgeResult<User>;

    /// Repositories visible to the authenticated user, most recently updated
    /// first.
    async fn list_repositories(&self) -> ForgeResult<Vec<Repository>>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the [`ForgeBackend`] for the configured backend type, authenticated
/// with `session`.
pub fn build_backend(
    config: &Config,
    session: &Session,
    metrics: &MetricsRegistry,
) -> anyhow::Result<Box<dyn ForgeBackend>> {
    match config.backend_type {
        BackendType::Github | BackendType::GithubEnterprise => Ok(Box::new(
            github::GitHubBackend::new(config, session, metrics.clone())?,
        )),
    }
}
