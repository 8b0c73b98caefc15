//! Repository browsing state: which repository, which branch, which
//! directory, and what that directory contains.
//!
//! Every load clears the current listing first, fetches the directory, then
//! refreshes the branch list.  Branch and path only change once the listing
//! succeeds, and always together with it, so the selection names what is on
//! screen.  A failed branch-list refresh keeps the previous branch list.

use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::forge::{DirectoryEntry, EntryType, ForgeBackend, ForgeError, Repository};
use crate::path;
use crate::reconcile::{Reconciled, Reconciler};
use crate::upload::commit::{CommitBuilder, CommitError, CommitOutcome, CommitTarget};
use crate::upload::UploadCandidate;

/// Extensions previewed as images.
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
];

#[derive(Debug, thiserror::Error)]
pub enum BrowseError {
    #[error("no repository selected")]
    NoRepository,
    #[error("unknown branch \"{0}\"")]
    UnknownBranch(String),
    #[error("path not found in repository: \"{0}\"")]
    PathNotFound(String),
    #[error("access denied - check repository permissions")]
    AccessDenied,
    #[error("authentication required: {0}")]
    Unauthorized(String),
    #[error("failed to load repository contents: {0}")]
    Failed(String),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl BrowseError {
    fn from_forge(err: ForgeError, path: &str) -> Self {
        match err {
            ForgeError::NotFound(_) => Self::PathNotFound(path.to_string()),
            ForgeError::Forbidden(_) => Self::AccessDenied,
            ForgeError::Unauthorized(msg) => Self::Unauthorized(msg),
            other => Self::Failed(other.to_string()),
        }
    }
}

/// How a file is shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Preview {
    Text { text: String },
    /// Base64 body, ready for a `data:` URL.
    Image { media_type: &'static str, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePreview {
    pub name: String,
    pub path: String,
    pub sha: String,
    pub size: u64,
    #[serde(flatten)]
    pub preview: Preview,
}

/// Media type for names with an image extension, case-insensitively.
pub fn image_media_type(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    IMAGE_TYPES
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, media_type)| *media_type)
}

fn preview(name: &str, bytes: Vec<u8>) -> Preview {
    match image_media_type(name) {
        Some(media_type) => Preview::Image {
            media_type,
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        },
        None => Preview::Text {
            text: String::from_utf8_lossy(&bytes).into_owned(),
        },
    }
}

/// What following an entry produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// The browser now shows the directory.
    Directory,
    File(FilePreview),
}

/// Result of committing from the browser.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub outcome: CommitOutcome,
    /// Whether the listing was refreshed after the commit.
    pub refreshed: bool,
}

pub struct Browser {
    forge: Arc<dyn ForgeBackend>,
    repository: Option<Repository>,
    branches: Vec<String>,
    branch: String,
    path: String,
    contents: Vec<DirectoryEntry>,
}

impl Browser {
    pub fn new(forge: Arc<dyn ForgeBackend>) -> Self {
        Self {
            forge,
            repository: None,
            branches: Vec::new(),
            branch: String::new(),
            path: String::new(),
            contents: Vec::new(),
        }
    }

    pub fn repository(&self) -> Option<&Repository> {
        self.repository.as_ref()
    }

    pub fn branches(&self) -> &[String] {
        &self.branches
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn contents(&self) -> &[DirectoryEntry] {
        &self.contents
    }

    pub fn breadcrumbs(&self) -> Vec<path::Crumb> {
        path::breadcrumbs(&self.path)
    }

    /// Repositories of the authenticated user, most recently updated first.
    pub async fn repositories(&self) -> Result<Vec<Repository>, BrowseError> {
        self.forge
            .list_repositories()
            .await
            .map_err(|e| BrowseError::Failed(e.to_string()))
    }

    /// Make `repository` active and show its root on the default branch.
    #[instrument(skip_all, fields(repo = %repository.full_name))]
    pub async fn select_repository(&mut self, repository: Repository) -> Result<(), BrowseError> {
        let branch = repository.default_branch.clone();
        self.repository = Some(repository);
        self.branches.clear();
        self.path.clear();
        self.load("", &branch).await
    }

    /// Show the current path on `branch`.  The branch must be in the last
    /// fetched branch list.
    pub async fn select_branch(&mut self, branch: &str) -> Result<(), BrowseError> {
        if !self.branches.iter().any(|b| b == branch) {
            return Err(BrowseError::UnknownBranch(branch.to_string()));
        }
        let path = self.path.clone();
        self.load(&path, branch).await
    }

    /// Show `path` on the current branch.
    pub async fn open(&mut self, path: &str) -> Result<(), BrowseError> {
        let branch = self.branch.clone();
        self.load(path, &branch).await
    }

    /// Show the parent of the current directory.  No-op at the root.
    pub async fn up(&mut self) -> Result<(), BrowseError> {
        match path::parent(&self.path) {
            Some(parent) => self.open(&parent).await,
            None => Ok(()),
        }
    }

    pub async fn refresh(&mut self) -> Result<(), BrowseError> {
        let path = self.path.clone();
        self.open(&path).await
    }

    /// Follow an entry: directories are opened, anything else is fetched and
    /// previewed.
    pub async fn navigate(&mut self, entry: &DirectoryEntry) -> Result<Navigation, BrowseError> {
        match entry.entry_type {
            EntryType::Dir => {
                self.open(&entry.path).await?;
                Ok(Navigation::Directory)
            }
            EntryType::File | EntryType::Symlink | EntryType::Submodule => {
                self.preview_file(&entry.path).await.map(Navigation::File)
            }
        }
    }

    /// Raw content of the file at `path` on the current branch.
    pub async fn preview_file(&self, path: &str) -> Result<FilePreview, BrowseError> {
        let repo = self.repository.as_ref().ok_or(BrowseError::NoRepository)?;
        let path = path::normalize(Some(path));
        let file = self
            .forge
            .get_file(&repo.owner, &repo.name, &path, &self.branch)
            .await
            .map_err(|e| BrowseError::from_forge(e, &path))?;
        debug!(path = %file.path, bytes = file.bytes.len(), "fetched file");

        let size = file.bytes.len() as u64;
        Ok(FilePreview {
            preview: preview(&file.name, file.bytes),
            name: file.name,
            path: file.path,
            sha: file.sha,
            size,
        })
    }

    /// Commit `files` into the current directory, then refresh the listing.
    ///
    /// A listing that cannot be refreshed is left as it was; the commit
    /// still counts as done.
    #[instrument(skip_all, fields(path = %self.path, files = files.len()))]
    pub async fn upload(
        &mut self,
        builder: &CommitBuilder,
        reconciler: &Reconciler,
        files: Vec<UploadCandidate>,
        message: &str,
    ) -> Result<UploadReport, BrowseError> {
        let repo = self.repository.as_ref().ok_or(BrowseError::NoRepository)?;
        let target = CommitTarget::new(&repo.owner, &repo.name, &self.branch, &self.path);
        let outcome = builder.commit(files, message, &target).await?;

        let forge = self.forge.clone();
        let fetch = || forge.list_directory(&target.owner, &target.repo, &target.path, &target.branch);
        let refreshed = match reconciler.reconcile(fetch).await {
            Reconciled::Fresh { value, attempt } => {
                debug!(attempt, entries = value.len(), "listing refreshed");
                self.contents = value;
                true
            }
            Reconciled::Stale => false,
        };

        Ok(UploadReport { outcome, refreshed })
    }

    async fn load(&mut self, path: &str, branch: &str) -> Result<(), BrowseError> {
        let repo = self.repository.as_ref().ok_or(BrowseError::NoRepository)?;
        let (owner, name) = (repo.owner.clone(), repo.name.clone());
        let path = path::normalize(Some(path));

        self.contents.clear();
        let entries = match self.forge.list_directory(&owner, &name, &path, branch).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%path, %branch, error = %e, "failed to load repository contents");
                return Err(BrowseError::from_forge(e, &path));
            }
        };
        info!(%path, %branch, entries = entries.len(), "loaded directory");
        self.contents = entries;
        self.path = path;
        self.branch = branch.to_string();

        self.branches = self
            .forge
            .list_branches(&owner, &name)
            .await
            .map_err(|e| BrowseError::Failed(e.to_string()))?;
        Ok(())
    }
}
