//! The commit pipeline.
//!
//! One attempt walks a fixed chain of remote calls:
//!
//! ```text
//! Idle → FetchingRef → FetchingBaseTree → EncodingBlobs(1..=N)
//!      → CreatingTree → CreatingCommit → UpdatingRef → Succeeded
//! ```
//!
//! Any step may end the attempt in `Failed`.  The branch ref is only touched
//! in the last step, so a failure anywhere earlier leaves the remote branch
//! exactly as it was.  Blobs, trees and commits created before the failure
//! are left behind unreferenced; the host garbage-collects them.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::config::{RefUpdateMode, UploadConfig};
use crate::forge::{ForgeBackend, ForgeError, ObjectId, TreeEntry, REGULAR_FILE_MODE};
use crate::metrics::{MetricsRegistry, Outcome};
use crate::path;

use super::classify::{FileClassifier, Violation};
use super::encode::{self, EncodeError};
use super::UploadCandidate;

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Idle,
    FetchingRef,
    FetchingBaseTree,
    /// Encoding and uploading file `file` (1-based) of `total`.
    EncodingBlobs { file: usize, total: usize },
    CreatingTree,
    CreatingCommit,
    UpdatingRef,
    Succeeded,
    Failed,
}

impl CommitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::FetchingRef => f.write_str("fetching branch ref"),
            Self::FetchingBaseTree => f.write_str("fetching base tree"),
            Self::EncodingBlobs { file, total } => write!(f, "uploading file {file} of {total}"),
            Self::CreatingTree => f.write_str("creating tree"),
            Self::CreatingCommit => f.write_str("creating commit"),
            Self::UpdatingRef => f.write_str("updating branch ref"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// What a subscriber sees while an attempt runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitEvent {
    State { state: CommitState },
    /// Percentage in `[0, 100]`.  Non-decreasing within an attempt except for
    /// the reset to 0 at start and end.
    Progress { percent: f64 },
}

/// Latest state and progress, folded from the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub state: CommitState,
    pub percent: f64,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            state: CommitState::Idle,
            percent: 0.0,
        }
    }
}

impl ProgressSnapshot {
    pub fn apply(&mut self, event: &CommitEvent) {
        match event {
            CommitEvent::State { state } => self.state = *state,
            CommitEvent::Progress { percent } => self.percent = *percent,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Input refused before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("commit message must not be empty")]
    EmptyMessage,
    #[error("no files selected for upload")]
    EmptyBatch,
    #[error("{0}")]
    Rejected(Violation),
    #[error("\"{0}\" appears more than once in the upload")]
    DuplicatePath(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Reading local content failed.
    #[error("{state} failed: {source}")]
    Transport {
        state: CommitState,
        #[source]
        source: EncodeError,
    },
    /// A remote call failed.
    #[error("{state} failed{}: {source}", for_file(.file))]
    Remote {
        state: CommitState,
        file: Option<String>,
        #[source]
        source: ForgeError,
    },
}

fn for_file(file: &Option<String>) -> String {
    file.as_ref()
        .map(|name| format!(" for \"{name}\""))
        .unwrap_or_default()
}

impl CommitError {
    /// State the attempt was in when it failed.  Validation happens before
    /// the first transition.
    pub fn state(&self) -> CommitState {
        match self {
            Self::Validation(_) => CommitState::Idle,
            Self::Transport { state, .. } | Self::Remote { state, .. } => *state,
        }
    }

    pub fn forge_error(&self) -> Option<&ForgeError> {
        match self {
            Self::Remote { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The branch moved and the ref update was refused.
    pub fn is_conflict(&self) -> bool {
        matches!(self.forge_error(), Some(ForgeError::Conflict(_)))
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Where the batch lands: a directory on a branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTarget {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Normalized destination directory; empty is the repository root.
    pub path: String,
}

impl CommitTarget {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        path: &str,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            path: path::normalize(Some(path)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedBlob {
    pub path: String,
    pub sha: ObjectId,
    pub size: u64,
}

/// The new branch tip and everything created on the way to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub commit: ObjectId,
    pub tree: ObjectId,
    pub parent: ObjectId,
    pub branch: String,
    pub blobs: Vec<UploadedBlob>,
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// Current state and progress of one attempt, mirrored to the subscriber.
struct Attempt<'a> {
    events: Option<&'a UnboundedSender<CommitEvent>>,
    state: CommitState,
    progress: f64,
}

impl<'a> Attempt<'a> {
    fn new(events: Option<&'a UnboundedSender<CommitEvent>>) -> Self {
        Self {
            events,
            state: CommitState::Idle,
            progress: 0.0,
        }
    }

    fn emit(&self, event: CommitEvent) {
        if let Some(tx) = self.events {
            // A subscriber that went away is not the pipeline's problem.
            let _ = tx.send(event);
        }
    }

    fn enter(&mut self, state: CommitState) {
        debug!(from = %self.state, to = %state, "commit state");
        self.state = state;
        self.emit(CommitEvent::State { state });
    }

    /// Move progress forward; never backwards.
    fn advance(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0).max(self.progress);
        self.progress = percent;
        self.emit(CommitEvent::Progress { percent });
    }

    fn reset_progress(&mut self) {
        self.progress = 0.0;
        self.emit(CommitEvent::Progress { percent: 0.0 });
    }

    fn remote(&self, file: Option<&str>, source: ForgeError) -> CommitError {
        CommitError::Remote {
            state: self.state,
            file: file.map(str::to_string),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct CommitBuilder {
    forge: Arc<dyn ForgeBackend>,
    classifier: FileClassifier,
    ref_update: RefUpdateMode,
    metrics: MetricsRegistry,
    events: Option<UnboundedSender<CommitEvent>>,
}

impl CommitBuilder {
    pub fn new(forge: Arc<dyn ForgeBackend>, config: &UploadConfig, metrics: MetricsRegistry) -> Self {
        Self {
            forge,
            classifier: FileClassifier::from_config(config),
            ref_update: config.ref_update,
            metrics,
            events: None,
        }
    }

    /// Publish state transitions and progress to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<CommitEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn classifier(&self) -> &FileClassifier {
        &self.classifier
    }

    /// Commit `files` into `target.path` on `target.branch` as one new
    /// commit whose only parent is the branch tip read at the start.
    ///
    /// The whole batch is validated first; a rejected file aborts the
    /// attempt before any network call.
    #[instrument(
        skip_all,
        fields(owner = %target.owner, repo = %target.repo, branch = %target.branch, files = files.len())
    )]
    pub async fn commit(
        &self,
        files: Vec<UploadCandidate>,
        message: &str,
        target: &CommitTarget,
    ) -> Result<CommitOutcome, CommitError> {
        let started = Instant::now();
        let mut attempt = Attempt::new(self.events.as_ref());
        attempt.reset_progress();

        let paths = match self.validate(&files, message, target) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "upload rejected");
                self.metrics.metrics.record_commit(Outcome::Rejected);
                attempt.enter(CommitState::Failed);
                return Err(e.into());
            }
        };

        let result = self.run(&mut attempt, &files, &paths, message.trim(), target).await;
        attempt.reset_progress();

        match result {
            Ok(outcome) => {
                attempt.enter(CommitState::Succeeded);
                let elapsed = started.elapsed();
                self.metrics.metrics.record_commit(Outcome::Succeeded);
                self.metrics
                    .metrics
                    .commit_duration_seconds
                    .observe(elapsed.as_secs_f64());
                info!(
                    commit = %outcome.commit,
                    parent = %outcome.parent,
                    files = outcome.blobs.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "commit pushed"
                );
                Ok(outcome)
            }
            Err(e) => {
                attempt.enter(CommitState::Failed);
                self.metrics.metrics.record_commit(Outcome::Failed);
                warn!(error = %e, "commit failed, branch left unchanged");
                Err(e)
            }
        }
    }

    /// Destination paths for every file, in order, or the first reason the
    /// batch cannot be sent.
    fn validate(
        &self,
        files: &[UploadCandidate],
        message: &str,
        target: &CommitTarget,
    ) -> Result<Vec<String>, ValidationError> {
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if files.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }

        let mut seen = HashSet::with_capacity(files.len());
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            if let Some(violation) = self
                .classifier
                .violations(&file.name, file.size)
                .into_iter()
                .next()
            {
                return Err(ValidationError::Rejected(violation));
            }
            let path = path::join(&[target.path.as_str(), file.name.as_str()]);
            if !seen.insert(path.clone()) {
                return Err(ValidationError::DuplicatePath(path));
            }
            paths.push(path);
        }
        Ok(paths)
    }

    async fn run(
        &self,
        attempt: &mut Attempt<'_>,
        files: &[UploadCandidate],
        paths: &[String],
        message: &str,
        target: &CommitTarget,
    ) -> Result<CommitOutcome, CommitError> {
        let (owner, repo, branch) = (&target.owner, &target.repo, &target.branch);

        attempt.enter(CommitState::FetchingRef);
        let parent = self
            .forge
            .resolve_branch_tip(owner, repo, branch)
            .await
            .map_err(|e| attempt.remote(None, e))?;

        attempt.enter(CommitState::FetchingBaseTree);
        let base_tree = self
            .forge
            .get_commit_tree(owner, repo, &parent)
            .await
            .map_err(|e| attempt.remote(None, e))?;
        debug!(%parent, %base_tree, "resolved base");

        let total = files.len();
        let mut blobs = Vec::with_capacity(total);
        for (i, (file, path)) in files.iter().zip(paths).enumerate() {
            attempt.enter(CommitState::EncodingBlobs { file: i + 1, total });
            attempt.advance((i as f64 + 0.5) / total as f64 * 100.0);

            let encoded = encode::encode(file, self.classifier.byte_cap())
                .await
                .map_err(|source| CommitError::Transport {
                    state: attempt.state,
                    source,
                })?;
            let sha = self
                .forge
                .create_blob(owner, repo, &encoded.data)
                .await
                .map_err(|e| attempt.remote(Some(&file.name), e))?;

            self.metrics.metrics.blobs_created_total.inc();
            self.metrics.metrics.blob_bytes_total.inc_by(encoded.len);
            debug!(path = %path, %sha, size = encoded.len, "blob created");

            blobs.push(UploadedBlob {
                path: path.clone(),
                sha,
                size: encoded.len,
            });
            attempt.advance((i + 1) as f64 / total as f64 * 100.0);
        }

        attempt.enter(CommitState::CreatingTree);
        let entries: Vec<TreeEntry> = blobs
            .iter()
            .map(|b| TreeEntry {
                path: b.path.clone(),
                mode: REGULAR_FILE_MODE,
                sha: b.sha.clone(),
            })
            .collect();
        let tree = self
            .forge
            .create_tree(owner, repo, &base_tree, &entries)
            .await
            .map_err(|e| attempt.remote(None, e))?;

        attempt.enter(CommitState::CreatingCommit);
        let commit = self
            .forge
            .create_commit(owner, repo, message, &tree, std::slice::from_ref(&parent))
            .await
            .map_err(|e| attempt.remote(None, e))?;

        attempt.enter(CommitState::UpdatingRef);
        self.forge
            .update_ref(owner, repo, branch, &commit, self.ref_update.force())
            .await
            .map_err(|e| attempt.remote(None, e))?;

        Ok(CommitOutcome {
            commit,
            tree,
            parent,
            branch: branch.clone(),
            blobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::memory::{Call, MemoryForge, Op};
    use tokio::sync::mpsc;

    fn config(size_limit: u64) -> UploadConfig {
        UploadConfig {
            size_limit,
            ..Default::default()
        }
    }

    fn setup(upload: UploadConfig) -> (Arc<MemoryForge>, CommitBuilder, MetricsRegistry) {
        let forge = Arc::new(MemoryForge::with_branches(&["main"]));
        let metrics = MetricsRegistry::new();
        let builder = CommitBuilder::new(forge.clone(), &upload, metrics.clone());
        (forge, builder, metrics)
    }

    fn target(path: &str) -> CommitTarget {
        CommitTarget::new("octocat", "hello", "main", path)
    }

    fn three_files() -> Vec<UploadCandidate> {
        vec![
            UploadCandidate::from_bytes("a.txt", &b"alpha"[..]),
            UploadCandidate::from_bytes("b.txt", &b"bravo"[..]),
            UploadCandidate::from_bytes("c.txt", &b"charlie"[..]),
        ]
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<CommitEvent>) -> Vec<CommitEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn whitespace_message_makes_no_calls() {
        let (forge, builder, _) = setup(config(1000));
        let err = builder
            .commit(three_files(), "  \n\t ", &target(""))
            .await
            .unwrap_err();

        assert!(matches!(err, CommitError::Validation(ValidationError::EmptyMessage)));
        assert_eq!(err.state(), CommitState::Idle);
        assert!(forge.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let (forge, builder, _) = setup(config(1000));
        let err = builder.commit(Vec::new(), "add", &target("")).await.unwrap_err();
        assert!(matches!(err, CommitError::Validation(ValidationError::EmptyBatch)));
        assert!(forge.calls().is_empty());
    }

    #[tokio::test]
    async fn oversize_file_aborts_whole_batch() {
        let limit = 2048;
        let (forge, builder, metrics) = setup(config(limit));
        let files = vec![
            UploadCandidate::from_bytes("a.txt", vec![b'a'; 1024]),
            UploadCandidate::from_bytes("big.bin", vec![0u8; limit as usize + 1]),
        ];

        let err = builder.commit(files, "add files", &target("")).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("big.bin"), "{message}");
        assert!(message.contains("2049"), "{message}");
        assert!(forge.calls().is_empty());
        assert_eq!(metrics.metrics.blobs_created_total.get(), 0);
    }

    #[tokio::test]
    async fn duplicate_destination_is_rejected() {
        let (forge, builder, _) = setup(config(1000));
        let files = vec![
            UploadCandidate::from_bytes("a.txt", &b"1"[..]),
            UploadCandidate::from_bytes("a.txt", &b"2"[..]),
        ];
        let err = builder.commit(files, "dup", &target("/docs/")).await.unwrap_err();
        assert!(matches!(
            err,
            CommitError::Validation(ValidationError::DuplicatePath(ref p)) if p == "docs/a.txt"
        ));
        assert!(forge.calls().is_empty());
    }

    #[tokio::test]
    async fn three_file_commit_builds_object_graph() {
        let (forge, builder, metrics) = setup(config(1000));
        let base_commit = forge.tip("main").unwrap();
        let base_tree = forge.tree_of(&base_commit).unwrap();

        let outcome = builder
            .commit(three_files(), "  add three files ", &target("/docs//notes/"))
            .await
            .unwrap();

        assert_eq!(outcome.parent, base_commit);
        assert_eq!(forge.tip("main"), Some(outcome.commit.clone()));
        assert_eq!(forge.parents_of(&outcome.commit), vec![base_commit.clone()]);
        assert_eq!(forge.tree_of(&outcome.commit), Some(outcome.tree.clone()));

        let paths: Vec<&str> = outcome.blobs.iter().map(|b| b.path.as_str()).collect();
        assert_eq!(paths, ["docs/notes/a.txt", "docs/notes/b.txt", "docs/notes/c.txt"]);
        assert_eq!(forge.blob(&outcome.blobs[0].sha).as_deref(), Some("YWxwaGE="));

        let calls = forge.calls();
        assert_eq!(forge.count(|c| matches!(c, Call::CreateBlob { .. })), 3);
        assert_eq!(calls[0], Call::ResolveBranchTip { branch: "main".into() });
        assert_eq!(calls[1], Call::GetCommitTree { commit: base_commit.clone() });

        let trees: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateTree { base_tree, entries } => Some((base_tree, entries)),
                _ => None,
            })
            .collect();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].0, &base_tree);
        assert_eq!(trees[0].1.len(), 3);
        assert!(trees[0].1.iter().all(|e| e.mode == "100644"));

        let commits: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateCommit { message, parents, .. } => Some((message, parents)),
                _ => None,
            })
            .collect();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "add three files");
        assert_eq!(commits[0].1, &vec![base_commit]);

        assert_eq!(
            calls.last(),
            Some(&Call::UpdateRef {
                branch: "main".into(),
                commit: outcome.commit.clone(),
                force: true,
            })
        );
        assert_eq!(metrics.metrics.blobs_created_total.get(), 3);
        assert_eq!(metrics.metrics.blob_bytes_total.get(), 17);
    }

    #[tokio::test]
    async fn publishes_states_and_monotonic_progress() {
        let forge = Arc::new(MemoryForge::with_branches(&["main"]));
        let (tx, rx) = mpsc::unbounded_channel();
        let builder =
            CommitBuilder::new(forge.clone(), &config(1000), MetricsRegistry::new()).with_events(tx);

        builder.commit(three_files(), "add", &target("")).await.unwrap();
        drop(builder);
        let events = drain(rx);

        let states: Vec<CommitState> = events
            .iter()
            .filter_map(|e| match e {
                CommitEvent::State { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                CommitState::FetchingRef,
                CommitState::FetchingBaseTree,
                CommitState::EncodingBlobs { file: 1, total: 3 },
                CommitState::EncodingBlobs { file: 2, total: 3 },
                CommitState::EncodingBlobs { file: 3, total: 3 },
                CommitState::CreatingTree,
                CommitState::CreatingCommit,
                CommitState::UpdatingRef,
                CommitState::Succeeded,
            ]
        );

        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                CommitEvent::Progress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first(), Some(&0.0));
        assert_eq!(progress.last(), Some(&0.0));
        let running = &progress[..progress.len() - 1];
        assert!(running.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(running.last(), Some(&100.0));
        assert!(progress.iter().all(|p| (0.0..=100.0).contains(p)));
    }

    #[tokio::test]
    async fn tree_failure_leaves_branch_untouched() {
        let (forge, builder, _) = setup(config(1000));
        let before = forge.tip("main");
        forge.fail_next(Op::CreateTree, ForgeError::from_status(500, "boom"));

        let err = builder.commit(three_files(), "add", &target("")).await.unwrap_err();
        assert_eq!(err.state(), CommitState::CreatingTree);
        assert!(matches!(
            err.forge_error(),
            Some(ForgeError::Status { status: 500, .. })
        ));
        assert_eq!(forge.tip("main"), before);
        assert_eq!(forge.count(|c| matches!(c, Call::CreateCommit { .. })), 0);
        assert_eq!(forge.count(|c| matches!(c, Call::UpdateRef { .. })), 0);
    }

    #[tokio::test]
    async fn blob_failure_names_file() {
        let (forge, builder, _) = setup(config(1000));
        forge.fail_next(Op::CreateBlob, ForgeError::Forbidden("Resource not accessible".into()));

        let err = builder.commit(three_files(), "add", &target("")).await.unwrap_err();
        match &err {
            CommitError::Remote { state, file, source } => {
                assert_eq!(*state, CommitState::EncodingBlobs { file: 1, total: 3 });
                assert_eq!(file.as_deref(), Some("a.txt"));
                assert!(matches!(source, ForgeError::Forbidden(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("a.txt"));
        assert_eq!(forge.count(|c| matches!(c, Call::CreateBlob { .. })), 1);
        assert_eq!(forge.count(|c| matches!(c, Call::CreateTree { .. })), 0);
    }

    #[tokio::test]
    async fn unreadable_second_file_is_transport_error() {
        let (forge, builder, _) = setup(config(1000));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, b"bravo").unwrap();
        let second = UploadCandidate::from_path(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let files = vec![
            UploadCandidate::from_bytes("a.txt", &b"alpha"[..]),
            second,
            UploadCandidate::from_bytes("c.txt", &b"charlie"[..]),
        ];
        let err = builder.commit(files, "add", &target("")).await.unwrap_err();

        assert!(matches!(err, CommitError::Transport { .. }));
        assert_eq!(err.state(), CommitState::EncodingBlobs { file: 2, total: 3 });
        assert!(err.to_string().contains("b.txt"));
        assert_eq!(forge.count(|c| matches!(c, Call::CreateBlob { .. })), 1);
        assert_eq!(forge.count(|c| matches!(c, Call::UpdateRef { .. })), 0);
    }

    #[tokio::test]
    async fn file_grown_since_selection_is_not_uploaded() {
        let (forge, builder, metrics) = setup(config(1000));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, b"0123456789").unwrap();
        let grown = UploadCandidate::from_path(&path).await.unwrap();
        std::fs::write(&path, vec![b'x'; 5000]).unwrap();

        let files = vec![UploadCandidate::from_bytes("a.txt", &b"alpha"[..]), grown];
        let err = builder.commit(files, "add", &target("docs")).await.unwrap_err();

        assert!(matches!(
            err,
            CommitError::Transport {
                source: EncodeError::Oversize { limit: 1000, .. },
                ..
            }
        ));
        assert_eq!(err.state(), CommitState::EncodingBlobs { file: 2, total: 2 });
        assert!(err.to_string().contains("log.txt"));
        assert_eq!(forge.count(|c| matches!(c, Call::CreateBlob { .. })), 1);
        assert_eq!(forge.count(|c| matches!(c, Call::CreateTree { .. })), 0);
        assert_eq!(metrics.metrics.blob_bytes_total.get(), 5);
    }

    #[tokio::test]
    async fn blob_size_reflects_bytes_read() {
        let (_forge, builder, metrics) = setup(config(1000));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, b"ab").unwrap();
        let file = UploadCandidate::from_path(&path).await.unwrap();
        std::fs::write(&path, b"abcdef").unwrap();

        let outcome = builder.commit(vec![file], "add", &target("")).await.unwrap();
        assert_eq!(outcome.blobs[0].size, 6);
        assert_eq!(metrics.metrics.blob_bytes_total.get(), 6);
    }

    #[tokio::test]
    async fn names_leaving_the_directory_make_no_calls() {
        let (forge, builder, _) = setup(config(1000));
        for name in ["../escape.txt", "sub/inner.txt"] {
            let files = vec![
                UploadCandidate::from_bytes("a.txt", &b"alpha"[..]),
                UploadCandidate::from_bytes(name, &b"x"[..]),
            ];
            let err = builder.commit(files, "add", &target("docs")).await.unwrap_err();
            match err {
                CommitError::Validation(ValidationError::Rejected(Violation::InvalidName { name: rejected })) => {
                    assert_eq!(rejected, name)
                }
                other => panic!("expected invalid name, got {other:?}"),
            }
        }
        assert!(forge.calls().is_empty());
    }

    #[tokio::test]
    async fn commit_builds_on_tip_pushed_by_someone_else() {
        let (forge, builder, _) = setup(config(1000));
        let pushed = forge.advance_branch("main");

        let outcome = builder.commit(three_files(), "add", &target("")).await.unwrap();
        assert_eq!(outcome.parent, pushed);
        assert_eq!(forge.parents_of(&outcome.commit), vec![pushed]);
        assert_eq!(forge.tip("main"), Some(outcome.commit));
    }

    #[tokio::test]
    async fn unknown_branch_fails_at_first_step() {
        let (forge, builder, _) = setup(config(1000));
        let err = builder
            .commit(three_files(), "add", &CommitTarget::new("octocat", "hello", "nope", ""))
            .await
            .unwrap_err();

        assert_eq!(err.state(), CommitState::FetchingRef);
        assert!(matches!(err.forge_error(), Some(ForgeError::NotFound(_))));
        assert_eq!(forge.calls().len(), 1);
    }

    #[tokio::test]
    async fn fast_forward_mode_detects_concurrent_push() {
        let upload = UploadConfig {
            size_limit: 1000,
            ref_update: RefUpdateMode::FastForward,
            ..Default::default()
        };
        let (forge, builder, metrics) = setup(upload);
        forge.race_next_update("main");

        let err = builder.commit(three_files(), "add", &target("")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.state(), CommitState::UpdatingRef);

        // The concurrent push stays in place.
        let tip = forge.tip("main").unwrap();
        assert_eq!(forge.count(|c| matches!(c, Call::UpdateRef { force: false, .. })), 1);
        assert!(!forge.parents_of(&tip).is_empty());
        assert_eq!(
            metrics
                .metrics
                .commit_attempts_total
                .get_or_create(&crate::metrics::OutcomeLabels { outcome: Outcome::Failed })
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn fast_forward_mode_succeeds_without_race() {
        let upload = UploadConfig {
            size_limit: 1000,
            ref_update: RefUpdateMode::FastForward,
            ..Default::default()
        };
        let (forge, builder, _) = setup(upload);
        let outcome = builder.commit(three_files(), "add", &target("")).await.unwrap();
        assert_eq!(forge.tip("main"), Some(outcome.commit));
    }

    #[test]
    fn snapshot_folds_events() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.apply(&CommitEvent::State {
            state: CommitState::EncodingBlobs { file: 1, total: 2 },
        });
        snapshot.apply(&CommitEvent::Progress { percent: 25.0 });
        assert_eq!(snapshot.state, CommitState::EncodingBlobs { file: 1, total: 2 });
        assert_eq!(snapshot.percent, 25.0);
        assert!(!snapshot.state.is_terminal());

        snapshot.apply(&CommitEvent::State {
            state: CommitState::Succeeded,
        });
        assert!(snapshot.state.is_terminal());
    }

    #[test]
    fn event_serialization() {
        let json = serde_json::to_value(CommitEvent::State {
            state: CommitState::EncodingBlobs { file: 2, total: 5 },
        })
        .unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"]["encoding_blobs"]["file"], 2);

        let json = serde_json::to_value(CommitEvent::Progress { percent: 50.0 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "progress", "percent": 50.0}));
    }
}
