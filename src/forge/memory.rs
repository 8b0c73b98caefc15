//! In-memory [`ForgeBackend`] used by the pipeline and browser tests.
//!
//! Holds a tiny object store (commits, trees, blobs) and branch refs, records
//! every call in order, and lets a test queue failures for specific
//! operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{
    DirectoryEntry, EntryType, FileContent, ForgeBackend, ForgeError, ForgeResult, ObjectId,
    Repository, TreeEntry, User,
};

/// Operations a failure can be queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ResolveBranchTip,
    GetCommitTree,
    CreateBlob,
    CreateTree,
    CreateCommit,
    UpdateRef,
    ListDirectory,
    ListBranches,
    GetFile,
}

/// One recorded call, with the arguments a test may want to assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ResolveBranchTip { branch: String },
    GetCommitTree { commit: ObjectId },
    CreateBlob { encoded: String },
    CreateTree { base_tree: ObjectId, entries: Vec<TreeEntry> },
    CreateCommit { message: String, tree: ObjectId, parents: Vec<ObjectId> },
    UpdateRef { branch: String, commit: ObjectId, force: bool },
    ListDirectory { path: String, branch: String },
    ListBranches,
    GetFile { path: String, branch: String },
    AuthenticatedUser,
    ListRepositories,
}

#[derive(Debug, Clone)]
struct CommitObject {
    tree: ObjectId,
    parents: Vec<ObjectId>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    branches: HashMap<String, ObjectId>,
    commits: HashMap<ObjectId, CommitObject>,
    blobs: HashMap<ObjectId, String>,
    listings: HashMap<String, Vec<DirectoryEntry>>,
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<Op, VecDeque<ForgeError>>,
    race: Option<String>,
    calls: Vec<Call>,
}

impl State {
    fn mint(&mut self, kind: &str) -> ObjectId {
        self.next_id += 1;
        format!("{kind}{:04}", self.next_id)
    }

    fn advance(&mut self, branch: &str) -> ObjectId {
        let parent = self.branches[branch].clone();
        let tree = self.commits[&parent].tree.clone();
        let commit = self.mint("commit");
        self.commits.insert(
            commit.clone(),
            CommitObject {
                tree,
                parents: vec![parent],
            },
        );
        self.branches.insert(branch.to_string(), commit.clone());
        commit
    }

    fn take_failure(&mut self, op: Op) -> ForgeResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct MemoryForge {
    state: Mutex<State>,
}

impl MemoryForge {
    /// A repository with one root commit on each of `branches`.
    pub fn with_branches(branches: &[&str]) -> Self {
        let mut state = State::default();
        let tree = state.mint("tree");
        let commit = state.mint("commit");
        state.commits.insert(
            commit.clone(),
            CommitObject {
                tree,
                parents: Vec::new(),
            },
        );
        for branch in branches {
            state.branches.insert(branch.to_string(), commit.clone());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Serve `entries` for listings of `path` on any branch.
    pub fn set_listing(&self, path: &str, entries: Vec<DirectoryEntry>) {
        self.state.lock().unwrap().listings.insert(path.to_string(), entries);
    }

    pub fn set_file(&self, path: &str, bytes: &[u8]) {
        self.state.lock().unwrap().files.insert(path.to_string(), bytes.to_vec());
    }

    /// The next call to `op` fails with `err`.  Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, op: Op, err: ForgeError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Simulate someone else pushing to `branch`.
    pub fn advance_branch(&self, branch: &str) -> ObjectId {
        self.state.lock().unwrap().advance(branch)
    }

    /// Someone else pushes to `branch` just before the next ref update lands.
    pub fn race_next_update(&self, branch: &str) {
        self.state.lock().unwrap().race = Some(branch.to_string());
    }

    pub fn tip(&self, branch: &str) -> Option<ObjectId> {
        self.state.lock().unwrap().branches.get(branch).cloned()
    }

    pub fn tree_of(&self, commit: &str) -> Option<ObjectId> {
        self.state.lock().unwrap().commits.get(commit).map(|c| c.tree.clone())
    }

    pub fn parents_of(&self, commit: &str) -> Vec<ObjectId> {
        self.state
            .lock()
            .unwrap()
            .commits
            .get(commit)
            .map(|c| c.parents.clone())
            .unwrap_or_default()
    }

    pub fn blob(&self, id: &str) -> Option<String> {
        self.state.lock().unwrap().blobs.get(id).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

/// Convenience constructor for listing fixtures.
pub fn entry(path: &str, entry_type: EntryType) -> DirectoryEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    DirectoryEntry {
        name,
        path: path.to_string(),
        entry_type,
        size: 0,
        sha: format!("sha-{path}"),
    }
}

#[async_trait::async_trait]
impl ForgeBackend for MemoryForge {
    async fn resolve_branch_tip(&self, _owner: &str, _repo: &str, branch: &str) -> ForgeResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ResolveBranchTip {
            branch: branch.to_string(),
        });
        state.take_failure(Op::ResolveBranchTip)?;
        state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("branch {branch}")))
    }

    async fn get_commit_tree(&self, _owner: &str, _repo: &str, commit: &str) -> ForgeResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::GetCommitTree {
            commit: commit.to_string(),
        });
        state.take_failure(Op::GetCommitTree)?;
        state
            .commits
            .get(commit)
            .map(|c| c.tree.clone())
            .ok_or_else(|| ForgeError::NotFound(format!("commit {commit}")))
    }

    async fn create_blob(&self, _owner: &str, _repo: &str, encoded: &str) -> ForgeResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateBlob {
            encoded: encoded.to_string(),
        });
        state.take_failure(Op::CreateBlob)?;
        let id = state.mint("blob");
        state.blobs.insert(id.clone(), encoded.to_string());
        Ok(id)
    }

    async fn create_tree(
        &self,
        _owner: &str,
        _repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> ForgeResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateTree {
            base_tree: base_tree.to_string(),
            entries: entries.to_vec(),
        });
        state.take_failure(Op::CreateTree)?;
        if let Some(missing) = entries.iter().find(|e| !state.blobs.contains_key(&e.sha)) {
            return Err(ForgeError::from_status(422, format!("unknown blob {}", missing.sha)));
        }
        Ok(state.mint("tree"))
    }

    async fn create_commit(
        &self,
        _owner: &str,
        _repo: &str,
        message: &str,
        tree: &str,
        parents: &[ObjectId],
    ) -> ForgeResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateCommit {
            message: message.to_string(),
            tree: tree.to_string(),
            parents: parents.to_vec(),
        });
        state.take_failure(Op::CreateCommit)?;
        let id = state.mint("commit");
        state.commits.insert(
            id.clone(),
            CommitObject {
                tree: tree.to_string(),
                parents: parents.to_vec(),
            },
        );
        Ok(id)
    }

    async fn update_ref(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
        commit: &str,
        force: bool,
    ) -> ForgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::UpdateRef {
            branch: branch.to_string(),
            commit: commit.to_string(),
            force,
        });
        state.take_failure(Op::UpdateRef)?;
        if let Some(raced) = state.race.take() {
            state.advance(&raced);
        }

        let current = state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("branch {branch}")))?;
        if !force {
            let descends = state
                .commits
                .get(commit)
                .is_some_and(|c| c.parents.contains(&current));
            if !descends {
                return Err(ForgeError::Conflict("Update is not a fast forward".to_string()));
            }
        }
        state.branches.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    async fn list_directory(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        branch: &str,
    ) -> ForgeResult<Vec<DirectoryEntry>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ListDirectory {
            path: path.to_string(),
            branch: branch.to_string(),
        });
        state.take_failure(Op::ListDirectory)?;
        if !state.branches.contains_key(branch) {
            return Err(ForgeError::NotFound(format!("No commit found for the ref {branch}")));
        }
        state
            .listings
            .get(path)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound("Not Found".to_string()))
    }

    async fn list_branches(&self, _owner: &str, _repo: &str) -> ForgeResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ListBranches);
        state.take_failure(Op::ListBranches)?;
        let mut names: Vec<String> = state.branches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_file(&self, _owner: &str, _repo: &str, path: &str, branch: &str) -> ForgeResult<FileContent> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::GetFile {
            path: path.to_string(),
            branch: branch.to_string(),
        });
        state.take_failure(Op::GetFile)?;
        let bytes = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound("Not Found".to_string()))?;
        Ok(FileContent {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            sha: format!("sha-{path}"),
            bytes,
        })
    }

    async fn authenticated_user(&self) -> ForgeResult<User> {
        self.state.lock().unwrap().calls.push(Call::AuthenticatedUser);
        Ok(User {
            login: "octocat".to_string(),
            name: None,
        })
    }

    async fn list_repositories(&self) -> ForgeResult<Vec<Repository>> {
        self.state.lock().unwrap().calls.push(Call::ListRepositories);
        Ok(vec![Repository {
            id: 1,
            owner: "octocat".to_string(),
            name: "hello".to_string(),
            full_name: "octocat/hello".to_string(),
            default_branch: "main".to_string(),
            private: false,
        }])
    }
}
