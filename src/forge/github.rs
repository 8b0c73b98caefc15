//! GitHub / GitHub Enterprise backend implementation.
//!
//! Reads go through the repository contents API; writes go through the git
//! data API (`/git/blobs`, `/git/trees`, `/git/commits`, `/git/refs`), which
//! is what lets a multi-file upload land as a single commit.

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::session::Session;

use super::rate_limit::RateLimitState;
use super::{
    DirectoryEntry, FileContent, ForgeBackend, ForgeError, ForgeResult, ObjectId, Repository,
    TreeEntry, User,
};

const PER_PAGE: usize = 100;
/// Upper bound on pages fetched for a single listing.
const MAX_PAGES: usize = 50;

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct GitHubBackend {
    client: reqwest::Client,
    api_url: Url,
    accept: &'static str,
    authorization: String,
    rate_limit: RateLimitState,
    rate_limit_buffer: u32,
    metrics: MetricsRegistry,
}

impl GitHubBackend {
    pub fn new(config: &Config, session: &Session, metrics: MetricsRegistry) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let client = reqwest::Client::builder()
            .user_agent(config.upstream.user_agent.clone())
            .timeout(Duration::from_secs(config.upstream.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let api_url = Url::parse(&config.upstream.api_url)
            .with_context(|| format!("invalid upstream.api_url: {}", config.upstream.api_url))?;

        Ok(Self {
            client,
            api_url,
            accept: config.backend_type.accept_header(),
            authorization: session.authorization(),
            rate_limit: RateLimitState::new(),
            rate_limit_buffer: config.upstream.api_rate_limit_buffer,
            metrics,
        })
    }

    /// Build an API URL from path segments.  Each segment is percent-encoded,
    /// so `segments` may carry file names with spaces or `#`.
    fn endpoint<'a, I>(&self, segments: I) -> ForgeResult<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ForgeError::Decode(format!("api_url cannot be a base: {}", self.api_url)))?
            .pop_if_empty()
            .extend(segments.into_iter().filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn repo_endpoint<'a>(
        &self,
        owner: &'a str,
        repo: &'a str,
        rest: impl IntoIterator<Item = &'a str>,
    ) -> ForgeResult<Url> {
        self.endpoint(["repos", owner, repo].into_iter().chain(rest))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", &self.authorization)
            .header("Accept", self.accept)
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send a request and decode a JSON body, classifying failures by status.
    async fn send<T: DeserializeOwned>(&self, endpoint: &'static str, req: RequestBuilder) -> ForgeResult<T> {
        let resp = self.execute(endpoint, req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ForgeError::Decode(format!("{endpoint}: {e}")))
    }

    async fn execute(&self, endpoint: &'static str, req: RequestBuilder) -> ForgeResult<reqwest::Response> {
        self.rate_limit.throttle(self.rate_limit_buffer).await;
        self.metrics.metrics.record_api_call(endpoint);

        let resp = req.send().await?;

        if let Some(remaining) = self.rate_limit.observe(resp.headers()) {
            self.metrics
                .metrics
                .upstream_api_rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
        }

        let status = resp.status();
        if status.is_success() {
            debug!(endpoint, %status, "upstream API call succeeded");
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| status.to_string());
        warn!(endpoint, %status, %message, "upstream API returned non-success status");
        Err(ForgeError::from_status(status.as_u16(), message))
    }

    /// Fetch every page of a list endpoint.
    async fn paginate<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: Url,
        extra_query: &[(&str, &str)],
    ) -> ForgeResult<Vec<T>> {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_str = page.to_string();
            let per_page = PER_PAGE.to_string();
            let req = self.request(Method::GET, url.clone()).query(extra_query).query(&[
                ("per_page", per_page.as_str()),
                ("page", page_str.as_str()),
            ]);
            let batch: Vec<T> = self.send(endpoint, req).await?;
            let len = batch.len();
            out.extend(batch);
            if len < PER_PAGE {
                return Ok(out);
            }
        }
        warn!(endpoint, pages = MAX_PAGES, "pagination stopped at page limit");
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ShaOnly {
    sha: ObjectId,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaOnly,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: ShaOnly,
}

#[derive(Serialize)]
struct CreateBlob<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTree<'a> {
    base_tree: &'a str,
    tree: Vec<WireTreeEntry<'a>>,
}

#[derive(Serialize)]
struct WireTreeEntry<'a> {
    path: &'a str,
    mode: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: &'a str,
}

#[derive(Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: &'a [ObjectId],
}

#[derive(Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

/// `GET /contents/{path}` answers with an array for a directory and a single
/// object for a file.
#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Listing(Vec<DirectoryEntry>),
    Single(DirectoryEntry),
}

#[derive(Deserialize)]
struct FileResponse {
    name: String,
    path: String,
    sha: ObjectId,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Deserialize)]
struct BranchResponse {
    name: String,
}

#[derive(Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    id: u64,
    name: String,
    full_name: String,
    owner: OwnerResponse,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
}

impl From<RepoResponse> for Repository {
    fn from(r: RepoResponse) -> Self {
        Repository {
            id: r.id,
            owner: r.owner.login,
            name: r.name,
            full_name: r.full_name,
            // Empty repositories have no default branch yet.
            default_branch: r.default_branch.unwrap_or_else(|| "main".to_string()),
            private: r.private,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ForgeBackend for GitHubBackend {
    async fn resolve_branch_tip(&self, owner: &str, repo: &str, branch: &str) -> ForgeResult<ObjectId> {
        let url = self.repo_endpoint(owner, repo, ["git", "ref", "heads"].into_iter().chain(branch.split('/')))?;
        let body: RefResponse = self.send("get_ref", self.request(Method::GET, url)).await?;
        Ok(body.object.sha)
    }

    async fn get_commit_tree(&self, owner: &str, repo: &str, commit: &str) -> ForgeResult<ObjectId> {
        let url = self.repo_endpoint(owner, repo, ["git", "commits", commit])?;
        let body: CommitResponse = self.send("get_commit", self.request(Method::GET, url)).await?;
        Ok(body.tree.sha)
    }

    async fn create_blob(&self, owner: &str, repo: &str, encoded: &str) -> ForgeResult<ObjectId> {
        let url = self.repo_endpoint(owner, repo, ["git", "blobs"])?;
        let req = self.request(Method::POST, url).json(&CreateBlob {
            content: encoded,
            encoding: "base64",
        });
        let body: ShaOnly = self.send("create_blob", req).await?;
        Ok(body.sha)
    }

    async fn create_tree(
        &self,
        owner: &str,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> ForgeResult<ObjectId> {
        let url = self.repo_endpoint(owner, repo, ["git", "trees"])?;
        let payload = CreateTree {
            base_tree,
            tree: entries
                .iter()
                .map(|e| WireTreeEntry {
                    path: &e.path,
                    mode: e.mode,
                    kind: "blob",
                    sha: &e.sha,
                })
                .collect(),
        };
        let body: ShaOnly = self
            .send("create_tree", self.request(Method::POST, url).json(&payload))
            .await?;
        Ok(body.sha)
    }

    async fn create_commit(
        &self,
        owner: &str,
        repo: &str,
        message: &str,
        tree: &str,
        parents: &[ObjectId],
    ) -> ForgeResult<ObjectId> {
        let url = self.repo_endpoint(owner, repo, ["git", "commits"])?;
        let req = self.request(Method::POST, url).json(&CreateCommit {
            message,
            tree,
            parents,
        });
        let body: ShaOnly = self.send("create_commit", req).await?;
        Ok(body.sha)
    }

    async fn update_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        commit: &str,
        force: bool,
    ) -> ForgeResult<()> {
        let url = self.repo_endpoint(owner, repo, ["git", "refs", "heads"].into_iter().chain(branch.split('/')))?;
        let req = self
            .request(Method::PATCH, url)
            .json(&UpdateRef { sha: commit, force });
        match self.execute("update_ref", req).await {
            Ok(_) => Ok(()),
            // GitHub reports a rejected non-fast-forward move as 422.
            Err(ForgeError::Status { status: 422, message }) if !force => Err(ForgeError::Conflict(message)),
            Err(e) => Err(e),
        }
    }

    async fn list_directory(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> ForgeResult<Vec<DirectoryEntry>> {
        let url = self.repo_endpoint(owner, repo, std::iter::once("contents").chain(path.split('/')))?;
        let req = self
            .request(Method::GET, url)
            .query(&[("ref", branch)])
            // Bypass conditional-request caching so a just-moved ref is seen.
            .header("If-None-Match", "")
            .header("Cache-Control", "no-cache");
        let body: ContentsResponse = self.send("get_contents", req).await?;
        Ok(match body {
            ContentsResponse::Listing(entries) => entries,
            ContentsResponse::Single(entry) => vec![entry],
        })
    }

    async fn list_branches(&self, owner: &str, repo: &str) -> ForgeResult<Vec<String>> {
        let url = self.repo_endpoint(owner, repo, ["branches"])?;
        let branches: Vec<BranchResponse> = self.paginate("list_branches", url, &[]).await?;
        Ok(branches.into_iter().map(|b| b.name).collect())
    }

    async fn get_file(&self, owner: &str, repo: &str, path: &str, branch: &str) -> ForgeResult<FileContent> {
        let url = self.repo_endpoint(owner, repo, std::iter::once("contents").chain(path.split('/')))?;
        let req = self.request(Method::GET, url).query(&[("ref", branch)]);
        let body: FileResponse = self.send("get_contents", req).await?;

        let bytes = match (body.encoding.as_deref(), body.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() => decode_content(content)?,
            // Files over 1 MB come back without inline content.
            _ => match body.download_url.as_deref() {
                Some(download) => {
                    let url = Url::parse(download).map_err(|e| ForgeError::Decode(e.to_string()))?;
                    let resp = self.execute("download_raw", self.request(Method::GET, url)).await?;
                    resp.bytes().await?.to_vec()
                }
                None => Vec::new(),
            },
        };

        Ok(FileContent {
            name: body.name,
            path: body.path,
            sha: body.sha,
            bytes,
        })
    }

    async fn authenticated_user(&self) -> ForgeResult<User> {
        let url = self.endpoint(["user"])?;
        self.send("get_user", self.request(Method::GET, url)).await
    }

    async fn list_repositories(&self) -> ForgeResult<Vec<Repository>> {
        let url = self.endpoint(["user", "repos"])?;
        let repos: Vec<RepoResponse> = self
            .paginate("list_repos", url, &[("sort", "updated")])
            .await?;
        Ok(repos.into_iter().map(Repository::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pull the `message` field out of a GitHub error body.
fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

/// Decode inline file content, which GitHub wraps at 60 columns.
fn decode_content(content: &str) -> ForgeResult<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ForgeError::Decode(format!("file content is not valid base64: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
