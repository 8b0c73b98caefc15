//! Main axum router and HTTP request handlers for the forgedrop API.
//!
//! Routes:
//! - `GET  /api/user`                  - Authenticated user
//! - `GET  /api/repos`                 - Repositories, most recently updated first
//! - `POST /api/repos/{owner}/{repo}`  - Select a repository (root, default branch)
//! - `GET  /api/view`                  - Current browser state
//! - `POST /api/branch`                - Switch branch, keeping the path
//! - `GET  /api/contents?path=`        - Open a directory
//! - `POST /api/up`                    - Open the parent directory
//! - `GET  /api/file?path=`            - Preview a file
//! - `POST /api/commit`                - Multipart upload: `message` + `file` parts
//! - `GET  /api/progress`              - State and progress of the running commit
//! - `GET  /healthz`                   - Health check
//! - `GET  /metrics`                   - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::browser::{BrowseError, Browser, FilePreview};
use crate::config::UploadConfig;
use crate::forge::{DirectoryEntry, ForgeError, Repository, User};
use crate::path::Crumb;
use crate::upload::commit::{CommitError, CommitOutcome, ProgressSnapshot};
use crate::upload::encode::EncodeError;
use crate::upload::UploadCandidate;
use crate::AppState;

/// Files a single multipart commit may carry at the size limit when
/// `upload.max_request_bytes` is unset.
const MAX_FILES_AT_LIMIT: u64 = 4;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = commit_body_limit(&state.config.upload);

    Router::new()
        // Browsing
        .route("/api/user", get(handle_user))
        .route("/api/repos", get(handle_repos))
        .route("/api/repos/{owner}/{repo}", post(handle_select_repo))
        .route("/api/view", get(handle_view))
        .route("/api/branch", post(handle_select_branch))
        .route("/api/contents", get(handle_contents))
        .route("/api/up", post(handle_up))
        .route("/api/file", get(handle_file))
        // Committing
        .route(
            "/api/commit",
            post(handle_commit).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/progress", get(handle_progress))
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Multipart bodies carry raw bytes plus framing.  Without an explicit
/// `upload.max_request_bytes`, allow a few files at the size limit.
fn commit_body_limit(upload: &UploadConfig) -> usize {
    let limit = upload
        .max_request_bytes
        .unwrap_or_else(|| upload.size_limit.saturating_mul(MAX_FILES_AT_LIMIT));
    usize::try_from(limit).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchRequest {
    branch: String,
}

/// Everything a UI needs to render the browser.
#[derive(Debug, Serialize)]
pub struct BrowserView {
    pub repository: Option<Repository>,
    pub branch: String,
    pub branches: Vec<String>,
    pub path: String,
    pub breadcrumbs: Vec<Crumb>,
    pub contents: Vec<DirectoryEntry>,
}

impl BrowserView {
    fn of(browser: &Browser) -> Self {
        Self {
            repository: browser.repository().cloned(),
            branch: browser.branch().to_string(),
            branches: browser.branches().to_vec(),
            path: browser.path().to_string(),
            breadcrumbs: browser.breadcrumbs(),
            contents: browser.contents().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CommitResponse {
    outcome: CommitOutcome,
    refreshed: bool,
    view: BrowserView,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/user`
async fn handle_user(State(state): State<Arc<AppState>>) -> Result<Json<User>, AppError> {
    Ok(Json(state.forge.authenticated_user().await?))
}

/// `GET /api/repos`
async fn handle_repos(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Repository>>, AppError> {
    Ok(Json(state.forge.list_repositories().await?))
}

/// `POST /api/repos/{owner}/{repo}`
///
/// The repository must be one the token can see; its default branch comes
/// from that listing.
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_select_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<BrowserView>, AppError> {
    let full_name = format!("{owner}/{repo}");
    let repository = state
        .forge
        .list_repositories()
        .await?
        .into_iter()
        .find(|r| r.full_name.eq_ignore_ascii_case(&full_name))
        .ok_or_else(|| AppError::NotFound(format!("repository {full_name} not found")))?;

    let mut browser = state.browser.lock().await;
    browser.select_repository(repository).await?;
    Ok(Json(BrowserView::of(&browser)))
}

/// `GET /api/view`
async fn handle_view(State(state): State<Arc<AppState>>) -> Json<BrowserView> {
    let browser = state.browser.lock().await;
    Json(BrowserView::of(&browser))
}

/// `POST /api/branch`
async fn handle_select_branch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BranchRequest>,
) -> Result<Json<BrowserView>, AppError> {
    let mut browser = state.browser.lock().await;
    browser.select_branch(&req.branch).await?;
    Ok(Json(BrowserView::of(&browser)))
}

/// `GET /api/contents?path=`
async fn handle_contents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<BrowserView>, AppError> {
    let mut browser = state.browser.lock().await;
    browser.open(query.path.as_deref().unwrap_or_default()).await?;
    Ok(Json(BrowserView::of(&browser)))
}

/// `POST /api/up`
async fn handle_up(State(state): State<Arc<AppState>>) -> Result<Json<BrowserView>, AppError> {
    let mut browser = state.browser.lock().await;
    browser.up().await?;
    Ok(Json(BrowserView::of(&browser)))
}

/// `GET /api/file?path=`
async fn handle_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<FilePreview>, AppError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing path".into()))?;
    let browser = state.browser.lock().await;
    Ok(Json(browser.preview_file(&path).await?))
}

/// `POST /api/commit`
///
/// Commits every `file` part into the current directory.  The browser lock
/// is held for the whole attempt, so commits are serialized.
///
/// The whole request is capped by `upload.max_request_bytes` (default four
/// files at the size limit).  A larger body is refused with 413 before any
/// file is classified, so the error names the cap rather than a file.
#[instrument(skip_all)]
async fn handle_commit(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<CommitResponse>, AppError> {
    let body_limit = commit_body_limit(&state.config.upload);
    let (message, files) = read_commit_form(multipart, body_limit).await?;
    info!(files = files.len(), "commit requested");

    let mut browser = state.browser.lock().await;
    let report = browser
        .upload(&state.builder, &state.reconciler, files, &message)
        .await?;

    Ok(Json(CommitResponse {
        outcome: report.outcome,
        refreshed: report.refreshed,
        view: BrowserView::of(&browser),
    }))
}

/// `GET /api/progress`
async fn handle_progress(State(state): State<Arc<AppState>>) -> Json<ProgressSnapshot> {
    Json(*state.progress.borrow())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health(&state.session, state.forge.as_ref()).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by forgedrop.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Pull the commit message and file parts out of a multipart body.
async fn read_commit_form(
    mut multipart: Multipart,
    body_limit: usize,
) -> Result<(String, Vec<UploadCandidate>), AppError> {
    let form_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(format!(
                "request body exceeds {body_limit} bytes; send fewer files per commit or raise upload.max_request_bytes"
            ))
        } else {
            AppError::BadRequest(e.body_text())
        }
    };
    let mut message = String::new();
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(form_error)?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => {
                message = field.text().await.map_err(form_error)?;
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::BadRequest("file part has no file name".into()))?;
                let bytes = field.bytes().await.map_err(form_error)?;
                debug!(name = %file_name, size = bytes.len(), "received file part");
                files.push(UploadCandidate::from_bytes(file_name, bytes));
            }
            other => debug!(field = ?other, "ignoring form field"),
        }
    }

    Ok((message, files))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// The token is missing or was rejected upstream.
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    /// The branch moved under a fast-forward-only ref update.
    Conflict(String),
    /// The upload itself is invalid (empty message, oversize file, ...).
    Unprocessable(String),
    /// The request body is over the configured cap.
    PayloadTooLarge(String),
    /// The hosting API failed in a way the caller cannot fix.
    Upstream(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl AppError {
    /// Classify a forge failure, keeping `message` as the text shown.
    fn from_forge(err: &ForgeError, message: String) -> Self {
        match err {
            ForgeError::Unauthorized(_) => AppError::Unauthorized(message),
            ForgeError::Forbidden(_) => AppError::Forbidden(message),
            ForgeError::NotFound(_) => AppError::NotFound(message),
            ForgeError::Conflict(_) => AppError::Conflict(message),
            _ => AppError::Upstream(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Upstream(msg) => {
                warn!(error = %msg, "upstream failure");
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
            }
        };
        (status, Json(ErrorBody { error: &message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<ForgeError> for AppError {
    fn from(err: ForgeError) -> Self {
        let message = err.to_string();
        AppError::from_forge(&err, message)
    }
}

impl From<CommitError> for AppError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Validation(e) => AppError::Unprocessable(e.to_string()),
            CommitError::Transport {
                source: EncodeError::Oversize { .. },
                ..
            } => AppError::Unprocessable(err.to_string()),
            CommitError::Transport { .. } => AppError::Internal(err.into()),
            CommitError::Remote { ref source, .. } => AppError::from_forge(source, err.to_string()),
        }
    }
}

impl From<BrowseError> for AppError {
    fn from(err: BrowseError) -> Self {
        match err {
            BrowseError::NoRepository | BrowseError::UnknownBranch(_) => {
                AppError::BadRequest(err.to_string())
            }
            BrowseError::PathNotFound(_) => AppError::NotFound(err.to_string()),
            BrowseError::AccessDenied => AppError::Forbidden(err.to_string()),
            BrowseError::Unauthorized(_) => AppError::Unauthorized(err.to_string()),
            BrowseError::Failed(_) => AppError::Upstream(err.to_string()),
            BrowseError::Commit(e) => e.into(),
        }
    }
}
