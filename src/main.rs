mod browser;
mod config;
mod forge;
mod health;
mod http;
mod metrics;
mod path;
mod reconcile;
mod session;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, watch, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::browser::{Browser, Preview};
use crate::config::Config;
use crate::forge::{ForgeBackend, Repository};
use crate::metrics::MetricsRegistry;
use crate::reconcile::{Reconciled, Reconciler};
use crate::session::{Session, SessionSource, SessionStore};
use crate::upload::classify::Classification;
use crate::upload::commit::{CommitBuilder, CommitEvent, CommitTarget, ProgressSnapshot};
use crate::upload::UploadCandidate;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "forgedrop",
    version,
    about = "Browse a hosted repository and commit files into it without a git client"
)]
struct Cli {
    /// Path to the YAML configuration file.  A missing file means defaults.
    #[arg(short, long, global = true, default_value = "forgedrop.yaml")]
    config: PathBuf,

    /// Log output format.  `serve` defaults to JSON, everything else to text.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a personal access token.  Reads it from stdin if not given.
    Login {
        #[arg(long)]
        token: Option<String>,
    },
    /// Forget the stored token.
    Logout,
    /// Show the user the token belongs to.
    Whoami,
    /// List repositories, most recently updated first.
    Repos,
    /// List the branches of OWNER/REPO.
    Branches { repo: String },
    /// List a directory of OWNER/REPO.
    Ls {
        repo: String,
        #[arg(default_value = "")]
        path: String,
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Print a file of OWNER/REPO.
    Cat {
        repo: String,
        path: String,
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Commit local files into a directory of OWNER/REPO as a single commit.
    Upload {
        repo: String,
        /// Commit message.
        #[arg(short, long)]
        message: String,
        /// Destination directory; the repository root by default.
        #[arg(short, long, default_value = "")]
        path: String,
        /// Target branch; the repository's default branch by default.
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Serve the JSON API for a browser UI.
    Serve {
        /// Overrides `server.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub session: Session,
    pub metrics: MetricsRegistry,
    pub forge: Arc<dyn ForgeBackend>,
    /// One browser per server; its lock also serializes commits.
    pub browser: Mutex<Browser>,
    pub builder: CommitBuilder,
    pub reconciler: Reconciler,
    pub progress: watch::Receiver<ProgressSnapshot>,
}

impl AppState {
    /// Wire the browser and commit pipeline together.  Must be called inside
    /// a Tokio runtime: commit events are folded into `progress` by a
    /// background task.
    pub fn new(
        config: Arc<Config>,
        session: Session,
        forge: Arc<dyn ForgeBackend>,
        metrics: MetricsRegistry,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let progress = spawn_progress_tracker(events_rx);

        let builder =
            CommitBuilder::new(Arc::clone(&forge), &config.upload, metrics.clone()).with_events(events_tx);
        let reconciler = Reconciler::from_config(&config.reconcile, metrics.clone());

        Self {
            browser: Mutex::new(Browser::new(Arc::clone(&forge))),
            config,
            session,
            metrics,
            forge,
            builder,
            reconciler,
            progress,
        }
    }
}

fn spawn_progress_tracker(mut events: mpsc::UnboundedReceiver<CommitEvent>) -> watch::Receiver<ProgressSnapshot> {
    let (tx, rx) = watch::channel(ProgressSnapshot::default());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tx.send_modify(|snapshot| snapshot.apply(&event));
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Session plumbing
// ---------------------------------------------------------------------------

async fn require_session(store: &SessionStore) -> Result<(Session, SessionSource)> {
    store
        .load()
        .await?
        .context("not logged in; run `forgedrop login` or set the token environment variable")
}

fn connect(config: &Config, session: &Session, metrics: &MetricsRegistry) -> Result<Arc<dyn ForgeBackend>> {
    let forge = forge::build_backend(config, session, metrics)?;
    tracing::info!(backend = ?config.backend_type, api_url = %config.upstream.api_url, "forge backend initialised");
    Ok(Arc::from(forge))
}

/// Look `owner/repo` up among the repositories the token can see.
async fn find_repository(forge: &dyn ForgeBackend, full_name: &str) -> Result<Repository> {
    anyhow::ensure!(
        full_name.split('/').filter(|s| !s.is_empty()).count() == 2,
        "expected OWNER/REPO, got {full_name:?}"
    );
    forge
        .list_repositories()
        .await
        .context("failed to list repositories")?
        .into_iter()
        .find(|r| r.full_name.eq_ignore_ascii_case(full_name))
        .with_context(|| format!("repository {full_name} not found or not accessible"))
}

/// A browser showing `path` of `repo` on `branch` (default branch if `None`).
async fn open_browser(
    forge: Arc<dyn ForgeBackend>,
    repo: &str,
    branch: Option<&str>,
    path: &str,
) -> Result<Browser> {
    let repository = find_repository(forge.as_ref(), repo).await?;
    let mut browser = Browser::new(forge);
    browser.select_repository(repository).await?;
    if let Some(branch) = branch {
        browser.select_branch(branch).await?;
    }
    if !path::normalize(Some(path)).is_empty() {
        browser.open(path).await?;
    }
    Ok(browser)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn login(config: &Config, store: &SessionStore, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(t) => t,
        None => {
            eprint!("Token: ");
            BufReader::new(tokio::io::stdin())
                .lines()
                .next_line()
                .await
                .context("failed to read token from stdin")?
                .unwrap_or_default()
        }
    };
    let session = Session::new(token)?;

    let metrics = MetricsRegistry::new();
    let forge = connect(config, &session, &metrics)?;
    let user = forge
        .authenticated_user()
        .await
        .context("token was not accepted")?;

    store.save(&session).await?;
    println!("Logged in as {} (token saved to {})", user.login, store.path().display());
    Ok(())
}

async fn logout(store: &SessionStore) -> Result<()> {
    if store.clear().await? {
        println!("Logged out");
    } else {
        println!("No stored token at {}", store.path().display());
    }
    Ok(())
}

async fn whoami(forge: &dyn ForgeBackend, session: &Session, source: SessionSource) -> Result<()> {
    let user = forge.authenticated_user().await?;
    let from = match source {
        SessionSource::Env => "environment",
        SessionSource::File => "token file",
    };
    match user.name {
        Some(name) => println!("{} ({name})", user.login),
        None => println!("{}", user.login),
    }
    println!("token {} from {from}", session.fingerprint());
    Ok(())
}

async fn repos(forge: &dyn ForgeBackend) -> Result<()> {
    for repo in forge.list_repositories().await? {
        let visibility = if repo.private { "private" } else { "public" };
        println!("{:<50} {:<8} {}", repo.full_name, visibility, repo.default_branch);
    }
    Ok(())
}

async fn branches(forge: Arc<dyn ForgeBackend>, repo: &str) -> Result<()> {
    let browser = open_browser(forge, repo, None, "").await?;
    for branch in browser.branches() {
        let marker = if branch == browser.branch() { "*" } else { " " };
        println!("{marker} {branch}");
    }
    Ok(())
}

fn print_listing(browser: &Browser) {
    let trail: Vec<_> = browser.breadcrumbs().into_iter().map(|c| c.label).collect();
    println!("{} @ {}", trail.join(" / "), browser.branch());
    for entry in browser.contents() {
        if entry.is_dir() {
            println!("{:>12}  {}/", "-", entry.name);
        } else {
            println!("{:>12}  {}", entry.size, entry.name);
        }
    }
}

async fn cat(forge: Arc<dyn ForgeBackend>, repo: &str, path: &str, branch: Option<&str>) -> Result<()> {
    let browser = open_browser(forge, repo, branch, "").await?;
    let file = browser.preview_file(path).await?;
    let mut stdout = tokio::io::stdout();
    match file.preview {
        Preview::Text { text } => stdout.write_all(text.as_bytes()).await?,
        Preview::Image { media_type, .. } => {
            let line = format!("{} is an image ({media_type}, {} bytes)\n", file.path, file.size);
            stdout.write_all(line.as_bytes()).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload(
    config: &Config,
    forge: Arc<dyn ForgeBackend>,
    metrics: MetricsRegistry,
    repo: &str,
    branch: Option<String>,
    path: &str,
    message: &str,
    files: &[PathBuf],
) -> Result<()> {
    let mut candidates = Vec::with_capacity(files.len());
    for file in files {
        let candidate = UploadCandidate::from_path(file)
            .await
            .with_context(|| format!("cannot upload {}", file.display()))?;
        candidates.push(candidate);
    }

    let repository = find_repository(forge.as_ref(), repo).await?;
    let branch = branch.unwrap_or_else(|| repository.default_branch.clone());
    let target = CommitTarget::new(&repository.owner, &repository.name, branch, path);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let builder = CommitBuilder::new(Arc::clone(&forge), &config.upload, metrics.clone()).with_events(tx);

    // Report every problem in the batch, not just the first.
    let mut rejected = false;
    for candidate in &candidates {
        if let Classification::Rejected(violations) = builder.classifier().classify(candidate) {
            rejected = true;
            for violation in violations {
                eprintln!("error: {violation}");
            }
        }
    }
    anyhow::ensure!(!rejected, "nothing was uploaded");

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let CommitEvent::State { state } = event {
                eprintln!("{state}...");
            }
        }
    });
    let result = builder.commit(candidates, message, &target).await;
    drop(builder);
    let _ = printer.await;
    let outcome = result?;

    println!(
        "Committed {} file(s) to {}/{} on {} as {}",
        outcome.blobs.len(),
        target.owner,
        target.repo,
        outcome.branch,
        outcome.commit
    );

    let reconciler = Reconciler::from_config(&config.reconcile, metrics);
    let fetch = || forge.list_directory(&target.owner, &target.repo, &target.path, &target.branch);
    match reconciler.reconcile(fetch).await {
        Reconciled::Fresh { value, .. } => {
            for entry in value {
                println!("  {}{}", entry.name, if entry.is_dir() { "/" } else { "" });
            }
        }
        Reconciled::Stale => eprintln!("(listing not yet updated upstream)"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen: &str) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = listen.parse().context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();
    let serving = matches!(cli.command, Command::Serve { .. });

    // ---- Tracing ----
    let format = cli
        .log_format
        .unwrap_or(if serving { LogFormat::Json } else { LogFormat::Text });
    init_tracing(format, if serving { "info" } else { "warn" });

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);
    tracing::debug!(config_path = %cli.config.display(), "configuration loaded");

    // ---- Session ----
    let store = SessionStore::from_config(&config.session)?;
    match cli.command {
        Command::Login { token } => login(&config, &store, token).await,
        Command::Logout => logout(&store).await,
        command => run(config, &store, command).await,
    }
}

/// Every command that needs an authenticated forge backend.
async fn run(config: Arc<Config>, store: &SessionStore, command: Command) -> Result<()> {
    let (session, source) = require_session(store).await?;

    // ---- Metrics / forge backend ----
    let metrics = MetricsRegistry::new();
    let forge = connect(&config, &session, &metrics)?;

    match command {
        Command::Login { .. } | Command::Logout => unreachable!("handled before authentication"),
        Command::Whoami => whoami(forge.as_ref(), &session, source).await,
        Command::Repos => repos(forge.as_ref()).await,
        Command::Branches { repo } => branches(forge, &repo).await,
        Command::Ls { repo, path, branch } => {
            let browser = open_browser(forge, &repo, branch.as_deref(), &path).await?;
            print_listing(&browser);
            Ok(())
        }
        Command::Cat { repo, path, branch } => cat(forge, &repo, &path, branch.as_deref()).await,
        Command::Upload {
            repo,
            message,
            path,
            branch,
            files,
        } => upload(&config, forge, metrics, &repo, branch, &path, &message, &files).await,
        Command::Serve { listen } => {
            tracing::info!(fingerprint = %session.fingerprint(), "starting forgedrop server");
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let state = AppState::new(Arc::clone(&config), session, forge, metrics);
            run_http_server(state, &listen).await?;
            tracing::info!("forgedrop shut down cleanly");
            Ok(())
        }
    }
}
