use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Backend type
// ---------------------------------------------------------------------------

/// Which upstream forge flavour to talk to.
///
/// Both variants speak the GitHub REST git data API (`/git/blobs`,
/// `/git/trees`, `/git/commits`, `/git/refs`).  They differ only in the API
/// root and the media type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    /// GitHub.com / GitHub Enterprise Cloud.
    #[default]
    Github,
    /// GitHub Enterprise Server (self-hosted, `https://host/api/v3`).
    GithubEnterprise,
}

impl BackendType {
    /// Returns the `Accept` header value for API requests to this backend.
    pub fn accept_header(&self) -> &'static str {
        match self {
            Self::Github => "application/vnd.github+json",
            Self::GithubEnterprise => "application/vnd.github.v3+json",
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend_type: BackendType,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the upstream API root (e.g. `https://ghe.corp.example.com/api/v3`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// `User-Agent` sent with every API request.  GitHub rejects requests
    /// without one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout applied by the HTTP client.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Minimum number of API calls to keep in reserve before self-throttling.
    #[serde(default = "default_api_rate_limit_buffer")]
    pub api_rate_limit_buffer: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            api_rate_limit_buffer: default_api_rate_limit_buffer(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    format!("forgedrop/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> u64 {
    120
}

fn default_api_rate_limit_buffer() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// How the branch ref is moved once the new commit exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefUpdateMode {
    /// Force the ref to the new commit.  Last writer wins: a commit pushed
    /// by someone else between fetching the tip and updating the ref is
    /// silently dropped from the branch.
    #[default]
    Force,
    /// Send a non-forced update.  The new commit's only parent is the tip
    /// read at the start of the attempt, so the host rejects the update if
    /// the branch moved in the meantime.
    FastForward,
}

impl RefUpdateMode {
    pub fn force(&self) -> bool {
        matches!(self, Self::Force)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Ceiling on a single file's size in bytes.  Files strictly larger are
    /// rejected.  This is the object-creation limit of the API transport,
    /// which sees the base64 form of the content.
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,
    /// Optional stricter client-side ceiling in bytes.
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub ref_update: RefUpdateMode,
    /// Ceiling on a whole multipart commit request served over HTTP.
    /// Defaults to four files at `size_limit`.
    #[serde(default)]
    pub max_request_bytes: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            max_file_size: None,
            ref_update: RefUpdateMode::default(),
            max_request_bytes: None,
        }
    }
}

fn default_size_limit() -> u64 {
    100 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Post-commit refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Delay before the first listing re-fetch after a commit.
    #[serde(default = "default_first_delay")]
    pub first_delay_ms: u64,
    /// Delay before the second (and last) re-fetch, if the first failed.
    #[serde(default = "default_second_delay")]
    pub second_delay_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            first_delay_ms: default_first_delay(),
            second_delay_ms: default_second_delay(),
        }
    }
}

fn default_first_delay() -> u64 {
    500
}

fn default_second_delay() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Where the bearer token is persisted.  Defaults to
    /// `$XDG_CONFIG_HOME/forgedrop/token` (or `~/.config/forgedrop/token`).
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    /// Name of an environment variable that, when set, supplies the token
    /// instead of the token file.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_path: None,
            token_env: default_token_env(),
        }
    }
}

impl SessionConfig {
    /// Resolve the token file location.
    pub fn resolved_token_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.token_path {
            return Ok(path.clone());
        }
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = std::env::var_os("HOME")
                    .context("neither XDG_CONFIG_HOME nor HOME is set; configure session.token_path")?;
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join("forgedrop").join("token"))
    }
}

fn default_token_env() -> String {
    "FORGEDROP_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `127.0.0.1:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
///
/// A missing file yields the defaults; an unreadable or malformed one is an
/// error.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        validate_config(&config)?;
        return Ok(config);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate YAML configuration text.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes to unit, not to an empty mapping.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.upload.size_limit > 0, "upload.size_limit must be positive");
    if let Some(max) = config.upload.max_file_size {
        anyhow::ensure!(max > 0, "upload.max_file_size must be positive");
    }
    if let Some(max) = config.upload.max_request_bytes {
        anyhow::ensure!(max > 0, "upload.max_request_bytes must be positive");
    }
    anyhow::ensure!(
        config.upstream.api_url.starts_with("http://") || config.upstream.api_url.starts_with("https://"),
        "upstream.api_url must be an http(s) URL"
    );
    anyhow::ensure!(
        config.upstream.request_timeout_secs > 0,
        "upstream.request_timeout_secs must be positive"
    );
    anyhow::ensure!(!config.session.token_env.is_empty(), "session.token_env must not be empty");
    Ok(())
}
