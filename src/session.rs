//! Bearer-token session and its on-disk store.
//!
//! The token is the only durable local state.  It is read once at start-up
//! ([`SessionStore::load`]), written on login and removed on logout.  Nothing
//! else reads it from ambient state: the loaded [`Session`] is handed to the
//! forge backend explicitly.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::SessionConfig;

/// An authenticated session: an opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    /// Wrap a token, trimming surrounding whitespace.  Empty tokens are
    /// rejected.
    pub fn new(token: impl AsRef<str>) -> Result<Self> {
        let token = token.as_ref().trim();
        anyhow::ensure!(!token.is_empty(), "token must not be empty");
        Ok(Self {
            token: token.to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Short SHA-256 fingerprint of the token, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Where a loaded session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Env,
    File,
}

/// File-backed token storage with an environment-variable override.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    env_var: String,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, env_var: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            env_var: env_var.into(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Ok(Self::new(config.resolved_token_path()?, config.token_env.clone()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted session, preferring the environment override.
    pub async fn load(&self) -> Result<Option<(Session, SessionSource)>> {
        if let Ok(token) = std::env::var(&self.env_var) {
            if !token.trim().is_empty() {
                let session = Session::new(token)?;
                debug!(env = %self.env_var, fingerprint = %session.fingerprint(), "session loaded from environment");
                return Ok(Some((session, SessionSource::Env)));
            }
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read token file: {}", self.path.display()))
            }
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }
        let session = Session::new(contents)?;
        debug!(path = %self.path.display(), fingerprint = %session.fingerprint(), "session loaded from file");
        Ok(Some((session, SessionSource::File)))
    }

    /// Persist `session`, replacing any previous token atomically.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let path = self.path.clone();
        let token = session.token().to_string();

        tokio::task::spawn_blocking(move || write_token(&path, &token))
            .await
            .context("token writer task failed")??;

        info!(path = %self.path.display(), fingerprint = %session.fingerprint(), "session saved");
        Ok(())
    }

    /// Remove the persisted token.  Returns `true` if one was present.
    pub async fn clear(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "session cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove token file: {}", self.path.display())),
        }
    }
}

/// Write the token through a temp file in the same directory so that a
/// crash never leaves a truncated token behind.
fn write_token(path: &Path, token: &str) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create token directory: {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("failed to create temp token file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.write_all(token.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to persist token file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        // An env var name nobody sets, so the file path is exercised.
        SessionStore::new(dir.path().join("nested/token"), "FORGEDROP_TEST_UNSET_TOKEN_VAR")
    }

    #[test]
    fn rejects_blank_token() {
        assert!(Session::new("   ").is_err());
        assert_eq!(Session::new("  abc \n").unwrap().token(), "abc");
    }

    #[test]
    fn debug_output_hides_token() {
        let session = Session::new("ghp_supersecret").unwrap();
        let debug = format!("{session:?}");
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains(&session.fingerprint()));
        assert_eq!(session.fingerprint().len(), 12);
    }

    #[test]
    fn authorization_header() {
        assert_eq!(Session::new("t0k").unwrap().authorization(), "Bearer t0k");
    }

    #[tokio::test]
    async fn load_without_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_load_clear_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let session = Session::new("ghp_abc123").unwrap();

        store.save(&session).await.unwrap();
        let (loaded, source) = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(source, SessionSource::File);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(store.clear().await.unwrap());
        assert!(!store.clear().await.unwrap());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&Session::new("first").unwrap()).await.unwrap();
        store.save(&Session::new("second").unwrap()).await.unwrap();
        let (loaded, _) = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.token(), "second");
    }
}
