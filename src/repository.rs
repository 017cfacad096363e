//! Local repository storage for mirrored git data (wikis, project repositories).

use std::path::{Component, Path, PathBuf};

use base64::Engine;
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::info;
use url::Url;

use crate::error::{sanitize_message, ImportError};

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Basic-auth credentials for fetching from the source.
///
/// Kept out of the fetch URL so they never appear in process arguments.
#[derive(Debug)]
pub struct GitCredentials {
    pub username: String,
    password: SecretString,
}

impl GitCredentials {
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Value for git's `http.extraHeader`.
    pub fn authorization_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!(
            "Authorization: Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RepositoryStore Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for repositories fetched from the source instance.
///
/// `path` is the destination full path of the repository, e.g.
/// `imported/app.wiki`.
pub trait RepositoryStore: Send + Sync {
    /// Creates the repository if it does not exist yet.
    fn ensure_repository<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(), ImportError>>;

    /// Fetches every ref of `url` into the repository, overwriting local refs.
    /// `url` carries no userinfo; credentials travel separately.
    fn fetch_as_mirror<'a>(
        &'a self,
        path: &'a str,
        url: &'a Url,
        credentials: Option<&'a GitCredentials>,
    ) -> BoxFuture<'a, Result<(), ImportError>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// GitRepositoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// Bare repositories under a root directory, driven by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitRepositoryStore {
    root: PathBuf,
}

impl GitRepositoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a repository. Rejects paths escaping the root.
    pub fn repository_dir(&self, path: &str) -> Result<PathBuf, ImportError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ImportError::Repository(format!("Invalid repository path: {path}")));
        }
        Ok(self.root.join(format!("{path}.git")))
    }

    fn command(args: &[&str], credentials: Option<&GitCredentials>) -> Command {
        let mut command = Command::new("git");
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(credentials) = credentials {
            command
                .env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", credentials.authorization_header());
        }
        command
    }

    async fn git(
        &self,
        args: &[&str],
        credentials: Option<&GitCredentials>,
        fallback: &str,
    ) -> Result<(), ImportError> {
        let output = Self::command(args, credentials)
            .output()
            .await
            .map_err(|e| ImportError::Repository(format!("Failed to run git: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let first_line = stderr.lines().next().unwrap_or_default();
        Err(ImportError::Repository(sanitize_message(first_line, fallback)))
    }
}

impl RepositoryStore for GitRepositoryStore {
    fn ensure_repository<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let dir = self.repository_dir(path)?;
            if dir.join("HEAD").exists() {
                return Ok(());
            }

            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                ImportError::Repository(format!("Failed to create repository directory: {e}"))
            })?;

            let dir_str = dir.to_string_lossy();
            self.git(&["init", "--bare", "--quiet", &dir_str], None, "git init failed")
                .await?;

            info!("[REPOSITORY] Created {}", path);
            Ok(())
        })
    }

    fn fetch_as_mirror<'a>(
        &'a self,
        path: &'a str,
        url: &'a Url,
        credentials: Option<&'a GitCredentials>,
    ) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let dir = self.repository_dir(path)?;
            let dir_str = dir.to_string_lossy();

            self.git(
                &[
                    "-C",
                    &dir_str,
                    "fetch",
                    "--quiet",
                    "--prune",
                    "--force",
                    url.as_str(),
                    "+refs/*:refs/*",
                ],
                credentials,
                "git fetch failed",
            )
            .await?;

            info!("[REPOSITORY] Mirrored {}", path);
            Ok(())
        })
    }
}
