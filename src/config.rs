//! Configuration loaded from a TOML file.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::entity::SourceType;
use crate::error::ImportError;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Source instance the entities are imported from.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL, e.g. `https://gitlab.example.com`
    pub url: String,
    /// Personal access token. Prefer `access_token_env`.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Environment variable holding the access token.
    #[serde(default)]
    pub access_token_env: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("url", &self.url)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("access_token_env", &self.access_token_env)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl SourceConfig {
    /// Resolves the access token from the file or the environment.
    pub fn resolve_token(&self) -> Result<SecretString, ImportError> {
        if let Some(token) = &self.access_token {
            return Ok(SecretString::from(token.clone()));
        }
        if let Some(var) = &self.access_token_env {
            return std::env::var(var).map(SecretString::from).map_err(|_| {
                ImportError::Configuration(format!("environment variable {var} is not set"))
            });
        }
        Err(ImportError::Configuration(
            "source.access_token or source.access_token_env is required".into(),
        ))
    }
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bulk_imports.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

/// Where mirrored repositories (wikis, project repositories) are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    #[serde(default = "default_repositories_root")]
    pub root: PathBuf,
}

fn default_repositories_root() -> PathBuf {
    PathBuf::from("repositories")
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self { root: default_repositories_root() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Pipelines executed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How often the poll loop re-dispatches active entities.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Page size requested from the source API.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_page_size() -> u32 {
    100
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Backoff policy for transient pipeline failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Dispatch attempts per page before the tracker is failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleConfig {
    /// A `created`/`started` tracker untouched for this long is timed out.
    #[serde(default = "default_stale_window")]
    pub window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_stale_window() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            window_secs: default_stale_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StaleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Rules applied to URLs fetched during the load phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlPolicyConfig {
    #[serde(default = "default_schemes")]
    pub schemes: Vec<String>,
    /// Empty means any port.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub allow_localhost: bool,
    #[serde(default)]
    pub allow_local_network: bool,
    #[serde(default)]
    pub ascii_only: bool,
    #[serde(default)]
    pub enforce_user: bool,
}

fn default_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

impl Default for UrlPolicyConfig {
    fn default() -> Self {
        Self {
            schemes: default_schemes(),
            ports: Vec::new(),
            allow_localhost: false,
            allow_local_network: false,
            ascii_only: false,
            enforce_user: false,
        }
    }
}

/// A feature flag, on globally or for a set of root namespaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlagConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Root namespaces the flag is enabled for, regardless of `enabled`.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Optional stage contributors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Adds the group wiki pipeline to group imports.
    #[serde(default)]
    pub group_wiki: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

/// One entry of the import manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// `group` or `project`
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub source_full_path: String,
    #[serde(default)]
    pub destination_namespace: String,
    pub destination_name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub repositories: RepositoriesConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stale: StaleConfig,
    #[serde(default)]
    pub url_policy: UrlPolicyConfig,
    #[serde(default)]
    pub feature_flags: HashMap<String, FeatureFlagConfig>,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ImportError::Configuration(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ImportError::Configuration(msg) => {
                ImportError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ImportError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ImportError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<(), ImportError> {
        let mut errors: Vec<String> = Vec::new();

        match url::Url::parse(&self.source.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!("source.url scheme {} is not http(s)", url.scheme())),
            Err(e) => errors.push(format!("source.url is invalid: {e}")),
        }
        if self.source.access_token.is_none() && self.source.access_token_env.is_none() {
            errors.push("source.access_token or source.access_token_env is required".into());
        }
        if self.source.request_timeout_secs == 0 {
            errors.push("source.request_timeout_secs must be positive".into());
        }

        if self.workers.concurrency == 0 {
            errors.push("workers.concurrency must be positive".into());
        }
        if self.workers.page_size == 0 {
            errors.push("workers.page_size must be positive".into());
        }
        if self.workers.poll_interval_ms == 0 {
            errors.push("workers.poll_interval_ms must be positive".into());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be positive".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms must be <= retry.max_delay_ms".into());
        }

        if self.stale.window_secs == 0 {
            errors.push("stale.window_secs must be positive".into());
        }
        if self.stale.sweep_interval_secs == 0 {
            errors.push("stale.sweep_interval_secs must be positive".into());
        }

        if self.url_policy.schemes.is_empty() {
            errors.push("url_policy.schemes must not be empty".into());
        }

        for (i, entity) in self.entities.iter().enumerate() {
            if entity.source_full_path.trim().is_empty() {
                errors.push(format!("entities[{i}].source_full_path can't be blank"));
            }
            if entity.destination_name.trim().is_empty() {
                errors.push(format!("entities[{i}].destination_name can't be blank"));
            }
            if entity.source_type == SourceType::ProjectEntity
                && entity.destination_namespace.trim().is_empty()
            {
                errors.push(format!(
                    "entities[{i}].destination_namespace is required for projects"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Configuration(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const MINIMAL: &str = r#"
        [source]
        url = "https://gitlab.example.com"
        access_token = "glpat-test"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.database.path, PathBuf::from("bulk_imports.db"));
        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.workers.page_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.stale.window_secs, 86_400);
        assert_eq!(config.url_policy.schemes, vec!["http", "https"]);
        assert!(!config.url_policy.allow_localhost);
        assert!(!config.stages.group_wiki);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.entities.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml(
            r#"
            [source]
            url = "https://gitlab.example.com"
            access_token_env = "SOURCE_TOKEN"

            [workers]
            concurrency = 8

            [retry]
            max_attempts = 3
            base_delay_ms = 10
            max_delay_ms = 100

            [url_policy]
            allow_local_network = true
            ports = [443]

            [feature_flags.bulk_import_projects]
            namespaces = ["acme"]

            [stages]
            group_wiki = true

            [logging]
            format = "json"
            level = "debug"

            [[entities]]
            type = "group_entity"
            source_full_path = "acme/platform"
            destination_namespace = "imported"
            destination_name = "platform"

            [[entities]]
            type = "project"
            source_full_path = "acme/app"
            destination_namespace = "imported"
            destination_name = "app"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.url_policy.allow_local_network);
        assert_eq!(config.url_policy.ports, vec![443]);
        assert_eq!(
            config.feature_flags["bulk_import_projects"].namespaces,
            vec!["acme".to_string()]
        );
        assert!(config.stages.group_wiki);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.entities.len(), 2);
        assert_eq!(config.entities[1].source_type, SourceType::ProjectEntity);
    }

    #[test]
    fn validate_collects_all_errors() {
        let err = Config::from_toml(
            r#"
            [source]
            url = "ftp://gitlab.example.com"

            [workers]
            concurrency = 0

            [retry]
            max_attempts = 0
            "#,
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("scheme ftp"), "{msg}");
        assert!(msg.contains("access_token"), "{msg}");
        assert!(msg.contains("workers.concurrency"), "{msg}");
        assert!(msg.contains("retry.max_attempts"), "{msg}");
    }

    #[test]
    fn validate_rejects_project_without_namespace() {
        let err = Config::from_toml(&format!(
            r#"{MINIMAL}
            [[entities]]
            type = "project_entity"
            source_full_path = "acme/app"
            destination_name = "app"
            "#
        ))
        .unwrap_err();
        assert!(err.to_string().contains("destination_namespace"));
    }

    #[test]
    fn resolve_token_prefers_inline_value() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.source.resolve_token().unwrap().expose_secret(), "glpat-test");
    }

    #[test]
    fn resolve_token_reports_missing_env_var() {
        let source = SourceConfig {
            url: "https://gitlab.example.com".into(),
            access_token: None,
            access_token_env: Some("BULK_IMPORTS_TEST_TOKEN_THAT_IS_NOT_SET".into()),
            request_timeout_secs: 30,
        };
        let err = source.resolve_token().unwrap_err();
        assert!(err.to_string().contains("BULK_IMPORTS_TEST_TOKEN_THAT_IS_NOT_SET"));
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let debug = format!("{:?}", config.source);
        assert!(!debug.contains("glpat-test"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/bulk-imports.toml")).unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }
}
