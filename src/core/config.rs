use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "reconciler.toml";
/// Longest lock lease accepted from configuration (one week).
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub postmark: PostmarkConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Adjustments made while loading, reported once logging is up.
    #[serde(skip)]
    notices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Path to the shared SQLite file. Relative paths resolve against the data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostmarkConfig {
    #[serde(default)]
    pub server_token: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// How long a lease survives without release before another instance may take it over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file name inside the data dir. Unset means stdout only.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_base_url() -> String {
    "https://api.postmarkapp.com".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_page_size() -> u32 {
    500
}
fn default_lease_secs() -> u64 {
    60 * 60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PostmarkConfig {
    fn default() -> Self {
        Self {
            server_token: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            page_size: default_page_size(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str::<AppConfig>(&content)?
        } else {
            AppConfig::default()
        };
        config.apply_env();
        config.clamp_values();
        Ok(config)
    }

    fn clamp_values(&mut self) {
        let requested = self.lock.lease_secs;
        let clamped = requested.clamp(1, MAX_LEASE_SECS);
        if clamped != requested {
            self.lock.lease_secs = clamped;
            self.notices.push(format!(
                "lock.lease_secs = {} is out of range, using {}s",
                requested, clamped
            ));
        }
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("POSTMARK_SERVER_TOKEN")
            && !token.trim().is_empty()
        {
            self.postmark.server_token = Some(token.trim().to_string());
        }
        if let Ok(level) = std::env::var("RECONCILER_LOG")
            && !level.trim().is_empty()
        {
            self.logging.level = level.trim().to_string();
        }
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        match &self.database.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => data_dir.join(p),
            None => data_dir.join("reconciler.db"),
        }
    }

    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .parse::<tracing::Level>()
            .unwrap_or(tracing::Level::INFO)
    }

    pub fn describe(&self) {
        info!(
            "Loaded config: postmark={} (token {}), lock lease={}s, log level={}",
            self.postmark.base_url,
            if self.postmark.server_token.is_some() {
                "set"
            } else {
                "missing"
            },
            self.lock.lease_secs,
            self.logging.level
        );
        for notice in &self.notices {
            warn!("{}", notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.postmark.base_url, "https://api.postmarkapp.com");
        assert_eq!(config.postmark.max_retries, 3);
        assert_eq!(config.postmark.page_size, 500);
        assert_eq!(config.lock.lease_secs, 3600);
        assert_eq!(config.log_level(), tracing::Level::INFO);
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(tmpdir.path()).await.unwrap();
        assert_eq!(config.postmark.retry_base_ms, 500);
        assert_eq!(
            config.database_path(tmpdir.path()),
            tmpdir.path().join("reconciler.db")
        );
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let content = r#"
[database]
path = "shared/recon.db"

[postmark]
server_token = "abc"
max_retries = 5

[logging]
level = "debug"
"#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.postmark.server_token.as_deref(), Some("abc"));
        assert_eq!(config.postmark.max_retries, 5);
        assert_eq!(config.postmark.page_size, 500);
        assert_eq!(config.lock.lease_secs, 3600);
        assert_eq!(config.log_level(), tracing::Level::DEBUG);
        assert_eq!(
            config.database_path(Path::new("/data")),
            PathBuf::from("/data/shared/recon.db")
        );
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let mut config = AppConfig::default();
        config.logging.level = "chatty".to_string();
        assert_eq!(config.log_level(), tracing::Level::INFO);
    }

    #[tokio::test]
    async fn out_of_range_lease_is_clamped_on_load() {
        let tmpdir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            tmpdir.path().join(CONFIG_FILE_NAME),
            "[lock]\nlease_secs = 10000000000000\n",
        )
        .await
        .unwrap();
        let config = AppConfig::load(tmpdir.path()).await.unwrap();
        assert_eq!(config.lock.lease_secs, MAX_LEASE_SECS);
        assert_eq!(config.notices.len(), 1);

        tokio::fs::write(tmpdir.path().join(CONFIG_FILE_NAME), "[lock]\nlease_secs = 0\n")
            .await
            .unwrap();
        let config = AppConfig::load(tmpdir.path()).await.unwrap();
        assert_eq!(config.lock.lease_secs, 1);
    }

    #[tokio::test]
    async fn in_range_lease_is_kept_silently() {
        let tmpdir = tempfile::tempdir().unwrap();
        tokio::fs::write(tmpdir.path().join(CONFIG_FILE_NAME), "[lock]\nlease_secs = 900\n")
            .await
            .unwrap();
        let config = AppConfig::load(tmpdir.path()).await.unwrap();
        assert_eq!(config.lock.lease_secs, 900);
        assert!(config.notices.is_empty());
    }
}
