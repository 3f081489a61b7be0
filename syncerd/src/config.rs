use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::registry::Vendor;

const APP_DIR_NAME: &str = "syncer";
const DATABASE_FILE_NAME: &str = "syncer.db";
const CLIENT_SECRET_FILE_NAME: &str = "client_secret.json";
const DEFAULT_SYNC_DIR_NAME: &str = "syncer";
const DEFAULT_DAEMON_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_OAUTH_PORT: u16 = 3333;
const DEFAULT_OAUTH_TIMEOUT_SECS: u64 = 180;

/// Runtime settings shared by the CLI and the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncerConfig {
    pub config_dir: PathBuf,
    pub client_secret_path: PathBuf,
    pub sync_dir: PathBuf,
    pub daemon_interval: Duration,
    pub http_timeout: Duration,
    pub oauth_port: u16,
    pub oauth_timeout: Duration,
    pub drive_base_url: Option<String>,
}

impl SyncerConfig {
    /// Defaults rooted at explicit directories.
    pub fn new(config_dir: impl Into<PathBuf>, sync_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            client_secret_path: config_dir.join(CLIENT_SECRET_FILE_NAME),
            config_dir,
            sync_dir: sync_dir.into(),
            daemon_interval: Duration::from_secs(DEFAULT_DAEMON_INTERVAL_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            oauth_port: DEFAULT_OAUTH_PORT,
            oauth_timeout: Duration::from_secs(DEFAULT_OAUTH_TIMEOUT_SECS),
            drive_base_url: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let config_base = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        Ok(Self::from_lookup(
            |name| std::env::var(name).ok(),
            &home,
            &config_base,
        ))
    }

    fn from_lookup<F>(lookup: F, home: &Path, config_base: &Path) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let config_dir = non_empty("SYNCER_CONFIG_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| config_base.join(APP_DIR_NAME));
        let sync_dir = non_empty("SYNCER_SYNC_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));

        let mut config = Self::new(config_dir, sync_dir);
        if let Some(path) = non_empty("SYNCER_CLIENT_SECRET") {
            config.client_secret_path = expand_with_home(&path, home);
        }
        config.daemon_interval = Duration::from_secs(parse_positive(
            non_empty("SYNCER_DAEMON_INTERVAL_SECS"),
            DEFAULT_DAEMON_INTERVAL_SECS,
        ));
        config.http_timeout = Duration::from_secs(parse_positive(
            non_empty("SYNCER_HTTP_TIMEOUT_SECS"),
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));
        config.oauth_port = non_empty("SYNCER_OAUTH_PORT")
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|port| *port > 0)
            .unwrap_or(DEFAULT_OAUTH_PORT);
        config.oauth_timeout = Duration::from_secs(parse_positive(
            non_empty("SYNCER_OAUTH_TIMEOUT_SECS"),
            DEFAULT_OAUTH_TIMEOUT_SECS,
        ));
        config.drive_base_url = non_empty("SYNCER_DRIVE_BASE_URL");
        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join(DATABASE_FILE_NAME)
    }

    pub fn token_path(&self, vendor: Vendor) -> PathBuf {
        self.config_dir.join(vendor.token_file_name())
    }

    /// Where `add` places a file when the user gives no local path.
    pub fn default_local_path(&self, vendor: Vendor, remote_name: &str) -> PathBuf {
        self.sync_dir.join(vendor.dir_name()).join(remote_name)
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn parse_positive(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> SyncerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncerConfig::from_lookup(
            |name| vars.get(name).cloned(),
            Path::new("/home/user"),
            Path::new("/home/user/.config"),
        )
    }

    #[test]
    fn defaults_follow_home_and_config_dirs() {
        let config = config_from(&[]);
        assert_eq!(config.config_dir, PathBuf::from("/home/user/.config/syncer"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/home/user/.config/syncer/syncer.db")
        );
        assert_eq!(
            config.token_path(Vendor::GoogleDrive),
            PathBuf::from("/home/user/.config/syncer/google_token.json")
        );
        assert_eq!(
            config.client_secret_path,
            PathBuf::from("/home/user/.config/syncer/client_secret.json")
        );
        assert_eq!(config.daemon_interval, Duration::from_secs(900));
        assert_eq!(config.oauth_port, 3333);
        assert_eq!(config.oauth_timeout, Duration::from_secs(180));
        assert!(config.drive_base_url.is_none());
    }

    #[test]
    fn default_local_path_lives_under_vendor_dir() {
        let config = config_from(&[]);
        assert_eq!(
            config.default_local_path(Vendor::GoogleDrive, "MainPasswords.kdbx"),
            PathBuf::from("/home/user/syncer/google-drive/MainPasswords.kdbx")
        );
    }

    #[test]
    fn env_overrides_are_applied_and_tilde_expanded() {
        let config = config_from(&[
            ("SYNCER_CONFIG_DIR", "~/cfg"),
            ("SYNCER_SYNC_DIR", "/data/sync"),
            ("SYNCER_CLIENT_SECRET", "~/secret.json"),
            ("SYNCER_DAEMON_INTERVAL_SECS", "60"),
            ("SYNCER_OAUTH_PORT", "4444"),
            ("SYNCER_DRIVE_BASE_URL", "http://127.0.0.1:9000"),
        ]);
        assert_eq!(config.config_dir, PathBuf::from("/home/user/cfg"));
        assert_eq!(config.sync_dir, PathBuf::from("/data/sync"));
        assert_eq!(
            config.client_secret_path,
            PathBuf::from("/home/user/secret.json")
        );
        assert_eq!(config.daemon_interval, Duration::from_secs(60));
        assert_eq!(config.oauth_port, 4444);
        assert_eq!(
            config.drive_base_url.as_deref(),
            Some("http://127.0.0.1:9000")
        );
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("SYNCER_HTTP_TIMEOUT_SECS", "0"),
            ("SYNCER_OAUTH_TIMEOUT_SECS", "soon"),
            ("SYNCER_OAUTH_PORT", "99999"),
        ]);
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert_eq!(config.oauth_timeout, Duration::from_secs(180));
        assert_eq!(config.oauth_port, 3333);
    }
}
