use crate::database::ConnectionSettings;
use crate::monitoring::{AlertRule, MonitoringSettings, NotificationChannel};
use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct PolystoreConfig {
    /// Directory holding the embedded database and its backups
    pub data_dir: String,

    /// File name of the embedded database inside `data_dir`
    pub database_file: String,

    /// Snapshot directory; defaults to `<data_dir>/backups`
    pub backup_dir: Option<String>,

    /// Snapshots kept by scheduled backups (default: 7)
    pub backup_keep: usize,

    /// SQLite busy timeout in milliseconds (default: 5000)
    pub busy_timeout_ms: u64,

    /// SQLite page cache in KiB (default: 64000)
    pub cache_size_kib: i64,

    /// SQLite memory-map size in bytes (default: 256 MiB)
    pub mmap_size: u64,

    /// Metrics kept in memory (default: 1000)
    pub metrics_capacity: usize,

    /// Metrics older than this are pruned (default: 1 hour)
    pub metrics_max_age_secs: u64,

    /// Operations slower than this count as slow queries (default: 1000)
    pub slow_query_ms: u64,

    /// Webhook receiving alert notifications
    pub alert_webhook_url: Option<String>,
}

const EMPTY_CONFIG: &str = r#"### polystore configuration file

### directory for the embedded database and snapshots
# data_dir = "~/.polystore"
# database_file = "polystore.sqlite3"

### file snapshots
# backup_dir = "~/.polystore/backups"
# backup_keep = 7

### sqlite tuning
# busy_timeout_ms = 5000
# cache_size_kib = 64000
# mmap_size = 268435456

### monitoring
# metrics_capacity = 1000
# metrics_max_age_secs = 3600       # 1 hour
# slow_query_ms = 1000
# alert_webhook_url = "https://hooks.example.com/polystore"
"#;

fn home_dir() -> String {
    dirs::home_dir()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string())
}

impl Default for PolystoreConfig {
    fn default() -> Self {
        Self {
            data_dir: format!("{}/.polystore", home_dir()),
            database_file: "polystore.sqlite3".to_string(),
            backup_dir: None,
            backup_keep: 7,
            busy_timeout_ms: 5000,
            cache_size_kib: 64000,
            mmap_size: 268_435_456,
            metrics_capacity: 1000,
            metrics_max_age_secs: 3600,
            slow_query_ms: 1000,
            alert_webhook_url: None,
        }
    }
}

impl PolystoreConfig {
    /// Load the configuration file (creating it from a template when absent)
    /// and apply `POLYSTORE_*` environment overrides
    pub fn new(path: &Option<String>) -> Result<PolystoreConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                let polystore_dir = format!("{}/.polystore", home_dir());
                std::fs::create_dir_all(polystore_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create polystore directory: {}", e))?;
                let p = Self::config_file_path();
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // E.g., `POLYSTORE_DATA_DIR=/var/lib/polystore polystore status`
        builder = builder.add_source(config::Environment::with_prefix("POLYSTORE"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_values(&values)
    }

    /// Build from flat key/value pairs; unknown keys are ignored and
    /// unparsable numbers are errors
    pub fn from_values(values: &HashMap<String, String>) -> Result<PolystoreConfig> {
        let defaults = PolystoreConfig::default();

        fn parse<T: std::str::FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
            match values.get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("Invalid value for {}: '{}'", key, raw)),
                None => Ok(default),
            }
        }

        let data_dir = match values.get("data_dir") {
            Some(dir) => expand_home(dir),
            None => defaults.data_dir,
        };

        Ok(PolystoreConfig {
            data_dir,
            database_file: values
                .get("database_file")
                .cloned()
                .unwrap_or(defaults.database_file),
            backup_dir: values.get("backup_dir").map(|d| expand_home(d)),
            backup_keep: parse(values, "backup_keep", defaults.backup_keep)?,
            busy_timeout_ms: parse(values, "busy_timeout_ms", defaults.busy_timeout_ms)?,
            cache_size_kib: parse(values, "cache_size_kib", defaults.cache_size_kib)?,
            mmap_size: parse(values, "mmap_size", defaults.mmap_size)?,
            metrics_capacity: parse(values, "metrics_capacity", defaults.metrics_capacity)?,
            metrics_max_age_secs: parse(values, "metrics_max_age_secs", defaults.metrics_max_age_secs)?,
            slow_query_ms: parse(values, "slow_query_ms", defaults.slow_query_ms)?,
            alert_webhook_url: values
                .get("alert_webhook_url")
                .filter(|u| !u.trim().is_empty())
                .cloned(),
        })
    }

    /// A configuration rooted at `data_dir`, everything else default
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> PolystoreConfig {
        PolystoreConfig {
            data_dir: data_dir.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    /// Get the path to the SQLite database file
    pub fn sqlite_path(&self) -> PathBuf {
        Path::new(self.data_dir.trim_end_matches('/')).join(&self.database_file)
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(self.data_dir.trim_end_matches('/')).join("backups"),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            cache_size: -self.cache_size_kib.abs(),
            busy_timeout_ms: self.busy_timeout_ms,
            mmap_size: self.mmap_size,
            ..Default::default()
        }
    }

    pub fn monitoring_settings(&self) -> MonitoringSettings {
        MonitoringSettings {
            capacity: self.metrics_capacity,
            max_age: Duration::from_secs(self.metrics_max_age_secs),
            slow_query_ms: self.slow_query_ms as f64,
        }
    }

    /// Default alert rules, with the webhook attached when configured
    pub fn alert_rules(&self) -> Vec<AlertRule> {
        crate::monitoring::default_alert_rules()
            .into_iter()
            .map(|rule| match &self.alert_webhook_url {
                Some(url) => rule.with_channel(NotificationChannel::Webhook { url: url.clone() }),
                None => rule,
            })
            .collect()
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Data Directory:     {}", self.data_dir),
            format!("SQLite Path:        {}", self.sqlite_path().display()),
            format!("Backup Directory:   {}", self.backup_dir().display()),
            format!("Backups Kept:       {}", self.backup_keep),
            format!("Busy Timeout:       {} ms", self.busy_timeout_ms),
            format!("Cache Size:         {} KiB", self.cache_size_kib),
            format!("Metrics Capacity:   {}", self.metrics_capacity),
            format!("Metrics Max Age:    {} seconds", self.metrics_max_age_secs),
            format!("Slow Query:         {} ms", self.slow_query_ms),
        ];
        if let Some(url) = &self.alert_webhook_url {
            lines.push(format!("Alert Webhook:      {}", url));
        }
        lines.join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        format!("{}/.polystore/polystore.toml", home_dir())
    }
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~") {
        Some(rest) => format!("{}{}", home_dir(), rest),
        None => path.to_string(),
    }
}
