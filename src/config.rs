use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub matcher: MatcherConfig,

    #[serde(default)]
    pub geolocation: GeolocationConfig,

    #[serde(default)]
    pub subnets: SubnetConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/crsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("crsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.general.db_path)
    }

    /// Get the log directory
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.log_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory holding auth.log* and fail2ban.log*
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Only count sshd lines logged under this host name
    #[serde(default)]
    pub host_name: Option<String>,

    /// Only count bans from this fail2ban jail
    #[serde(default)]
    pub ban_jail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationConfig {
    /// Look up locations of new addresses (false = offline mode)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// ip-city endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API key for the endpoint
    #[serde(default)]
    pub api_key: Option<String>,

    /// Seconds to wait after each lookup
    #[serde(default = "default_request_delay")]
    pub request_delay_secs: u64,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_api_url(),
            api_key: None,
            request_delay_secs: default_request_delay(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Attempts needed before an address takes part in clustering
    #[serde(default = "default_min_attempts")]
    pub min_attempts: u32,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            min_attempts: default_min_attempts(),
        }
    }
}

fn default_db_path() -> String {
    "/var/lib/crsentry/crsentry.db".to_string()
}

fn default_log_dir() -> String {
    "/var/log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_url() -> String {
    "http://api.ipinfodb.com/v3/ip-city/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_delay() -> u64 {
    2
}

fn default_timeout() -> u64 {
    10
}

fn default_min_attempts() -> u32 {
    3
}
