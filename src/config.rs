use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from dms.toml.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DmsConfig {
    pub switch: SwitchSection,
    pub http: HttpConfig,
    pub actions: ActionsConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwitchSection {
    /// Interval to wait for a postpone: "500ms", "10s", "2m" or bare seconds.
    pub ttl: String,
    /// Consecutive missed intervals tolerated before triggering.
    pub misses: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address, or just a port.
    pub address: String,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionsConfig {
    /// Commands to run, in order, when the switch triggers.
    pub exec: Vec<String>,
    /// Working directory for every command.
    pub dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            ttl: "1m".to_string(),
            misses: 0,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for `DmsConfig`.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A duration did not match the accepted grammar.
    InvalidDuration(String),
    /// No exec commands were configured.
    NoActions,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidDuration(s) => {
                write!(f, "invalid duration {:?} (expected e.g. \"500ms\", \"10s\", \"2m\")", s)
            }
            ConfigError::NoActions => {
                write!(f, "at least one command to execute is required (--exec)")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<DmsConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(DmsConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl DmsConfig {
    /// Resolved TTL.
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.switch.ttl)
            .ok_or_else(|| ConfigError::InvalidDuration(self.switch.ttl.clone()))
    }

    /// Check that the config describes something the switch can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ttl()?;
        if self.actions.exec.is_empty() {
            return Err(ConfigError::NoActions);
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
