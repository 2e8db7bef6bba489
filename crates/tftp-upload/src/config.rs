use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};

/// Which uploads are accepted and what happens to existing files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// When false an upload onto an existing name is refused with
    /// "File already exists" (RFC 1350 code 6).
    pub allow_overwrite: bool,

    /// Glob patterns, relative to `root_dir`, an upload name must match.
    /// Examples: ["*.bin", "configs/*.cfg"]. Empty means every name is allowed.
    pub allowed_patterns: Vec<String>,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            allow_overwrite: true,
            allowed_patterns: Vec::new(),
        }
    }
}

/// Retransmission and lifetime knobs of a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retransmission interval used unless the client negotiates one.
    pub retransmit_timeout_ms: u64,

    /// Cumulative timeouts tolerated before the transfer is abandoned.
    pub max_retries: u32,

    /// How long to wait for the initial request; 0 waits forever.
    pub idle_timeout_secs: u64,

    /// Keep `<name>.upload` after a failed transfer instead of deleting it.
    pub keep_partial_uploads: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: 1000,
            max_retries: 5,
            idle_timeout_secs: 0,
            keep_partial_uploads: false,
        }
    }
}

impl TransferConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Create `root_dir` at startup when it is missing.
    pub create_root_dir: bool,
    pub transfer: TransferConfig,
    pub write_config: WriteConfig,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tftp-upload"),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 69),
            create_root_dir: true,
            transfer: TransferConfig::default(),
            write_config: WriteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events alongside the regular log lines.
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line, for log aggregators
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check a configuration before serving.
///
/// With `validate_bind` the bind address is probed, which fails when another
/// process already owns the port.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or set create_root_dir".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    validate_transfer_config(&config.transfer)?;
    validate_write_config(&config.write_config)?;
    Ok(())
}

pub(crate) fn validate_transfer_config(config: &TransferConfig) -> Result<()> {
    // Same bounds a client may request through `utimeout`.
    if !(1000..=255_000).contains(&config.retransmit_timeout_ms) {
        return Err(TftpError::Config(
            "transfer.retransmit_timeout_ms must be in range 1000-255000".to_string(),
        ));
    }

    if config.max_retries == 0 {
        return Err(TftpError::Config(
            "transfer.max_retries must be at least 1".to_string(),
        ));
    }

    Ok(())
}

pub(crate) fn validate_write_config(config: &WriteConfig) -> Result<()> {
    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::Config(
                "write_config.allowed_patterns cannot contain empty patterns".to_string(),
            ));
        }

        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(TftpError::Config(format!(
                "Invalid write pattern '{}': {}",
                pattern, e
            )));
        }
    }

    Ok(())
}
