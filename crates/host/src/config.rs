//! Host configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use session::SessionConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Per-device session tunables
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
    /// Bytes requested per read on the bridged device
    #[serde(default = "HostSettings::default_read_chunk")]
    pub read_chunk: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            read_chunk: Self::default_read_chunk(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_read_chunk() -> usize {
        512
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns of devices to attach (empty = any device with a bulk pair)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Timeout of one bulk IN poll; cancellation is checked between polls
    #[serde(default = "UsbSettings::default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Timeout of one bulk OUT transfer
    #[serde(default = "UsbSettings::default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            poll_timeout_ms: Self::default_poll_timeout(),
            write_timeout_ms: Self::default_write_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_poll_timeout() -> u64 {
        100
    }

    fn default_write_timeout() -> u64 {
        5000
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the standard locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/bulk-link/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bulk-link").join("host.toml")
        } else {
            PathBuf::from(".config/bulk-link/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.host.read_chunk == 0 {
            return Err(anyhow!("read_chunk must be greater than 0"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.poll_timeout_ms == 0 {
            return Err(anyhow!("poll_timeout_ms must be greater than 0"));
        }

        self.session
            .validate()
            .map_err(|e| anyhow!("Invalid [session] settings: {}", e))?;

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
