//! Hardware composer configuration
//!
//! ```toml
//! display = 0
//! refresh_rate = 60.0
//! vsync = true
//! fence_timeout_ms = 1000   # 0 = wait forever
//! abort_on_fatal = true
//! thread_name = "void_hwc"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Hardware composer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HwcConfig {
    /// Display index passed to the hardware composer
    pub display: u32,
    /// Refresh rate reported to the renderer (Hz)
    pub refresh_rate: f32,
    /// Enable vsync events at initialization
    pub vsync: bool,
    /// Upper bound for waiting on a stale release fence (0 = no bound)
    pub fence_timeout_ms: u64,
    /// Abort the process when the hardware breaks its lifecycle contract.
    /// When false the composition thread panics instead.
    pub abort_on_fatal: bool,
    /// Name of the composition thread
    pub thread_name: String,
}

impl Default for HwcConfig {
    fn default() -> Self {
        Self {
            display: 0,
            refresh_rate: 60.0,
            vsync: true,
            fence_timeout_ms: 1000,
            abort_on_fatal: true,
            thread_name: "void_hwc".to_string(),
        }
    }
}

impl HwcConfig {
    /// Parse a configuration from TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HwcConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.refresh_rate.is_finite() && self.refresh_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "refresh_rate must be positive, got {}",
                self.refresh_rate
            )));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("thread_name must not be empty".into()));
        }
        Ok(())
    }

    /// Fence wait bound, `None` meaning wait forever
    pub fn fence_timeout(&self) -> Option<Duration> {
        match self.fence_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
