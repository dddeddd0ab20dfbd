//! Bridge configuration, stored as TOML in the platform config directory.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capability::DeviceFilter;
use crate::protocol::{
    DEFAULT_MAILBOX_CAPACITY, DEFAULT_PROGRESS_INTERVAL, MIN_MAILBOX_CAPACITY, NSPIRE_PID,
    NSPIRE_PID_CX2, NSPIRE_VID,
};

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# nlink configuration. Changes made outside nlink may be overwritten.\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Size of each device's reply mailbox in bytes, header included. Default: 10000.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// USB vendor ID of the calculators. Default: 0x0451.
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    /// USB product IDs that count as calculators. Default: [0xE012, 0xE022].
    #[serde(default = "default_product_ids")]
    pub product_ids: Vec<u16>,

    /// Forward one progress update out of this many. Default: 6.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u32,

    /// Enumeration poll period for `watch`, in milliseconds. Default: 1000.
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}
fn default_vendor_id() -> u16 {
    NSPIRE_VID
}
fn default_product_ids() -> Vec<u16> {
    vec![NSPIRE_PID, NSPIRE_PID_CX2]
}
fn default_progress_interval() -> u32 {
    DEFAULT_PROGRESS_INTERVAL
}
fn default_watch_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mailbox_capacity: default_mailbox_capacity(),
            vendor_id: default_vendor_id(),
            product_ids: default_product_ids(),
            progress_interval: default_progress_interval(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `mailbox_capacity` cannot hold one bulk packet and its envelope.
    MailboxTooSmall { capacity: usize, min: usize },
    EmptyProductIds,
    ZeroProgressInterval,
    ZeroWatchInterval,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MailboxTooSmall { capacity, min } => {
                write!(f, "mailbox_capacity {capacity} is below the minimum of {min}")
            }
            ValidationError::EmptyProductIds => write!(f, "product_ids cannot be empty"),
            ValidationError::ZeroProgressInterval => {
                write!(f, "progress_interval must be at least 1")
            }
            ValidationError::ZeroWatchInterval => {
                write!(f, "watch_interval_ms must be at least 1")
            }
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nlink"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // rename can fail across filesystems
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Which devices enumeration should report.
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self.vendor_id,
            product_ids: self.product_ids.clone(),
        }
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.mailbox_capacity < MIN_MAILBOX_CAPACITY {
            errors.push(ValidationError::MailboxTooSmall {
                capacity: self.mailbox_capacity,
                min: MIN_MAILBOX_CAPACITY,
            });
        }
        if self.product_ids.is_empty() {
            errors.push(ValidationError::EmptyProductIds);
        }
        if self.progress_interval == 0 {
            errors.push(ValidationError::ZeroProgressInterval);
        }
        if self.watch_interval_ms == 0 {
            errors.push(ValidationError::ZeroWatchInterval);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
