//! Mount configuration: a `clap`-derived CLI surface layered over a
//! `toml`/`serde` config file.
//!
//! This is the "explicit, constructed mount context" called for in §9
//! (replacing the original's singleton bootstrap): a single [`MountConfig`]
//! value is built once at startup and handed by reference to every
//! component that needs it, instead of each component reaching for a
//! process-wide global.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Command-line surface for starting a mount. CLI/option parsing itself is
/// out of core scope (§1), but the resulting struct is what the core's
/// [`MountConfig`] is built from.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "objectfs", about = "Project an object-storage bucket as a filesystem")]
pub struct MountOptions {
    /// Bucket name to mount.
    #[arg(long)]
    pub bucket: String,

    /// Local mountpoint directory.
    #[arg(long)]
    pub mountpoint: PathBuf,

    /// Path to the credentials file (§6).
    #[arg(long)]
    pub credentials_file: PathBuf,

    /// Optional path to a TOML config file overriding the defaults below.
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// Tunables consumed by the core (Cache, TransferManager, Drive). Defaults
/// mirror the orders of magnitude named in §4.7 (buffer size) and §4.8
/// (stat expiry).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MountConfig {
    /// In-memory cache byte budget (§4.3).
    pub cache_capacity_bytes: u64,
    /// Directory for spill files (§6 persisted state); wiped on clean
    /// shutdown.
    pub spill_directory: PathBuf,
    /// Max resident metadata entries (§4.4).
    pub max_metadata_entries: usize,
    /// How long a cached `getattr` result is trusted before a HEAD is
    /// issued to revalidate it (§4.8 `getattr`).
    pub stat_expiry: Duration,
    /// TransferManager buffer size; must be at least 8 MiB so the
    /// last-two-parts averaging trick for multipart uploads has room
    /// (§4.7).
    pub transfer_buffer_size: usize,
    /// Number of parts transferred in parallel.
    pub parallel_transfers: usize,
    /// Size threshold above which an upload uses multipart (§4.7).
    pub multipart_threshold: u64,
    /// Minimum size of a multipart part, except possibly the last.
    pub multipart_min_part_size: usize,
    /// Base retry count per ObjectClient operation.
    pub retry_count: u32,
    /// Scale factor for the exponential backoff `(1 << attempt) * scale`.
    pub retry_backoff_scale: Duration,
    /// uid/gid override, when the mount should present every object as
    /// owned by a fixed identity regardless of stored attributes.
    pub override_uid: Option<u32>,
    pub override_gid: Option<u32>,
    /// Mask applied in place of the stored mode bits, when configured.
    pub umask: Option<u32>,
}

const MIB: u64 = 1024 * 1024;

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 512 * MIB,
            spill_directory: PathBuf::from("/tmp/objectfs-cache"),
            max_metadata_entries: 100_000,
            stat_expiry: Duration::from_secs(60),
            transfer_buffer_size: 10 * MIB as usize,
            parallel_transfers: 4,
            multipart_threshold: 20 * MIB,
            multipart_min_part_size: 4 * MIB as usize,
            retry_count: 3,
            retry_backoff_scale: Duration::from_millis(100),
            override_uid: None,
            override_gid: None,
            umask: None,
        }
    }
}

/// Minimum allowed transfer buffer size (§4.7).
pub const MIN_TRANSFER_BUFFER_SIZE: usize = 8 * MIB as usize;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid mount configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl MountConfig {
    /// Load a config file (if any), falling back to defaults, then validate.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError(format!("reading {}: {e}", path.display())))?;
                toml::from_str(&text).map_err(|e| ConfigError(format!("parsing {}: {e}", path.display())))?
            }
            None => MountConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_buffer_size < MIN_TRANSFER_BUFFER_SIZE {
            return Err(ConfigError(format!(
                "transfer_buffer_size must be at least {MIN_TRANSFER_BUFFER_SIZE} bytes"
            )));
        }
        if self.parallel_transfers == 0 {
            return Err(ConfigError("parallel_transfers must be at least 1".into()));
        }
        if self.multipart_min_part_size == 0 {
            return Err(ConfigError("multipart_min_part_size must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        MountConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_undersized_buffer() {
        let mut config = MountConfig::default();
        config.transfer_buffer_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_parallelism() {
        let mut config = MountConfig::default();
        config.parallel_transfers = 0;
        assert!(config.validate().is_err());
    }
}
