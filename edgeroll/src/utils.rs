//! Utility functions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::errors::FleetError;

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120), // 2 minutes
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Calculate the lowercase hex SHA256 digest of data
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Normalize an artifact checksum to 64 lowercase hex characters.
///
/// Accepts `sha256:<hex>` or bare hex. Anything else is rejected before any
/// download starts.
pub fn normalize_checksum(raw: &str) -> Result<String, FleetError> {
    let trimmed = raw.trim();
    let digest = match trimmed.split_once(':') {
        Some((algo, digest)) if algo.eq_ignore_ascii_case("sha256") => digest,
        Some((algo, _)) => {
            return Err(FleetError::InvalidInput(format!(
                "unsupported checksum algorithm: {}",
                algo
            )))
        }
        None => trimmed,
    };

    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FleetError::InvalidInput(format!(
            "malformed sha256 checksum: {}",
            raw
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

/// Percentage of `part` over `total`, rounded down
pub fn floor_percent(part: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((part * 100) / total) as u32
}
