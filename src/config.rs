//! Cache configuration.
//!
//! Loaded from a JSON file (all keys optional) and adjusted from the
//! environment:
//!
//! ```json
//! { "cache_dir": "/var/cache/charts", "tile_dim": 512, "max_jobs": 2 }
//! ```
//!
//! `TEXCACHE_MAX_JOBS` overrides the worker count; `TEXCACHE_JOB_TIMING=1`
//! turns on per-job timing logs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{TexCacheError, TexResult};
use crate::format::{RasterFormat, MAX_MIP_LEVELS};

/// Default interval of the factory maintenance tick, in milliseconds.
pub const FACTORY_TIMER_MS: u64 = 10_000;

/// Texture cache settings shared by the worker pool and every chart factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one compressed cache file per chart.
    pub cache_dir: PathBuf,
    /// Edge length of a square tile at level 0, in pixels.
    pub tile_dim: u32,
    /// Highest mip level built for each tile.
    pub max_level: u32,
    /// Worker threads (and running job slots). 0 compresses synchronously.
    pub max_jobs: usize,
    /// Format produced by the compressor.
    pub raster_format: RasterFormat,
    /// LZ4-compress tiles on the worker instead of the consumer thread.
    pub post_zip: bool,
    /// Let background jobs yield between mip levels.
    pub throttle: bool,
    /// GPU bytes kept resident per chart by `delete_some_textures_to_budget`.
    pub gpu_budget_bytes: u64,
    /// Descriptors kept in memory per chart by the maintenance tick.
    pub max_descriptors: usize,
    /// Maintenance tick interval in milliseconds.
    pub factory_timer_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("chart_texcache"),
            tile_dim: 512,
            max_level: (MAX_MIP_LEVELS - 1) as u32,
            max_jobs: default_max_jobs(),
            raster_format: RasterFormat::Dxt1,
            post_zip: true,
            throttle: true,
            gpu_budget_bytes: 64 * 1024 * 1024,
            max_descriptors: 256,
            factory_timer_ms: FACTORY_TIMER_MS,
        }
    }
}

/// Leave one core to the UI thread; cap at 4 so multi-chart quilts do not
/// oversubscribe the machine.
fn default_max_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .clamp(1, 4)
}

impl CacheConfig {
    /// Load a JSON config file, apply environment overrides and validate.
    pub fn load(path: &Path) -> TexResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&content)?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TEXCACHE_MAX_JOBS` if set to a valid number.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(jobs) = std::env::var("TEXCACHE_MAX_JOBS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.max_jobs = jobs;
        }
        self
    }

    pub fn validate(&self) -> TexResult<()> {
        if self.tile_dim < 4 || !self.tile_dim.is_power_of_two() {
            return Err(TexCacheError::Config(format!(
                "tile_dim must be a power of two >= 4, got {}",
                self.tile_dim
            )));
        }
        if self.max_level as usize >= MAX_MIP_LEVELS {
            return Err(TexCacheError::Config(format!(
                "max_level must be below {}, got {}",
                MAX_MIP_LEVELS, self.max_level
            )));
        }
        if self.tile_dim >> self.max_level < 4 {
            return Err(TexCacheError::Config(format!(
                "tile_dim {} is too small for {} mip levels",
                self.tile_dim, self.max_level
            )));
        }
        Ok(())
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.factory_timer_ms)
    }
}

/// Check if per-job timing instrumentation is enabled via env var.
pub(crate) fn job_timing_enabled() -> bool {
    std::env::var("TEXCACHE_JOB_TIMING").is_ok_and(|v| v == "1" || v == "true")
}
