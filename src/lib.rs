//! chart_texcache - compressed GPU texture cache for raster charts.
//!
//! This crate provides:
//! - Per-chart texture factories with LRU eviction of GPU textures
//! - A disk cache of compressed tiles with a trailing catalog
//! - A bounded worker pool compressing tiles off the UI thread
//! - Software DXT1 compression and 2x2 mip reduction
//!
//! Usage:
//! ```no_run
//! use std::sync::Arc;
//! use chart_texcache::{CacheConfig, ColorScheme, CompressionWorkerPool, TexFactory, TileRect};
//! # fn demo(
//! #     chart: Arc<dyn chart_texcache::RasterSource>,
//! #     gpu: Box<dyn chart_texcache::TextureUploader>,
//! # ) -> chart_texcache::TexResult<()> {
//! let config = CacheConfig::default().with_env_overrides();
//! let pool = Arc::new(CompressionWorkerPool::new(&config)?);
//! let mut factory = TexFactory::new(chart, gpu, Arc::clone(&pool), config)?;
//!
//! // Every frame:
//! let view = TileRect::new(0, 0, 1920, 1080);
//! let ready = factory.prepare_texture(0, &view, ColorScheme::Day, true)?;
//! factory.dispatch_completions();
//!
//! // Every `factory.timer_interval()`:
//! factory.on_timer();
//! # let _ = ready;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod factory;
pub mod format;
pub mod pool;
pub mod raster;
pub mod texture;
#[cfg(test)]
pub(crate) mod test_utils;

pub use catalog::{
    read_cache_file, CatalogEntry, CatalogEntryKey, CatalogEntryValue, CompressedCacheHeader,
    COMPRESSED_CACHE_MAGIC,
};
pub use config::{CacheConfig, FACTORY_TIMER_MS};
pub use error::{TexCacheError, TexResult};
pub use factory::{cache_file_path, TexFactory};
pub use format::{ColorScheme, RasterFormat, TileGrid, TileRect, MAX_MIP_LEVELS, N_COLOR_SCHEMES};
pub use pool::{
    CompletionEvent, CompletionSink, CompressionWorkerPool, FactoryId, FactoryResolver,
    JobClient, JobOutput, JobTicket, PoolStats, ScheduleOutcome, TicketState,
};
pub use raster::{
    compressor_for, half_scale_chart_bits, CompressedLevel, Dxt1Compressor, RasterSource,
    RgbCompressor, TextureCompressor,
};
pub use texture::{BufferStatus, GpuTextureId, TextureDescriptor, TextureUploader, TileState};
