//! Shared test fixtures: synthetic charts, a recording uploader and factory
//! setup helpers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::config::CacheConfig;
use crate::error::{TexCacheError, TexResult};
use crate::factory::TexFactory;
use crate::format::{ColorScheme, RasterFormat, TileRect};
use crate::pool::CompressionWorkerPool;
use crate::raster::RasterSource;
use crate::texture::{GpuTextureId, TextureUploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Normal,
    Fail,
    Panic,
}

/// Gradient chart whose pixels depend on position and color scheme.
#[derive(Debug)]
pub struct TestChart {
    path: PathBuf,
    width: u32,
    height: u32,
    chart_date: u32,
    mode: SourceMode,
    reads: AtomicUsize,
}

impl TestChart {
    pub fn new(path: &str, width: u32, height: u32) -> Self {
        Self::with_mode(path, width, height, SourceMode::Normal)
    }

    pub fn with_mode(path: &str, width: u32, height: u32, mode: SourceMode) -> Self {
        Self {
            path: PathBuf::from(path),
            width,
            height,
            chart_date: 20240101,
            mode,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn shared(path: &str, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self::new(path, width, height))
    }

    pub fn with_date(mut self, chart_date: u32) -> Self {
        self.chart_date = chart_date;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl RasterSource for TestChart {
    fn chart_path(&self) -> &Path {
        &self.path
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn chart_date(&self) -> u32 {
        self.chart_date
    }

    fn read_rgb(&self, rect: &TileRect, level: u32, scheme: ColorScheme) -> TexResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            SourceMode::Normal => {}
            SourceMode::Fail => {
                return Err(TexCacheError::Compression("synthetic read failure".into()))
            }
            SourceMode::Panic => panic!("synthetic source panic"),
        }

        let w = (rect.width as u32) >> level;
        let h = (rect.height as u32) >> level;
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for py in 0..h {
            for px in 0..w {
                let x = rect.x as i64 + ((px as i64) << level);
                let y = rect.y as i64 + ((py as i64) << level);
                if x >= self.width as i64 || y >= self.height as i64 {
                    out.extend_from_slice(&[0, 0, 0]);
                } else {
                    out.extend_from_slice(&[(x / 4) as u8, (y / 4) as u8, 60 * scheme.index() as u8]);
                }
            }
        }
        Ok(out)
    }
}

/// Everything a [`RecordingUploader`] has been asked to do.
#[derive(Debug, Default)]
pub struct UploadLog {
    pub created: u32,
    pub live: BTreeSet<u32>,
    /// `(texture, level, dim, bytes)`
    pub uploads: Vec<(GpuTextureId, u32, u32, usize)>,
    pub deleted: Vec<GpuTextureId>,
    pub fail: bool,
}

/// In-memory GPU stand-in. Clones share one log so tests can inspect it
/// after handing a box to the factory.
#[derive(Debug, Clone, Default)]
pub struct RecordingUploader {
    log: Arc<Mutex<UploadLog>>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, UploadLog> {
        self.log.lock()
    }

    pub fn set_failing(&self, fail: bool) {
        self.log.lock().fail = fail;
    }
}

impl TextureUploader for RecordingUploader {
    fn create_texture(&mut self) -> TexResult<GpuTextureId> {
        let mut log = self.log.lock();
        if log.fail {
            return Err(TexCacheError::Upload("out of texture memory".into()));
        }
        log.created += 1;
        let id = log.created;
        log.live.insert(id);
        Ok(GpuTextureId(id))
    }

    fn upload_level(
        &mut self,
        id: GpuTextureId,
        level: u32,
        _format: RasterFormat,
        dim: u32,
        data: &[u8],
    ) -> TexResult<()> {
        let mut log = self.log.lock();
        if log.fail {
            return Err(TexCacheError::Upload("upload rejected".into()));
        }
        log.uploads.push((id, level, dim, data.len()));
        Ok(())
    }

    fn delete_texture(&mut self, id: GpuTextureId) {
        let mut log = self.log.lock();
        log.live.remove(&id.0);
        log.deleted.push(id);
    }
}

/// 64 px tiles, three mip levels, two workers.
pub fn test_config(cache_dir: &Path) -> CacheConfig {
    CacheConfig {
        cache_dir: cache_dir.to_path_buf(),
        tile_dim: 64,
        max_level: 2,
        max_jobs: 2,
        raster_format: RasterFormat::Dxt1,
        post_zip: true,
        throttle: false,
        gpu_budget_bytes: 1024 * 1024,
        max_descriptors: 64,
        ..CacheConfig::default()
    }
}

pub fn test_pool(config: &CacheConfig) -> Arc<CompressionWorkerPool> {
    Arc::new(CompressionWorkerPool::new(config).unwrap())
}

/// Factory over `chart` with a fresh recording uploader.
pub fn open_factory(
    chart: Arc<TestChart>,
    pool: &Arc<CompressionWorkerPool>,
    config: &CacheConfig,
) -> (TexFactory, RecordingUploader) {
    let uploader = RecordingUploader::new();
    let factory = TexFactory::new(
        chart,
        Box::new(uploader.clone()),
        Arc::clone(pool),
        config.clone(),
    )
    .unwrap();
    (factory, uploader)
}

/// Dispatch completions until the factory has no live jobs.
pub fn drain_jobs(factory: &mut TexFactory) {
    while factory.background_compression_as_job() {
        let handled = factory.wait_for_completions(Duration::from_secs(10));
        assert!(handled > 0, "timed out waiting for compression jobs");
    }
    factory.dispatch_completions();
}
