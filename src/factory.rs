//! Per-chart texture factory.
//!
//! A [`TexFactory`] owns everything one chart needs for GPU display: the
//! cache file with its in-memory catalog, the texture descriptors of tiles
//! touched on screen, and an LRU clock. It lives on the consumer (UI) thread;
//! compression runs on the shared [`CompressionWorkerPool`] and comes back
//! through [`CompletionSink::job_completed`].
//!
//! Disk problems never make a chart unusable. A bad or stale cache file is
//! rebuilt from scratch, and a failed write only stops persistence for the
//! rest of the session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::catalog::{
    CacheFile, CatalogEntry, CatalogEntryValue, CatalogIndex, CompressedCacheHeader,
};
use crate::config::CacheConfig;
use crate::error::{TexCacheError, TexResult};
use crate::format::{ColorScheme, TileGrid, TileRect};
use crate::pool::{
    CompletionSink, CompressionWorkerPool, FactoryId, FactoryResolver, JobClient, JobOutput,
    JobTicket, ScheduleOutcome, TicketState,
};
use crate::raster::{unzip_texture, zip_texture, RasterSource};
use crate::texture::{BufferStatus, TextureDescriptor, TextureUploader, TileState};

/// Cache file for a chart: the chart path with separators flattened to `!`.
pub fn cache_file_path(cache_dir: &Path, chart_path: &Path) -> PathBuf {
    let name: String = chart_path
        .to_string_lossy()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '!' } else { c })
        .collect();
    cache_dir.join(format!("{name}.tcache"))
}

enum HeaderCheck {
    Current(CompressedCacheHeader),
    Empty,
    Stale(String),
    Corrupt(String),
}

fn check_header(file: &CacheFile, expected: &CompressedCacheHeader) -> HeaderCheck {
    if file.is_empty() {
        return HeaderCheck::Empty;
    }
    let header = match file.read_header() {
        Ok(Some(header)) => header,
        Ok(None) => return HeaderCheck::Corrupt("file shorter than header".into()),
        Err(e) => return HeaderCheck::Corrupt(e.to_string()),
    };
    if let Err(e) = header.check_structure(file.len()) {
        return HeaderCheck::Corrupt(e.to_string());
    }
    if header.format != expected.format {
        return HeaderCheck::Stale(format!(
            "format {:#x}, expected {:#x}",
            header.format, expected.format
        ));
    }
    if header.chartdate != expected.chartdate {
        return HeaderCheck::Stale(format!(
            "chart date {}, expected {}",
            header.chartdate, expected.chartdate
        ));
    }
    HeaderCheck::Current(header)
}

/// GPU texture cache of one chart.
pub struct TexFactory {
    id: FactoryId,
    pool: Arc<CompressionWorkerPool>,
    source: Arc<dyn RasterSource>,
    uploader: Box<dyn TextureUploader>,
    config: CacheConfig,
    grid: TileGrid,
    chart_path: PathBuf,
    cache_path: PathBuf,
    cache_file: Option<CacheFile>,
    header: CompressedCacheHeader,
    catalog: CatalogIndex,
    catalog_corrupted: bool,
    /// Blobs were appended since the last catalog write; the on-disk header
    /// is invalid while this is set.
    catalog_dirty: bool,
    persist_failed: bool,
    descriptors: BTreeMap<usize, TextureDescriptor>,
    color_scheme: ColorScheme,
    lru_time: u64,
}

impl TexFactory {
    /// Open the cache for `source` and register with `pool`.
    pub fn new(
        source: Arc<dyn RasterSource>,
        uploader: Box<dyn TextureUploader>,
        pool: Arc<CompressionWorkerPool>,
        config: CacheConfig,
    ) -> TexResult<Self> {
        config.validate()?;
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return Err(TexCacheError::Config(format!(
                "chart {} has no pixels",
                source.chart_path().display()
            )));
        }

        let grid = TileGrid::new(width, height, config.tile_dim);
        let chart_path = source.chart_path().to_path_buf();
        let cache_path = cache_file_path(&config.cache_dir, &chart_path);
        let (cache_file, persist_failed) = match CacheFile::open(&cache_path) {
            Ok(file) => (Some(file), false),
            Err(e) => {
                warn!(
                    "[CACHE] cannot open {}: {}; tiles will not persist",
                    cache_path.display(),
                    e
                );
                (None, true)
            }
        };
        let header = CompressedCacheHeader::new(pool.raster_format(), source.chart_date());
        let id = pool.register_factory();

        let mut factory = Self {
            id,
            pool,
            source,
            uploader,
            config,
            grid,
            chart_path,
            cache_path,
            cache_file,
            header,
            catalog: CatalogIndex::new(grid.ntex()),
            catalog_corrupted: false,
            catalog_dirty: false,
            persist_failed,
            descriptors: BTreeMap::new(),
            color_scheme: ColorScheme::default(),
            lru_time: 0,
        };
        factory.load_catalog();

        info!(
            "[FACTORY] {} {}x{} tiles of {}px, {} cached levels",
            factory.chart_path.display(),
            grid.nx_tex,
            grid.ny_tex,
            grid.tile_dim,
            factory.catalog.len()
        );
        Ok(factory)
    }

    pub fn id(&self) -> FactoryId {
        self.id
    }

    pub fn chart_path(&self) -> &Path {
        &self.chart_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn color_scheme(&self) -> ColorScheme {
        self.color_scheme
    }

    pub fn max_level(&self) -> u32 {
        self.config.max_level
    }

    /// The last load found a damaged cache file and started over.
    pub fn catalog_corrupted(&self) -> bool {
        self.catalog_corrupted
    }

    /// A cache write failed; persistence is off for this session.
    pub fn persist_failed(&self) -> bool {
        self.persist_failed
    }

    pub fn catalog_dirty(&self) -> bool {
        self.catalog_dirty
    }

    /// Number of cataloged tile levels.
    pub fn catalog_len(&self) -> usize {
        self.catalog.len()
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// GPU bytes held by resident textures.
    pub fn resident_bytes(&self) -> u64 {
        self.descriptors.values().map(|td| td.gpu_bytes).sum()
    }

    pub fn timer_interval(&self) -> Duration {
        self.config.timer_interval()
    }

    pub fn lru_time(&self) -> u64 {
        self.lru_time
    }

    pub fn set_lru_time(&mut self, lru_time: u64) {
        self.lru_time = lru_time;
    }

    /// Linear tile index for a level-0 pixel position, `None` outside the chart.
    pub fn array_index(&self, x: i32, y: i32) -> Option<usize> {
        self.grid.array_index(x, y)
    }

    pub fn array_xy(&self, index: usize) -> Option<TileRect> {
        self.grid.array_xy(index)
    }

    pub fn texture_descriptor(&self, rect: &TileRect) -> Option<&TextureDescriptor> {
        let index = self.array_index(rect.x, rect.y)?;
        self.descriptors.get(&index)
    }

    fn out_of_bounds(&self, x: i64, y: i64) -> TexCacheError {
        TexCacheError::OutOfBounds {
            x,
            y,
            width: self.grid.size_x,
            height: self.grid.size_y,
        }
    }

    fn index_for(&self, rect: &TileRect) -> TexResult<usize> {
        self.array_index(rect.x, rect.y)
            .ok_or_else(|| self.out_of_bounds(rect.x as i64, rect.y as i64))
    }

    fn check_index(&self, index: usize) -> TexResult<()> {
        if index >= self.grid.ntex() {
            let stride = self.grid.stride().max(1) as usize;
            let dim = self.grid.tile_dim as i64;
            return Err(self.out_of_bounds(
                (index % stride) as i64 * dim,
                (index / stride) as i64 * dim,
            ));
        }
        Ok(())
    }

    fn check_level(&self, level: u32) -> TexResult<()> {
        if level > self.config.max_level {
            return Err(TexCacheError::InvalidLevel {
                level,
                max: self.config.max_level,
            });
        }
        Ok(())
    }

    fn expected_header(&self) -> CompressedCacheHeader {
        CompressedCacheHeader::new(self.pool.raster_format(), self.source.chart_date())
    }

    // ----- loading -----

    /// Validate the on-disk header. Returns true when it is intact and
    /// current; otherwise the file has been reset to an empty cache.
    pub fn load_header(&mut self) -> bool {
        let expected = self.expected_header();
        let check = match &self.cache_file {
            Some(file) => check_header(file, &expected),
            None => return false,
        };

        match check {
            HeaderCheck::Current(header) => {
                self.header = header;
                return true;
            }
            HeaderCheck::Empty => {}
            HeaderCheck::Stale(reason) => {
                info!(
                    "[CACHE] {} is stale ({}), rebuilding",
                    self.cache_path.display(),
                    reason
                );
            }
            HeaderCheck::Corrupt(reason) => {
                warn!(
                    "[CACHE] {} is corrupt ({}), rebuilding",
                    self.cache_path.display(),
                    reason
                );
                self.catalog_corrupted = true;
            }
        }
        self.rebuild_cache_file(expected);
        false
    }

    /// Load header and catalog into memory. Any damage empties the cache.
    pub fn load_catalog(&mut self) -> bool {
        self.catalog.clear();
        if !self.load_header() {
            return false;
        }

        let entries = match self.cache_file.as_ref().map(|f| f.read_catalog(&self.header)) {
            Some(Ok(entries)) => entries,
            Some(Err(e)) => return self.catalog_load_failed(&e.to_string()),
            None => return false,
        };
        for entry in &entries {
            if !self.add_cache_entry_value(entry) {
                return self.catalog_load_failed(&format!("entry {:?} does not fit the chart", entry.k));
            }
        }

        debug!(
            "[CACHE] loaded {} entries from {}",
            entries.len(),
            self.cache_path.display()
        );
        true
    }

    fn catalog_load_failed(&mut self, reason: &str) -> bool {
        warn!(
            "[CACHE] catalog of {} unreadable ({}), rebuilding",
            self.cache_path.display(),
            reason
        );
        self.catalog_corrupted = true;
        let expected = self.expected_header();
        self.rebuild_cache_file(expected);
        false
    }

    fn rebuild_cache_file(&mut self, header: CompressedCacheHeader) {
        self.header = header;
        self.catalog.clear();
        self.catalog_dirty = false;
        if let Some(file) = self.cache_file.as_mut() {
            if let Err(e) = file.reset(&header) {
                warn!("[CACHE] cannot reset {}: {}", self.cache_path.display(), e);
                self.persist_failed = true;
            }
        }
    }

    /// Insert a catalog entry read from disk. False when its key does not fit
    /// this chart.
    pub fn add_cache_entry_value(&mut self, entry: &CatalogEntry) -> bool {
        let Some((level, scheme)) = entry.level_and_scheme() else {
            return false;
        };
        let Some(index) = self.grid.array_index(entry.k.x, entry.k.y) else {
            return false;
        };
        self.catalog.insert(level, scheme, index, entry.v)
    }

    pub fn get_cache_entry_value(
        &self,
        level: u32,
        x: i32,
        y: i32,
        scheme: ColorScheme,
    ) -> Option<CatalogEntryValue> {
        let index = self.array_index(x, y)?;
        self.catalog.get(level, scheme, index)
    }

    // ----- persistence -----

    fn persistence_enabled(&self) -> bool {
        self.cache_file.is_some() && !self.persist_failed
    }

    fn mark_catalog_dirty(&mut self) -> TexResult<()> {
        if !self.catalog_dirty {
            if let Some(file) = self.cache_file.as_mut() {
                file.invalidate_header()?;
            }
            self.catalog_dirty = true;
        }
        Ok(())
    }

    /// Append an LZ4 blob and point the catalog at it, replacing any previous
    /// entry. Returns false when persistence is off.
    pub fn update_cache_precomp(
        &mut self,
        zipped: &[u8],
        index: usize,
        level: u32,
        scheme: ColorScheme,
        write_catalog: bool,
    ) -> TexResult<bool> {
        self.check_index(index)?;
        self.check_level(level)?;
        if !self.persistence_enabled() {
            return Ok(false);
        }

        let offset = self.header.catalog_offset as u64;
        let end = offset + zipped.len() as u64;
        if end > i32::MAX as u64 {
            return Err(TexCacheError::Format(format!(
                "{} would exceed the addressable size",
                self.cache_path.display()
            )));
        }

        let written = self.mark_catalog_dirty().and_then(|()| match self.cache_file.as_mut() {
            Some(file) => file.write_blob(offset, zipped),
            None => Ok(()),
        });
        if let Err(e) = written {
            warn!(
                "[CACHE] write to {} failed: {}; persistence disabled",
                self.cache_path.display(),
                e
            );
            self.persist_failed = true;
            return Err(e);
        }

        self.header.catalog_offset = end as u32;
        self.catalog.insert(
            level,
            scheme,
            index,
            CatalogEntryValue {
                texture_offset: offset as i32,
                compressed_size: zipped.len() as u32,
            },
        );

        if write_catalog {
            self.write_catalog_and_header()?;
        }
        Ok(true)
    }

    /// LZ4-compress GPU-format bytes and store them.
    pub fn update_cache(
        &mut self,
        data: &[u8],
        index: usize,
        level: u32,
        scheme: ColorScheme,
        write_catalog: bool,
    ) -> TexResult<bool> {
        let zipped = zip_texture(data);
        self.update_cache_precomp(&zipped, index, level, scheme, write_catalog)
    }

    /// Persist one in-memory level of the tile at `rect` if it is not on
    /// disk yet.
    pub fn update_cache_level(
        &mut self,
        rect: &TileRect,
        level: u32,
        scheme: ColorScheme,
        write_catalog: bool,
    ) -> TexResult<bool> {
        let index = self.index_for(rect)?;
        self.check_level(level)?;
        if self.catalog.contains(level, scheme, index) {
            return Ok(false);
        }
        let data = self
            .descriptors
            .get(&index)
            .filter(|td| td.scheme == scheme)
            .and_then(|td| td.comp_array[level as usize].clone());
        match data {
            Some(data) => self.update_cache(&data, index, level, scheme, write_catalog),
            None => Ok(false),
        }
    }

    /// Write the catalog after the last blob and then the header.
    pub fn write_catalog_and_header(&mut self) -> TexResult<()> {
        let Some(file) = self.cache_file.as_mut() else {
            return Err(TexCacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no cache file open",
            )));
        };

        let grid = self.grid;
        let entries: Vec<CatalogEntry> = self
            .catalog
            .iter()
            .filter_map(|(level, scheme, index, v)| {
                grid.array_xy(index)
                    .map(|r| CatalogEntry::new(level, r.x, r.y, scheme, v))
            })
            .collect();
        self.header.n_entries = entries.len() as u32;

        match file.write_catalog_and_header(&self.header, &entries) {
            Ok(()) => {
                self.catalog_dirty = false;
                debug!(
                    "[CACHE] wrote {} entries to {}",
                    entries.len(),
                    self.cache_path.display()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[CACHE] catalog write to {} failed: {}; keeping in-memory state",
                    self.cache_path.display(),
                    e
                );
                self.persist_failed = true;
                Err(e)
            }
        }
    }

    fn read_cached_level(&self, level: u32, value: &CatalogEntryValue) -> TexResult<Bytes> {
        let file = self.cache_file.as_ref().ok_or_else(|| {
            TexCacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no cache file open",
            ))
        })?;
        let data = unzip_texture(&file.read_blob(value)?)?;
        let dim = self.config.tile_dim >> level;
        let expected = self.pool.raster_format().encoded_size(dim, dim);
        if data.len() != expected {
            return Err(TexCacheError::Format(format!(
                "level {} blob is {} bytes, expected {}",
                level,
                data.len(),
                expected
            )));
        }
        Ok(data)
    }

    fn unwritten_levels(&self, td: &TextureDescriptor) -> Vec<(u32, Bytes)> {
        td.comp_array
            .iter()
            .enumerate()
            .filter_map(|(level, data)| Some((level as u32, data.clone()?)))
            .filter(|(level, _)| !self.catalog.contains(*level, td.scheme, td.index))
            .collect()
    }

    fn persist_descriptor(&mut self, index: usize) -> TexResult<usize> {
        let Some(td) = self.descriptors.get(&index) else {
            return Ok(0);
        };
        let scheme = td.scheme;
        let mut written = 0;
        for (level, data) in self.unwritten_levels(td) {
            if self.update_cache(&data, index, level, scheme, false)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist the unwritten levels of one descriptor. Returns true when
    /// anything was written.
    pub fn compress_uncached_entry(&mut self) -> TexResult<bool> {
        if !self.persistence_enabled() {
            return Ok(false);
        }
        let Some(index) = self
            .descriptors
            .values()
            .find(|td| !self.unwritten_levels(td).is_empty())
            .map(|td| td.index)
        else {
            return Ok(false);
        };

        let written = self.persist_descriptor(index)?;
        debug!("[CACHE] persisted {} levels of tile {}", written, index);
        Ok(written > 0)
    }

    /// Periodic maintenance: persist one descriptor, flush a dirty catalog and
    /// trim GPU and host memory to budget.
    pub fn on_timer(&mut self) {
        if let Err(e) = self.compress_uncached_entry() {
            warn!("[FACTORY] idle persistence failed: {}", e);
        }
        if self.catalog_dirty && self.persistence_enabled() {
            // Failure is logged and disables persistence.
            let _ = self.write_catalog_and_header();
        }
        self.delete_some_textures_to_budget();
        if self.descriptors.len() > self.config.max_descriptors {
            self.free_some(self.config.max_descriptors);
        }
    }

    // ----- queries -----

    /// Whether the catalog has this level on disk. No I/O.
    pub fn is_level_in_cache(&self, level: u32, rect: &TileRect, scheme: ColorScheme) -> bool {
        self.array_index(rect.x, rect.y)
            .is_some_and(|index| self.catalog.contains(level, scheme, index))
    }

    /// Whether every level from `base_level` up is in memory for the current
    /// scheme. No I/O.
    pub fn is_compressed_array_complete(&self, base_level: u32, rect: &TileRect) -> bool {
        let Some(td) = self
            .array_index(rect.x, rect.y)
            .and_then(|index| self.descriptors.get(&index))
        else {
            return false;
        };
        td.scheme == self.color_scheme
            && (base_level..=self.config.max_level).all(|level| td.has_level(level))
    }

    pub fn tile_state(&self, rect: &TileRect, level: u32, scheme: ColorScheme) -> TileState {
        let Some(index) = self.array_index(rect.x, rect.y) else {
            return TileState::Absent;
        };
        let td = self.descriptors.get(&index).filter(|td| td.scheme == scheme);

        if td.is_some_and(|td| td.is_resident_at(level)) {
            return TileState::Resident;
        }
        if self.catalog.contains(level, scheme, index) || td.is_some_and(|td| td.has_level(level)) {
            return TileState::Cached;
        }
        match self.pool.ticket_state(self.id, index, scheme) {
            Some(TicketState::Queued) => TileState::Queued,
            Some(TicketState::Running) => TileState::Compressing,
            _ => TileState::Absent,
        }
    }

    // ----- descriptors and upload -----

    fn descriptor_for(&mut self, index: usize, scheme: ColorScheme) -> Option<&mut TextureDescriptor> {
        let rect = self.grid.array_xy(index)?;
        let td = self
            .descriptors
            .entry(index)
            .or_insert_with(|| TextureDescriptor::new(index, rect, scheme));
        if td.scheme != scheme {
            if let Some(id) = td.clear_gpu() {
                self.uploader.delete_texture(id);
            }
            td.comp_array = Default::default();
            td.scheme = scheme;
        }
        Some(td)
    }

    /// Bring one level of a tile into memory, from the descriptor or the
    /// cache file. Only the current color scheme can be loaded.
    pub fn load_texture_level(
        &mut self,
        rect: &TileRect,
        level: u32,
        scheme: ColorScheme,
    ) -> TexResult<BufferStatus> {
        let index = self.index_for(rect)?;
        self.check_level(level)?;
        if scheme != self.color_scheme {
            return Err(TexCacheError::SchemeMismatch {
                requested: scheme,
                current: self.color_scheme,
            });
        }

        if self
            .descriptors
            .get(&index)
            .is_some_and(|td| td.scheme == scheme && td.has_level(level))
        {
            return Ok(BufferStatus::CompressedOk);
        }

        if let Some(value) = self.catalog.get(level, scheme, index) {
            match self.read_cached_level(level, &value) {
                Ok(data) => {
                    if let Some(td) = self.descriptor_for(index, scheme) {
                        td.comp_array[level as usize] = Some(data);
                    }
                    return Ok(BufferStatus::CompressedOk);
                }
                Err(e) => {
                    warn!(
                        "[CACHE] dropping unreadable level {} of tile {}: {}",
                        level, index, e
                    );
                    self.catalog.remove(level, scheme, index);
                    if let Err(e) = self.mark_catalog_dirty() {
                        warn!("[CACHE] cannot invalidate header: {}", e);
                        self.persist_failed = true;
                    }
                }
            }
        }

        if self.pool.ticket_state(self.id, index, scheme).is_some() {
            return Ok(BufferStatus::Pending);
        }
        Ok(BufferStatus::Missing)
    }

    fn upload_descriptor(&mut self, index: usize, base_level: u32) -> TexResult<()> {
        let format = self.pool.raster_format();
        let tile_dim = self.config.tile_dim;
        let max_level = self.config.max_level;
        let Some(td) = self.descriptors.get_mut(&index) else {
            return Ok(());
        };
        if td.is_resident_at(base_level) {
            return Ok(());
        }
        if let Some(old) = td.clear_gpu() {
            self.uploader.delete_texture(old);
        }

        let id = self.uploader.create_texture()?;
        let mut bytes = 0u64;
        for level in base_level..=max_level {
            let Some(data) = td.comp_array[level as usize].as_ref() else {
                self.uploader.delete_texture(id);
                return Err(TexCacheError::Upload(format!(
                    "level {} of tile {} is not in memory",
                    level, index
                )));
            };
            if let Err(e) = self
                .uploader
                .upload_level(id, level, format, tile_dim >> level, data)
            {
                self.uploader.delete_texture(id);
                return Err(e);
            }
            bytes += data.len() as u64;
        }

        td.gpu = Some(id);
        td.level_min = base_level;
        td.gpu_bytes = bytes;
        Ok(())
    }

    // ----- compression -----

    fn job_client(&self) -> JobClient {
        JobClient {
            id: self.id,
            chart_path: self.chart_path.clone(),
            source: Arc::clone(&self.source),
            grid: self.grid,
            max_level: self.config.max_level,
        }
    }

    /// Ask the pool for levels `level_min..` of a tile. True when the output
    /// was applied before returning.
    fn request_compression(
        &mut self,
        rect: &TileRect,
        level_min: u32,
        scheme: ColorScheme,
        immediate: bool,
    ) -> TexResult<bool> {
        let index = self.index_for(rect)?;
        let client = self.job_client();
        let outcome = self.pool.schedule_job(
            &client,
            rect,
            level_min,
            scheme,
            self.config.throttle && !immediate,
            immediate,
            self.config.post_zip,
        );

        match outcome {
            Ok(ScheduleOutcome::Completed(output)) => {
                self.apply_levels(index, scheme, output);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e @ (TexCacheError::OutOfBounds { .. } | TexCacheError::InvalidLevel { .. })) => {
                Err(e)
            }
            Err(e) => {
                warn!(
                    "[FACTORY] compression of tile {} in {} failed: {}",
                    index,
                    self.chart_path.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    /// Compress a tile on the calling thread. True when its levels are now in
    /// memory; false when the job failed or a background job owns the tile.
    pub fn do_immediate_full_compress(
        &mut self,
        rect: &TileRect,
        level_min: u32,
        scheme: ColorScheme,
    ) -> TexResult<bool> {
        self.check_level(level_min)?;
        self.request_compression(rect, level_min, scheme, true)
    }

    fn apply_levels(&mut self, index: usize, scheme: ColorScheme, output: JobOutput) {
        let now = self.lru_time;
        for level in output.levels {
            let current = scheme == self.color_scheme;
            if !self.catalog.contains(level.level, scheme, index) {
                // Levels for a scheme off screen have no descriptor to wait in.
                let stored = match &level.zipped {
                    Some(zipped) => {
                        self.update_cache_precomp(zipped, index, level.level, scheme, false)
                    }
                    None if !current => {
                        self.update_cache(&level.data, index, level.level, scheme, false)
                    }
                    None => Ok(false),
                };
                if let Err(e) = stored {
                    debug!("[CACHE] level {} of tile {} not stored: {}", level.level, index, e);
                }
            }
            if current {
                if let Some(td) = self.descriptor_for(index, scheme) {
                    td.lru_time = td.lru_time.max(now);
                    if let Some(slot) = td.comp_array.get_mut(level.level as usize) {
                        *slot = Some(level.data);
                    }
                }
            }
        }

        if self.catalog_dirty && self.persistence_enabled() {
            let _ = self.write_catalog_and_header();
        }
    }

    /// Store a finished job's levels. Results for another scheme only reach
    /// the cache file.
    pub fn apply_job_output(&mut self, ticket: &JobTicket, output: JobOutput) {
        if ticket.factory() != self.id {
            warn!("[FACTORY] job {} belongs to another factory", ticket.ident());
            return;
        }
        debug!(
            "[FACTORY] job {} done: tile {} {:?} {} levels in {:.2?}",
            ticket.ident(),
            ticket.index(),
            ticket.scheme(),
            output.levels.len(),
            output.elapsed
        );
        self.apply_levels(ticket.index(), ticket.scheme(), output);
    }

    fn prepare_tile(
        &mut self,
        index: usize,
        base_level: u32,
        scheme: ColorScheme,
        throttle: bool,
    ) -> TexResult<bool> {
        if self
            .descriptors
            .get(&index)
            .is_some_and(|td| td.scheme == scheme && td.is_resident_at(base_level))
        {
            return Ok(true);
        }
        let Some(rect) = self.grid.array_xy(index) else {
            return Ok(false);
        };

        let mut first_missing = None;
        let mut pending = false;
        for level in base_level..=self.config.max_level {
            match self.load_texture_level(&rect, level, scheme)? {
                BufferStatus::CompressedOk => {}
                BufferStatus::Pending => pending = true,
                BufferStatus::Missing => {
                    first_missing.get_or_insert(level);
                }
            }
        }
        if pending {
            return Ok(false);
        }
        if let Some(level_min) = first_missing {
            if !self.request_compression(&rect, level_min, scheme, !throttle)? {
                return Ok(false);
            }
        }

        self.upload_descriptor(index, base_level)?;
        Ok(true)
    }

    /// Make every tile covering `rect` resident from `base_level` up, or get
    /// it compressing. Returns true when all of them are resident now.
    ///
    /// With `throttle` false missing tiles are compressed synchronously.
    pub fn prepare_texture(
        &mut self,
        base_level: u32,
        rect: &TileRect,
        scheme: ColorScheme,
        throttle: bool,
    ) -> TexResult<bool> {
        self.check_level(base_level)?;
        let tiles = self.grid.tiles_covering(rect)?;

        if scheme != self.color_scheme {
            debug!(
                "[FACTORY] color scheme {:?} -> {:?}, dropping descriptors",
                self.color_scheme, scheme
            );
            self.delete_all_descriptors();
            self.color_scheme = scheme;
        }

        let mut all_resident = true;
        for index in tiles {
            self.lru_time += 1;
            let now = self.lru_time;
            if !self.prepare_tile(index, base_level, scheme, throttle)? {
                all_resident = false;
            }
            if let Some(td) = self.descriptors.get_mut(&index) {
                td.lru_time = now;
            }
        }
        Ok(all_resident)
    }

    // ----- eviction -----

    fn lru_order(&self, resident_only: bool) -> Vec<(u64, usize)> {
        let mut order: Vec<(u64, usize)> = self
            .descriptors
            .values()
            .filter(|td| !resident_only || td.is_resident())
            .map(|td| (td.lru_time, td.index))
            .collect();
        order.sort_unstable();
        order
    }

    /// Evict least recently used GPU textures until at most `target_bytes`
    /// stay resident. Compressed levels stay in memory and on disk.
    pub fn delete_some_textures(&mut self, target_bytes: u64) -> usize {
        let mut total = self.resident_bytes();
        if total <= target_bytes {
            return 0;
        }

        let mut evicted = 0;
        for (_, index) in self.lru_order(true) {
            if total <= target_bytes {
                break;
            }
            if let Some(td) = self.descriptors.get_mut(&index) {
                total -= td.gpu_bytes;
                if let Some(id) = td.clear_gpu() {
                    self.uploader.delete_texture(id);
                }
                evicted += 1;
            }
        }
        debug!(
            "[FACTORY] evicted {} textures, {} bytes resident",
            evicted, total
        );
        evicted
    }

    pub fn delete_some_textures_to_budget(&mut self) -> usize {
        self.delete_some_textures(self.config.gpu_budget_bytes)
    }

    /// Drop least recently used descriptors until at most `target_count`
    /// remain, persisting their unwritten levels first.
    pub fn free_some(&mut self, target_count: usize) -> usize {
        let excess = self.descriptors.len().saturating_sub(target_count);
        if excess == 0 {
            return 0;
        }

        for (_, index) in self.lru_order(false).into_iter().take(excess) {
            if self.persistence_enabled() {
                if let Err(e) = self.persist_descriptor(index) {
                    warn!("[CACHE] tile {} not persisted before free: {}", index, e);
                }
            }
            if let Some(mut td) = self.descriptors.remove(&index) {
                if let Some(id) = td.clear_gpu() {
                    self.uploader.delete_texture(id);
                }
            }
        }
        if self.catalog_dirty && self.persistence_enabled() {
            let _ = self.write_catalog_and_header();
        }
        excess
    }

    /// Release the GPU texture of one tile.
    pub fn delete_texture(&mut self, rect: &TileRect) -> TexResult<()> {
        let index = self.index_for(rect)?;
        if let Some(id) = self.descriptors.get_mut(&index).and_then(|td| td.clear_gpu()) {
            self.uploader.delete_texture(id);
        }
        Ok(())
    }

    pub fn delete_all_textures(&mut self) {
        for td in self.descriptors.values_mut() {
            if let Some(id) = td.clear_gpu() {
                self.uploader.delete_texture(id);
            }
        }
    }

    pub fn delete_all_descriptors(&mut self) {
        self.delete_all_textures();
        self.descriptors.clear();
    }

    // ----- pool interaction -----

    /// Remove this chart's queued jobs and abort its running ones.
    pub fn purge_background_compression_pool(&mut self) -> usize {
        self.pool.purge_factory(self.id)
    }

    pub fn background_compression_as_job(&self) -> bool {
        self.pool.as_job(&self.chart_path)
    }

    /// Apply this chart's finished jobs. Completions of other charts sharing
    /// the pool are held for their own factory.
    pub fn dispatch_completions(&mut self) -> usize {
        let pool = Arc::clone(&self.pool);
        pool.dispatch_pending(self)
    }

    /// Wait up to `timeout` for a completion, then apply all posted ones.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> usize {
        let pool = Arc::clone(&self.pool);
        pool.wait_and_dispatch(self, timeout)
    }
}

impl CompletionSink for TexFactory {
    fn job_completed(&mut self, ticket: &JobTicket, output: JobOutput) {
        self.apply_job_output(ticket, output);
    }
}

impl FactoryResolver for TexFactory {
    fn resolve(&mut self, id: FactoryId) -> Option<&mut dyn CompletionSink> {
        if self.id == id {
            Some(self as &mut dyn CompletionSink)
        } else {
            None
        }
    }
}

impl FactoryResolver for Vec<TexFactory> {
    fn resolve(&mut self, id: FactoryId) -> Option<&mut dyn CompletionSink> {
        self.iter_mut()
            .find(|f| f.id == id)
            .map(|f| f as &mut dyn CompletionSink)
    }
}

impl Drop for TexFactory {
    fn drop(&mut self) {
        self.pool.unregister_factory(self.id);
        if self.catalog_dirty && self.persistence_enabled() {
            let _ = self.write_catalog_and_header();
        }
        self.delete_all_descriptors();
        debug!("[FACTORY] closed {}", self.chart_path.display());
    }
}
