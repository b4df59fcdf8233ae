//! GPU-side texture descriptors and the upload seam.

use bytes::Bytes;

use crate::error::TexResult;
use crate::format::{ColorScheme, RasterFormat, TileRect, MAX_MIP_LEVELS};

/// Opaque handle of a texture object owned by the GPU context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuTextureId(pub u32);

/// Texture upload primitive, implemented by the renderer on the thread that
/// owns the GPU context.
pub trait TextureUploader {
    fn create_texture(&mut self) -> TexResult<GpuTextureId>;

    /// Upload one mip level. `dim` is the edge length of that level.
    fn upload_level(
        &mut self,
        id: GpuTextureId,
        level: u32,
        format: RasterFormat,
        dim: u32,
        data: &[u8],
    ) -> TexResult<()>;

    fn delete_texture(&mut self, id: GpuTextureId);
}

/// Status of one mip level of a descriptor after a load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Compressed bytes are in memory.
    CompressedOk,
    /// A compression job is queued or running.
    Pending,
    /// Neither in memory, on disk, nor scheduled.
    Missing,
}

/// Lifecycle of a tile at one (level, scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Absent,
    Queued,
    Compressing,
    Cached,
    Resident,
}

/// One tile of the chart currently known to the factory.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub index: usize,
    pub rect: TileRect,
    /// Scheme the in-memory levels were built for.
    pub scheme: ColorScheme,
    /// Compressed GPU-format bytes per mip level.
    pub comp_array: [Option<Bytes>; MAX_MIP_LEVELS],
    pub gpu: Option<GpuTextureId>,
    /// Lowest level uploaded to `gpu`.
    pub level_min: u32,
    pub gpu_bytes: u64,
    pub lru_time: u64,
}

impl TextureDescriptor {
    pub fn new(index: usize, rect: TileRect, scheme: ColorScheme) -> Self {
        Self {
            index,
            rect,
            scheme,
            comp_array: Default::default(),
            gpu: None,
            level_min: u32::MAX,
            gpu_bytes: 0,
            lru_time: 0,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.gpu.is_some()
    }

    /// Uploaded and covering `level` and everything coarser.
    pub fn is_resident_at(&self, level: u32) -> bool {
        self.gpu.is_some() && self.level_min <= level
    }

    pub fn has_level(&self, level: u32) -> bool {
        self.comp_array
            .get(level as usize)
            .is_some_and(|l| l.is_some())
    }

    /// Host memory held by in-memory compressed levels.
    pub fn host_bytes(&self) -> usize {
        self.comp_array.iter().flatten().map(|b| b.len()).sum()
    }

    /// Forget the GPU texture after it has been deleted.
    pub(crate) fn clear_gpu(&mut self) -> Option<GpuTextureId> {
        self.level_min = u32::MAX;
        self.gpu_bytes = 0;
        self.gpu.take()
    }
}
