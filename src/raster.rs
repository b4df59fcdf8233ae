//! Source pixels, mip reduction and texture compression.
//!
//! The software DXT1 encoder stands in for the GPU compression primitive;
//! hosts with a GPU path implement [`TextureCompressor`] themselves.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{TexCacheError, TexResult};
use crate::format::{ColorScheme, RasterFormat, TileRect};

/// Provider of chart pixels, implemented by the chart renderer.
pub trait RasterSource: Send + Sync {
    /// Path identifying the chart; jobs are purged by it.
    fn chart_path(&self) -> &Path;

    /// Level-0 size in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Edition date of the chart; a change invalidates the cache file.
    fn chart_date(&self) -> u32;

    /// RGB bytes for `rect` downsampled by `2^level`, row-major,
    /// `(rect.width >> level) * (rect.height >> level) * 3` bytes.
    /// Pixels outside the chart are filled by the source.
    fn read_rgb(&self, rect: &TileRect, level: u32, scheme: ColorScheme) -> TexResult<Vec<u8>>;
}

/// Compress RGB pixels into a GPU texture format. Called from worker threads.
pub trait TextureCompressor: Send + Sync {
    fn format(&self) -> RasterFormat;

    fn compress(&self, rgb: &[u8], width: u32, height: u32) -> TexResult<Bytes>;
}

/// Software compressor for the given format.
pub fn compressor_for(format: RasterFormat) -> Arc<dyn TextureCompressor> {
    match format {
        RasterFormat::Rgb => Arc::new(RgbCompressor),
        RasterFormat::Dxt1 => Arc::new(Dxt1Compressor),
    }
}

fn check_len(rgb: &[u8], width: u32, height: u32) -> TexResult<()> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(TexCacheError::Compression(format!(
            "expected {} RGB bytes for {}x{}, got {}",
            expected,
            width,
            height,
            rgb.len()
        )));
    }
    Ok(())
}

/// Stores pixels as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct RgbCompressor;

impl TextureCompressor for RgbCompressor {
    fn format(&self) -> RasterFormat {
        RasterFormat::Rgb
    }

    fn compress(&self, rgb: &[u8], width: u32, height: u32) -> TexResult<Bytes> {
        check_len(rgb, width, height)?;
        Ok(Bytes::copy_from_slice(rgb))
    }
}

/// Bounding-box DXT1 (BC1) encoder, four-color mode only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dxt1Compressor;

impl TextureCompressor for Dxt1Compressor {
    fn format(&self) -> RasterFormat {
        RasterFormat::Dxt1
    }

    fn compress(&self, rgb: &[u8], width: u32, height: u32) -> TexResult<Bytes> {
        check_len(rgb, width, height)?;
        if width == 0 || height == 0 {
            return Err(TexCacheError::Compression("empty image".into()));
        }

        let (w, h) = (width as usize, height as usize);
        let mut out = Vec::with_capacity(RasterFormat::Dxt1.encoded_size(width, height));
        let mut block = [[0u8; 3]; 16];

        for by in (0..h).step_by(4) {
            for bx in (0..w).step_by(4) {
                // Edge blocks repeat the last row/column.
                for (i, texel) in block.iter_mut().enumerate() {
                    let px = (bx + i % 4).min(w - 1);
                    let py = (by + i / 4).min(h - 1);
                    let at = (py * w + px) * 3;
                    texel.copy_from_slice(&rgb[at..at + 3]);
                }
                out.extend_from_slice(&encode_dxt1_block(&block));
            }
        }
        Ok(Bytes::from(out))
    }
}

fn to_565(c: [u8; 3]) -> u16 {
    ((c[0] as u16 >> 3) << 11) | ((c[1] as u16 >> 2) << 5) | (c[2] as u16 >> 3)
}

fn from_565(c: u16) -> [i32; 3] {
    let r = ((c >> 11) & 0x1F) as i32;
    let g = ((c >> 5) & 0x3F) as i32;
    let b = (c & 0x1F) as i32;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

fn encode_dxt1_block(block: &[[u8; 3]; 16]) -> [u8; 8] {
    let mut lo = [255u8; 3];
    let mut hi = [0u8; 3];
    for texel in block {
        for c in 0..3 {
            lo[c] = lo[c].min(texel[c]);
            hi[c] = hi[c].max(texel[c]);
        }
    }

    let c0 = to_565(hi);
    let c1 = to_565(lo);
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&c0.to_le_bytes());
    out[2..4].copy_from_slice(&c1.to_le_bytes());

    // c0 == c1 would select three-color mode; all-zero indices decode to c0.
    if c0 == c1 {
        return out;
    }

    let e0 = from_565(c0);
    let e1 = from_565(c1);
    let mut palette = [[0i32; 3]; 4];
    for c in 0..3 {
        palette[0][c] = e0[c];
        palette[1][c] = e1[c];
        palette[2][c] = (2 * e0[c] + e1[c]) / 3;
        palette[3][c] = (e0[c] + 2 * e1[c]) / 3;
    }

    let mut indices = 0u32;
    for (i, texel) in block.iter().enumerate() {
        let best = (0..4)
            .min_by_key(|&p| {
                (0..3)
                    .map(|c| {
                        let d = texel[c] as i32 - palette[p][c];
                        d * d
                    })
                    .sum::<i32>()
            })
            .unwrap_or(0);
        indices |= (best as u32) << (2 * i);
    }
    out[4..8].copy_from_slice(&indices.to_le_bytes());
    out
}

/// Halve an RGB image with a 2x2 box filter. Odd trailing rows/columns are
/// dropped.
pub fn half_scale_chart_bits(width: u32, height: u32, source: &[u8]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (tw, th) = (w / 2, h / 2);
    let mut target = vec![0u8; tw * th * 3];

    for y in 0..th {
        let row0 = 2 * y * w;
        let row1 = (2 * y + 1) * w;
        for x in 0..tw {
            for c in 0..3 {
                let sum = source[(row0 + 2 * x) * 3 + c] as u32
                    + source[(row0 + 2 * x + 1) * 3 + c] as u32
                    + source[(row1 + 2 * x) * 3 + c] as u32
                    + source[(row1 + 2 * x + 1) * 3 + c] as u32;
                target[(y * tw + x) * 3 + c] = (sum / 4) as u8;
            }
        }
    }
    target
}

/// LZ4-compress a texture for storage in the cache file.
pub fn zip_texture(data: &[u8]) -> Bytes {
    Bytes::from(lz4_flex::compress_prepend_size(data))
}

pub fn unzip_texture(data: &[u8]) -> TexResult<Bytes> {
    lz4_flex::decompress_size_prepended(data)
        .map(Bytes::from)
        .map_err(|e| TexCacheError::Format(format!("corrupt tile blob: {e}")))
}

/// One mip level produced by a compression job.
#[derive(Debug, Clone)]
pub struct CompressedLevel {
    pub level: u32,
    /// GPU-format bytes, ready for upload.
    pub data: Bytes,
    /// LZ4 form of `data`, present when the worker post-zipped it.
    pub zipped: Option<Bytes>,
}
