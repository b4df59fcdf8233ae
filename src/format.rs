//! Tile geometry, color schemes and raster formats.

use serde::Deserialize;

use crate::error::{TexCacheError, TexResult};

/// Number of color schemes the catalog is keyed by.
pub const N_COLOR_SCHEMES: usize = 4;

/// Number of mip levels a tile can carry (levels 0..=4).
pub const MAX_MIP_LEVELS: usize = 5;

/// Chart color scheme. Each scheme renders different pixels, so tiles are
/// cached separately per scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    Rgb,
    #[default]
    Day,
    Dusk,
    Night,
}

impl ColorScheme {
    pub const ALL: [ColorScheme; N_COLOR_SCHEMES] = [
        ColorScheme::Rgb,
        ColorScheme::Day,
        ColorScheme::Dusk,
        ColorScheme::Night,
    ];

    /// Stable code used on disk and for index slots.
    pub fn index(self) -> usize {
        match self {
            ColorScheme::Rgb => 0,
            ColorScheme::Day => 1,
            ColorScheme::Dusk => 2,
            ColorScheme::Night => 3,
        }
    }

    pub fn from_index(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

/// GPU texture format produced by the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    /// Uncompressed 24-bit RGB (GL_RGB).
    Rgb,
    /// S3TC DXT1 blocks (GL_COMPRESSED_RGB_S3TC_DXT1_EXT).
    #[default]
    Dxt1,
}

impl RasterFormat {
    /// GL enum value, stored in the cache header.
    pub fn code(self) -> u32 {
        match self {
            RasterFormat::Rgb => 0x1907,
            RasterFormat::Dxt1 => 0x83F0,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x1907 => Some(RasterFormat::Rgb),
            0x83F0 => Some(RasterFormat::Dxt1),
            _ => None,
        }
    }

    /// Size in bytes of one encoded image of the given dimensions.
    pub fn encoded_size(self, width: u32, height: u32) -> usize {
        match self {
            RasterFormat::Rgb => width as usize * height as usize * 3,
            RasterFormat::Dxt1 => {
                width.div_ceil(4) as usize * height.div_ceil(4) as usize * 8
            }
        }
    }
}

/// Pixel rectangle in level-0 chart coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl TileRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Intersection with another rect, `None` when they do not overlap.
    pub fn intersect(&self, other: &TileRect) -> Option<TileRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as i64 || y1 <= y0 as i64 {
            return None;
        }
        Some(TileRect::new(x0, y0, (x1 - x0 as i64) as i32, (y1 - y0 as i64) as i32))
    }
}

impl std::fmt::Display for TileRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{} {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Tile layout of one chart: how level-0 pixels map to linear tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub tile_dim: u32,
    pub size_x: u32,
    pub size_y: u32,
    pub nx_tex: u32,
    pub ny_tex: u32,
}

impl TileGrid {
    pub fn new(size_x: u32, size_y: u32, tile_dim: u32) -> Self {
        let tile_dim = tile_dim.max(1);
        Self {
            tile_dim,
            size_x,
            size_y,
            nx_tex: size_x.div_ceil(tile_dim),
            ny_tex: size_y.div_ceil(tile_dim),
        }
    }

    /// Tiles per row.
    pub fn stride(&self) -> u32 {
        self.nx_tex
    }

    /// Total tile count.
    pub fn ntex(&self) -> usize {
        self.nx_tex as usize * self.ny_tex as usize
    }

    /// Linear tile index for a level-0 pixel position.
    ///
    /// Positions outside the chart are rejected rather than clamped.
    pub fn array_index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 {
            return None;
        }
        let col = x as u32 / self.tile_dim;
        let row = y as u32 / self.tile_dim;
        if col >= self.nx_tex || row >= self.ny_tex {
            return None;
        }
        Some(row as usize * self.nx_tex as usize + col as usize)
    }

    /// Full tile rect for a linear index.
    pub fn array_xy(&self, index: usize) -> Option<TileRect> {
        if index >= self.ntex() {
            return None;
        }
        let col = (index % self.nx_tex as usize) as i32;
        let row = (index / self.nx_tex as usize) as i32;
        let dim = self.tile_dim as i32;
        Some(TileRect::new(col * dim, row * dim, dim, dim))
    }

    pub fn chart_rect(&self) -> TileRect {
        TileRect::new(0, 0, self.size_x as i32, self.size_y as i32)
    }

    /// Linear indices of every tile overlapping `rect`, row-major.
    ///
    /// The rect is clipped to the chart first; a rect lying entirely outside
    /// the chart is an error.
    pub fn tiles_covering(&self, rect: &TileRect) -> TexResult<Vec<usize>> {
        let clipped = rect
            .intersect(&self.chart_rect())
            .ok_or(TexCacheError::OutOfBounds {
                x: rect.x as i64,
                y: rect.y as i64,
                width: self.size_x,
                height: self.size_y,
            })?;

        let dim = self.tile_dim as i64;
        let col0 = clipped.x as i64 / dim;
        let row0 = clipped.y as i64 / dim;
        let col1 = (clipped.right() - 1) / dim;
        let row1 = (clipped.bottom() - 1) / dim;

        let mut out = Vec::with_capacity(((col1 - col0 + 1) * (row1 - row0 + 1)) as usize);
        for row in row0..=row1 {
            for col in col0..=col1 {
                out.push(row as usize * self.nx_tex as usize + col as usize);
            }
        }
        Ok(out)
    }
}
