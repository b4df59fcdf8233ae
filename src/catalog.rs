//! Compressed cache file: header, tile blobs and the trailing catalog.
//!
//! Layout (little endian):
//!
//! ```text
//! [header: magic u32 | format u32 | chartdate u32 | n_entries u32 | catalog_offset u32]
//! [tile blobs, referenced by offset + size]
//! [catalog: n_entries x {level i32, scheme i32, x i32, y i32, offset i32, size u32}]
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{TexCacheError, TexResult};
use crate::format::{ColorScheme, RasterFormat, MAX_MIP_LEVELS, N_COLOR_SCHEMES};

/// Change this when the on-disk format changes.
pub const COMPRESSED_CACHE_MAGIC: u32 = 0xF010;
pub const HEADER_SIZE: usize = 20;
pub const ENTRY_SIZE: usize = 24;

/// Fixed-size header at offset 0 of every cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedCacheHeader {
    pub magic: u32,
    pub format: u32,
    pub chartdate: u32,
    pub n_entries: u32,
    pub catalog_offset: u32,
}

impl CompressedCacheHeader {
    /// Header of an empty cache file.
    pub fn new(format: RasterFormat, chartdate: u32) -> Self {
        Self {
            magic: COMPRESSED_CACHE_MAGIC,
            format: format.code(),
            chartdate,
            n_entries: 0,
            catalog_offset: HEADER_SIZE as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.format.to_le_bytes());
        out[8..12].copy_from_slice(&self.chartdate.to_le_bytes());
        out[12..16].copy_from_slice(&self.n_entries.to_le_bytes());
        out[16..20].copy_from_slice(&self.catalog_offset.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> TexResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TexCacheError::Format("truncated header".into()));
        }
        Ok(Self {
            magic: le_u32(bytes, 0),
            format: le_u32(bytes, 4),
            chartdate: le_u32(bytes, 8),
            n_entries: le_u32(bytes, 12),
            catalog_offset: le_u32(bytes, 16),
        })
    }

    /// Byte length of the catalog this header describes.
    pub fn catalog_len(&self) -> Option<u64> {
        (self.n_entries as u64).checked_mul(ENTRY_SIZE as u64)
    }

    /// Structural checks against the file length: magic, and that the
    /// catalog lies exactly at the file tail.
    pub fn check_structure(&self, file_len: u64) -> TexResult<()> {
        if self.magic != COMPRESSED_CACHE_MAGIC {
            return Err(TexCacheError::Format(format!(
                "magic mismatch: {:#x}",
                self.magic
            )));
        }
        if (self.catalog_offset as u64) < HEADER_SIZE as u64 {
            return Err(TexCacheError::Format("catalog overlaps header".into()));
        }
        let end = self
            .catalog_len()
            .and_then(|len| len.checked_add(self.catalog_offset as u64))
            .ok_or_else(|| TexCacheError::Format("catalog size overflow".into()))?;
        if end != file_len {
            return Err(TexCacheError::Format(format!(
                "catalog ends at {} but file is {} bytes",
                end, file_len
            )));
        }
        Ok(())
    }
}

/// Identifies one compressed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatalogEntryKey {
    pub mip_level: i32,
    pub color_scheme: i32,
    pub x: i32,
    pub y: i32,
}

/// Location of a compressed tile in the cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntryValue {
    pub texture_offset: i32,
    pub compressed_size: u32,
}

impl CatalogEntryValue {
    pub fn end(&self) -> u64 {
        self.texture_offset as u64 + self.compressed_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub k: CatalogEntryKey,
    pub v: CatalogEntryValue,
}

impl CatalogEntry {
    pub fn new(level: u32, x: i32, y: i32, scheme: ColorScheme, v: CatalogEntryValue) -> Self {
        Self {
            k: CatalogEntryKey {
                mip_level: level as i32,
                color_scheme: scheme.index() as i32,
                x,
                y,
            },
            v,
        }
    }

    pub fn serial_size() -> usize {
        ENTRY_SIZE
    }

    pub fn serialize(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.k.mip_level.to_le_bytes());
        out[4..8].copy_from_slice(&self.k.color_scheme.to_le_bytes());
        out[8..12].copy_from_slice(&self.k.x.to_le_bytes());
        out[12..16].copy_from_slice(&self.k.y.to_le_bytes());
        out[16..20].copy_from_slice(&self.v.texture_offset.to_le_bytes());
        out[20..24].copy_from_slice(&self.v.compressed_size.to_le_bytes());
    }

    pub fn deserialize(bytes: &[u8]) -> Self {
        Self {
            k: CatalogEntryKey {
                mip_level: le_u32(bytes, 0) as i32,
                color_scheme: le_u32(bytes, 4) as i32,
                x: le_u32(bytes, 8) as i32,
                y: le_u32(bytes, 12) as i32,
            },
            v: CatalogEntryValue {
                texture_offset: le_u32(bytes, 16) as i32,
                compressed_size: le_u32(bytes, 20),
            },
        }
    }

    /// Level and scheme decoded from the key, `None` when out of range.
    pub fn level_and_scheme(&self) -> Option<(u32, ColorScheme)> {
        let level = u32::try_from(self.k.mip_level).ok()?;
        if level as usize >= MAX_MIP_LEVELS {
            return None;
        }
        Some((level, ColorScheme::from_index(self.k.color_scheme)?))
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// In-memory catalog: `[color_scheme][mip_level]` -> one optional slot per
/// linear tile index. Slot arrays are allocated on first insert.
#[derive(Debug, Clone)]
pub struct CatalogIndex {
    ntex: usize,
    slots: Vec<Option<Vec<Option<CatalogEntryValue>>>>,
    len: usize,
}

impl CatalogIndex {
    pub fn new(ntex: usize) -> Self {
        Self {
            ntex,
            slots: vec![None; N_COLOR_SCHEMES * MAX_MIP_LEVELS],
            len: 0,
        }
    }

    fn slot(level: u32, scheme: ColorScheme) -> Option<usize> {
        ((level as usize) < MAX_MIP_LEVELS)
            .then(|| scheme.index() * MAX_MIP_LEVELS + level as usize)
    }

    pub fn get(&self, level: u32, scheme: ColorScheme, index: usize) -> Option<CatalogEntryValue> {
        let slot = Self::slot(level, scheme)?;
        self.slots[slot].as_ref()?.get(index).copied().flatten()
    }

    pub fn contains(&self, level: u32, scheme: ColorScheme, index: usize) -> bool {
        self.get(level, scheme, index).is_some()
    }

    /// Insert or replace an entry. Returns false when the key is out of range.
    pub fn insert(
        &mut self,
        level: u32,
        scheme: ColorScheme,
        index: usize,
        value: CatalogEntryValue,
    ) -> bool {
        let Some(slot) = Self::slot(level, scheme) else {
            return false;
        };
        if index >= self.ntex {
            return false;
        }
        let ntex = self.ntex;
        let entries = self.slots[slot].get_or_insert_with(|| vec![None; ntex]);
        if entries[index].replace(value).is_none() {
            self.len += 1;
        }
        true
    }

    pub fn remove(
        &mut self,
        level: u32,
        scheme: ColorScheme,
        index: usize,
    ) -> Option<CatalogEntryValue> {
        let slot = Self::slot(level, scheme)?;
        let removed = self.slots[slot].as_mut()?.get_mut(index)?.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All entries as `(level, scheme, index, value)`, ordered by scheme,
    /// level, then index.
    pub fn iter(&self) -> impl Iterator<Item = (u32, ColorScheme, usize, CatalogEntryValue)> + '_ {
        self.slots.iter().enumerate().flat_map(|(slot, entries)| {
            let scheme = ColorScheme::ALL[slot / MAX_MIP_LEVELS];
            let level = (slot % MAX_MIP_LEVELS) as u32;
            entries
                .iter()
                .flat_map(|e| e.iter().enumerate())
                .filter_map(move |(index, v)| v.map(|v| (level, scheme, index, v)))
        })
    }
}

/// Open handle on one chart's cache file.
#[derive(Debug)]
pub struct CacheFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl CacheFile {
    /// Open for read/write, creating an empty file if needed.
    pub fn open(path: &Path) -> TexResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Open an existing file read-only.
    pub fn open_read_only(path: &Path) -> TexResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Header bytes, `None` for a file shorter than a header.
    pub fn read_header(&self) -> TexResult<Option<CompressedCacheHeader>> {
        if self.len < HEADER_SIZE as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_SIZE];
        read_at(&self.file, 0, &mut buf)?;
        CompressedCacheHeader::from_bytes(&buf).map(Some)
    }

    /// Read the catalog described by a structurally valid header.
    pub fn read_catalog(&self, header: &CompressedCacheHeader) -> TexResult<Vec<CatalogEntry>> {
        header.check_structure(self.len)?;
        let len = header
            .catalog_len()
            .ok_or_else(|| TexCacheError::Format("catalog size overflow".into()))?;
        let mut buf = vec![0u8; len as usize];
        read_at(&self.file, header.catalog_offset as u64, &mut buf)?;

        let mut entries = Vec::with_capacity(header.n_entries as usize);
        for chunk in buf.chunks_exact(ENTRY_SIZE) {
            let entry = CatalogEntry::deserialize(chunk);
            if entry.v.texture_offset < HEADER_SIZE as i32
                || entry.v.end() > header.catalog_offset as u64
            {
                return Err(TexCacheError::Format(format!(
                    "entry {:?} points outside the data area",
                    entry.k
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn read_blob(&self, value: &CatalogEntryValue) -> TexResult<Bytes> {
        if value.end() > self.len {
            return Err(TexCacheError::Format(
                "tile byte range exceeds file size".into(),
            ));
        }
        let mut buf = vec![0u8; value.compressed_size as usize];
        read_at(&self.file, value.texture_offset as u64, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn write_blob(&mut self, offset: u64, data: &[u8]) -> TexResult<()> {
        write_at(&self.file, offset, data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    /// Zero the magic so a crash before the next catalog write rebuilds the
    /// cache instead of trusting a catalog that blobs have overwritten.
    pub fn invalidate_header(&mut self) -> TexResult<()> {
        if self.len >= 4 {
            write_at(&self.file, 0, &0u32.to_le_bytes())?;
        }
        Ok(())
    }

    /// Truncate and write a fresh, empty header.
    pub fn reset(&mut self, header: &CompressedCacheHeader) -> TexResult<()> {
        self.file.set_len(0)?;
        self.len = 0;
        write_at(&self.file, 0, &header.to_bytes())?;
        self.len = HEADER_SIZE as u64;
        self.file.sync_data()?;
        Ok(())
    }

    /// Write the catalog at `header.catalog_offset`, cut the file after it
    /// and write the header last.
    pub fn write_catalog_and_header(
        &mut self,
        header: &CompressedCacheHeader,
        entries: &[CatalogEntry],
    ) -> TexResult<()> {
        let mut buf = vec![0u8; entries.len() * ENTRY_SIZE];
        for (entry, chunk) in entries.iter().zip(buf.chunks_exact_mut(ENTRY_SIZE)) {
            entry.serialize(chunk);
        }

        let offset = header.catalog_offset as u64;
        write_at(&self.file, offset, &buf)?;
        let end = offset + buf.len() as u64;
        self.file.set_len(end)?;
        self.len = end;
        self.file.sync_data()?;

        write_at(&self.file, 0, &header.to_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Read and fully validate a cache file without a chart attached.
pub fn read_cache_file(path: &Path) -> TexResult<(CompressedCacheHeader, Vec<CatalogEntry>)> {
    let file = CacheFile::open_read_only(path)?;
    let header = file
        .read_header()?
        .ok_or_else(|| TexCacheError::Format("file shorter than header".into()))?;
    let entries = file.read_catalog(&header)?;
    for entry in &entries {
        if entry.level_and_scheme().is_none() {
            return Err(TexCacheError::Format(format!(
                "entry key out of range: {:?}",
                entry.k
            )));
        }
    }
    Ok((header, entries))
}

#[cfg(windows)]
fn read_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}
