use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chart_texcache::catalog::CacheFile;
use chart_texcache::raster::unzip_texture;
use chart_texcache::{read_cache_file, RasterFormat};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

#[cfg(not(debug_assertions))]
const DEFAULT_DEBUG_LEVEL: u8 = 1;
#[cfg(debug_assertions)]
const DEFAULT_DEBUG_LEVEL: u8 = 2;

#[derive(Parser)]
#[command(version, about = "Inspect chart texture cache files", long_about = None)]
struct Cli {
    /// Turn debugging information on
    #[arg(short, long, default_value_t = DEFAULT_DEBUG_LEVEL, action = clap::ArgAction::Count)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// prints the header and catalog of a cache file
    Inspect {
        /// The .tcache file
        cache_file: PathBuf,

        /// Also list every catalog entry
        #[arg(short, long)]
        entries: bool,
    },

    /// checks a cache file and every tile blob in it
    Verify {
        /// The .tcache file
        cache_file: PathBuf,

        /// Tile edge length used to check decompressed sizes
        #[arg(short, long)]
        tile_dim: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_file(true)
        .with_line_number(true)
        .init();

    match cli.command {
        Commands::Inspect {
            cache_file,
            entries,
        } => inspect(&cache_file, entries),
        Commands::Verify {
            cache_file,
            tile_dim,
        } => verify(&cache_file, tile_dim),
    }
}

fn format_name(code: u32) -> String {
    match RasterFormat::from_code(code) {
        Some(format) => format!("{:?} ({:#06x})", format, code),
        None => format!("unknown ({:#06x})", code),
    }
}

fn inspect(path: &Path, list_entries: bool) -> Result<()> {
    let (header, entries) =
        read_cache_file(path).with_context(|| format!("reading {}", path.display()))?;

    println!("file:           {}", path.display());
    println!("magic:          {:#06x}", header.magic);
    println!("format:         {}", format_name(header.format));
    println!("chart date:     {}", header.chartdate);
    println!("entries:        {}", header.n_entries);
    println!("catalog offset: {}", header.catalog_offset);

    let data_bytes: u64 = entries.iter().map(|e| e.v.compressed_size as u64).sum();
    println!("blob bytes:     {}", data_bytes);

    if list_entries {
        println!();
        println!("{:>5} {:>6} {:>8} {:>8} {:>10} {:>8}", "level", "scheme", "x", "y", "offset", "size");
        for entry in &entries {
            let scheme = entry
                .level_and_scheme()
                .map(|(_, s)| format!("{:?}", s))
                .unwrap_or_else(|| entry.k.color_scheme.to_string());
            println!(
                "{:>5} {:>6} {:>8} {:>8} {:>10} {:>8}",
                entry.k.mip_level,
                scheme,
                entry.k.x,
                entry.k.y,
                entry.v.texture_offset,
                entry.v.compressed_size
            );
        }
    }
    Ok(())
}

fn verify(path: &Path, tile_dim: Option<u32>) -> Result<()> {
    let (header, entries) =
        read_cache_file(path).with_context(|| format!("reading {}", path.display()))?;
    let format = RasterFormat::from_code(header.format);
    let file = CacheFile::open_read_only(path)?;

    let mut bad = 0usize;
    for entry in &entries {
        let blob = file.read_blob(&entry.v)?;
        let data = match unzip_texture(&blob) {
            Ok(data) => data,
            Err(e) => {
                warn!("{:?}: {}", entry.k, e);
                bad += 1;
                continue;
            }
        };
        if let (Some(dim), Some(format)) = (tile_dim, format) {
            let level_dim = dim >> entry.k.mip_level.clamp(0, 31);
            let expected = format.encoded_size(level_dim, level_dim);
            if data.len() != expected {
                warn!(
                    "{:?}: {} bytes, expected {} for a {}px tile",
                    entry.k,
                    data.len(),
                    expected,
                    level_dim
                );
                bad += 1;
            }
        }
    }

    if bad > 0 {
        bail!("{} of {} tiles in {} are damaged", bad, entries.len(), path.display());
    }
    info!("{}: {} tiles ok", path.display(), entries.len());
    println!("ok");
    Ok(())
}
