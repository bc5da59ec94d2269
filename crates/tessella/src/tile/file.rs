//! On-disk layout of a tiled history file.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Static header (16 bytes)                                    │
//! │  - Magic: u32 = 0x05FFB100                                   │
//! │  - File version: u32 = 1                                     │
//! │  - Provider version: u32                                     │
//! │  - Config header size: u32                                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Config header                                               │
//! │  - nPixels: u32, nResolutions: u32                           │
//! │  - per level: resolution: u64, nTiles: u32,                  │
//! │               tileOffsets: nTiles × u64                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Tile section (contiguous serialised tiles)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers little-endian. A tile offset of 0 means the tile was never
//! flushed and reads back as an empty tile. The header is written once, when
//! the build finishes; until then only the tile section exists on disk.

use crate::backend::IGNORE_PROVIDER_VERSION;
use crate::error::{HistoryError, Result};
use crate::tile::HistoryTile;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number identifying a tiled history file.
pub const HISTORY_FILE_MAGIC: u32 = 0x05FF_B100;

/// Current file format version.
pub const FILE_VERSION: u32 = 1;

/// Size of the static header in bytes.
const STATIC_HEADER_SIZE: u64 = 16;

/// Addressing and header bookkeeping for one tiled history file.
///
/// Holds the resolution ladder, the per-level tile-offset directories and the
/// file identity fields. Tiles are addressed by `(level, index)`, where level
/// 0 is the coarsest resolution and the index counts tile spans from the
/// trace start.
#[derive(Debug)]
pub struct TileFileConfig {
    path: PathBuf,
    provider_version: u32,
    start: i64,
    n_pixels: u32,
    /// Monotonically decreasing; index 0 is the coarsest.
    resolutions: Vec<i64>,
    /// Per-level absolute file offsets; 0 = never flushed.
    tile_offsets: Vec<Vec<u64>>,
}

impl TileFileConfig {
    /// Creates the configuration for a new file.
    ///
    /// Directory slots are pre-allocated so that the coarsest level's span is
    /// covered by every level; they grow on demand when a caller-supplied
    /// ladder spans less than the trace.
    pub fn new(
        path: impl Into<PathBuf>,
        provider_version: u32,
        start: i64,
        n_pixels: u32,
        resolutions: Vec<i64>,
    ) -> Self {
        let mut config = Self {
            path: path.into(),
            provider_version,
            start,
            n_pixels,
            resolutions,
            tile_offsets: Vec::new(),
        };
        let counts: Vec<usize> = (0..config.resolutions.len())
            .map(|level| config.initial_tile_count(level))
            .collect();
        config.tile_offsets = counts.into_iter().map(|count| vec![0u64; count]).collect();
        config
    }

    /// Number of directory slots a level needs to cover the coarsest level's
    /// span.
    fn initial_tile_count(&self, level: usize) -> usize {
        match self.resolutions.first() {
            Some(&coarsest) => {
                let r = self.resolutions[level];
                ((coarsest + r - 1) / r) as usize
            }
            None => 0,
        }
    }

    /// The file this configuration belongs to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Trace start time.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Number of pixels a tile is sized for.
    pub fn n_pixels(&self) -> u32 {
        self.n_pixels
    }

    /// The resolution ladder, coarsest first.
    pub fn resolutions(&self) -> &[i64] {
        &self.resolutions
    }

    /// State-provider version recorded in the header.
    pub fn provider_version(&self) -> u32 {
        self.provider_version
    }

    /// Time span of one tile at `level`.
    pub fn tile_span(&self, level: usize) -> i64 {
        self.resolutions[level] * i64::from(self.n_pixels)
    }

    /// Directory index of the tile containing `time` at `level`.
    pub fn tile_index(&self, level: usize, time: i64) -> i64 {
        (time - self.start).div_euclid(self.tile_span(level))
    }

    /// Number of directory slots holding a flushed tile at `level`.
    pub fn flushed_tile_count(&self, level: usize) -> usize {
        self.tile_offsets[level]
            .iter()
            .filter(|&&offset| offset != 0)
            .count()
    }

    /// Index one past the last flushed tile at `level`, 0 when none. The
    /// write path may skip slots, so this can exceed the flushed count.
    pub fn flushed_tile_upper_bound(&self, level: usize) -> usize {
        self.tile_offsets[level]
            .iter()
            .rposition(|&offset| offset != 0)
            .map_or(0, |index| index + 1)
    }

    /// File offset where the tile section begins.
    pub fn tile_section_start(&self) -> u64 {
        STATIC_HEADER_SIZE + self.config_header_size() as u64
    }

    fn config_header_size(&self) -> u32 {
        let mut size = 4 + 4;
        for offsets in &self.tile_offsets {
            size += 8 + 4 + 8 * offsets.len() as u32;
        }
        size
    }

    /// Records a flushed tile's file position in the directory, growing the
    /// level's directory if the tile lies past its current coverage.
    pub fn add_tile(&mut self, tile: &HistoryTile, position: u64) {
        let Some(level) = self
            .resolutions
            .iter()
            .position(|&r| r == tile.resolution())
        else {
            return;
        };
        let index = self.tile_index(level, tile.start()) as usize;
        let offsets = &mut self.tile_offsets[level];
        if offsets.len() <= index {
            offsets.resize(index + 1, 0);
        }
        offsets[index] = position;
    }

    /// Reads the tile at `(level, index)`, synthesising an empty tile for
    /// slots that were never flushed or lie past the directory.
    pub fn read_tile(&self, level: usize, index: i64) -> Result<HistoryTile> {
        let span = self.tile_span(level);
        let tile_start = self.start + span * index;
        let tile_end = tile_start + span;
        let ignore_cutoff = level == 0;

        let offset = if index >= 0 {
            self.tile_offsets[level].get(index as usize).copied()
        } else {
            None
        };
        let Some(offset) = offset.filter(|&o| o != 0) else {
            return Ok(HistoryTile::new(
                self.resolutions[level],
                tile_start,
                tile_end,
                ignore_cutoff,
            ));
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut size_buf = [0u8; 4];
        file.read_exact(&mut size_buf)?;
        let tile_size = u32::from_le_bytes(size_buf) as usize;
        if tile_size < 8 {
            return Err(HistoryError::Corrupt(format!(
                "tile at offset {offset} has impossible size {tile_size}"
            )));
        }
        let mut payload = vec![0u8; tile_size - 4];
        file.read_exact(&mut payload)?;
        HistoryTile::from_payload(
            &payload,
            self.resolutions[level],
            tile_start,
            tile_end,
            ignore_cutoff,
        )
    }

    /// Writes the static and config headers at the start of the file.
    pub fn write_header(&self, file: &mut File) -> Result<()> {
        let config_size = self.config_header_size();
        let mut buf = Vec::with_capacity(STATIC_HEADER_SIZE as usize + config_size as usize);
        buf.extend_from_slice(&HISTORY_FILE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.provider_version.to_le_bytes());
        buf.extend_from_slice(&config_size.to_le_bytes());

        buf.extend_from_slice(&self.n_pixels.to_le_bytes());
        buf.extend_from_slice(&(self.resolutions.len() as u32).to_le_bytes());
        for (level, &resolution) in self.resolutions.iter().enumerate() {
            let offsets = &self.tile_offsets[level];
            buf.extend_from_slice(&(resolution as u64).to_le_bytes());
            buf.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
            for &offset in offsets {
                buf.extend_from_slice(&offset.to_le_bytes());
            }
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Reads and validates the header of an existing file.
    ///
    /// `start` is not stored in the header; the caller supplies the trace
    /// start it opened the history for. Pass [`IGNORE_PROVIDER_VERSION`] to
    /// skip the provider-version check.
    ///
    /// # Errors
    ///
    /// `InvalidMagic`, `UnsupportedVersion` or `ProviderVersionMismatch` when
    /// the header does not match; `Corrupt` on truncation.
    pub fn read_header(
        path: impl Into<PathBuf>,
        provider_version: u32,
        start: i64,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;

        let mut static_buf = [0u8; STATIC_HEADER_SIZE as usize];
        file.read_exact(&mut static_buf)
            .map_err(|_| HistoryError::Corrupt("truncated static header".to_string()))?;
        let magic = u32::from_le_bytes(static_buf[0..4].try_into().unwrap());
        if magic != HISTORY_FILE_MAGIC {
            return Err(HistoryError::InvalidMagic(magic));
        }
        let version = u32::from_le_bytes(static_buf[4..8].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(HistoryError::UnsupportedVersion(version));
        }
        let found_provider =
            u32::from_le_bytes(static_buf[8..12].try_into().unwrap());
        if found_provider != provider_version && provider_version != IGNORE_PROVIDER_VERSION {
            return Err(HistoryError::ProviderVersionMismatch {
                expected: provider_version,
                found: found_provider,
            });
        }
        let config_size =
            u32::from_le_bytes(static_buf[12..16].try_into().unwrap()) as usize;

        let mut config_buf = vec![0u8; config_size];
        file.read_exact(&mut config_buf)
            .map_err(|_| HistoryError::Corrupt("truncated config header".to_string()))?;
        let mut cursor = std::io::Cursor::new(config_buf);

        let n_pixels = read_u32(&mut cursor)?;
        let n_resolutions = read_u32(&mut cursor)? as usize;
        let mut resolutions = Vec::with_capacity(n_resolutions);
        let mut tile_offsets = Vec::with_capacity(n_resolutions);
        for _ in 0..n_resolutions {
            resolutions.push(read_u64(&mut cursor)? as i64);
            let n_tiles = read_u32(&mut cursor)? as usize;
            let mut offsets = Vec::with_capacity(n_tiles);
            for _ in 0..n_tiles {
                offsets.push(read_u64(&mut cursor)?);
            }
            tile_offsets.push(offsets);
        }

        Ok(Self {
            path,
            provider_version: found_provider,
            start,
            n_pixels,
            resolutions,
            tile_offsets,
        })
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| HistoryError::Corrupt("truncated config header".to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| HistoryError::Corrupt("truncated config header".to_string()))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn config(path: &Path) -> TileFileConfig {
        TileFileConfig::new(path, 3, 0, 10, vec![1000, 250])
    }

    #[test]
    fn test_initial_directory_sizing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir.path().join("history.tile"));
        assert_eq!(config.tile_offsets[0].len(), 1);
        assert_eq!(config.tile_offsets[1].len(), 4);
        assert_eq!(config.tile_span(0), 10_000);
        assert_eq!(config.tile_span(1), 2_500);
    }

    #[test]
    fn test_header_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.tile");
        let mut config = config(&path);
        let tile = HistoryTile::new(250, 2500, 5000, false);
        config.add_tile(&tile, 4242);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        config.write_header(&mut file).unwrap();
        drop(file);

        let read = TileFileConfig::read_header(&path, 3, 0).unwrap();
        assert_eq!(read.n_pixels(), 10);
        assert_eq!(read.resolutions(), &[1000, 250]);
        assert_eq!(read.tile_offsets[1][1], 4242);
        assert_eq!(read.tile_offsets[0], vec![0]);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.tile");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let result = TileFileConfig::read_header(&path, 3, 0);
        assert!(matches!(result, Err(HistoryError::InvalidMagic(0))));
    }

    #[test]
    fn test_provider_version_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.tile");
        let config = config(&path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        config.write_header(&mut file).unwrap();
        drop(file);

        let result = TileFileConfig::read_header(&path, 9, 0);
        assert!(matches!(
            result,
            Err(HistoryError::ProviderVersionMismatch {
                expected: 9,
                found: 3
            })
        ));
        assert!(TileFileConfig::read_header(&path, IGNORE_PROVIDER_VERSION, 0).is_ok());
    }

    #[test]
    fn test_unflushed_slot_reads_empty_tile() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir.path().join("history.tile"));
        let tile = config.read_tile(1, 2).unwrap();
        assert_eq!(tile.start(), 5000);
        assert_eq!(tile.end(), 7500);
        assert_eq!(tile.interval_count(), 0);
    }

    #[test]
    fn test_directory_grows_past_initial_estimate() {
        let dir = TempDir::new().unwrap();
        let mut config = TileFileConfig::new(dir.path().join("h.tile"), 1, 0, 2, vec![10]);
        assert_eq!(config.tile_offsets[0].len(), 1);
        let tile = HistoryTile::new(10, 80, 100, true);
        config.add_tile(&tile, 7);
        assert_eq!(config.tile_offsets[0].len(), 5);
        assert_eq!(config.tile_offsets[0][4], 7);
    }
}
