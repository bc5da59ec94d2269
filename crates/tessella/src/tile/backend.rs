//! Multi-resolution tiled history back-end.
//!
//! The write path distributes every incoming interval to one open tile per
//! resolution level; a tile that overflows its window is serialised, appended
//! to the file and replaced by a successor. The read path starts at the
//! finest level and falls back to the adjacent tile, then to coarser levels,
//! until the query is resolved; the coarsest level keeps every short run and
//! is authoritative.

use crate::backend::StateHistoryBackend;
use crate::error::{HistoryError, Result};
use crate::interval::{Quark, StateInterval};
use crate::tile::file::TileFileConfig;
use crate::tile::HistoryTile;
use crate::value::StateValue;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default number of display pixels a tile is sized for.
pub const N_PIXELS: u32 = 2000;

/// Resolutions below this are never generated by the automatic ladder.
pub const MIN_RESOLUTION: i64 = 10_000;

/// Each ladder level is four times finer than the previous one.
const REDUCTION_FACTOR: f64 = 0.25;

/// Derives the default resolution ladder for a trace of `[start, end]`.
///
/// The coarsest resolution maps the whole trace onto [`N_PIXELS`] pixels;
/// each further level divides it by four, stopping once a level reaches
/// [`MIN_RESOLUTION`] or finer.
pub fn resolution_ladder(start: i64, end: i64) -> Vec<i64> {
    let duration = (end - start).max(0);
    let pixels = i64::from(N_PIXELS);
    let coarsest = (duration + pixels - 1) / pixels + 1;
    let mut resolutions = Vec::new();
    let mut resolution = coarsest;
    loop {
        resolutions.push(resolution);
        if resolution <= MIN_RESOLUTION {
            break;
        }
        resolution = ((resolution as f64) * REDUCTION_FACTOR) as i64;
        if resolution < 1 {
            break;
        }
    }
    resolutions
}

/// A tile borrowed from the open set or loaded from disk.
enum TileRef<'a> {
    Open(&'a HistoryTile),
    Loaded(Arc<HistoryTile>),
}

impl Deref for TileRef<'_> {
    type Target = HistoryTile;

    fn deref(&self) -> &HistoryTile {
        match self {
            TileRef::Open(tile) => tile,
            TileRef::Loaded(tile) => tile,
        }
    }
}

/// On-disk history back-end storing intervals in fixed-window tiles, one tile
/// array per resolution level.
pub struct TiledHistory {
    ssid: String,
    config: TileFileConfig,
    end_time: i64,
    finished: bool,
    disposed: bool,
    /// One open tile per level while building; drained on finish.
    open_tiles: Vec<HistoryTile>,
    /// Last tile read per level, kept once the store is read-mostly.
    read_cache: Mutex<Vec<Option<Arc<HistoryTile>>>>,
    writer: File,
    write_pos: u64,
}

impl TiledHistory {
    /// Creates a new history file at `path`, deleting any previous file.
    ///
    /// `resolutions` must be monotonically decreasing, coarsest first.
    pub fn create(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider_version: u32,
        start_time: i64,
        n_pixels: u32,
        resolutions: Vec<i64>,
    ) -> Result<Self> {
        let path = path.as_ref();
        debug_assert!(
            resolutions.windows(2).all(|pair| pair[0] > pair[1]),
            "resolution ladder must be strictly decreasing"
        );
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let config = TileFileConfig::new(path, provider_version, start_time, n_pixels, resolutions);
        let mut writer = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let write_pos = config.tile_section_start();
        writer.seek(SeekFrom::Start(write_pos))?;
        let levels = config.resolutions().len();
        Ok(Self {
            ssid: ssid.into(),
            config,
            end_time: start_time,
            finished: false,
            disposed: false,
            open_tiles: Vec::with_capacity(levels),
            read_cache: Mutex::new(vec![None; levels]),
            writer,
            write_pos,
        })
    }

    /// Creates a new history file with the default ladder derived from the
    /// trace range.
    pub fn create_auto(
        ssid: impl Into<String>,
        start_time: i64,
        end_time: i64,
        provider_version: u32,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let resolutions = resolution_ladder(start_time, end_time);
        Self::create(ssid, path, provider_version, start_time, N_PIXELS, resolutions)
    }

    /// Opens an existing, finished history file.
    ///
    /// The provider version must match the one recorded in the header unless
    /// the caller passes [`IGNORE_PROVIDER_VERSION`](crate::backend::IGNORE_PROVIDER_VERSION).
    /// The returned back-end
    /// is already in the finished state; disposing it leaves the file intact.
    pub fn open_existing(
        ssid: impl Into<String>,
        provider_version: u32,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let config = TileFileConfig::read_header(path, provider_version, 0)?;
        let end_time = (0..config.resolutions().len())
            .map(|level| {
                let covered = config.flushed_tile_upper_bound(level) as i64;
                config.start() + covered * config.tile_span(level)
            })
            .max()
            .unwrap_or(config.start());
        let writer = OpenOptions::new().write(true).open(path)?;
        let levels = config.resolutions().len();
        Ok(Self {
            ssid: ssid.into(),
            config,
            end_time,
            finished: true,
            disposed: false,
            open_tiles: Vec::new(),
            read_cache: Mutex::new(vec![None; levels]),
            writer,
            write_pos: 0,
        })
    }

    /// Number of flushed tiles at `level` (level 0 is the coarsest).
    pub fn tile_count(&self, level: usize) -> usize {
        self.config.flushed_tile_count(level)
    }

    /// The resolution ladder in use, coarsest first.
    pub fn resolutions(&self) -> &[i64] {
        self.config.resolutions()
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        Ok(())
    }

    /// Serialises `tile` and appends it to the tile section. I/O failures are
    /// logged and swallowed; the build carries on best-effort.
    fn flush_tile(&mut self, tile: HistoryTile) {
        let position = self.write_pos;
        let result = tile.to_bytes().and_then(|bytes| {
            self.writer.seek(SeekFrom::Start(position))?;
            self.writer.write_all(&bytes)?;
            Ok(bytes.len() as u64)
        });
        match result {
            Ok(len) => {
                debug!(
                    resolution = tile.resolution(),
                    start = tile.start(),
                    bytes = len,
                    "flushed tile"
                );
                self.config.add_tile(&tile, position);
                self.write_pos += len;
            }
            Err(error) => {
                warn!(
                    resolution = tile.resolution(),
                    start = tile.start(),
                    %error,
                    "failed to flush tile"
                );
            }
        }
    }

    /// Builds the successor of the open tile at `level`, skipping forward
    /// until the window contains `end_time`.
    fn successor_tile(&self, level: usize, end_time: i64) -> HistoryTile {
        let span = self.config.tile_span(level);
        let mut start = self.open_tiles[level].end() + 1;
        let mut end = start + span;
        while end < end_time {
            start = end + 1;
            end = start + span;
        }
        HistoryTile::new(self.config.resolutions()[level], start, end, level == 0)
    }

    /// Reads the tile containing `time` at `level`, preferring the open tile
    /// and the per-level read cache.
    fn read_tile(&self, level: usize, time: i64) -> Result<TileRef<'_>> {
        if let Some(open) = self.open_tiles.get(level) {
            if time >= open.start() && time < open.end() {
                return Ok(TileRef::Open(open));
            }
        }
        {
            let cache = self.read_cache.lock().unwrap();
            if let Some(cached) = cache.get(level).and_then(Option::as_ref) {
                if time >= cached.start() && time < cached.end() {
                    return Ok(TileRef::Loaded(Arc::clone(cached)));
                }
            }
        }
        let index = self.config.tile_index(level, time);
        let tile = Arc::new(self.config.read_tile(level, index)?);
        if self.finished {
            let mut cache = self.read_cache.lock().unwrap();
            if let Some(slot) = cache.get_mut(level) {
                *slot = Some(Arc::clone(&tile));
            }
        }
        Ok(TileRef::Loaded(tile))
    }

    /// Next coarser level worth trying: skips levels whose resolution is
    /// still finer than the current level's whole tile span, and always makes
    /// progress.
    fn coarser_level(&self, level: usize) -> usize {
        let resolutions = self.config.resolutions();
        let min_interval_size = resolutions[level] * i64::from(self.config.n_pixels());
        let mut next = level;
        while next > 0 && min_interval_size > resolutions[next - 1] {
            next -= 1;
        }
        if next == level && level > 0 {
            level - 1
        } else {
            next
        }
    }

    /// Last stored interval of `quark` in the coarsest tile covering the
    /// observed end time.
    ///
    /// Used as a tail fallback: a query exactly at the end time may land past
    /// every stored interval of a quark when the producer never emitted a
    /// closing interval. The last known state is returned as-is, with its
    /// original end time, so callers that require covering intervals (the
    /// checkpoint front-end's fullness check) still see it as incomplete.
    fn tail_interval(&self, quark: Quark) -> Option<StateInterval> {
        if let Some(interval) = self.read_tile(0, self.end_time).ok()?.last_interval(quark) {
            return Some(interval);
        }
        // Successor tiles drift forward one unit per rotation, so the final
        // tile can sit one directory slot before the one the grid names.
        let earlier = self.end_time - self.config.tile_span(0);
        self.read_tile(0, earlier).ok()?.last_interval(quark)
    }

    /// Index of the smallest level whose resolution is at most `step`,
    /// falling back to the finest.
    fn level_for_step(&self, step: i64) -> usize {
        let resolutions = self.config.resolutions();
        let mut level = 0;
        while resolutions[level] > step && level + 1 < resolutions.len() {
            level += 1;
        }
        level
    }
}

impl StateHistoryBackend for TiledHistory {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.config.start()
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }

    fn insert(&mut self, start: i64, end: i64, quark: Quark, value: StateValue) -> Result<()> {
        self.check_live()?;
        if end < start {
            return Err(HistoryError::TimeRange { t: end, start, end });
        }
        self.end_time = end;
        for level in 0..self.config.resolutions().len() {
            if self.open_tiles.len() <= level {
                let span = self.config.tile_span(level);
                self.open_tiles.push(HistoryTile::new(
                    self.config.resolutions()[level],
                    start,
                    start + span,
                    level == 0,
                ));
            }
            self.open_tiles[level].insert(start, end, quark, value.clone());
            if self.open_tiles[level].is_finished() {
                let successor = self.successor_tile(level, end);
                let full = std::mem::replace(&mut self.open_tiles[level], successor);
                self.flush_tile(full);
                self.open_tiles[level].insert(start, end, quark, value.clone());
            }
        }
        Ok(())
    }

    fn finished_building(&mut self, end_time: i64) -> Result<()> {
        self.check_live()?;
        if self.finished {
            return Ok(());
        }
        if end_time > self.end_time {
            self.end_time = end_time;
        }
        for tile in std::mem::take(&mut self.open_tiles) {
            self.flush_tile(tile);
        }
        self.config.write_header(&mut self.writer)?;
        self.writer.sync_all()?;
        self.finished = true;
        Ok(())
    }

    fn point_query(&self, state: &mut Vec<Option<StateInterval>>, t: i64) -> Result<()> {
        self.check_live()?;
        let levels = self.config.resolutions().len();
        if levels == 0 {
            return Ok(());
        }
        let mut level = levels - 1;
        let tile = self.read_tile(level, t)?;
        tile.point_query(state, t);
        loop {
            if !state.iter().any(Option::is_none) {
                return Ok(());
            }
            // State may begin in a later tile of the same level.
            let adjacent = t + self.config.tile_span(level);
            if adjacent <= self.end_time {
                self.read_tile(level, adjacent)?.point_query(state, t);
            }
            if !state.iter().any(Option::is_none) || level == 0 {
                break;
            }
            level = self.coarser_level(level);
            self.read_tile(level, t)?.point_query(state, t);
        }
        if t == self.end_time {
            for (quark, slot) in state.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = self.tail_interval(quark as Quark);
                }
            }
        }
        Ok(())
    }

    fn singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_live()?;
        let levels = self.config.resolutions().len();
        if levels == 0 {
            return Ok(None);
        }
        let mut level = levels - 1;
        let mut found = self.read_tile(level, t)?.singular_query(t, quark);
        loop {
            if found.is_some() {
                return Ok(found);
            }
            let adjacent = t + self.config.tile_span(level);
            if adjacent <= self.end_time {
                found = self.read_tile(level, adjacent)?.singular_query(t, quark);
            }
            if found.is_some() || level == 0 {
                break;
            }
            level = self.coarser_level(level);
            found = self.read_tile(level, t)?.singular_query(t, quark);
        }
        if found.is_none() && t == self.end_time {
            found = self.tail_interval(quark);
        }
        Ok(found)
    }

    fn range_query<'a>(
        &'a self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Result<Box<dyn Iterator<Item = StateInterval> + 'a>> {
        self.check_live()?;
        if times.len() < 2 || times[0] >= self.end_time || self.config.resolutions().is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let step = times[1] - times[0];
        let level = self.level_for_step(step);
        debug!(
            step,
            resolution = self.config.resolutions()[level],
            "selected range-query resolution"
        );
        Ok(Box::new(TileRangeQuery::new(
            self,
            level,
            quarks.to_vec(),
            times.to_vec(),
        )))
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.open_tiles.clear();
        self.read_cache.lock().unwrap().iter_mut().for_each(|slot| *slot = None);
        if !self.finished {
            if let Err(error) = std::fs::remove_file(self.config.path()) {
                warn!(%error, "failed to delete unfinished history file");
            }
        }
    }

    fn remove_files(&mut self) {
        if let Err(error) = std::fs::remove_file(self.config.path()) {
            warn!(%error, "failed to delete history file");
        }
    }
}

impl Drop for TiledHistory {
    fn drop(&mut self) {
        if !self.disposed && !self.finished {
            let _ = std::fs::remove_file(self.config.path());
        }
    }
}

/// Lazy iterator over the tiles covering a 2-D query.
///
/// Walks the selected level tile by tile, buffering each tile's matching
/// intervals, then tops up quarks whose state at `times.max` begins in a tile
/// past the walk. Internal errors degrade to an exhausted iterator.
struct TileRangeQuery<'a> {
    backend: &'a TiledHistory,
    level: usize,
    quarks: Vec<Quark>,
    times: Vec<i64>,
    cursor: i64,
    walking: bool,
    missing: Vec<Quark>,
    buffered: VecDeque<StateInterval>,
}

impl<'a> TileRangeQuery<'a> {
    fn new(backend: &'a TiledHistory, level: usize, quarks: Vec<Quark>, times: Vec<i64>) -> Self {
        let cursor = times[0].max(backend.start_time());
        Self {
            backend,
            level,
            quarks,
            times,
            cursor,
            walking: true,
            missing: Vec::new(),
            buffered: VecDeque::new(),
        }
    }

    fn max_time(&self) -> i64 {
        *self.times.last().expect("times checked non-empty")
    }

    /// Buffers the next tile's matching intervals. Returns false once the
    /// walk is over.
    fn load_next_tile(&mut self) -> bool {
        if !self.walking {
            return false;
        }
        let tile = match self.backend.read_tile(self.level, self.cursor) {
            Ok(tile) => tile,
            Err(error) => {
                warn!(%error, "range query degraded by tile read failure");
                self.walking = false;
                self.missing.clear();
                return false;
            }
        };
        self.buffered
            .extend(tile.range_query(&self.quarks, &self.times).cloned());
        if tile.end() >= self.max_time() || tile.end() >= self.backend.end_time() {
            // Last tile of the walk: anything still open here is finished by
            // a point query at the range's end.
            self.missing = tile.missing(&self.quarks, self.max_time());
            self.walking = false;
        } else {
            self.cursor += self.backend.config.tile_span(self.level);
        }
        true
    }

    fn load_missing(&mut self) {
        let t = self.max_time().min(self.backend.end_time());
        for quark in std::mem::take(&mut self.missing) {
            match self.backend.singular_query(t, quark) {
                Ok(Some(interval)) => self.buffered.push_back(interval),
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, quark, "range query top-up failed");
                }
            }
        }
    }
}

impl Iterator for TileRangeQuery<'_> {
    type Item = StateInterval;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(interval) = self.buffered.pop_front() {
                return Some(interval);
            }
            if self.load_next_tile() {
                continue;
            }
            if !self.missing.is_empty() {
                self.load_missing();
                continue;
            }
            return None;
        }
    }
}
