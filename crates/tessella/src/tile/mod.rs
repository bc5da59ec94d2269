//! Fixed-window interval tiles.
//!
//! A tile covers one time window at one resolution and holds, per quark, an
//! ordered list of intervals. Intervals shorter than the tile's resolution
//! are coalesced into their predecessor so a finished tile never stores more
//! detail than the resolution can show; the coarsest level disables the
//! cut-off and keeps every run.
//!
//! ## Payload layout
//!
//! ```text
//! tileSize: u32 LE          total byte count, including this field
//! nAttributes: u32 LE
//! repeated nAttributes times:
//!     intervalCount: u32 LE
//!     quark: i32 LE
//!     firstStart: varint
//!     intervalCount × (value, duration: varint)
//! ```
//!
//! Per-interval start times are not stored: within one quark's list each
//! interval begins where the previous one ends, so the reader advances
//! `start += duration` from `firstStart`.

pub mod backend;
pub mod file;

use crate::error::{HistoryError, Result};
use crate::interval::{intersects_samples, Quark, StateInterval};
use crate::value::StateValue;
use crate::varint;
use std::collections::HashMap;
use std::io::{Cursor, Read};

/// A bounded time window of intervals at one resolution.
#[derive(Debug)]
pub struct HistoryTile {
    resolution: i64,
    start: i64,
    end: i64,
    finished: bool,
    ignore_resolution_cutoff: bool,
    /// Serialised size of the interval bodies accumulated so far.
    content_size: usize,
    intervals: HashMap<Quark, Vec<StateInterval>>,
}

impl HistoryTile {
    /// Creates an empty tile spanning `[start, end]` at `resolution`.
    ///
    /// With `ignore_resolution_cutoff` set, short intervals are never
    /// coalesced; the coarsest level uses this so it stays authoritative.
    pub fn new(resolution: i64, start: i64, end: i64, ignore_resolution_cutoff: bool) -> Self {
        Self {
            resolution,
            start,
            end,
            finished: false,
            ignore_resolution_cutoff,
            content_size: 0,
            intervals: HashMap::new(),
        }
    }

    /// The tile's resolution in time units.
    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    /// Start of the tile's window.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End of the tile's window.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// True once an insert has overflowed the window; the caller must rotate
    /// to a successor tile.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of quarks holding at least one interval.
    pub fn attribute_count(&self) -> usize {
        self.intervals.len()
    }

    /// Total number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.intervals.values().map(Vec::len).sum()
    }

    /// Offers an interval to the tile.
    ///
    /// Intervals ending before the window are discarded. An interval ending
    /// past the window marks the tile finished and is not stored. Otherwise
    /// the interval is appended to its quark's list, or coalesced into the
    /// list's last entry when both are shorter than the resolution, the last
    /// entry is non-null and the cut-off is enabled.
    ///
    /// Lists must stay contiguous for the on-disk start reconstruction to be
    /// exact, so a gap between the previous entry's end and `start` is padded
    /// with an explicit null interval.
    pub fn insert(&mut self, start: i64, end: i64, quark: Quark, value: StateValue) {
        if end < self.start {
            return;
        }
        if end > self.end {
            self.finished = true;
            return;
        }
        let mut content_size = self.content_size;
        let list = self.intervals.entry(quark).or_insert_with(|| Vec::with_capacity(1));
        if let Some(prev_end) = list.last().map(|iv| iv.end) {
            debug_assert!(start >= prev_end, "intervals delivered out of order");
            if start > prev_end {
                let filler = StateInterval::new(prev_end, start, quark, StateValue::Null);
                content_size +=
                    filler.value.encoded_len() + varint::encoded_len(filler.duration() as u64);
                list.push(filler);
            }
        }
        if end - start < self.resolution && !self.ignore_resolution_cutoff {
            let last = list.last_mut().filter(|iv| iv.end - iv.start < self.resolution);
            if let Some(last) = last {
                if !last.value.is_null() {
                    content_size += varint::encoded_len((end - last.start) as u64);
                    content_size -= varint::encoded_len((last.end - last.start) as u64);
                    last.end = end;
                    self.content_size = content_size;
                    return;
                }
            }
        }
        let interval = StateInterval::new(start, end, quark, value);
        content_size +=
            interval.value.encoded_len() + varint::encoded_len(interval.duration() as u64);
        list.push(interval);
        self.content_size = content_size;
    }

    /// Fills the unresolved entries of `state` with this tile's intervals
    /// covering `t`. Quarks the tile knows nothing about are left untouched.
    pub fn point_query(&self, state: &mut [Option<StateInterval>], t: i64) {
        if t > self.end {
            return;
        }
        for (&quark, _) in self.intervals.iter() {
            let idx = quark as usize;
            if idx < state.len() && state[idx].is_none() {
                state[idx] = self.singular_query(t, quark);
            }
        }
    }

    /// Returns the interval covering `t` for one quark, if this tile has it.
    pub fn singular_query(&self, t: i64, quark: Quark) -> Option<StateInterval> {
        if t > self.end {
            return None;
        }
        self.intervals
            .get(&quark)?
            .iter()
            .find(|iv| iv.intersects(t))
            .cloned()
    }

    /// Returns the last stored interval of one quark, if any.
    pub fn last_interval(&self, quark: Quark) -> Option<StateInterval> {
        self.intervals.get(&quark)?.last().cloned()
    }

    /// Quarks whose list is absent or whose last interval ends before `t`.
    pub fn missing(&self, quarks: &[Quark], t: i64) -> Vec<Quark> {
        quarks
            .iter()
            .copied()
            .filter(|quark| match self.intervals.get(quark) {
                Some(list) => list.last().map_or(true, |iv| iv.end < t),
                None => true,
            })
            .collect()
    }

    /// Lazily yields intervals of the requested quarks that intersect at
    /// least one sample of the sorted `times` series.
    pub fn range_query<'a>(
        &'a self,
        quarks: &'a [Quark],
        times: &'a [i64],
    ) -> impl Iterator<Item = &'a StateInterval> + 'a {
        self.intervals
            .iter()
            .filter(move |(quark, _)| quarks.contains(quark))
            .flat_map(|(_, list)| list.iter())
            .filter(move |iv| intersects_samples(times, iv.start, iv.end))
    }

    /// Serialises the tile payload, returning the bytes to append to the
    /// tile section of the history file.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.content_size + 8 + self.intervals.len() * 10);
        buf.extend_from_slice(&0u32.to_le_bytes()); // patched below
        buf.extend_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        for (&quark, list) in self.intervals.iter() {
            buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
            buf.extend_from_slice(&quark.to_le_bytes());
            varint::write_u64(&mut buf, list[0].start as u64)?;
            for iv in list {
                iv.value.write_to(&mut buf)?;
                varint::write_u64(&mut buf, iv.duration() as u64)?;
            }
        }
        let tile_size = buf.len() as u32;
        buf[0..4].copy_from_slice(&tile_size.to_le_bytes());
        Ok(buf)
    }

    /// Rebuilds a tile from `payload`, the serialised bytes *after* the
    /// leading `tileSize` field.
    pub fn from_payload(
        payload: &[u8],
        resolution: i64,
        start: i64,
        end: i64,
        ignore_resolution_cutoff: bool,
    ) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let n_attributes = read_u32(&mut cursor)?;

        let mut intervals = HashMap::with_capacity(n_attributes as usize);
        let mut content_size = 0usize;
        for _ in 0..n_attributes {
            let count = read_u32(&mut cursor)?;
            let quark = read_i32(&mut cursor)?;
            let mut interval_start = varint::read_u64(&mut cursor)? as i64;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let value = StateValue::read_from(&mut cursor)?;
                let duration = varint::read_u64(&mut cursor)? as i64;
                let interval_end = interval_start + duration;
                content_size += value.encoded_len() + varint::encoded_len(duration as u64);
                list.push(StateInterval::new(interval_start, interval_end, quark, value));
                interval_start = interval_end;
            }
            intervals.insert(quark, list);
        }

        Ok(Self {
            resolution,
            start,
            end,
            finished: true,
            ignore_resolution_cutoff,
            content_size,
            intervals,
        })
    }

    #[cfg(test)]
    fn list(&self, quark: Quark) -> &[StateInterval] {
        self.intervals.get(&quark).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| HistoryError::Corrupt("truncated tile".to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    read_u32(reader).map(|v| v as i32)
}
