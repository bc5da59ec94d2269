//! The storage contract shared by all history back-ends.

use crate::error::Result;
use crate::interval::{Quark, StateInterval};
use crate::value::StateValue;

/// Sentinel provider version that disables the provider-version check when
/// opening an existing history file.
pub const IGNORE_PROVIDER_VERSION: u32 = u32::MAX;

/// A store of state intervals, written once in event order and queried by
/// timestamp.
///
/// The write side is single-threaded: one producer calls [`insert`] with
/// non-decreasing end times, then [`finished_building`] exactly once. Queries
/// take `&self` and may run concurrently with each other; running them
/// concurrently with the producer requires external synchronisation (a
/// read-write lock or a published snapshot), per the store's concurrency
/// model.
///
/// [`insert`]: StateHistoryBackend::insert
/// [`finished_building`]: StateHistoryBackend::finished_building
pub trait StateHistoryBackend: Send {
    /// Identifier of the owning state system.
    fn ssid(&self) -> &str;

    /// Earliest timestamp covered by this store.
    fn start_time(&self) -> i64;

    /// Latest timestamp observed so far.
    fn end_time(&self) -> i64;

    /// Inserts one past state interval.
    fn insert(&mut self, start: i64, end: i64, quark: Quark, value: StateValue) -> Result<()>;

    /// Marks the build complete at `end_time` and persists any pending state.
    /// A repeated call is a no-op.
    fn finished_building(&mut self, end_time: i64) -> Result<()>;

    /// Fills `state` with, for each quark index, the interval covering `t`.
    ///
    /// Entries already holding an interval are left untouched; entries for
    /// which no interval is found stay `None`. The vector is grown as needed.
    fn point_query(&self, state: &mut Vec<Option<StateInterval>>, t: i64) -> Result<()>;

    /// Returns the interval covering `t` for one quark, if any.
    fn singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>>;

    /// Returns the intervals of the requested quarks that intersect at least
    /// one sample of the (sorted, ascending) `times` series.
    ///
    /// The iterator may borrow the back-end but not the argument slices. On
    /// internal error implementations degrade to an exhausted iterator and
    /// log the failure.
    fn range_query<'a>(
        &'a self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Result<Box<dyn Iterator<Item = StateInterval> + 'a>>;

    /// Releases resources. If the build never finished, persistent files are
    /// deleted. Any later call on the back-end fails with `Disposed`.
    fn dispose(&mut self);

    /// Deletes the back-end's persistent files, if any.
    fn remove_files(&mut self);
}
