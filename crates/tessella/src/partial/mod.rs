//! Checkpoint-based partial history front-end.
//!
//! A shim inserted between a state system and a real storage back-end. It
//! keeps a set of evenly spaced checkpoints and forwards to the inner store
//! only the intervals that cross at least one of them; everything else is
//! discarded. Queries restore the nearest earlier checkpoint snapshot from
//! the inner store, then re-feed trace events through a private state
//! provider into a shadow state-system to rebuild the exact state at the
//! requested time.

pub mod shadow;

use crate::backend::StateHistoryBackend;
use crate::error::{HistoryError, Result};
use crate::interval::{Quark, StateInterval, TimeRange};
use crate::provider::{EventSource, StateProvider};
use crate::value::StateValue;
use shadow::{ShadowStateSystem, CHECKPOINT_ATTRIBUTE};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::debug;

/// A history back-end persisting only checkpoint-crossing intervals,
/// recovering everything else by replaying trace events.
pub struct CheckpointHistory {
    ssid: String,
    /// The real storage back-end; the replay is purely advisory, this store
    /// stays authoritative.
    inner: Box<dyn StateHistoryBackend>,
    shadow: Arc<ShadowStateSystem>,
    /// Private provider bound to the shadow, driven only during replays.
    provider: Mutex<Box<dyn StateProvider>>,
    source: Arc<dyn EventSource>,
    granularity: i64,
    checkpoints: RwLock<BTreeSet<i64>>,
    latest_time: AtomicI64,
    checkpoint_quark: OnceLock<Quark>,
    disposed: bool,
}

impl CheckpointHistory {
    /// Wraps `inner` with checkpoint+replay recovery.
    ///
    /// `provider` must be a dedicated instance assigned to `shadow`, not the
    /// provider building the upstream state system: the two have different
    /// targets. `granularity` is the time distance between checkpoints.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is not positive or if `provider` is not bound
    /// to `shadow`.
    pub fn new(
        ssid: impl Into<String>,
        provider: Box<dyn StateProvider>,
        shadow: Arc<ShadowStateSystem>,
        inner: Box<dyn StateHistoryBackend>,
        granularity: i64,
    ) -> Self {
        assert!(granularity > 0, "checkpoint granularity must be positive");
        assert!(
            Arc::ptr_eq(&provider.assigned_state_system(), &shadow),
            "replay provider must be bound to the shadow state-system"
        );
        let source = provider.trace();
        let latest = inner.start_time();
        Self {
            ssid: ssid.into(),
            inner,
            shadow,
            provider: Mutex::new(provider),
            source,
            granularity,
            checkpoints: RwLock::new(BTreeSet::new()),
            latest_time: AtomicI64::new(latest),
            checkpoint_quark: OnceLock::new(),
            disposed: false,
        }
    }

    /// The shadow state-system driven by this history's replays.
    pub fn shadow(&self) -> &Arc<ShadowStateSystem> {
        &self.shadow
    }

    /// The wrapped storage back-end. Useful for inspecting what was actually
    /// persisted; the front-end stays responsible for all writes.
    pub fn inner(&self) -> &dyn StateHistoryBackend {
        self.inner.as_ref()
    }

    /// Distance between checkpoints, in time units.
    pub fn granularity(&self) -> i64 {
        self.granularity
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        Ok(())
    }

    fn check_valid_time(&self, t: i64) -> Result<()> {
        let start = self.start_time();
        let end = self.end_time();
        if t < start || t > end {
            return Err(HistoryError::TimeRange { t, start, end });
        }
        Ok(())
    }

    fn floor_checkpoint(&self, t: i64) -> Option<i64> {
        self.checkpoints
            .read()
            .unwrap()
            .range(..=t)
            .next_back()
            .copied()
    }

    fn ceiling_checkpoint(&self, t: i64) -> Option<i64> {
        self.checkpoints.read().unwrap().range(t..).next().copied()
    }

    fn nb_attributes(&self) -> Result<usize> {
        Ok(self.shadow.attribute_tree()?.number_of_attributes())
    }

    /// Emits one checkpoint interval per granularity step the observed end
    /// time has passed.
    fn add_time_based_checkpoints(&mut self, quark: Quark) -> Result<()> {
        let latest = self.latest_time.load(Ordering::Relaxed);
        loop {
            let (last, index) = {
                let mut checkpoints = self.checkpoints.write().unwrap();
                let last = *checkpoints.iter().next_back().expect("seeded with start");
                if latest < last + self.granularity {
                    return Ok(());
                }
                checkpoints.insert(last + self.granularity);
                (last, checkpoints.len() as i32 - 1)
            };
            let next = last + self.granularity;
            self.inner
                .insert(last, next - 1, quark, StateValue::Int32(index))?;
        }
    }

    /// Streams trace events in `range` through the replay provider. The
    /// caller must hold the shadow query lock.
    fn replay_range(&self, range: TimeRange) -> Result<()> {
        debug!(start = range.start, end = range.end, "replaying trace events");
        let mut provider = self.provider.lock().unwrap();
        self.source
            .stream_range(range, &mut |event| provider.process_event(event))?;
        provider.wait_for_empty_queue();
        Ok(())
    }

    /// True when every entry holds an interval that extends to `t` or later.
    fn is_state_full(state: &[Option<StateInterval>], t: i64) -> bool {
        state
            .iter()
            .all(|entry| entry.as_ref().is_some_and(|iv| iv.end >= t))
    }
}

impl StateHistoryBackend for CheckpointHistory {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.inner.start_time()
    }

    fn end_time(&self) -> i64 {
        self.latest_time.load(Ordering::Relaxed)
    }

    fn insert(&mut self, start: i64, end: i64, quark: Quark, value: StateValue) -> Result<()> {
        self.check_live()?;
        let checkpoint_quark = match self.checkpoint_quark.get() {
            Some(&quark) => quark,
            None => {
                let created = self
                    .shadow
                    .get_quark_absolute_and_add(&[CHECKPOINT_ATTRIBUTE])?;
                let start_time = self.provider.lock().unwrap().start_time();
                self.checkpoints.write().unwrap().insert(start_time);
                *self.checkpoint_quark.get_or_init(|| created)
            }
        };
        // Checkpoint intervals are emitted below, never accepted from the
        // provider, or they would feed back on themselves.
        if quark == checkpoint_quark {
            return Ok(());
        }
        if end > self.latest_time.load(Ordering::Relaxed) {
            self.latest_time.store(end, Ordering::Relaxed);
        }

        self.add_time_based_checkpoints(checkpoint_quark)?;

        // Only intervals crossing a checkpoint reach the real store.
        let crosses = self
            .floor_checkpoint(end)
            .is_some_and(|checkpoint| start <= checkpoint);
        if crosses {
            self.inner.insert(start, end, quark, value)?;
        }
        Ok(())
    }

    fn finished_building(&mut self, end_time: i64) -> Result<()> {
        self.check_live()?;
        if end_time > self.latest_time.load(Ordering::Relaxed) {
            self.latest_time.store(end_time, Ordering::Relaxed);
        }
        let last = self
            .checkpoints
            .read()
            .unwrap()
            .iter()
            .next_back()
            .copied();
        if let (Some(last), Some(&quark)) = (last, self.checkpoint_quark.get()) {
            // The final checkpoint lands after the last interval, so queries
            // at the tail must fall back to the previous one (floor of t-1).
            if end_time > last {
                let index = {
                    let mut checkpoints = self.checkpoints.write().unwrap();
                    let index = checkpoints.len() as i32;
                    checkpoints.insert(end_time);
                    index
                };
                self.inner
                    .insert(last, end_time, quark, StateValue::Int32(index))?;
            }
        }
        self.inner.finished_building(end_time)
    }

    fn point_query(&self, state: &mut Vec<Option<StateInterval>>, t: i64) -> Result<()> {
        self.check_live()?;
        self.check_valid_time(t)?;
        let nb_attributes = self.nb_attributes()?;
        if state.len() < nb_attributes {
            state.resize(nb_attributes, None);
        }

        // Restore the closest earlier checkpoint snapshot.
        let start_time = self.start_time();
        let mut checkpoint = self.floor_checkpoint(t).unwrap_or(start_time);
        self.inner.point_query(state, checkpoint)?;

        // The last checkpoint is written after the last interval, so a query
        // at the tail may need the one before it.
        if state.iter().any(Option::is_none) {
            if let Some(previous) = self.floor_checkpoint(t - 1) {
                checkpoint = previous;
                self.inner.point_query(state, checkpoint)?;
            }
        }

        if Self::is_state_full(state, t) {
            return Ok(());
        }
        let snapshot = state.clone();

        let latest = self.end_time();
        let checkpoint_after = self.ceiling_checkpoint(t).unwrap_or(latest);
        if t < latest {
            // States persisted at the next checkpoint may already cover t.
            let mut next_state: Vec<Option<StateInterval>> = vec![None; state.len()];
            self.inner.point_query(&mut next_state, checkpoint_after)?;
            let mut full = true;
            for (entry, next) in state.iter_mut().zip(next_state) {
                let covered = entry.as_ref().is_some_and(|iv| iv.end >= t);
                if !covered {
                    match next {
                        Some(candidate) if candidate.start <= t => *entry = Some(candidate),
                        _ => full = false,
                    }
                }
            }
            if full {
                return Ok(());
            }
        }

        // Replay the bracketed range through the shadow. The state at the
        // checkpoint already reflects events at exactly that time, so the
        // replay starts one unit later.
        let _guard = self.shadow.take_query_lock();
        self.shadow.set_nb_attributes(state.len());
        self.shadow.replace_ongoing(&snapshot);
        self.replay_range(TimeRange::new(checkpoint + 1, checkpoint_after))?;
        if latest == t {
            self.shadow.close_history(t);
        }
        for (idx, reconstructed) in self.shadow.query_full_state(t).into_iter().enumerate() {
            if let Some(interval) = reconstructed {
                if interval.intersects(t) && idx < state.len() {
                    state[idx] = Some(interval);
                }
            }
        }
        Ok(())
    }

    fn singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_live()?;
        self.check_valid_time(t)?;
        let nb_attributes = self.nb_attributes()?;
        let mut state: Vec<Option<StateInterval>> = vec![None; nb_attributes];

        // The interval may have been persisted: check the checkpoint
        // snapshot before paying for a replay.
        let checkpoint = self.floor_checkpoint(t).unwrap_or_else(|| self.start_time());
        self.inner.point_query(&mut state, checkpoint)?;
        if let Some(interval) = state.get(quark as usize).and_then(Option::as_ref) {
            if interval.intersects(t) {
                return Ok(Some(interval.clone()));
            }
        }

        let mut state: Vec<Option<StateInterval>> = vec![None; nb_attributes];
        self.point_query(&mut state, t)?;
        Ok(state.into_iter().nth(quark as usize).flatten())
    }

    fn range_query<'a>(
        &'a self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Result<Box<dyn Iterator<Item = StateInterval> + 'a>> {
        self.check_live()?;
        if times.len() < 2 || quarks.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let min_time = times[0];
        let max_time = *times.last().expect("times checked non-empty");
        let lower = self.floor_checkpoint(min_time).unwrap_or_else(|| self.start_time());
        let upper = self.ceiling_checkpoint(max_time).or_else(|| {
            self.checkpoints.read().unwrap().iter().next_back().copied()
        });
        let Some(upper) = upper else {
            return Ok(Box::new(std::iter::empty()));
        };

        let step = times[1] - times[0];
        if step >= 2 * self.granularity {
            // Sampling at twice the checkpoint cadence: the persisted
            // snapshots alone resolve every pixel. The step is re-aligned to
            // the checkpoint grid, clamped so it can never collapse to zero.
            let aligned_step = (step / self.granularity * self.granularity).max(self.granularity);
            let mut sampled = Vec::new();
            let mut sample = lower;
            while sample <= upper {
                sampled.push(sample);
                sample += aligned_step;
            }
            debug!(step, aligned_step, "delegating 2-D query to inner store");
            return self.inner.range_query(quarks, &sampled);
        }

        // Finer than the checkpoint cadence: restore the lower checkpoint
        // and rebuild the whole window in the shadow.
        let nb_attributes = self.nb_attributes()?;
        let mut snapshot: Vec<Option<StateInterval>> = vec![None; nb_attributes];
        self.inner.point_query(&mut snapshot, lower)?;

        let _guard = self.shadow.take_query_lock();
        self.shadow.set_nb_attributes(snapshot.len());
        self.shadow.replace_ongoing(&snapshot);
        self.replay_range(TimeRange::new(lower + 1, upper))?;
        let reconstructed = self.shadow.range_query(quarks, times);
        Ok(Box::new(reconstructed.into_iter()))
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.provider.lock().unwrap().dispose();
        self.shadow.dispose();
        self.inner.dispose();
    }

    fn remove_files(&mut self) {
        self.inner.remove_files();
    }
}
