//! In-memory shadow state-system used during partial-history replays.
//!
//! The shadow exposes the read and "ongoing state" surface of a primary
//! state-system while sharing — and never mutating — its attribute tree. A
//! replay seeks the shadow to a checkpoint snapshot with [`replace_ongoing`],
//! streams events through a state provider bound to the shadow, then reads
//! the reconstructed state back. One exclusive query lock serialises the
//! whole sequence.
//!
//! [`replace_ongoing`]: ShadowStateSystem::replace_ongoing

use crate::error::{HistoryError, Result};
use crate::interval::{intersects_samples, Quark, StateInterval};
use crate::provider::AttributeTree;
use crate::value::StateValue;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Name of the synthetic attribute carrying checkpoint indices.
pub const CHECKPOINT_ATTRIBUTE: &str = "_checkpoint";

/// The per-quark "current state" while replaying.
#[derive(Debug, Clone)]
struct OngoingState {
    start: i64,
    value: StateValue,
}

/// Latched reference to the upstream state-system's attribute tree.
#[derive(Default)]
struct Upstream {
    tree: Option<Arc<dyn AttributeTree>>,
    disposed: bool,
}

/// Exclusive guard over a shadow replay; dropping it releases the lock on
/// every exit path.
pub struct QueryGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// An in-memory state-system facade for checkpoint replays.
pub struct ShadowStateSystem {
    upstream: Mutex<Upstream>,
    upstream_ready: Condvar,
    query_lock: Mutex<()>,
    nb_attributes: Mutex<usize>,
    ongoing: Mutex<Vec<OngoingState>>,
    /// Intervals closed since the last `replace_ongoing`, per quark.
    closed: Mutex<Vec<Vec<StateInterval>>>,
}

impl ShadowStateSystem {
    /// Creates a shadow with no upstream assigned yet. Readers block until
    /// [`assign_upstream`] runs.
    ///
    /// [`assign_upstream`]: ShadowStateSystem::assign_upstream
    pub fn new() -> Self {
        Self {
            upstream: Mutex::new(Upstream::default()),
            upstream_ready: Condvar::new(),
            query_lock: Mutex::new(()),
            nb_attributes: Mutex::new(0),
            ongoing: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Single-shot handshake binding the upstream attribute tree. Wakes every
    /// reader blocked in [`attribute_tree`].
    ///
    /// [`attribute_tree`]: ShadowStateSystem::attribute_tree
    pub fn assign_upstream(&self, tree: Arc<dyn AttributeTree>) {
        let mut upstream = self.upstream.lock().unwrap();
        if upstream.tree.is_none() {
            upstream.tree = Some(tree);
        }
        self.upstream_ready.notify_all();
    }

    /// Blocks until the upstream is assigned, then returns its attribute
    /// tree.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` if the shadow is disposed before (or while)
    /// waiting.
    pub fn attribute_tree(&self) -> Result<Arc<dyn AttributeTree>> {
        let mut upstream = self.upstream.lock().unwrap();
        loop {
            if let Some(tree) = &upstream.tree {
                return Ok(Arc::clone(tree));
            }
            if upstream.disposed {
                return Err(HistoryError::Disposed);
            }
            upstream = self.upstream_ready.wait(upstream).unwrap();
        }
    }

    /// Acquires the exclusive replay lock. Hold the guard across
    /// `replace_ongoing`, the event replay and the final state read.
    pub fn take_query_lock(&self) -> QueryGuard<'_> {
        QueryGuard {
            _guard: self.query_lock.lock().unwrap(),
        }
    }

    /// Sets the number of attributes the replay works over.
    pub fn set_nb_attributes(&self, nb: usize) {
        *self.nb_attributes.lock().unwrap() = nb;
    }

    /// Number of attributes the replay works over.
    pub fn nb_attributes(&self) -> usize {
        *self.nb_attributes.lock().unwrap()
    }

    /// Atomically substitutes the current state vector with a checkpoint
    /// snapshot, discarding anything recorded by a previous replay. The
    /// attribute tree is untouched.
    pub fn replace_ongoing(&self, snapshot: &[Option<StateInterval>]) {
        let mut ongoing = self.ongoing.lock().unwrap();
        let mut closed = self.closed.lock().unwrap();
        ongoing.clear();
        ongoing.extend(snapshot.iter().map(|entry| match entry {
            Some(interval) => OngoingState {
                start: interval.start,
                value: interval.value.clone(),
            },
            None => OngoingState {
                start: i64::MIN,
                value: StateValue::Null,
            },
        }));
        closed.clear();
        closed.resize_with(snapshot.len(), Vec::new);
    }

    /// Applies one state change at time `t`: the previous ongoing state of
    /// `quark` is closed at `t - 1` and recorded, and `value` becomes the
    /// ongoing state from `t`.
    pub fn modify_attribute(&self, t: i64, quark: Quark, value: StateValue) -> Result<()> {
        let mut ongoing = self.ongoing.lock().unwrap();
        let mut closed = self.closed.lock().unwrap();
        let idx = quark as usize;
        if ongoing.len() <= idx {
            ongoing.resize_with(idx + 1, || OngoingState {
                start: i64::MIN,
                value: StateValue::Null,
            });
            closed.resize_with(idx + 1, Vec::new);
        }
        let previous = &mut ongoing[idx];
        if previous.start != i64::MIN && previous.start <= t - 1 {
            closed[idx].push(StateInterval::new(
                previous.start,
                t - 1,
                quark,
                previous.value.clone(),
            ));
        }
        previous.start = t;
        previous.value = value;
        Ok(())
    }

    /// Closes every ongoing state at `end_time`, recording the final
    /// intervals. Used when a replay runs to the end of the trace.
    pub fn close_history(&self, end_time: i64) {
        let mut ongoing = self.ongoing.lock().unwrap();
        let mut closed = self.closed.lock().unwrap();
        for (idx, state) in ongoing.iter_mut().enumerate() {
            if state.start != i64::MIN && state.start <= end_time {
                closed[idx].push(StateInterval::new(
                    state.start,
                    end_time,
                    idx as Quark,
                    state.value.clone(),
                ));
                state.start = end_time + 1;
            }
        }
    }

    /// Full state at `t`: for each quark, the recorded interval covering `t`,
    /// or the ongoing state projected onto `[start, t]`.
    pub fn query_full_state(&self, t: i64) -> Vec<Option<StateInterval>> {
        let ongoing = self.ongoing.lock().unwrap();
        let closed = self.closed.lock().unwrap();
        let nb = self.nb_attributes().max(ongoing.len());
        let mut state = vec![None; nb];
        for (idx, slot) in state.iter_mut().enumerate() {
            if let Some(list) = closed.get(idx) {
                *slot = list.iter().find(|iv| iv.intersects(t)).cloned();
            }
            if slot.is_none() {
                if let Some(current) = ongoing.get(idx) {
                    if current.start != i64::MIN && current.start <= t {
                        *slot = Some(StateInterval::new(
                            current.start,
                            t,
                            idx as Quark,
                            current.value.clone(),
                        ));
                    }
                }
            }
        }
        state
    }

    /// Intervals reconstructed by the current replay that belong to the
    /// requested quarks and intersect a sample of the sorted `times` series.
    pub fn range_query(&self, quarks: &[Quark], times: &[i64]) -> Vec<StateInterval> {
        let ongoing = self.ongoing.lock().unwrap();
        let closed = self.closed.lock().unwrap();
        let max_time = times.last().copied().unwrap_or(i64::MIN);
        let mut result = Vec::new();
        for &quark in quarks {
            let idx = quark as usize;
            if let Some(list) = closed.get(idx) {
                for iv in list {
                    if intersects_samples(times, iv.start, iv.end) {
                        result.push(iv.clone());
                    }
                }
            }
            if let Some(current) = ongoing.get(idx) {
                if current.start != i64::MIN
                    && current.start <= max_time
                    && intersects_samples(times, current.start, max_time)
                {
                    result.push(StateInterval::new(
                        current.start,
                        max_time,
                        quark,
                        current.value.clone(),
                    ));
                }
            }
        }
        result
    }

    /// Resolves an absolute path without creating it.
    pub fn get_quark_absolute(&self, path: &[&str]) -> Result<Option<Quark>> {
        Ok(self.attribute_tree()?.quark_for_path(path))
    }

    /// Probe for a path in the upstream tree.
    pub fn has_quark(&self, path: &[&str]) -> Result<bool> {
        Ok(self.attribute_tree()?.has_quark(path))
    }

    /// Resolves an absolute path, creating it only for the synthetic
    /// checkpoint attribute.
    ///
    /// # Errors
    ///
    /// `AttributeTreeImmutable` for any other missing path: the shadow never
    /// grows the upstream tree.
    pub fn get_quark_absolute_and_add(&self, path: &[&str]) -> Result<Quark> {
        let tree = self.attribute_tree()?;
        if path == [CHECKPOINT_ATTRIBUTE] {
            return Ok(tree.quark_for_path_or_create(path));
        }
        tree.quark_for_path(path)
            .ok_or(HistoryError::AttributeTreeImmutable)
    }

    /// Always fails: attribute creation goes through the upstream, never the
    /// shadow.
    pub fn add_empty_attribute(&self) -> Result<Quark> {
        Err(HistoryError::AttributeTreeImmutable)
    }

    /// Marks the shadow disposed and wakes any reader still waiting for the
    /// upstream.
    pub fn dispose(&self) {
        let mut upstream = self.upstream.lock().unwrap();
        upstream.disposed = true;
        self.upstream_ready.notify_all();
    }
}

impl Default for ShadowStateSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// Minimal attribute tree fixture.
    struct FixedTree {
        paths: RwLock<HashMap<Vec<String>, Quark>>,
    }

    impl FixedTree {
        fn with_attributes(names: &[&str]) -> Self {
            let paths = names
                .iter()
                .enumerate()
                .map(|(idx, name)| (vec![name.to_string()], idx as Quark))
                .collect();
            Self {
                paths: RwLock::new(paths),
            }
        }
    }

    impl AttributeTree for FixedTree {
        fn number_of_attributes(&self) -> usize {
            self.paths.read().unwrap().len()
        }

        fn has_quark(&self, path: &[&str]) -> bool {
            self.quark_for_path(path).is_some()
        }

        fn quark_for_path(&self, path: &[&str]) -> Option<Quark> {
            let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
            self.paths.read().unwrap().get(&key).copied()
        }

        fn quark_for_path_or_create(&self, path: &[&str]) -> Quark {
            let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
            let mut paths = self.paths.write().unwrap();
            let next = paths.len() as Quark;
            *paths.entry(key).or_insert(next)
        }
    }

    fn shadow_with_tree(names: &[&str]) -> ShadowStateSystem {
        let shadow = ShadowStateSystem::new();
        shadow.assign_upstream(Arc::new(FixedTree::with_attributes(names)));
        shadow
    }

    #[test]
    fn test_checkpoint_attribute_is_creatable() {
        let shadow = shadow_with_tree(&["cpu"]);
        let quark = shadow.get_quark_absolute_and_add(&[CHECKPOINT_ATTRIBUTE]).unwrap();
        assert_eq!(quark, 1);
        // Existing paths resolve without creating.
        assert_eq!(shadow.get_quark_absolute_and_add(&["cpu"]).unwrap(), 0);
    }

    #[test]
    fn test_other_paths_are_immutable() {
        let shadow = shadow_with_tree(&["cpu"]);
        let result = shadow.get_quark_absolute_and_add(&["disk"]);
        assert!(matches!(result, Err(HistoryError::AttributeTreeImmutable)));
        assert!(matches!(
            shadow.add_empty_attribute(),
            Err(HistoryError::AttributeTreeImmutable)
        ));
    }

    #[test]
    fn test_dispose_unblocks_waiters() {
        let shadow = ShadowStateSystem::new();
        shadow.dispose();
        assert!(matches!(
            shadow.attribute_tree(),
            Err(HistoryError::Disposed)
        ));
    }

    #[test]
    fn test_replay_sequence() {
        let shadow = shadow_with_tree(&["q"]);
        shadow.set_nb_attributes(1);
        let snapshot = vec![Some(StateInterval::new(10, 12, 0, "on".into()))];
        shadow.replace_ongoing(&snapshot);

        // A state change at 13 closes "on" at 12 and opens "off".
        shadow.modify_attribute(13, 0, "off".into()).unwrap();

        let state = shadow.query_full_state(14);
        let interval = state[0].as_ref().unwrap();
        assert_eq!(interval.value, StateValue::Str("off".to_string()));
        assert_eq!(interval.start, 13);

        let state = shadow.query_full_state(11);
        let interval = state[0].as_ref().unwrap();
        assert_eq!(interval.value, StateValue::Str("on".to_string()));
        assert_eq!(interval.end, 12);
    }

    #[test]
    fn test_close_history_seals_ongoing_state() {
        let shadow = shadow_with_tree(&["q"]);
        shadow.set_nb_attributes(1);
        shadow.replace_ongoing(&[Some(StateInterval::new(0, 5, 0, "x".into()))]);
        shadow.close_history(20);

        let state = shadow.query_full_state(20);
        let interval = state[0].as_ref().unwrap();
        assert_eq!(interval.start, 0);
        assert_eq!(interval.end, 20);
    }

    #[test]
    fn test_replace_ongoing_discards_previous_replay() {
        let shadow = shadow_with_tree(&["q"]);
        shadow.set_nb_attributes(1);
        shadow.replace_ongoing(&[Some(StateInterval::new(0, 5, 0, "x".into()))]);
        shadow.modify_attribute(6, 0, "y".into()).unwrap();
        shadow.replace_ongoing(&[Some(StateInterval::new(10, 15, 0, "z".into()))]);

        let state = shadow.query_full_state(6);
        assert!(state[0].is_none());
        let state = shadow.query_full_state(12);
        assert_eq!(
            state[0].as_ref().unwrap().value,
            StateValue::Str("z".to_string())
        );
    }
}
