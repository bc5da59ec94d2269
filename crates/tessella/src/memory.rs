//! In-memory history back-end.
//!
//! Keeps every interval in per-quark vectors sorted by start time. Useful as
//! the inner store of a checkpoint-partial history, where only the sparse
//! checkpoint-crossing intervals reach it, and as a reference implementation
//! in tests.

use crate::backend::StateHistoryBackend;
use crate::error::{HistoryError, Result};
use crate::interval::{intersects_samples, Quark, StateInterval};
use crate::value::StateValue;
use std::sync::RwLock;

/// A history back-end with no persistent storage.
pub struct InMemoryHistory {
    ssid: String,
    start_time: i64,
    end_time: i64,
    finished: bool,
    disposed: bool,
    /// Per-quark interval lists, sorted by start time and disjoint.
    intervals: RwLock<Vec<Vec<StateInterval>>>,
}

impl InMemoryHistory {
    /// Creates an empty in-memory back-end starting at `start_time`.
    pub fn new(ssid: impl Into<String>, start_time: i64) -> Self {
        Self {
            ssid: ssid.into(),
            start_time,
            end_time: start_time,
            finished: false,
            disposed: false,
            intervals: RwLock::new(Vec::new()),
        }
    }

    /// Total number of stored intervals, across all quarks.
    pub fn interval_count(&self) -> usize {
        let lists = self.intervals.read().unwrap();
        lists.iter().map(Vec::len).sum()
    }

    fn find_covering(list: &[StateInterval], t: i64) -> Option<StateInterval> {
        // Entries are sorted by start and disjoint, so the only candidate is
        // the last one starting at or before t.
        let idx = list.partition_point(|iv| iv.start <= t);
        if idx == 0 {
            return None;
        }
        let candidate = &list[idx - 1];
        candidate.intersects(t).then(|| candidate.clone())
    }
}

impl StateHistoryBackend for InMemoryHistory {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }

    fn insert(&mut self, start: i64, end: i64, quark: Quark, value: StateValue) -> Result<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        if end < start {
            return Err(HistoryError::TimeRange {
                t: end,
                start,
                end,
            });
        }
        if end > self.end_time {
            self.end_time = end;
        }
        let mut lists = self.intervals.write().unwrap();
        let idx = quark as usize;
        if lists.len() <= idx {
            lists.resize_with(idx + 1, Vec::new);
        }
        lists[idx].push(StateInterval::new(start, end, quark, value));
        Ok(())
    }

    fn finished_building(&mut self, end_time: i64) -> Result<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        if self.finished {
            return Ok(());
        }
        if end_time > self.end_time {
            self.end_time = end_time;
        }
        self.finished = true;
        Ok(())
    }

    fn point_query(&self, state: &mut Vec<Option<StateInterval>>, t: i64) -> Result<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        let lists = self.intervals.read().unwrap();
        if state.len() < lists.len() {
            state.resize(lists.len(), None);
        }
        for (quark, list) in lists.iter().enumerate() {
            if state[quark].is_none() {
                state[quark] = Self::find_covering(list, t);
            }
        }
        Ok(())
    }

    fn singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        let lists = self.intervals.read().unwrap();
        Ok(lists
            .get(quark as usize)
            .and_then(|list| Self::find_covering(list, t)))
    }

    fn range_query<'a>(
        &'a self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Result<Box<dyn Iterator<Item = StateInterval> + 'a>> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        let lists = self.intervals.read().unwrap();
        let mut matches = Vec::new();
        for &quark in quarks {
            if let Some(list) = lists.get(quark as usize) {
                for iv in list {
                    if intersects_samples(times, iv.start, iv.end) {
                        matches.push(iv.clone());
                    }
                }
            }
        }
        Ok(Box::new(matches.into_iter()))
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.intervals.write().unwrap().clear();
    }

    fn remove_files(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_query_latest_covering() {
        let mut backend = InMemoryHistory::new("mem", 0);
        backend.insert(0, 10, 0, "A".into()).unwrap();
        backend.insert(10, 20, 0, "B".into()).unwrap();
        backend.finished_building(20).unwrap();

        let iv = backend.singular_query(15, 0).unwrap().unwrap();
        assert_eq!(iv.value, StateValue::Str("B".to_string()));

        // t = 10 belongs to the later interval (latest start <= t wins).
        let iv = backend.singular_query(10, 0).unwrap().unwrap();
        assert_eq!(iv.value, StateValue::Str("B".to_string()));
    }

    #[test]
    fn test_finished_building_idempotent() {
        let mut backend = InMemoryHistory::new("mem", 0);
        backend.insert(0, 5, 0, StateValue::Int32(1)).unwrap();
        backend.finished_building(5).unwrap();
        backend.finished_building(5).unwrap();
        assert_eq!(backend.end_time(), 5);
    }

    #[test]
    fn test_disposed_rejects_operations() {
        let mut backend = InMemoryHistory::new("mem", 0);
        backend.dispose();
        assert!(matches!(
            backend.insert(0, 1, 0, StateValue::Null),
            Err(HistoryError::Disposed)
        ));
        assert!(matches!(
            backend.singular_query(0, 0),
            Err(HistoryError::Disposed)
        ));
    }

    #[test]
    fn test_range_query_sample_filter() {
        let mut backend = InMemoryHistory::new("mem", 0);
        backend.insert(0, 9, 0, StateValue::Int32(1)).unwrap();
        backend.insert(10, 19, 0, StateValue::Int32(2)).unwrap();
        backend.insert(20, 29, 0, StateValue::Int32(3)).unwrap();
        backend.finished_building(29).unwrap();

        let found: Vec<_> = backend.range_query(&[0], &[5, 25]).unwrap().collect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].value, StateValue::Int32(1));
        assert_eq!(found[1].value, StateValue::Int32(3));
    }
}
