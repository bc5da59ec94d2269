//! Integration tests for the checkpoint-partial history front-end.
//!
//! The fixtures model the trace framework: a fixed attribute tree, an event
//! source replaying a recorded event list, and a state provider that applies
//! each event's payload to its quark on the shadow state-system.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tempfile::TempDir;
use tessella::{
    AttributeTree, CheckpointHistory, EventSource, HistoryError, InMemoryHistory, Quark,
    ShadowStateSystem, StateHistoryBackend, StateProvider, StateValue, TiledHistory, TimeRange,
    TraceEvent,
};

/// Attribute tree fixture with a flat namespace.
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

/// Event source backed by a recorded event list.
struct RecordedTrace {
    events: Vec<TraceEvent>,
}

impl EventSource for RecordedTrace {
    fn stream_range(
        &self,
        range: TimeRange,
        sink: &mut dyn FnMut(&TraceEvent) -> tessella::Result<()>,
    ) -> tessella::Result<()> {
        for event in self
            .events
            .iter()
            .filter(|ev| range.contains(ev.timestamp()))
        {
            sink(event)?;
        }
        Ok(())
    }
}

/// Provider applying each event's `(quark, value)` payload to the shadow.
struct ReplayProvider {
    start_time: i64,
    shadow: Arc<ShadowStateSystem>,
    trace: Arc<RecordedTrace>,
    processed: Arc<Mutex<usize>>,
}

impl StateProvider for ReplayProvider {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn assigned_state_system(&self) -> Arc<ShadowStateSystem> {
        Arc::clone(&self.shadow)
    }

    fn trace(&self) -> Arc<dyn EventSource> {
        Arc::clone(&self.trace) as Arc<dyn EventSource>
    }

    fn process_event(&mut self, event: &TraceEvent) -> tessella::Result<()> {
        *self.processed.lock().unwrap() += 1;
        for (name, value) in event.fields() {
            let quark: Quark = name.parse().expect("fixture field names are quarks");
            self.shadow
                .modify_attribute(event.timestamp(), quark, value.clone())?;
        }
        Ok(())
    }
}

struct Fixture {
    history: CheckpointHistory,
    processed: Arc<Mutex<usize>>,
}

/// One event changing `quark` to `value` at `t`.
fn event(t: i64, quark: Quark, value: &str) -> TraceEvent {
    TraceEvent::new(t, vec![(quark.to_string(), value.into())])
}

/// Builds a partial history over the toggle trace of the S4 scenario:
/// `q0` flips at 3, 7, 13 and 19, the trace closes at 25.
fn toggle_fixture(granularity: i64, inner: Box<dyn StateHistoryBackend>) -> Fixture {
    let shadow = Arc::new(ShadowStateSystem::new());
    let tree = Arc::new(FixedTree::with_attributes(&["q0"]));
    shadow.assign_upstream(tree);

    let events = vec![
        event(3, 0, "on"),
        event(7, 0, "off"),
        event(13, 0, "on"),
        event(19, 0, "off"),
    ];
    let processed = Arc::new(Mutex::new(0));
    let provider = Box::new(ReplayProvider {
        start_time: 0,
        shadow: Arc::clone(&shadow),
        trace: Arc::new(RecordedTrace { events }),
        processed: Arc::clone(&processed),
    });

    let mut history = CheckpointHistory::new("partial", provider, shadow, inner, granularity);

    // The interval stream a state provider would emit for the toggles: each
    // state change at t closes the previous run at t - 1, and the final run
    // is closed when the trace ends.
    history.insert(0, 2, 0, "off".into()).unwrap();
    history.insert(3, 6, 0, "on".into()).unwrap();
    history.insert(7, 12, 0, "off".into()).unwrap();
    history.insert(13, 18, 0, "on".into()).unwrap();
    history.insert(19, 25, 0, "off".into()).unwrap();
    history.finished_building(25).unwrap();

    Fixture { history, processed }
}

fn str_value(interval: &tessella::StateInterval) -> &str {
    match &interval.value {
        StateValue::Str(s) => s,
        other => panic!("expected string value, got {other:?}"),
    }
}

#[test]
fn test_only_checkpoint_crossing_intervals_persisted() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // (3,6) and (13,18) cross no checkpoint and never reach the inner store.
    assert!(fixture.history.inner().singular_query(5, 0).unwrap().is_none());
    assert!(fixture.history.inner().singular_query(15, 0).unwrap().is_none());

    // (7,12) crosses checkpoint 10 and is persisted.
    let stored = fixture.history.inner().singular_query(10, 0).unwrap().unwrap();
    assert_eq!(stored.start, 7);
    assert_eq!(stored.end, 12);
}

#[test]
fn test_checkpoint_intervals_written_in_order() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // The synthetic checkpoint attribute was created after q0.
    let checkpoint_quark = 1;
    let cadence: Vec<_> = fixture
        .history
        .inner()
        .range_query(&[checkpoint_quark], &[0, 10, 20, 25])
        .unwrap()
        .collect();
    assert_eq!(cadence.len(), 3);
    assert_eq!((cadence[0].start, cadence[0].end), (0, 9));
    assert_eq!((cadence[1].start, cadence[1].end), (10, 19));
    assert_eq!((cadence[2].start, cadence[2].end), (20, 25));
    assert_eq!(cadence[0].value, StateValue::Int32(1));
    assert_eq!(cadence[1].value, StateValue::Int32(2));
    assert_eq!(cadence[2].value, StateValue::Int32(3));
}

#[test]
fn test_query_between_checkpoints_replays_trace() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // t = 14 is covered by no persisted interval: the front-end restores
    // checkpoint 10 and replays events 11..=20, so the toggle at 13 decides.
    let interval = fixture.history.singular_query(14, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "on");
    assert!(interval.intersects(14));
    assert!(*fixture.processed.lock().unwrap() > 0);
}

#[test]
fn test_query_at_persisted_interval_skips_replay() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // t = 10 sits inside the persisted (7,12) interval: answered from the
    // inner store alone.
    let interval = fixture.history.singular_query(10, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "off");
    assert_eq!(*fixture.processed.lock().unwrap(), 0);
}

#[test]
fn test_query_at_trace_tail() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // The final state at the trace end comes from the closing interval,
    // which crossed the last in-build checkpoint.
    let interval = fixture.history.singular_query(25, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "off");
    assert_eq!(interval.end, 25);
}

#[test]
fn test_point_query_matches_full_history() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // A full history fed the same intervals is the reference.
    let mut reference = InMemoryHistory::new("full", 0);
    reference.insert(0, 2, 0, "off".into()).unwrap();
    reference.insert(3, 6, 0, "on".into()).unwrap();
    reference.insert(7, 12, 0, "off".into()).unwrap();
    reference.insert(13, 18, 0, "on".into()).unwrap();
    reference.insert(19, 25, 0, "off".into()).unwrap();
    reference.finished_building(25).unwrap();

    for t in 0..=25 {
        let expected = reference.singular_query(t, 0).unwrap().unwrap();
        let actual = fixture.history.singular_query(t, 0).unwrap().unwrap();
        assert_eq!(
            str_value(&actual),
            str_value(&expected),
            "diverged from full history at t = {t}"
        );
    }
}

#[test]
fn test_coarse_range_query_served_from_checkpoints() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    // Step 20 is twice the granularity: the persisted snapshots suffice and
    // no event is replayed.
    let found: Vec<_> = fixture
        .history
        .range_query(&[0], &[0, 20, 40])
        .unwrap()
        .collect();
    assert!(!found.is_empty());
    assert_eq!(*fixture.processed.lock().unwrap(), 0);
}

#[test]
fn test_fine_range_query_replays_window() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));

    let found: Vec<_> = fixture
        .history
        .range_query(&[0], &[12, 14, 16, 18])
        .unwrap()
        .collect();
    assert!(*fixture.processed.lock().unwrap() > 0);

    // The replayed window reconstructs both runs the samples touch.
    assert_eq!(found.len(), 2);
    assert_eq!(str_value(&found[0]), "off");
    assert_eq!(str_value(&found[1]), "on");
    assert_eq!(found[1].start, 13);
    assert_eq!(found[1].end, 18);
}

#[test]
fn test_query_outside_range_rejected() {
    let fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));
    assert!(matches!(
        fixture.history.singular_query(26, 0),
        Err(HistoryError::TimeRange { .. })
    ));
    assert!(matches!(
        fixture.history.singular_query(-1, 0),
        Err(HistoryError::TimeRange { .. })
    ));
}

#[test]
fn test_dispose_cascades() {
    let mut fixture = toggle_fixture(10, Box::new(InMemoryHistory::new("inner", 0)));
    fixture.history.dispose();
    assert!(matches!(
        fixture.history.singular_query(5, 0),
        Err(HistoryError::Disposed)
    ));
}

#[test]
fn test_partial_over_tiled_inner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial-inner.tile");
    let inner = TiledHistory::create("inner", &path, 1, 0, 10, vec![10]).unwrap();
    let fixture = toggle_fixture(10, Box::new(inner));

    // Same answers as over the in-memory inner store, including a replayed
    // timestamp and the trace tail.
    let interval = fixture.history.singular_query(14, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "on");
    let interval = fixture.history.singular_query(25, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "off");
    let interval = fixture.history.singular_query(10, 0).unwrap().unwrap();
    assert_eq!(str_value(&interval), "off");
}

#[test]
fn test_shadow_rejects_tree_mutation() {
    let shadow = ShadowStateSystem::new();
    shadow.assign_upstream(Arc::new(FixedTree::with_attributes(&["q0"])));
    assert!(matches!(
        shadow.get_quark_absolute_and_add(&["not-there"]),
        Err(HistoryError::AttributeTreeImmutable)
    ));
    assert!(shadow.has_quark(&["q0"]).unwrap());
    assert!(!shadow.has_quark(&["not-there"]).unwrap());
}
