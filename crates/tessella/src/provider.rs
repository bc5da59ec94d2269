//! Collaborator contracts supplied by the owning trace framework.
//!
//! The store never parses traces itself. The framework owns the attribute
//! tree, the state provider that turns events into interval inserts, and the
//! trace reader that can re-stream a time range of events during a partial
//! history replay.

use crate::error::Result;
use crate::interval::{Quark, TimeRange};
use crate::partial::shadow::ShadowStateSystem;
use crate::value::StateValue;
use std::sync::Arc;

/// The framework's tree of named attributes, addressed by path and identified
/// at runtime by integer quarks. The store reads the tree but never mutates
/// it except through [`quark_for_path_or_create`] for its own bookkeeping
/// attributes.
///
/// [`quark_for_path_or_create`]: AttributeTree::quark_for_path_or_create
pub trait AttributeTree: Send + Sync {
    /// Total number of attributes currently in the tree.
    fn number_of_attributes(&self) -> usize;

    /// Probe for a path without creating it.
    fn has_quark(&self, path: &[&str]) -> bool;

    /// Resolves an absolute path to its quark, or `None` if absent.
    fn quark_for_path(&self, path: &[&str]) -> Option<Quark>;

    /// Resolves an absolute path, creating the attribute if needed.
    fn quark_for_path_or_create(&self, path: &[&str]) -> Quark;
}

/// One trace event re-fed to a state provider during replay.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    timestamp: i64,
    fields: Vec<(String, StateValue)>,
}

impl TraceEvent {
    /// Creates an event with a timestamp and named field payloads.
    pub fn new(timestamp: i64, fields: Vec<(String, StateValue)>) -> Self {
        Self { timestamp, fields }
    }

    /// The event's timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The event's named fields.
    pub fn fields(&self) -> &[(String, StateValue)] {
        &self.fields
    }

    /// Looks up one field by name.
    pub fn field(&self, name: &str) -> Option<&StateValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// Translates trace events into state changes on its assigned shadow
/// state-system.
///
/// A partial history owns a private provider instance bound to the shadow; it
/// must not be the provider building the upstream state system.
pub trait StateProvider: Send {
    /// Timestamp of the start of the trace.
    fn start_time(&self) -> i64;

    /// The shadow state-system this provider writes to.
    fn assigned_state_system(&self) -> Arc<ShadowStateSystem>;

    /// The trace this provider's events come from, used to re-stream event
    /// ranges during replays.
    fn trace(&self) -> Arc<dyn EventSource>;

    /// Applies one event's state changes.
    fn process_event(&mut self, event: &TraceEvent) -> Result<()>;

    /// Blocks until any internal event queue has drained. Synchronous
    /// providers keep the default no-op.
    fn wait_for_empty_queue(&mut self) {}

    /// Releases provider resources.
    fn dispose(&mut self) {}
}

/// Re-streams a time range of trace events through a sink.
///
/// This is the synchronous rendering of the framework's event-request
/// protocol: one call covers request construction, dispatch and completion
/// wait. The sink is invoked once per event in timestamp order; a sink error
/// cancels the stream and is propagated to the caller.
pub trait EventSource: Send + Sync {
    /// Streams every event with a timestamp in `range` (inclusive bounds)
    /// into `sink`.
    fn stream_range(
        &self,
        range: TimeRange,
        sink: &mut dyn FnMut(&TraceEvent) -> Result<()>,
    ) -> Result<()>;
}
