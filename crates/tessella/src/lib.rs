//! Tessella - time-keyed interval storage for trace analysis.
//!
//! This crate answers state-over-time queries on very long event traces: a
//! state provider streams intervals of the form `(start, end, quark, value)`
//! into a history back-end, which persists them and later answers "what value
//! was this attribute holding at time t?" as well as downsampled 2-D
//! `(quarks x times)` queries for visualisation.
//!
//! # Components
//!
//! - [`TiledHistory`]: on-disk multi-resolution tiled history, optimised for
//!   downsampled range queries and bounded-memory writes
//! - [`CheckpointHistory`]: checkpoint+replay front-end that wraps any
//!   back-end and persists only checkpoint-crossing intervals
//! - [`ShadowStateSystem`]: in-memory state-system facade driven during
//!   partial-history replays
//! - [`InMemoryHistory`]: storage back-end with no persistence
//!
//! # Example
//!
//! ```rust,ignore
//! use tessella::{StateHistoryBackend, TiledHistory};
//!
//! // Build a history over a trace spanning [0, end].
//! let mut history = TiledHistory::create_auto("ss0", 0, end, 1, path)?;
//! for interval in provider_output {
//!     history.insert(interval.start, interval.end, interval.quark, interval.value)?;
//! }
//! history.finished_building(end)?;
//!
//! // What was quark 3 holding at t = 1500?
//! let state = history.singular_query(1500, 3)?;
//! ```

#![deny(missing_docs)]

pub mod backend;
pub mod error;
pub mod interval;
pub mod memory;
pub mod partial;
pub mod provider;
pub mod tile;
pub mod value;
pub mod varint;

pub use backend::{StateHistoryBackend, IGNORE_PROVIDER_VERSION};
pub use error::{HistoryError, Result};
pub use interval::{Quark, StateInterval, TimeRange};
pub use memory::InMemoryHistory;
pub use partial::shadow::{ShadowStateSystem, CHECKPOINT_ATTRIBUTE};
pub use partial::CheckpointHistory;
pub use provider::{AttributeTree, EventSource, StateProvider, TraceEvent};
pub use tile::backend::{resolution_ladder, TiledHistory, MIN_RESOLUTION, N_PIXELS};
pub use tile::file::{TileFileConfig, FILE_VERSION, HISTORY_FILE_MAGIC};
pub use tile::HistoryTile;
pub use value::{StateValue, MAX_PAYLOAD_LEN};
