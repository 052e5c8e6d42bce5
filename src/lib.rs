//! # Cascade
//!
//! A live media pipeline runtime: processing filters composed into
//! paths, frames handed between them through lock-free bounded rings,
//! and workers stepping filters under best-effort or framerate-locked
//! disciplines.
//!
//! ## Architecture
//!
//! - [`frame`]: the typed buffer exchanged between filters.
//! - [`queue`]: single-producer, one-or-two-consumer frame rings.
//! - [`filter`]: the [`Stage`](filter::Stage) behavior trait and the
//!   [`FilterNode`](filter::FilterNode) wiring state.
//! - [`worker`]: the four scheduling disciplines (best-effort and
//!   constant-framerate, master and slave).
//! - [`pipeline`]: the [`PipelineManager`](pipeline::PipelineManager)
//!   owning filters, paths and workers.
//! - [`control`]: the JSON control plane mutating a running graph.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cascade::control;
//! use cascade::pipeline::PipelineManager;
//! use serde_json::json;
//!
//! # fn main() -> cascade::Result<()> {
//! let mut pipeline = PipelineManager::new(1, 2)?;
//!
//! // Build receiver -> decoder -> encoder -> transmitter.
//! control::handle_event(
//!     &mut pipeline,
//!     "createFilter",
//!     &json!({"id": 10, "type": "audioDecoder"}),
//! );
//! control::handle_event(
//!     &mut pipeline,
//!     "createFilter",
//!     &json!({"id": 11, "type": "audioEncoder"}),
//! );
//! control::handle_event(
//!     &mut pipeline,
//!     "createPath",
//!     &json!({
//!         "id": 100, "orgFilterId": 1, "dstFilterId": 2,
//!         "orgWriterId": -1, "dstReaderId": -1,
//!         "midFiltersIds": [10, 11], "sharedQueue": false
//!     }),
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod control;
pub mod error;
pub mod filter;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod stages;
pub mod stats;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::filter::{FilterNode, FilterType, Progress, Stage, StageIo};
    pub use crate::frame::{Frame, FrameShape};
    pub use crate::pipeline::{Path, PipelineManager};
    pub use crate::queue::{FrameQueue, FrameReader, FrameWriter};
    pub use crate::worker::{Discipline, Worker};
}

pub use error::{Error, Result};
