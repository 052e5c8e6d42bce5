//! Error types for cascade.

use thiserror::Error;

/// Result type alias using cascade's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cascade operations.
///
/// Transient runtime conditions (a full queue on produce, an empty queue
/// on consume) are not errors: they are expressed in the queue and stage
/// return types and counted as metrics.
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced an ID that is not registered.
    #[error("unknown {entity} id: {id}")]
    UnknownId {
        /// Table the lookup ran against ("filter", "path", "worker", "port").
        entity: &'static str,
        /// The offending ID.
        id: i32,
    },

    /// Tried to register an ID that already exists.
    #[error("duplicate {entity} id: {id}")]
    DuplicateId {
        /// Table the insert ran against.
        entity: &'static str,
        /// The offending ID.
        id: i32,
    },

    /// Control message missing fields or carrying the wrong types.
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// Unknown filter/worker/codec type string.
    #[error("unknown type string: {0:?}")]
    UnknownType(String),

    /// Wiring operation rejected (incompatible ports, endpoint removal,
    /// double-bound port, master/slave mismatch).
    #[error("topology error: {0}")]
    Topology(String),

    /// A worker thread could not be spawned or joined.
    #[error("worker thread error: {0}")]
    WorkerThread(String),

    /// I/O error (control-plane session transport).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an unknown-filter lookup failure.
    pub(crate) fn unknown_filter(id: i32) -> Self {
        Self::UnknownId {
            entity: "filter",
            id,
        }
    }

    /// Shorthand for an unknown-worker lookup failure.
    pub(crate) fn unknown_worker(id: i32) -> Self {
        Self::UnknownId {
            entity: "worker",
            id,
        }
    }
}
