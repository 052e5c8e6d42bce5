//! The filter abstraction: typed processing nodes with reader and
//! writer ports.
//!
//! A filter is split in two:
//!
//! - [`Stage`] is the behavior: one bounded unit of work per
//!   [`process`](Stage::process) call, pulling from reader ports and
//!   producing into writer ports.
//! - [`FilterNode`] is the wiring state: the port maps, generated port
//!   IDs, the worker binding, and the connect/disconnect operations the
//!   pipeline manager drives.
//!
//! Wiring runs on the control thread with the affected workers stopped;
//! `process` runs on exactly one worker thread per filter.

use crate::error::{Error, Result};
use crate::frame::{AudioCodec, FrameShape};
use crate::queue::{FrameQueue, FrameReader, FrameWriter, DEFAULT_QUEUE_SLOTS};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Filter identifier, externally assigned.
pub type FilterId = i32;

/// Port identifier, unique within one side (readers or writers) of a
/// filter.
pub type PortId = i32;

/// The implicit port used by the one-to-one wiring operations.
pub const DEFAULT_PORT: PortId = 0;

/// A filter shared between the manager's table and one worker.
pub type FilterHandle = Arc<Mutex<FilterNode>>;

// ============================================================================
// FilterType
// ============================================================================

/// The typed identity of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Ingress endpoint (source; no readers).
    Receiver,
    /// Egress endpoint (sink; no writers).
    Transmitter,
    /// Video decoder.
    VideoDecoder,
    /// Video encoder.
    VideoEncoder,
    /// Video mixer.
    VideoMixer,
    /// Video resampler.
    VideoResampler,
    /// Audio decoder.
    AudioDecoder,
    /// Audio encoder.
    AudioEncoder,
    /// Audio mixer.
    AudioMixer,
}

impl FilterType {
    /// Map a control-plane type string to the enum.
    ///
    /// The two endpoints are created implicitly and have no string.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "videoDecoder" => Some(Self::VideoDecoder),
            "videoEncoder" => Some(Self::VideoEncoder),
            "videoMixer" => Some(Self::VideoMixer),
            "videoResampler" => Some(Self::VideoResampler),
            "audioDecoder" => Some(Self::AudioDecoder),
            "audioEncoder" => Some(Self::AudioEncoder),
            "audioMixer" => Some(Self::AudioMixer),
            _ => None,
        }
    }

    /// The control-plane string for this type.
    pub fn token(self) -> &'static str {
        match self {
            Self::Receiver => "receiver",
            Self::Transmitter => "transmitter",
            Self::VideoDecoder => "videoDecoder",
            Self::VideoEncoder => "videoEncoder",
            Self::VideoMixer => "videoMixer",
            Self::VideoResampler => "videoResampler",
            Self::AudioDecoder => "audioDecoder",
            Self::AudioEncoder => "audioEncoder",
            Self::AudioMixer => "audioMixer",
        }
    }

    /// Source filters have no readers.
    pub fn has_readers(self) -> bool {
        !matches!(self, Self::Receiver)
    }

    /// Sink filters have no writers.
    pub fn has_writers(self) -> bool {
        !matches!(self, Self::Transmitter)
    }
}

// ============================================================================
// Stage
// ============================================================================

/// Outcome of one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The stage consumed or produced at least one frame.
    Worked,
    /// No input was ready and no timer was due.
    Idle,
}

/// Port access handed to a stage for one `process` call.
pub struct StageIo<'a> {
    readers: &'a mut BTreeMap<PortId, FrameReader>,
    writers: &'a mut BTreeMap<PortId, FrameWriter>,
}

impl StageIo<'_> {
    /// Reader port by ID.
    pub fn reader(&mut self, id: PortId) -> Option<&mut FrameReader> {
        self.readers.get_mut(&id)
    }

    /// The lowest-numbered reader port, if any.
    pub fn first_reader(&mut self) -> Option<&mut FrameReader> {
        self.readers.values_mut().next()
    }

    /// Iterate all reader ports in port-ID order.
    pub fn readers(&mut self) -> impl Iterator<Item = (PortId, &mut FrameReader)> {
        self.readers.iter_mut().map(|(id, r)| (*id, r))
    }

    /// Writer port by ID.
    pub fn writer(&mut self, id: PortId) -> Option<&mut FrameWriter> {
        self.writers.get_mut(&id)
    }

    /// The lowest-numbered writer port, if any.
    pub fn first_writer(&mut self) -> Option<&mut FrameWriter> {
        self.writers.values_mut().next()
    }

    /// Iterate all writer ports in port-ID order.
    pub fn writers(&mut self) -> impl Iterator<Item = (PortId, &mut FrameWriter)> {
        self.writers.iter_mut().map(|(id, w)| (*id, w))
    }

    /// Number of connected reader ports.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Number of connected writer ports.
    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

/// Behavior of one filter.
///
/// # The `process` contract
///
/// One call executes one bounded unit of work: peek readers, consume
/// zero or more input frames, produce zero or more output frames. A
/// stage must not spin waiting for input; when nothing is ready it
/// returns [`Progress::Idle`]. It must not hold resources across calls
/// that would prevent the owning worker from stopping between calls.
pub trait Stage: Send {
    /// The typed identity of this stage.
    fn kind(&self) -> FilterType;

    /// Execute one bounded unit of work.
    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress>;

    /// Shape of the frames this stage produces.
    ///
    /// Edge wiring uses this to size and shape the ring it allocates.
    fn output_shape(&self) -> FrameShape;

    /// Slot count for rings allocated on this stage's output edges.
    fn queue_capacity(&self) -> usize {
        DEFAULT_QUEUE_SLOTS
    }

    /// Contribute stage-specific fields to a `getState` snapshot.
    fn describe(&self, _state: &mut serde_json::Map<String, Value>) {}

    /// Apply a new audio encoder configuration.
    ///
    /// Only meaningful for audio encoder stages; everything else keeps
    /// the default and reports `false`.
    fn reconfigure_audio(
        &mut self,
        _codec: AudioCodec,
        _channels: u32,
        _sample_rate: u32,
    ) -> bool {
        false
    }
}

// ============================================================================
// FilterNode
// ============================================================================

/// A filter instance: its stage plus all wiring state.
pub struct FilterNode {
    stage: Box<dyn Stage>,
    readers: BTreeMap<PortId, FrameReader>,
    writers: BTreeMap<PortId, FrameWriter>,
    worker: Option<i32>,
    next_reader_id: PortId,
    next_writer_id: PortId,
}

impl FilterNode {
    /// Wrap a stage into an unwired node.
    pub fn new(stage: Box<dyn Stage>) -> Self {
        Self {
            stage,
            readers: BTreeMap::new(),
            writers: BTreeMap::new(),
            worker: None,
            next_reader_id: DEFAULT_PORT + 1,
            next_writer_id: DEFAULT_PORT + 1,
        }
    }

    /// The node's typed identity.
    pub fn kind(&self) -> FilterType {
        self.stage.kind()
    }

    /// The worker this filter is bound to, if any.
    pub fn worker(&self) -> Option<i32> {
        self.worker
    }

    /// Bind the filter to a worker. A filter belongs to at most one.
    pub fn set_worker(&mut self, worker: Option<i32>) {
        self.worker = worker;
    }

    /// Mutable access to the stage behavior.
    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        self.stage.as_mut()
    }

    /// Return an unused writer port ID.
    pub fn generate_writer_id(&mut self) -> PortId {
        while self.writers.contains_key(&self.next_writer_id) {
            self.next_writer_id += 1;
        }
        let id = self.next_writer_id;
        self.next_writer_id += 1;
        id
    }

    /// Return an unused reader port ID.
    pub fn generate_reader_id(&mut self) -> PortId {
        while self.readers.contains_key(&self.next_reader_id) {
            self.next_reader_id += 1;
        }
        let id = self.next_reader_id;
        self.next_reader_id += 1;
        id
    }

    /// Execute one unit of work on the stage.
    pub fn process(&mut self) -> Result<Progress> {
        let mut io = StageIo {
            readers: &mut self.readers,
            writers: &mut self.writers,
        };
        self.stage.process(&mut io)
    }

    // ------------------------------------------------------------------
    // Wiring operations (control thread, affected workers stopped)
    // ------------------------------------------------------------------

    /// Wire this filter's default writer to `other`'s default reader.
    pub fn connect_one_to_one(&mut self, other: &mut FilterNode) -> Result<()> {
        self.connect(other, DEFAULT_PORT, DEFAULT_PORT, false)
    }

    /// Wire this filter's default writer to a specific reader on `other`.
    pub fn connect_one_to_many(&mut self, other: &mut FilterNode, reader_id: PortId) -> Result<()> {
        self.connect(other, DEFAULT_PORT, reader_id, false)
    }

    /// Wire a specific writer to `other`'s default reader.
    pub fn connect_many_to_one(
        &mut self,
        other: &mut FilterNode,
        writer_id: PortId,
        shared: bool,
    ) -> Result<()> {
        self.connect(other, writer_id, DEFAULT_PORT, shared)
    }

    /// Wire a specific writer to a specific reader on `other`.
    pub fn connect_many_to_many(
        &mut self,
        other: &mut FilterNode,
        reader_id: PortId,
        writer_id: PortId,
        shared: bool,
    ) -> Result<()> {
        self.connect(other, writer_id, reader_id, shared)
    }

    fn connect(
        &mut self,
        other: &mut FilterNode,
        writer_id: PortId,
        reader_id: PortId,
        shared: bool,
    ) -> Result<()> {
        if !self.kind().has_writers() {
            return Err(Error::Topology(format!(
                "{} filters have no writer ports",
                self.kind().token()
            )));
        }
        if !other.kind().has_readers() {
            return Err(Error::Topology(format!(
                "{} filters have no reader ports",
                other.kind().token()
            )));
        }
        if other.readers.contains_key(&reader_id) {
            return Err(Error::Topology(format!(
                "reader port {reader_id} already bound"
            )));
        }

        if let Some(writer) = self.writers.get(&writer_id) {
            // Fan-out: a second edge from an already-bound writer is only
            // valid on a shared queue with a free lane.
            if !shared || !writer.queue().is_shared() {
                return Err(Error::Topology(format!(
                    "writer port {writer_id} already bound"
                )));
            }
            let reader = writer.attach_reader().ok_or_else(|| {
                Error::Topology(format!("shared queue on writer {writer_id} has both readers"))
            })?;
            other.readers.insert(reader_id, reader);
            return Ok(());
        }

        let shape = self.stage.output_shape();
        let capacity = self.stage.queue_capacity();
        let (writer, reader) = if shared {
            FrameQueue::shared_channel(shape, capacity)
        } else {
            FrameQueue::channel(shape, capacity)
        };
        self.writers.insert(writer_id, writer);
        other.readers.insert(reader_id, reader);
        Ok(())
    }

    /// Tear down the edge between this filter's writer and `other`'s
    /// reader.
    ///
    /// The queue is destroyed when its last port drops. A shared
    /// writer keeps its port while the sibling lane is still wired.
    pub fn disconnect(
        &mut self,
        other: &mut FilterNode,
        writer_id: PortId,
        reader_id: PortId,
    ) -> Result<()> {
        let writer = self
            .writers
            .get(&writer_id)
            .ok_or(Error::UnknownId {
                entity: "port",
                id: writer_id,
            })?;
        let reader = other.readers.get(&reader_id).ok_or(Error::UnknownId {
            entity: "port",
            id: reader_id,
        })?;
        if !Arc::ptr_eq(writer.queue(), reader.queue()) {
            return Err(Error::Topology(format!(
                "writer {writer_id} and reader {reader_id} are not on the same edge"
            )));
        }

        let queue = Arc::clone(writer.queue());
        other.readers.remove(&reader_id);
        // After removing the reader: refs are the writer, this probe, and
        // (for shared queues) the sibling lane's reader.
        if !queue.is_shared() || Arc::strong_count(&queue) <= 2 {
            self.writers.remove(&writer_id);
        }
        Ok(())
    }

    /// Drop every remaining port. Used when the filter itself is
    /// deleted.
    pub fn disconnect_all(&mut self) {
        self.readers.clear();
        self.writers.clear();
    }

    /// Snapshot for the `getState` control event.
    pub fn describe(&self) -> Value {
        let mut state = serde_json::Map::new();
        state.insert("type".into(), json!(self.kind().token()));
        if let Some(worker) = self.worker {
            state.insert("workerId".into(), json!(worker));
        }
        state.insert(
            "readers".into(),
            json!(self.readers.keys().collect::<Vec<_>>()),
        );
        state.insert(
            "writers".into(),
            json!(self.writers.keys().collect::<Vec<_>>()),
        );
        self.stage.describe(&mut state);
        Value::Object(state)
    }
}
