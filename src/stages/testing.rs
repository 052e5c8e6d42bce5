//! Deterministic stages for tests and examples.

use crate::error::Result;
use crate::filter::{FilterType, Progress, Stage, StageIo};
use crate::frame::FrameShape;
use std::sync::{Arc, Mutex};

/// Source producing one sequenced frame per `process` call, up to a
/// limit (`u64::MAX` for unbounded).
pub struct FrameCounterSource {
    limit: u64,
    produced: u64,
    payload: Vec<u8>,
    shape: FrameShape,
    drop_on_full: bool,
}

impl FrameCounterSource {
    /// Produce `limit` frames whose payload is the sequence number.
    ///
    /// By default the source retries a frame that found every edge
    /// full, so downstream counts are deterministic. Live sources use
    /// [`drop_on_full`](Self::drop_on_full) instead.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            produced: 0,
            payload: Vec::new(),
            shape: FrameShape::raw_audio(),
            drop_on_full: false,
        }
    }

    /// Produce `limit` frames with a fixed payload.
    pub fn with_payload(limit: u64, payload: &[u8]) -> Self {
        Self {
            limit,
            produced: 0,
            payload: payload.to_vec(),
            shape: FrameShape::raw_audio(),
            drop_on_full: false,
        }
    }

    /// Use a specific output shape.
    pub fn with_shape(mut self, shape: FrameShape) -> Self {
        self.shape = shape;
        self
    }

    /// Discard a frame whose edges are all full instead of retrying,
    /// the way a live capture source paces itself.
    pub fn drop_on_full(mut self) -> Self {
        self.drop_on_full = true;
        self
    }
}

impl Stage for FrameCounterSource {
    fn kind(&self) -> FilterType {
        FilterType::Receiver
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if self.produced >= self.limit || io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }
        let seq = self.produced;
        let payload = if self.payload.is_empty() {
            seq.to_le_bytes().to_vec()
        } else {
            self.payload.clone()
        };

        let mut wrote = false;
        for (_, writer) in io.writers() {
            if let Some(mut slot) = writer.rear() {
                slot.fill_from(&payload);
                slot.set_presentation_us(seq * 1000);
                slot.set_sequence(seq);
                slot.mark_updated();
                slot.commit();
                wrote = true;
            }
        }
        if !wrote && !self.drop_on_full {
            return Ok(Progress::Idle);
        }
        self.produced += 1;
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }
}

/// Frames gathered by a [`CollectSink`].
#[derive(Clone, Default)]
pub struct CollectedFrames {
    inner: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
}

impl CollectedFrames {
    /// Sequence numbers in arrival order.
    pub fn sequences(&self) -> Vec<u64> {
        self.inner.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    /// Payloads in arrival order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Number of frames collected.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether nothing arrived yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sink recording every frame it drains.
pub struct CollectSink {
    collected: CollectedFrames,
}

impl CollectSink {
    /// Create the sink and the shared view of what it collects.
    pub fn new() -> (Self, CollectedFrames) {
        let collected = CollectedFrames::default();
        (
            Self {
                collected: collected.clone(),
            },
            collected,
        )
    }
}

impl Stage for CollectSink {
    fn kind(&self) -> FilterType {
        FilterType::Transmitter
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let mut progress = Progress::Idle;
        for (_, reader) in io.readers() {
            let Some(front) = reader.front() else { continue };
            self.collected
                .inner
                .lock()
                .unwrap()
                .push((front.sequence(), front.payload().to_vec()));
            front.release();
            progress = Progress::Worked;
        }
        Ok(progress)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::raw_audio()
    }
}
