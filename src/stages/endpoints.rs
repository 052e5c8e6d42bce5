//! The two endpoint stages.
//!
//! The receiver is the pipeline's ingress: external code (the RTP/RTSP
//! ingest, or a test harness) pushes frames through a [`ReceiverHandle`]
//! and the stage moves them into its writer ports. The transmitter is
//! the egress: it drains its reader ports and hands frames to an
//! optional callback. Both endpoints exist for the whole life of the
//! pipeline and survive every path removal.

use crate::error::Result;
use crate::filter::{FilterType, Progress, Stage, StageIo};
use crate::frame::{AudioCodec, FrameShape};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Upper bound on frames queued behind the receiver before pushes are
/// refused.
const INJECT_BACKLOG: usize = 64;

/// A frame pending injection into the pipeline.
struct PendingFrame {
    payload: Vec<u8>,
    presentation_us: u64,
}

struct ReceiverShared {
    pending: Mutex<VecDeque<PendingFrame>>,
    shape: Mutex<FrameShape>,
    refused: AtomicU64,
}

/// Ingress endpoint: a source stage fed from outside the pipeline.
pub struct ReceiverEndpoint {
    shared: Arc<ReceiverShared>,
    sequence: u64,
}

impl ReceiverEndpoint {
    /// Create the endpoint and its external handle.
    ///
    /// The default output shape is encoded AAC audio; reconfigure it
    /// through the handle before wiring if the ingress carries
    /// something else.
    pub fn new() -> (Self, ReceiverHandle) {
        let shared = Arc::new(ReceiverShared {
            pending: Mutex::new(VecDeque::new()),
            shape: Mutex::new(FrameShape::Audio {
                sample_rate: 48_000,
                channels: 2,
                sample_format: crate::frame::SampleFormat::S16,
                codec: AudioCodec::Aac,
            }),
            refused: AtomicU64::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
                sequence: 0,
            },
            ReceiverHandle { shared },
        )
    }
}

impl Stage for ReceiverEndpoint {
    fn kind(&self) -> FilterType {
        FilterType::Receiver
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }
        let Some(frame) = self.shared.pending.lock().unwrap().pop_front() else {
            return Ok(Progress::Idle);
        };

        let seq = self.sequence;
        self.sequence += 1;

        for (_, writer) in io.writers() {
            if let Some(mut slot) = writer.rear() {
                slot.fill_from(&frame.payload);
                slot.set_presentation_us(frame.presentation_us);
                slot.set_sequence(seq);
                slot.mark_updated();
                slot.commit();
            }
            // rear() == None: the edge is saturated and this copy of the
            // frame is the drop.
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        *self.shared.shape.lock().unwrap()
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert(
            "pending".into(),
            json!(self.shared.pending.lock().unwrap().len()),
        );
        state.insert(
            "refused".into(),
            json!(self.shared.refused.load(Ordering::Relaxed)),
        );
    }
}

/// External handle feeding the receiver endpoint.
#[derive(Clone)]
pub struct ReceiverHandle {
    shared: Arc<ReceiverShared>,
}

impl ReceiverHandle {
    /// Queue a frame for injection.
    ///
    /// Returns `false` (and counts a refusal) when the injection
    /// backlog is full.
    pub fn push_frame(&self, payload: &[u8], presentation_us: u64) -> bool {
        let mut pending = self.shared.pending.lock().unwrap();
        if pending.len() >= INJECT_BACKLOG {
            self.shared.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        pending.push_back(PendingFrame {
            payload: payload.to_vec(),
            presentation_us,
        });
        true
    }

    /// Set the shape of the frames this ingress produces.
    ///
    /// Takes effect for edges wired after the call.
    pub fn set_output_shape(&self, shape: FrameShape) {
        *self.shared.shape.lock().unwrap() = shape;
    }

    /// Frames refused because the backlog was full.
    pub fn refused(&self) -> u64 {
        self.shared.refused.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Transmitter
// ============================================================================

type FrameCallback = Box<dyn FnMut(&[u8], u64) + Send>;

struct TransmitterShared {
    sent: AtomicU64,
    callback: Mutex<Option<FrameCallback>>,
}

/// Egress endpoint: a sink stage draining every reader port.
pub struct TransmitterEndpoint {
    shared: Arc<TransmitterShared>,
}

impl TransmitterEndpoint {
    /// Create the endpoint and its external handle.
    pub fn new() -> (Self, TransmitterHandle) {
        let shared = Arc::new(TransmitterShared {
            sent: AtomicU64::new(0),
            callback: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            TransmitterHandle { shared },
        )
    }
}

impl Stage for TransmitterEndpoint {
    fn kind(&self) -> FilterType {
        FilterType::Transmitter
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let mut progress = Progress::Idle;
        let mut callback = self.shared.callback.lock().unwrap();

        for (_, reader) in io.readers() {
            let Some(front) = reader.front() else { continue };
            if let Some(cb) = callback.as_mut() {
                cb(front.payload(), front.presentation_us());
            }
            front.release();
            self.shared.sent.fetch_add(1, Ordering::Relaxed);
            progress = Progress::Worked;
        }
        Ok(progress)
    }

    fn output_shape(&self) -> FrameShape {
        // Sinks have no writer ports; never used for wiring.
        FrameShape::raw_audio()
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert(
            "sent".into(),
            json!(self.shared.sent.load(Ordering::Relaxed)),
        );
    }
}

/// External handle observing the transmitter endpoint.
#[derive(Clone)]
pub struct TransmitterHandle {
    shared: Arc<TransmitterShared>,
}

impl TransmitterHandle {
    /// Total frames the transmitter has drained.
    pub fn frame_count(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Install the egress callback, replacing any previous one.
    ///
    /// The callback receives the payload and presentation time of each
    /// drained frame, on the transmitter worker's thread.
    pub fn on_frame(&self, callback: impl FnMut(&[u8], u64) + Send + 'static) {
        *self.shared.callback.lock().unwrap() = Some(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;

    #[test]
    fn test_receiver_moves_pending_frames() {
        let (stage, handle) = ReceiverEndpoint::new();
        let mut rx = FilterNode::new(Box::new(stage));
        let (tx_stage, tx_handle) = TransmitterEndpoint::new();
        let mut tx = FilterNode::new(Box::new(tx_stage));

        rx.connect_one_to_one(&mut tx).unwrap();

        assert!(handle.push_frame(b"abc", 1000));
        assert_eq!(rx.process().unwrap(), Progress::Worked);
        assert_eq!(rx.process().unwrap(), Progress::Idle);

        assert_eq!(tx.process().unwrap(), Progress::Worked);
        assert_eq!(tx_handle.frame_count(), 1);
    }

    #[test]
    fn test_receiver_backlog_refuses() {
        let (_stage, handle) = ReceiverEndpoint::new();
        for _ in 0..INJECT_BACKLOG {
            assert!(handle.push_frame(b"x", 0));
        }
        assert!(!handle.push_frame(b"x", 0));
        assert_eq!(handle.refused(), 1);
    }

    #[test]
    fn test_transmitter_callback_sees_payload() {
        let (stage, handle) = ReceiverEndpoint::new();
        let mut rx = FilterNode::new(Box::new(stage));
        let (tx_stage, tx_handle) = TransmitterEndpoint::new();
        let mut tx = FilterNode::new(Box::new(tx_stage));
        rx.connect_one_to_one(&mut tx).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        tx_handle.on_frame(move |payload, pts| {
            seen_clone.lock().unwrap().push((payload.to_vec(), pts));
        });

        handle.push_frame(b"hello", 42);
        rx.process().unwrap();
        tx.process().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"hello");
        assert_eq!(seen[0].1, 42);
    }
}
