//! Lock-free frame queue connecting one writer port to one or two
//! reader ports.
//!
//! The queue is a bounded ring of pre-allocated [`Frame`]s. Producing a
//! frame means borrowing the rear slot, overwriting its bytes in place
//! and committing; consuming means borrowing the front slot and
//! releasing it. No allocation and no locking happens on the hot path:
//! head and per-lane tail indices are monotonically increasing atomic
//! counters with acquire/release ordering, and slot access is guarded by
//! the protocol (the producer only touches slots no reader can see, and
//! each lane's reader only touches slots the producer has published).
//!
//! # Shared mode
//!
//! In shared (fan-out) mode the same slot sequence feeds two readers.
//! Each reader advances its own tail lane; a slot is reclaimed only
//! after the lagging lane has advanced past it, so a stalled reader
//! eventually makes the queue full and the producer drops.
//!
//! # Drop policy
//!
//! When the ring is full the producer gets no rear slot and discards the
//! newest pending output. Committed frames are never overwritten.

use crate::frame::{Frame, FrameShape};
use crate::stats;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default slot count for a new edge.
pub const DEFAULT_QUEUE_SLOTS: usize = 8;

/// Cache line size for padding.
const CACHE_LINE: usize = 64;

/// Padded atomic for avoiding false sharing.
#[repr(C)]
struct PaddedAtomicUsize {
    value: AtomicUsize,
    _padding: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
}

impl PaddedAtomicUsize {
    fn new(val: usize) -> Self {
        Self {
            value: AtomicUsize::new(val),
            _padding: [0; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
        }
    }

    fn load(&self, order: Ordering) -> usize {
        self.value.load(order)
    }

    fn store(&self, val: usize, order: Ordering) {
        self.value.store(val, order)
    }
}

/// A slot in the ring.
struct Slot {
    frame: UnsafeCell<Frame>,
}

// SAFETY: slot access is guarded by the queue's head/tail protocol.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// The bounded ring between a writer port and its reader port(s).
///
/// Constructed through [`FrameQueue::channel`] or
/// [`FrameQueue::shared_channel`]; user code holds the port handles, not
/// the queue itself.
pub struct FrameQueue {
    slots: Box<[Slot]>,

    /// Mask for index wrapping (capacity - 1, capacity is a power of 2).
    mask: usize,

    /// Write position (only modified by the producer).
    head: PaddedAtomicUsize,

    /// Per-lane read positions (lane 0 always active, lane 1 in shared
    /// mode once a second reader attaches).
    tails: [PaddedAtomicUsize; 2],

    /// Number of active reader lanes (1 or 2).
    lanes: AtomicUsize,

    /// Whether a second reader may attach.
    shared: bool,

    /// Shape of every frame in the ring.
    shape: FrameShape,

    /// Frames discarded because the ring was full.
    dropped: AtomicU64,

    /// Frames committed.
    produced: AtomicU64,
}

impl FrameQueue {
    fn new(shape: FrameShape, capacity: usize, shared: bool) -> Arc<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Vec<Slot> = (0..capacity)
            .map(|_| Slot {
                frame: UnsafeCell::new(Frame::new(shape)),
            })
            .collect();

        Arc::new(Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: PaddedAtomicUsize::new(0),
            tails: [PaddedAtomicUsize::new(0), PaddedAtomicUsize::new(0)],
            lanes: AtomicUsize::new(1),
            shared,
            shape,
            dropped: AtomicU64::new(0),
            produced: AtomicU64::new(0),
        })
    }

    /// Create an exclusive edge: one writer, one reader.
    ///
    /// `capacity` is clamped to at least 2 and rounded up to a power of
    /// two.
    pub fn channel(shape: FrameShape, capacity: usize) -> (FrameWriter, FrameReader) {
        let queue = Self::new(shape, capacity, false);
        (
            FrameWriter {
                queue: queue.clone(),
            },
            FrameReader { queue, lane: 0 },
        )
    }

    /// Create a shared edge: one writer, one reader now, room for a
    /// second reader via [`FrameWriter::attach_reader`].
    pub fn shared_channel(shape: FrameShape, capacity: usize) -> (FrameWriter, FrameReader) {
        let queue = Self::new(shape, capacity, true);
        (
            FrameWriter {
                queue: queue.clone(),
            },
            FrameReader { queue, lane: 0 },
        )
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether this queue fans out to two readers.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Shape of the frames in the ring.
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Frames discarded at the full ring.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames committed by the producer.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// The tail of the most-lagging active lane.
    fn lagging_tail(&self) -> usize {
        let t0 = self.tails[0].load(Ordering::Acquire);
        if self.lanes.load(Ordering::Acquire) == 2 {
            let t1 = self.tails[1].load(Ordering::Acquire);
            // Monotonic counters: the smaller wrapping distance from the
            // head is the fresher lane, so take the minimum counter.
            t0.min(t1)
        } else {
            t0
        }
    }
}

// SAFETY: the queue is shared between exactly one producer thread and
// one or two consumer threads; slot access follows the index protocol.
unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

// ============================================================================
// Writer port
// ============================================================================

/// The producing endpoint of a [`FrameQueue`].
///
/// Not cloneable: the ring supports a single producer.
pub struct FrameWriter {
    queue: Arc<FrameQueue>,
}

impl FrameWriter {
    /// Borrow the rear slot for writing.
    ///
    /// Returns `None` when the ring is full; the producer then discards
    /// its newest pending output (counted as a drop).
    pub fn rear(&mut self) -> Option<RearSlot<'_>> {
        let head = self.queue.head.load(Ordering::Relaxed);
        if head.wrapping_sub(self.queue.lagging_tail()) >= self.queue.capacity() {
            self.queue.dropped.fetch_add(1, Ordering::Relaxed);
            stats::record_frame_dropped();
            return None;
        }
        Some(RearSlot {
            queue: &self.queue,
            pos: head,
        })
    }

    /// Attach the second reader lane of a shared queue.
    ///
    /// Returns `None` if the queue is exclusive or already has both
    /// readers. Must run on the control thread while the edge's workers
    /// are stopped; the new reader observes frames produced from this
    /// point on.
    pub fn attach_reader(&self) -> Option<FrameReader> {
        if !self.queue.shared {
            return None;
        }
        if self
            .queue
            .lanes
            .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let head = self.queue.head.load(Ordering::Acquire);
        self.queue.tails[1].store(head, Ordering::Release);
        Some(FrameReader {
            queue: self.queue.clone(),
            lane: 1,
        })
    }

    /// The queue behind this port.
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

/// Writable borrow of the rear slot. Commit to publish; dropping the
/// guard without committing discards the frame.
pub struct RearSlot<'a> {
    queue: &'a FrameQueue,
    pos: usize,
}

impl RearSlot<'_> {
    /// Publish the slot and advance the head.
    pub fn commit(self) {
        self.queue.produced.fetch_add(1, Ordering::Relaxed);
        stats::record_frame_produced();
        self.queue
            .head
            .store(self.pos.wrapping_add(1), Ordering::Release);
    }
}

impl Deref for RearSlot<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // SAFETY: the full-check excluded this slot from every reader's
        // unread window, and there is a single producer.
        unsafe { &*self.queue.slots[self.pos & self.queue.mask].frame.get() }
    }
}

impl DerefMut for RearSlot<'_> {
    fn deref_mut(&mut self) -> &mut Frame {
        // SAFETY: as above; the guard borrows the writer mutably so at
        // most one rear slot is outstanding.
        unsafe { &mut *self.queue.slots[self.pos & self.queue.mask].frame.get() }
    }
}

// ============================================================================
// Reader port
// ============================================================================

/// A consuming endpoint of a [`FrameQueue`].
///
/// Exclusive queues have one reader; shared queues have two, each on its
/// own tail lane.
pub struct FrameReader {
    queue: Arc<FrameQueue>,
    lane: usize,
}

impl FrameReader {
    /// Borrow the oldest unread frame.
    ///
    /// Returns `None` when this lane has consumed everything published.
    pub fn front(&mut self) -> Option<FrontSlot<'_>> {
        let tail = self.queue.tails[self.lane].load(Ordering::Relaxed);
        let head = self.queue.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        Some(FrontSlot {
            queue: &self.queue,
            lane: self.lane,
            pos: tail,
        })
    }

    /// Number of published frames this lane has not yet released.
    pub fn pending(&self) -> usize {
        let tail = self.queue.tails[self.lane].load(Ordering::Relaxed);
        let head = self.queue.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// The queue behind this port.
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

/// Read borrow of the front slot. Release to advance this lane's tail;
/// dropping the guard without releasing leaves the frame unread.
pub struct FrontSlot<'a> {
    queue: &'a FrameQueue,
    lane: usize,
    pos: usize,
}

impl FrontSlot<'_> {
    /// Release the slot and advance this lane's tail.
    pub fn release(self) {
        stats::record_frame_consumed();
        self.queue.tails[self.lane].store(self.pos.wrapping_add(1), Ordering::Release);
    }
}

impl Deref for FrontSlot<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // SAFETY: the slot is published (tail < head) and the producer
        // cannot reclaim it until this lane's tail advances past it.
        unsafe { &*self.queue.slots[self.pos & self.queue.mask].frame.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn write_one(writer: &mut FrameWriter, seq: u64) -> bool {
        match writer.rear() {
            Some(mut slot) => {
                slot.fill_from(&seq.to_le_bytes());
                slot.set_sequence(seq);
                slot.mark_updated();
                slot.commit();
                true
            }
            None => false,
        }
    }

    fn read_one(reader: &mut FrameReader) -> Option<u64> {
        let slot = reader.front()?;
        let seq = slot.sequence();
        slot.release();
        Some(seq)
    }

    #[test]
    fn test_fifo_order() {
        let (mut w, mut r) = FrameQueue::channel(FrameShape::raw_audio(), 4);

        for seq in 0..4 {
            assert!(write_one(&mut w, seq));
        }
        for seq in 0..4 {
            assert_eq!(read_one(&mut r), Some(seq));
        }
        assert!(r.front().is_none());
    }

    #[test]
    fn test_full_drops_newest() {
        let (mut w, mut r) = FrameQueue::channel(FrameShape::raw_audio(), 4);

        for seq in 0..4 {
            assert!(write_one(&mut w, seq));
        }
        // Ring full: rear() fails and the newest output is the drop.
        assert!(!write_one(&mut w, 99));
        assert_eq!(w.queue().dropped(), 1);

        // Committed frames are intact.
        for seq in 0..4 {
            assert_eq!(read_one(&mut r), Some(seq));
        }
    }

    #[test]
    fn test_uncommitted_rear_discards() {
        let (mut w, mut r) = FrameQueue::channel(FrameShape::raw_audio(), 4);

        {
            let mut slot = w.rear().unwrap();
            slot.set_sequence(7);
            // Dropped without commit.
        }
        assert!(r.front().is_none());

        assert!(write_one(&mut w, 1));
        assert_eq!(read_one(&mut r), Some(1));
    }

    #[test]
    fn test_capacity_clamped_to_power_of_two() {
        let (w, _r) = FrameQueue::channel(FrameShape::raw_audio(), 5);
        assert_eq!(w.queue().capacity(), 8);

        let (w, _r) = FrameQueue::channel(FrameShape::raw_audio(), 0);
        assert_eq!(w.queue().capacity(), 2);
    }

    #[test]
    fn test_shared_both_lanes_see_all_frames() {
        let (mut w, mut r0) = FrameQueue::shared_channel(FrameShape::raw_audio(), 8);
        let mut r1 = w.attach_reader().expect("second lane");
        assert!(w.attach_reader().is_none());

        for seq in 0..6 {
            assert!(write_one(&mut w, seq));
        }
        for seq in 0..6 {
            assert_eq!(read_one(&mut r0), Some(seq));
        }
        for seq in 0..6 {
            assert_eq!(read_one(&mut r1), Some(seq));
        }
    }

    #[test]
    fn test_shared_lagging_reader_holds_slots() {
        let (mut w, mut r0) = FrameQueue::shared_channel(FrameShape::raw_audio(), 4);
        let mut r1 = w.attach_reader().unwrap();

        for seq in 0..4 {
            assert!(write_one(&mut w, seq));
        }
        // Fast reader drains its lane.
        for seq in 0..4 {
            assert_eq!(read_one(&mut r0), Some(seq));
        }
        // Lagging lane still pins every slot: the ring is full.
        assert!(!write_one(&mut w, 99));

        assert_eq!(read_one(&mut r1), Some(0));
        // One slot reclaimed.
        assert!(write_one(&mut w, 4));
    }

    #[test]
    fn test_attach_reader_rejected_on_exclusive() {
        let (w, _r) = FrameQueue::channel(FrameShape::raw_audio(), 4);
        assert!(w.attach_reader().is_none());
    }

    #[test]
    fn test_cross_thread_ordering() {
        let (mut w, mut r) = FrameQueue::channel(FrameShape::raw_audio(), 8);
        const COUNT: u64 = 10_000;

        let producer = thread::spawn(move || {
            let mut seq = 0;
            while seq < COUNT {
                if write_one(&mut w, seq) {
                    seq += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let consumer = thread::spawn(move || {
            let mut expected = 0;
            while expected < COUNT {
                match read_one(&mut r) {
                    Some(seq) => {
                        assert_eq!(seq, expected);
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn test_backpressure_drop_counting() {
        let (mut w, mut r) = FrameQueue::channel(FrameShape::raw_audio(), 4);

        // Produce 100, consuming one for every four produced.
        let mut written = 0u64;
        for seq in 0..100 {
            if write_one(&mut w, seq) {
                written += 1;
            }
            if seq % 4 == 3 {
                let _ = read_one(&mut r);
            }
        }

        assert_eq!(w.queue().produced(), written);
        assert_eq!(w.queue().dropped(), 100 - written);
        // No crash, no corruption: remaining frames are in order.
        let mut last = None;
        while let Some(seq) = read_one(&mut r) {
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        }
    }
}
