//! Workers: the execution vehicles that step filters.
//!
//! A worker owns one OS thread and iterates a set of filters under one
//! of four disciplines:
//!
//! - **Best-effort master**: round-robin sweeps with a small back-off
//!   sleep after an empty sweep.
//! - **Best-effort slave**: sweeps only when its master ticks.
//! - **Constant-framerate master**: absolute-deadline pacing at a
//!   target frame period; misses are logged and counted, never caught
//!   up.
//! - **Constant-framerate slave**: sweeps on each completed master
//!   tick, phase-locked to the master's cadence.
//!
//! Masters signal slaves through a [`TickGate`] (eventfd on Linux, an
//! atomic counter elsewhere). Stopping a worker sets a flag checked once
//! per iteration; the current sweep finishes, the thread joins, filter
//! state is untouched.

use crate::error::{Error, Result};
use crate::filter::{FilterHandle, FilterId, Progress};
use crate::stats;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Smallest back-off sleep after an empty best-effort sweep.
const BACKOFF_MIN: Duration = Duration::from_millis(1);

/// Largest back-off sleep after consecutive empty sweeps.
const BACKOFF_MAX: Duration = Duration::from_millis(5);

/// How long a slave parks between polls of its tick gate.
const SLAVE_POLL: Duration = Duration::from_micros(200);

// ============================================================================
// TickGate
// ============================================================================

/// Cross-thread tick signal from a master to a slave.
///
/// On Linux this is a non-blocking eventfd; elsewhere it falls back to
/// an atomic counter. Signals accumulate: a slave that was busy during
/// two ticks sees one pending wakeup, not zero.
#[cfg(target_os = "linux")]
pub struct TickGate {
    fd: rustix::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl TickGate {
    /// Create an unsignaled gate.
    pub fn new() -> Result<Self> {
        let fd = rustix::event::eventfd(
            0,
            rustix::event::EventfdFlags::NONBLOCK | rustix::event::EventfdFlags::CLOEXEC,
        )
        .map_err(|e| Error::Io(std::io::Error::other(format!("eventfd: {e}"))))?;
        Ok(Self { fd })
    }

    /// Signal the gate. Safe from any thread.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        rustix::io::write(&self.fd, &val.to_ne_bytes())
            .map_err(|e| Error::Io(std::io::Error::other(format!("eventfd write: {e}"))))?;
        Ok(())
    }

    /// Consume a pending signal without blocking.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(true),
            Ok(_) => Ok(false),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(false),
            Err(e) => Err(Error::Io(std::io::Error::other(format!(
                "eventfd read: {e}"
            )))),
        }
    }
}

/// Fallback gate for non-Linux platforms using atomics.
#[cfg(not(target_os = "linux"))]
pub struct TickGate {
    counter: std::sync::atomic::AtomicU64,
}

#[cfg(not(target_os = "linux"))]
impl TickGate {
    /// Create an unsignaled gate.
    pub fn new() -> Result<Self> {
        Ok(Self {
            counter: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Signal the gate. Safe from any thread.
    pub fn notify(&self) -> Result<()> {
        self.counter.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Consume a pending signal without blocking.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            let val = self.counter.load(Ordering::Acquire);
            if val == 0 {
                return Ok(false);
            }
            if self
                .counter
                .compare_exchange(val, val - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(true);
            }
        }
    }
}

// ============================================================================
// Discipline
// ============================================================================

/// The scheduling discipline of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Free-running round-robin with idle back-off.
    BestEffortMaster,
    /// Sweeps on the master's tick.
    BestEffortSlave,
    /// Deadline-paced at a target frame period.
    ConstantRateMaster {
        /// Target frame period (1/fps).
        period: Duration,
    },
    /// Sweeps on each completed constant-rate tick.
    ConstantRateSlave,
}

impl Discipline {
    /// Build a constant-rate master discipline from a frames-per-second
    /// target.
    pub fn constant_rate(fps: u32) -> Self {
        Self::ConstantRateMaster {
            period: Duration::from_secs_f64(1.0 / fps as f64),
        }
    }

    /// Whether this discipline drives timing.
    pub fn is_master(self) -> bool {
        matches!(
            self,
            Self::BestEffortMaster | Self::ConstantRateMaster { .. }
        )
    }

    /// Whether this discipline follows a master's tick.
    pub fn is_slave(self) -> bool {
        !self.is_master()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// A worker: one OS thread stepping a set of filters.
pub struct Worker {
    id: i32,
    discipline: Discipline,
    /// Filters stepped by this worker, keyed by filter ID. Shared with
    /// the worker thread; mutated only while the worker is stopped.
    processors: Arc<Mutex<BTreeMap<FilterId, FilterHandle>>>,
    /// Gates of this master's slaves. Empty for slave workers.
    slave_gates: Arc<Mutex<BTreeMap<i32, Arc<TickGate>>>>,
    /// This worker's own gate; masters tick it when this worker slaves
    /// for them.
    tick: Arc<TickGate>,
    /// The master this slave is bound to, if any.
    master: Option<i32>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a stopped worker.
    pub fn new(id: i32, discipline: Discipline) -> Result<Self> {
        Ok(Self {
            id,
            discipline,
            processors: Arc::new(Mutex::new(BTreeMap::new())),
            slave_gates: Arc::new(Mutex::new(BTreeMap::new())),
            tick: Arc::new(TickGate::new()?),
            master: None,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    /// This worker's ID.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The worker's discipline.
    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Whether the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// The master this slave is bound to.
    pub fn master(&self) -> Option<i32> {
        self.master
    }

    /// Record the master binding. A slave belongs to at most one master.
    pub fn set_master(&mut self, master: i32) -> Result<()> {
        if self.discipline.is_master() {
            return Err(Error::Topology(format!(
                "worker {} is a master and cannot slave",
                self.id
            )));
        }
        if let Some(existing) = self.master {
            return Err(Error::Topology(format!(
                "worker {} already slaves for {existing}",
                self.id
            )));
        }
        self.master = Some(master);
        Ok(())
    }

    /// This worker's tick gate, for a master to signal.
    pub fn tick_gate(&self) -> Arc<TickGate> {
        Arc::clone(&self.tick)
    }

    /// Register a slave's gate on this master.
    pub fn add_slave(&mut self, slave_id: i32, gate: Arc<TickGate>) -> Result<()> {
        if !self.discipline.is_master() {
            return Err(Error::Topology(format!(
                "worker {} is not a master",
                self.id
            )));
        }
        self.slave_gates.lock().unwrap().insert(slave_id, gate);
        Ok(())
    }

    /// Assign a filter to this worker. Call with the worker stopped.
    pub fn add_processor(&mut self, filter_id: FilterId, filter: FilterHandle) -> Result<()> {
        let mut processors = self.processors.lock().unwrap();
        if processors.contains_key(&filter_id) {
            return Err(Error::DuplicateId {
                entity: "filter",
                id: filter_id,
            });
        }
        processors.insert(filter_id, filter);
        Ok(())
    }

    /// Remove a filter from this worker's set. Call with the worker
    /// stopped.
    pub fn remove_processor(&mut self, filter_id: FilterId) -> bool {
        self.processors.lock().unwrap().remove(&filter_id).is_some()
    }

    /// IDs of the filters assigned to this worker.
    pub fn processor_ids(&self) -> Vec<FilterId> {
        self.processors.lock().unwrap().keys().copied().collect()
    }

    /// Whether any filter is assigned.
    pub fn has_processors(&self) -> bool {
        !self.processors.lock().unwrap().is_empty()
    }

    /// Start the worker thread. No-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);

        let id = self.id;
        let discipline = self.discipline;
        let processors = Arc::clone(&self.processors);
        let slave_gates = Arc::clone(&self.slave_gates);
        let tick = Arc::clone(&self.tick);
        let stop = Arc::clone(&self.stop);

        let handle = std::thread::Builder::new()
            .name(format!("cascade-worker-{id}"))
            .spawn(move || {
                tracing::info!(worker = id, ?discipline, "worker started");
                match discipline {
                    Discipline::BestEffortMaster => {
                        run_best_effort_master(id, &stop, &processors, &slave_gates)
                    }
                    Discipline::ConstantRateMaster { period } => {
                        run_constant_rate_master(id, period, &stop, &processors, &slave_gates)
                    }
                    Discipline::BestEffortSlave | Discipline::ConstantRateSlave => {
                        run_slave(id, &stop, &processors, &tick)
                    }
                }
                tracing::info!(worker = id, "worker stopped");
            })
            .map_err(|e| Error::WorkerThread(format!("spawning worker {id}: {e}")))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the worker thread and join it. No-op when already stopped.
    ///
    /// The loop finishes its current sweep; filter state is untouched.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        handle
            .join()
            .map_err(|_| Error::WorkerThread(format!("worker {} panicked", self.id)))?;
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ============================================================================
// Loop bodies
// ============================================================================

/// Step every assigned filter once. Returns true when any filter made
/// progress. Per-filter failures are logged, never fatal to the loop.
fn sweep(id: i32, processors: &Mutex<BTreeMap<FilterId, FilterHandle>>) -> bool {
    let processors = processors.lock().unwrap();
    let mut progress = false;
    for (filter_id, filter) in processors.iter() {
        match filter.lock().unwrap().process() {
            Ok(Progress::Worked) => progress = true,
            Ok(Progress::Idle) => {}
            Err(e) => {
                tracing::warn!(worker = id, filter = *filter_id, "filter step failed: {e}");
            }
        }
    }
    progress
}

/// Tick every registered slave gate.
fn tick_slaves(slave_gates: &Mutex<BTreeMap<i32, Arc<TickGate>>>) {
    for gate in slave_gates.lock().unwrap().values() {
        let _ = gate.notify();
    }
}

fn run_best_effort_master(
    id: i32,
    stop: &AtomicBool,
    processors: &Mutex<BTreeMap<FilterId, FilterHandle>>,
    slave_gates: &Mutex<BTreeMap<i32, Arc<TickGate>>>,
) {
    let mut backoff = BACKOFF_MIN;
    while !stop.load(Ordering::Acquire) {
        tick_slaves(slave_gates);
        if sweep(id, processors) {
            backoff = BACKOFF_MIN;
        } else {
            stats::record_idle_sweep(id);
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }
}

fn run_constant_rate_master(
    id: i32,
    period: Duration,
    stop: &AtomicBool,
    processors: &Mutex<BTreeMap<FilterId, FilterHandle>>,
    slave_gates: &Mutex<BTreeMap<i32, Arc<TickGate>>>,
) {
    let mut deadline = Instant::now() + period;
    while !stop.load(Ordering::Acquire) {
        tick_slaves(slave_gates);
        sweep(id, processors);

        let now = Instant::now();
        if now < deadline {
            std::thread::sleep(deadline - now);
            deadline += period;
        } else {
            // Overran the period: report and resume cadence from here,
            // no catch-up ticks.
            tracing::warn!(worker = id, "deadline missed by {:?}", now - deadline);
            stats::record_deadline_miss(id);
            deadline = now + period;
        }
    }
}

fn run_slave(
    id: i32,
    stop: &AtomicBool,
    processors: &Mutex<BTreeMap<FilterId, FilterHandle>>,
    tick: &TickGate,
) {
    while !stop.load(Ordering::Acquire) {
        match tick.try_wait() {
            Ok(true) => {
                sweep(id, processors);
            }
            Ok(false) => std::thread::sleep(SLAVE_POLL),
            Err(e) => {
                tracing::error!(worker = id, "tick gate failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CascadeResult;
    use crate::filter::{FilterNode, FilterType, Progress, Stage, StageIo};
    use crate::frame::FrameShape;
    use std::sync::atomic::AtomicU64;

    /// Stage that counts its process calls.
    struct CountingStage {
        calls: Arc<AtomicU64>,
        busy: bool,
    }

    impl Stage for CountingStage {
        fn kind(&self) -> FilterType {
            FilterType::AudioDecoder
        }

        fn process(&mut self, _io: &mut StageIo<'_>) -> CascadeResult<Progress> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(if self.busy {
                Progress::Worked
            } else {
                Progress::Idle
            })
        }

        fn output_shape(&self) -> FrameShape {
            FrameShape::raw_audio()
        }
    }

    fn counting_filter(busy: bool) -> (FilterHandle, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let node = FilterNode::new(Box::new(CountingStage {
            calls: Arc::clone(&calls),
            busy,
        }));
        (Arc::new(Mutex::new(node)), calls)
    }

    #[test]
    fn test_tick_gate_accumulates() {
        let gate = TickGate::new().unwrap();
        assert!(!gate.try_wait().unwrap());
        gate.notify().unwrap();
        assert!(gate.try_wait().unwrap());
        assert!(!gate.try_wait().unwrap());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let mut worker = Worker::new(1, Discipline::BestEffortMaster).unwrap();
        let (filter, _calls) = counting_filter(false);
        worker.add_processor(10, filter).unwrap();

        assert!(!worker.is_running());
        worker.start().unwrap();
        worker.start().unwrap();
        assert!(worker.is_running());

        worker.stop().unwrap();
        worker.stop().unwrap();
        assert!(!worker.is_running());

        // Restartable after a stop.
        worker.start().unwrap();
        worker.stop().unwrap();
    }

    #[test]
    fn test_best_effort_master_steps_filters() {
        let mut worker = Worker::new(2, Discipline::BestEffortMaster).unwrap();
        let (filter, calls) = counting_filter(true);
        worker.add_processor(10, filter).unwrap();

        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop().unwrap();

        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_slave_only_steps_on_tick() {
        let mut slave = Worker::new(3, Discipline::BestEffortSlave).unwrap();
        let (filter, calls) = counting_filter(true);
        slave.add_processor(10, filter).unwrap();
        let gate = slave.tick_gate();

        slave.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        for _ in 0..5 {
            gate.notify().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        slave.stop().unwrap();

        let swept = calls.load(Ordering::Relaxed);
        assert!(swept >= 1 && swept <= 5, "swept {swept} times");
    }

    #[test]
    fn test_constant_rate_master_cadence() {
        let mut worker = Worker::new(4, Discipline::constant_rate(100)).unwrap();
        let (filter, calls) = counting_filter(true);
        worker.add_processor(10, filter).unwrap();

        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        worker.stop().unwrap();

        // 100 Hz over 500 ms is 50 sweeps; allow generous scheduling
        // slack below and the stop-boundary sweep above.
        let swept = calls.load(Ordering::Relaxed);
        assert!((35..=55).contains(&swept), "swept {swept} times");
    }

    #[test]
    fn test_duplicate_processor_rejected() {
        let mut worker = Worker::new(5, Discipline::BestEffortMaster).unwrap();
        let (filter, _) = counting_filter(false);
        worker.add_processor(10, Arc::clone(&filter)).unwrap();
        assert!(worker.add_processor(10, filter).is_err());
    }

    #[test]
    fn test_slave_master_binding_rules() {
        let mut master = Worker::new(6, Discipline::BestEffortMaster).unwrap();
        let mut slave = Worker::new(7, Discipline::BestEffortSlave).unwrap();

        // A master cannot slave.
        assert!(master.set_master(7).is_err());
        // A slave cannot own slaves.
        assert!(slave.add_slave(6, master.tick_gate()).is_err());

        slave.set_master(6).unwrap();
        // Only one master per slave.
        assert!(slave.set_master(8).is_err());

        master.add_slave(7, slave.tick_gate()).unwrap();
    }
}
