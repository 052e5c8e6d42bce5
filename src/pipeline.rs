//! The pipeline manager: topology tables, path lifecycle and the
//! composite reconfiguration operation.
//!
//! The manager owns the three keyed tables (filters, paths, workers)
//! and the two endpoint filters created at construction. It is an
//! explicit long-lived value owned by the embedder and passed by
//! reference to the control layer; there is no process-global instance.
//!
//! All operations here run on the control thread. Operations that
//! mutate wiring or worker assignments stop the workers first, mutate,
//! and restart them; worker threads never see a half-wired filter.

use crate::error::{Error, Result};
use crate::filter::{FilterHandle, FilterId, FilterNode, FilterType, PortId, Stage, DEFAULT_PORT};
use crate::frame::AudioCodec;
use crate::stages::{
    self, ReceiverEndpoint, ReceiverHandle, TransmitterEndpoint, TransmitterHandle,
};
use crate::worker::{Discipline, Worker};
use serde_json::{json, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// First ID handed out for internally generated paths and filters,
/// far above the range control clients use.
const GENERATED_ID_BASE: i32 = 1 << 20;

// ============================================================================
// Path
// ============================================================================

/// An ordered producer-to-consumer chain of filters.
#[derive(Debug, Clone)]
pub struct Path {
    origin: FilterId,
    destination: FilterId,
    org_writer: PortId,
    dst_reader: PortId,
    mid: Vec<FilterId>,
    shared: bool,
}

impl Path {
    /// Origin filter ID.
    pub fn origin(&self) -> FilterId {
        self.origin
    }

    /// Destination filter ID.
    pub fn destination(&self) -> FilterId {
        self.destination
    }

    /// Writer port reserved on the origin filter.
    pub fn org_writer(&self) -> PortId {
        self.org_writer
    }

    /// Reader port reserved on the destination filter.
    pub fn dst_reader(&self) -> PortId {
        self.dst_reader
    }

    /// Intermediate filter IDs in flow order.
    pub fn mid_filters(&self) -> &[FilterId] {
        &self.mid
    }

    /// Whether the head edge uses a shared (fan-out) queue.
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

// ============================================================================
// PipelineManager
// ============================================================================

/// Owner of the pipeline topology.
pub struct PipelineManager {
    filters: BTreeMap<FilterId, FilterHandle>,
    paths: BTreeMap<i32, Path>,
    workers: BTreeMap<i32, Worker>,
    receiver_id: FilterId,
    transmitter_id: FilterId,
    receiver: ReceiverHandle,
    transmitter: TransmitterHandle,
    next_generated_id: i32,
}

impl PipelineManager {
    /// Build an empty pipeline with the two endpoint filters and their
    /// implicit workers registered under the endpoint IDs.
    pub fn new(receiver_id: FilterId, transmitter_id: FilterId) -> Result<Self> {
        if receiver_id == transmitter_id {
            return Err(Error::Topology(
                "receiver and transmitter need distinct IDs".into(),
            ));
        }

        let (rx_stage, rx_handle) = ReceiverEndpoint::new();
        let (tx_stage, tx_handle) = TransmitterEndpoint::new();

        let mut manager = Self {
            filters: BTreeMap::new(),
            paths: BTreeMap::new(),
            workers: BTreeMap::new(),
            receiver_id,
            transmitter_id,
            receiver: rx_handle,
            transmitter: tx_handle,
            next_generated_id: GENERATED_ID_BASE,
        };

        manager.add_filter(receiver_id, FilterNode::new(Box::new(rx_stage)))?;
        manager.add_filter(transmitter_id, FilterNode::new(Box::new(tx_stage)))?;

        manager.add_worker(receiver_id, Worker::new(receiver_id, Discipline::BestEffortMaster)?)?;
        manager.add_worker(
            transmitter_id,
            Worker::new(transmitter_id, Discipline::BestEffortMaster)?,
        )?;
        manager.add_filter_to_worker(receiver_id, receiver_id)?;
        manager.add_filter_to_worker(transmitter_id, transmitter_id)?;

        Ok(manager)
    }

    /// The ingress endpoint's filter ID.
    pub fn receiver_id(&self) -> FilterId {
        self.receiver_id
    }

    /// The egress endpoint's filter ID.
    pub fn transmitter_id(&self) -> FilterId {
        self.transmitter_id
    }

    /// Typed handle to the ingress endpoint.
    pub fn receiver(&self) -> ReceiverHandle {
        self.receiver.clone()
    }

    /// Typed handle to the egress endpoint.
    pub fn transmitter(&self) -> TransmitterHandle {
        self.transmitter.clone()
    }

    fn generate_id(&mut self) -> i32 {
        let id = self.next_generated_id;
        self.next_generated_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Filter table
    // ------------------------------------------------------------------

    /// Instantiate the built-in stage for a creatable type and register
    /// it under `id`.
    pub fn create_filter(&mut self, id: FilterId, kind: FilterType) -> Result<()> {
        let stage = stages::create_stage(kind)
            .ok_or_else(|| Error::UnknownType(kind.token().to_string()))?;
        self.add_filter(id, FilterNode::new(stage))
    }

    /// Register a filter node. Fails on a duplicate ID.
    pub fn add_filter(&mut self, id: FilterId, node: FilterNode) -> Result<()> {
        if self.filters.contains_key(&id) {
            return Err(Error::DuplicateId {
                entity: "filter",
                id,
            });
        }
        self.filters.insert(id, Arc::new(Mutex::new(node)));
        Ok(())
    }

    /// Handle to a registered filter.
    pub fn filter(&self, id: FilterId) -> Option<FilterHandle> {
        self.filters.get(&id).cloned()
    }

    /// First registered filter of the given type, if any.
    pub fn search_filter_by_type(&self, kind: FilterType) -> Option<FilterId> {
        self.filters
            .iter()
            .find(|(_, f)| f.lock().unwrap().kind() == kind)
            .map(|(id, _)| *id)
    }

    // ------------------------------------------------------------------
    // Worker table
    // ------------------------------------------------------------------

    /// Register a worker. Fails on a duplicate ID.
    pub fn add_worker(&mut self, id: i32, worker: Worker) -> Result<()> {
        if self.workers.contains_key(&id) {
            return Err(Error::DuplicateId {
                entity: "worker",
                id,
            });
        }
        self.workers.insert(id, worker);
        Ok(())
    }

    /// Whether a worker ID is registered.
    pub fn has_worker(&self, id: i32) -> bool {
        self.workers.contains_key(&id)
    }

    /// IDs of the filters assigned to a worker, if the worker exists.
    pub fn worker_processors(&self, id: i32) -> Option<Vec<FilterId>> {
        self.workers.get(&id).map(|w| w.processor_ids())
    }

    /// Bind a filter to a worker's processor set.
    ///
    /// A filter belongs to exactly one worker once assigned. Call with
    /// the worker stopped.
    pub fn add_filter_to_worker(&mut self, worker_id: i32, filter_id: FilterId) -> Result<()> {
        let filter = self
            .filters
            .get(&filter_id)
            .cloned()
            .ok_or_else(|| Error::unknown_filter(filter_id))?;
        let worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| Error::unknown_worker(worker_id))?;

        let mut node = filter.lock().unwrap();
        if let Some(existing) = node.worker() {
            return Err(Error::Topology(format!(
                "filter {filter_id} already runs on worker {existing}"
            )));
        }
        worker.add_processor(filter_id, Arc::clone(&filter))?;
        node.set_worker(Some(worker_id));
        Ok(())
    }

    /// Bind slave workers to a master.
    pub fn add_slaves_to_worker(&mut self, master_id: i32, slave_ids: &[i32]) -> Result<()> {
        let master_discipline = self
            .workers
            .get(&master_id)
            .ok_or_else(|| Error::unknown_worker(master_id))?
            .discipline();
        if !master_discipline.is_master() {
            return Err(Error::Topology(format!(
                "worker {master_id} is not a master"
            )));
        }

        for &slave_id in slave_ids {
            let gate = {
                let slave = self
                    .workers
                    .get_mut(&slave_id)
                    .ok_or_else(|| Error::unknown_worker(slave_id))?;
                slave.set_master(master_id)?;
                slave.tick_gate()
            };
            let master = self
                .workers
                .get_mut(&master_id)
                .ok_or_else(|| Error::unknown_worker(master_id))?;
            master.add_slave(slave_id, gate)?;
        }
        Ok(())
    }

    /// Start every stopped worker.
    pub fn start_workers(&mut self) -> Result<()> {
        for (id, worker) in self.workers.iter_mut() {
            if !worker.is_running() {
                worker.start()?;
                tracing::debug!(worker = id, "worker started");
            }
        }
        Ok(())
    }

    /// Stop every running worker.
    pub fn stop_workers(&mut self) -> Result<()> {
        for (id, worker) in self.workers.iter_mut() {
            if worker.is_running() {
                worker.stop()?;
                tracing::debug!(worker = id, "worker stopped");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Path lifecycle
    // ------------------------------------------------------------------

    /// Validate IDs and build a path description.
    ///
    /// Negative `org_writer`/`dst_reader` mean "generate an unused port
    /// ID". No queues are wired here; see [`connect_path`](Self::connect_path).
    pub fn create_path(
        &mut self,
        origin: FilterId,
        destination: FilterId,
        org_writer: PortId,
        dst_reader: PortId,
        mid: Vec<FilterId>,
        shared: bool,
    ) -> Result<Path> {
        if origin == destination {
            return Err(Error::Topology("path origin equals destination".into()));
        }
        let origin_handle = self
            .filters
            .get(&origin)
            .cloned()
            .ok_or_else(|| Error::unknown_filter(origin))?;
        let destination_handle = self
            .filters
            .get(&destination)
            .cloned()
            .ok_or_else(|| Error::unknown_filter(destination))?;

        let mut seen = vec![origin, destination];
        for &id in &mid {
            if !self.filters.contains_key(&id) {
                return Err(Error::unknown_filter(id));
            }
            if id == self.receiver_id || id == self.transmitter_id {
                return Err(Error::Topology(
                    "endpoint filters cannot be path intermediates".into(),
                ));
            }
            if seen.contains(&id) {
                return Err(Error::Topology(format!(
                    "filter {id} appears twice in the path"
                )));
            }
            seen.push(id);
        }

        let org_writer = if org_writer < 0 {
            origin_handle.lock().unwrap().generate_writer_id()
        } else {
            org_writer
        };
        let dst_reader = if dst_reader < 0 {
            destination_handle.lock().unwrap().generate_reader_id()
        } else {
            dst_reader
        };

        Ok(Path {
            origin,
            destination,
            org_writer,
            dst_reader,
            mid,
            shared,
        })
    }

    /// Allocate and bind the queues along a path.
    ///
    /// On failure every edge wired so far is torn down before the error
    /// is returned. Call with the affected workers stopped.
    pub fn connect_path(&mut self, path: &Path) -> Result<()> {
        // Edges as (from, to, writer, reader), wired in flow order.
        // Paths are short; four edges cover a three-stage chain.
        let mut edges: SmallVec<[(FilterId, FilterId, PortId, PortId); 4]> = SmallVec::new();
        if path.mid.is_empty() {
            edges.push((
                path.origin,
                path.destination,
                path.org_writer,
                path.dst_reader,
            ));
        } else {
            edges.push((path.origin, path.mid[0], path.org_writer, DEFAULT_PORT));
            for pair in path.mid.windows(2) {
                edges.push((pair[0], pair[1], DEFAULT_PORT, DEFAULT_PORT));
            }
            edges.push((
                path.mid[path.mid.len() - 1],
                path.destination,
                DEFAULT_PORT,
                path.dst_reader,
            ));
        }

        for (i, &(from, to, writer, reader)) in edges.iter().enumerate() {
            let result = self.wire_edge(from, to, writer, reader, path.shared && i == 0);
            if let Err(e) = result {
                tracing::warn!("wiring {from}->{to} failed, unwinding: {e}");
                for &(from, to, writer, reader) in edges[..i].iter().rev() {
                    if let Err(undo) = self.unwire_edge(from, to, writer, reader) {
                        tracing::warn!("unwind of {from}->{to} failed: {undo}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn wire_edge(
        &self,
        from: FilterId,
        to: FilterId,
        writer: PortId,
        reader: PortId,
        shared: bool,
    ) -> Result<()> {
        let from_handle = self
            .filters
            .get(&from)
            .ok_or_else(|| Error::unknown_filter(from))?;
        let to_handle = self
            .filters
            .get(&to)
            .ok_or_else(|| Error::unknown_filter(to))?;
        let mut from_node = from_handle.lock().unwrap();
        let mut to_node = to_handle.lock().unwrap();
        from_node.connect_many_to_many(&mut to_node, reader, writer, shared)
    }

    fn unwire_edge(&self, from: FilterId, to: FilterId, writer: PortId, reader: PortId) -> Result<()> {
        let from_handle = self
            .filters
            .get(&from)
            .ok_or_else(|| Error::unknown_filter(from))?;
        let to_handle = self
            .filters
            .get(&to)
            .ok_or_else(|| Error::unknown_filter(to))?;
        let mut from_node = from_handle.lock().unwrap();
        let mut to_node = to_handle.lock().unwrap();
        from_node.disconnect(&mut to_node, writer, reader)
    }

    /// Register a connected path. Fails on a duplicate ID.
    pub fn add_path(&mut self, id: i32, path: Path) -> Result<()> {
        if self.paths.contains_key(&id) {
            return Err(Error::DuplicateId { entity: "path", id });
        }
        self.paths.insert(id, path);
        Ok(())
    }

    /// A registered path.
    pub fn path(&self, id: i32) -> Option<&Path> {
        self.paths.get(&id)
    }

    /// IDs of all registered paths.
    pub fn path_ids(&self) -> Vec<i32> {
        self.paths.keys().copied().collect()
    }

    /// Tear down every edge of a connected path without touching the
    /// filter or path tables.
    ///
    /// Call with the affected workers stopped.
    pub fn disconnect_path(&mut self, path: &Path) -> Result<()> {
        if path.mid.is_empty() {
            self.unwire_edge(
                path.origin,
                path.destination,
                path.org_writer,
                path.dst_reader,
            )?;
        } else {
            self.unwire_edge(path.origin, path.mid[0], path.org_writer, DEFAULT_PORT)?;
            for pair in path.mid.windows(2) {
                self.unwire_edge(pair[0], pair[1], DEFAULT_PORT, DEFAULT_PORT)?;
            }
            self.unwire_edge(
                path.mid[path.mid.len() - 1],
                path.destination,
                DEFAULT_PORT,
                path.dst_reader,
            )?;
        }
        Ok(())
    }

    /// Disconnect a path, delete its intermediate filters and drop it.
    ///
    /// The endpoint filters survive. Call with the affected workers
    /// stopped.
    pub fn remove_path(&mut self, id: i32) -> Result<()> {
        let path = self
            .paths
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownId { entity: "path", id })?;

        self.disconnect_path(&path)?;

        for &mid_id in &path.mid {
            if let Some(filter) = self.filters.remove(&mid_id) {
                let mut node = filter.lock().unwrap();
                if let Some(worker_id) = node.worker() {
                    if let Some(worker) = self.workers.get_mut(&worker_id) {
                        worker.remove_processor(mid_id);
                    }
                }
                node.disconnect_all();
            }
        }

        self.paths.remove(&id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Composite reconfiguration
    // ------------------------------------------------------------------

    /// Replace the audio encoder sub-path in place.
    ///
    /// Locates the path whose head intermediate filter is `encoder_id`,
    /// removes it (destroying that encoder), builds a replacement
    /// encoder configured with the new codec/channels/sample rate on
    /// the same worker, wires it from the old origin to the
    /// transmitter, and registers the new path under a fresh ID.
    ///
    /// Returns the new (path ID, encoder filter ID) pair.
    pub fn reconfig_audio_encoder(
        &mut self,
        encoder_id: FilterId,
        codec: AudioCodec,
        sample_rate: u32,
        channels: u32,
    ) -> Result<(i32, FilterId)> {
        let (path_id, origin) = self
            .paths
            .iter()
            .find(|(_, p)| p.mid.first() == Some(&encoder_id))
            .map(|(id, p)| (*id, p.origin))
            .ok_or_else(|| {
                Error::Topology(format!("no path headed by encoder {encoder_id}"))
            })?;

        let old_worker = self
            .filters
            .get(&encoder_id)
            .and_then(|f| f.lock().unwrap().worker());

        self.remove_path(path_id)?;

        let new_encoder_id = self.generate_id();
        let mut encoder = stages::AudioEncoderStage::new();
        encoder.reconfigure_audio(codec, channels, sample_rate);
        self.add_filter(new_encoder_id, FilterNode::new(Box::new(encoder)))?;

        if let Some(worker_id) = old_worker {
            self.add_filter_to_worker(worker_id, new_encoder_id)?;
        }

        let transmitter_id = self.transmitter_id;
        let path = self.create_path(origin, transmitter_id, -1, -1, vec![new_encoder_id], false)?;
        self.connect_path(&path)?;

        let new_path_id = self.generate_id();
        self.add_path(new_path_id, path)?;
        tracing::info!(
            encoder = new_encoder_id,
            path = new_path_id,
            codec = codec.token(),
            "audio encoder replaced"
        );
        Ok((new_path_id, new_encoder_id))
    }

    // ------------------------------------------------------------------
    // State snapshot
    // ------------------------------------------------------------------

    /// Full topology snapshot for the `getState` control event.
    pub fn state(&self) -> Value {
        let filters: Vec<Value> = self
            .filters
            .iter()
            .map(|(id, f)| {
                let mut obj = serde_json::Map::new();
                obj.insert("id".into(), json!(id));
                obj.insert("state".into(), f.lock().unwrap().describe());
                Value::Object(obj)
            })
            .collect();

        let paths: Vec<Value> = self
            .paths
            .iter()
            .map(|(id, p)| {
                json!({
                    "id": id,
                    "originFilter": p.origin,
                    "destinationFilter": p.destination,
                    "originWriter": p.org_writer,
                    "destinationReader": p.dst_reader,
                    "filters": p.mid,
                })
            })
            .collect();

        let workers: Vec<Value> = self.workers.keys().map(|id| json!({ "id": id })).collect();

        json!({
            "filters": filters,
            "paths": paths,
            "workers": workers,
        })
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        let _ = self.stop_workers();
    }
}
