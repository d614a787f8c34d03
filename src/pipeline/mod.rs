//! Pipeline construction and control.
//!
//! [`PipelineManager`] is the topology registry and control plane: it owns
//! the filters, wires writer endpoints to reader endpoints through the
//! writer filter's `alloc_queue` hook, runs the worker-pool scheduler, and
//! reports a JSON-shaped state tree.
//!
//! # Example
//!
//! ```rust,ignore
//! use framewire::pipeline::PipelineManager;
//! use framewire::filter::{Filter, FilterRole};
//!
//! let mut pipeline = PipelineManager::new();
//! pipeline.add_filter(Filter::head(1, FilterRole::Master, camera))?;
//! pipeline.add_filter(Filter::tail(2, FilterRole::Regular, display))?;
//! pipeline.connect(1, 1, 2, 1)?;
//! pipeline.start(4)?;
//! // ...
//! pipeline.stop();
//! ```

mod scheduler;

use crate::error::{Error, Result};
use crate::filter::{Filter, FilterRole, StopToken};
use crate::queue::{ConnectionData, FilterId, ReaderId, WriterId};
use scheduler::Scheduler;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A registered filter plus the bookkeeping the scheduler needs without
/// taking the filter's mutex.
pub(crate) struct FilterCell {
    pub(crate) id: FilterId,
    pub(crate) role: FilterRole,
    /// Cleared on stop; checked by workers between cycles and polled by
    /// NETWORK event loops through their stop token.
    pub(crate) running: Arc<AtomicBool>,
    /// Whether a job for this filter is pending on the heap.
    pub(crate) scheduled: AtomicBool,
    pub(crate) filter: Mutex<Filter>,
}

pub(crate) type Registry = Arc<Mutex<HashMap<FilterId, Arc<FilterCell>>>>;

/// Topology registry and worker-pool driver for a set of filters.
pub struct PipelineManager {
    filters: Registry,
    connections: Vec<ConnectionData>,
    scheduler: Option<Scheduler>,
    workers: usize,
    network_threads: Vec<(FilterId, JoinHandle<()>)>,
}

impl PipelineManager {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            filters: Arc::new(Mutex::new(HashMap::new())),
            connections: Vec::new(),
            scheduler: None,
            workers: 0,
            network_threads: Vec::new(),
        }
    }

    /// Whether the scheduler is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Register a filter. Its id must be unused.
    pub fn add_filter(&mut self, filter: Filter) -> Result<()> {
        let id = filter.id();
        if filter.role() == FilterRole::Network && !filter.is_endpoint() {
            return Err(Error::Wiring(format!(
                "filter {id} has NETWORK role but is not a head or tail filter"
            )));
        }
        let kind = filter.kind_str();
        let cell = Arc::new(FilterCell {
            id,
            role: filter.role(),
            running: Arc::new(AtomicBool::new(false)),
            scheduled: AtomicBool::new(false),
            filter: Mutex::new(filter),
        });

        {
            let mut registry = self.filters.lock().unwrap();
            if registry.contains_key(&id) {
                return Err(Error::Pipeline(format!("filter id {id} already in use")));
            }
            registry.insert(id, Arc::clone(&cell));
        }
        tracing::info!(filter = id, kind, role = cell.role.as_str(), "filter added");

        if self.is_running() {
            self.launch(&cell)?;
        }
        Ok(())
    }

    /// Remove a filter, tearing down every connection that touches it.
    pub fn remove_filter(&mut self, id: FilterId) -> Result<()> {
        let cell = {
            let registry = self.filters.lock().unwrap();
            registry
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::Pipeline(format!("unknown filter {id}")))?
        };
        cell.running.store(false, Ordering::Release);

        let touching: Vec<ConnectionData> = self
            .connections
            .iter()
            .filter(|c| c.writer_filter == id || c.reader_filter == id)
            .copied()
            .collect();
        for cdata in touching {
            self.disconnect(
                cdata.writer_filter,
                cdata.writer_id,
                cdata.reader_filter,
                cdata.reader_id,
            )?;
        }

        if let Some(pos) = self.network_threads.iter().position(|(fid, _)| *fid == id) {
            let (_, handle) = self.network_threads.swap_remove(pos);
            let _ = handle.join();
        }
        cell.filter.lock().unwrap().stop();

        self.filters.lock().unwrap().remove(&id);
        tracing::info!(filter = id, "filter removed");
        Ok(())
    }

    /// Connect writer `writer_id` of `writer_filter` to reader `reader_id`
    /// of `reader_filter`, allocating the queue through the writer filter.
    pub fn connect(
        &mut self,
        writer_filter: FilterId,
        writer_id: WriterId,
        reader_filter: FilterId,
        reader_id: ReaderId,
    ) -> Result<()> {
        if writer_filter == reader_filter {
            return Err(Error::Wiring(format!(
                "filter {writer_filter} cannot connect to itself"
            )));
        }
        if self.reaches(reader_filter, writer_filter) {
            return Err(Error::Wiring(format!(
                "connecting {writer_filter} to {reader_filter} would form a cycle"
            )));
        }

        let (wcell, rcell) = {
            let registry = self.filters.lock().unwrap();
            let wcell = registry
                .get(&writer_filter)
                .cloned()
                .ok_or_else(|| Error::Pipeline(format!("unknown filter {writer_filter}")))?;
            let rcell = registry
                .get(&reader_filter)
                .cloned()
                .ok_or_else(|| Error::Pipeline(format!("unknown filter {reader_filter}")))?;
            (wcell, rcell)
        };

        let cdata = ConnectionData {
            writer_filter,
            writer_id,
            reader_filter,
            reader_id,
        };

        // Writer side first, reader second; every multi-filter lock in the
        // manager takes them in this order.
        let mut wf = wcell.filter.lock().unwrap();
        let mut rf = rcell.filter.lock().unwrap();
        wf.can_install_writer(writer_id)?;
        rf.can_install_reader(reader_id)?;
        let queue = wf.alloc_queue(cdata)?;
        let (writer, reader) = queue.split();
        wf.install_writer(writer_id, writer);
        rf.install_reader(reader_id, reader);
        drop(rf);
        drop(wf);

        self.connections.push(cdata);
        tracing::info!(
            writer_filter,
            writer_id,
            reader_filter,
            reader_id,
            "filters connected"
        );
        Ok(())
    }

    /// Tear down one connection. The queue and its pre-allocated frames are
    /// dropped with the last endpoint.
    pub fn disconnect(
        &mut self,
        writer_filter: FilterId,
        writer_id: WriterId,
        reader_filter: FilterId,
        reader_id: ReaderId,
    ) -> Result<()> {
        let cdata = ConnectionData {
            writer_filter,
            writer_id,
            reader_filter,
            reader_id,
        };
        let pos = self
            .connections
            .iter()
            .position(|c| *c == cdata)
            .ok_or_else(|| Error::Wiring(format!("no such connection: {cdata:?}")))?;

        let registry = self.filters.lock().unwrap();
        if let Some(wcell) = registry.get(&writer_filter) {
            wcell.filter.lock().unwrap().remove_writer(writer_id);
        }
        if let Some(rcell) = registry.get(&reader_filter) {
            rcell.filter.lock().unwrap().remove_reader(reader_id);
        }
        drop(registry);

        self.connections.swap_remove(pos);
        tracing::info!(
            writer_filter,
            writer_id,
            reader_filter,
            reader_id,
            "filters disconnected"
        );
        Ok(())
    }

    /// Start the worker pool and hand NETWORK filters to their event loops.
    pub fn start(&mut self, workers: usize) -> Result<()> {
        if self.is_running() {
            return Err(Error::Pipeline("pipeline already running".into()));
        }
        crate::observability::init_metrics();
        self.workers = workers.max(1);
        self.scheduler = Some(Scheduler::start(
            Arc::clone(&self.filters),
            self.workers,
        )?);

        let cells: Vec<Arc<FilterCell>> = {
            let registry = self.filters.lock().unwrap();
            registry.values().cloned().collect()
        };
        for cell in cells {
            self.launch(&cell)?;
        }
        tracing::info!(workers = self.workers, "pipeline started");
        Ok(())
    }

    /// Mark a filter runnable under the current scheduler: seed its first
    /// job, or spawn its event-loop thread for NETWORK filters.
    fn launch(&mut self, cell: &Arc<FilterCell>) -> Result<()> {
        cell.running.store(true, Ordering::Release);
        match cell.role {
            FilterRole::Network => {
                let cell = Arc::clone(cell);
                let token = StopToken::new(Arc::clone(&cell.running));
                let id = cell.id;
                let handle = std::thread::Builder::new()
                    .name(format!("framewire-net-{id}"))
                    .spawn(move || {
                        tracing::info!(filter = cell.id, "transferring control to event loop");
                        let mut filter = cell.filter.lock().unwrap();
                        if let Err(e) = filter.run_manager(token) {
                            tracing::warn!(filter = cell.id, error = %e, "event loop exited");
                        }
                    })?;
                self.network_threads.push((id, handle));
            }
            FilterRole::Slave => {}
            _ => {
                if let Some(scheduler) = &self.scheduler {
                    scheduler.kick(cell);
                }
            }
        }
        Ok(())
    }

    /// Stop the pipeline: clear every running flag, drain and join the
    /// workers and event-loop threads, then let each filter release its
    /// external resources.
    pub fn stop(&mut self) {
        let cells: Vec<Arc<FilterCell>> = {
            let registry = self.filters.lock().unwrap();
            registry.values().cloned().collect()
        };
        for cell in &cells {
            cell.running.store(false, Ordering::Release);
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        // Jobs pending at shutdown died with the heap; clear their marks so
        // a restart can seed every filter again.
        for cell in &cells {
            cell.scheduled.store(false, Ordering::Release);
        }
        for (_, handle) in self.network_threads.drain(..) {
            let _ = handle.join();
        }
        for cell in &cells {
            cell.filter.lock().unwrap().stop();
        }
        if !cells.is_empty() {
            tracing::info!("pipeline stopped");
        }
    }

    /// The pipeline state tree: one node per filter with its role, fault
    /// count, and per-endpoint queue depths.
    pub fn state(&self) -> serde_json::Value {
        let cells: Vec<Arc<FilterCell>> = {
            let registry = self.filters.lock().unwrap();
            registry.values().cloned().collect()
        };
        let mut nodes: Vec<(FilterId, serde_json::Value)> = cells
            .iter()
            .map(|cell| {
                // A NETWORK filter's event loop owns its mutex for as long
                // as it runs; report what is known without blocking on it.
                let node = if cell.role == FilterRole::Network {
                    match cell.filter.try_lock() {
                        Ok(filter) => filter.state(),
                        Err(_) => serde_json::json!({
                            "id": cell.id,
                            "role": cell.role.as_str(),
                            "busy": true,
                        }),
                    }
                } else {
                    cell.filter.lock().unwrap().state()
                };
                (cell.id, node)
            })
            .collect();
        nodes.sort_by_key(|(id, _)| *id);

        serde_json::json!({
            "running": self.is_running(),
            "filters": nodes.into_iter().map(|(_, node)| node).collect::<Vec<_>>(),
        })
    }

    /// Whether `from` already reaches `to` through existing connections.
    fn reaches(&self, from: FilterId, to: FilterId) -> bool {
        let mut seen: HashSet<FilterId> = HashSet::new();
        let mut stack = vec![from];
        while let Some(filter) = stack.pop() {
            if filter == to {
                return true;
            }
            for cdata in &self.connections {
                if cdata.writer_filter == filter && seen.insert(cdata.reader_filter) {
                    stack.push(cdata.reader_filter);
                }
            }
        }
        false
    }
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.stop();
    }
}
