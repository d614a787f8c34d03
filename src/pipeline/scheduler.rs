//! Worker-pool scheduler driving filter processing cycles.
//!
//! A fixed pool of OS threads shares a deadline heap of jobs. Each worker
//! repeatedly pops the earliest due job, runs that filter's
//! `process_frame`, executes any SLAVE filters it enabled inline (so a
//! MASTER's tick carries its slaves on the same thread), wakes other
//! enabled filters, and reschedules the filter with the delay it returned.
//!
//! NETWORK filters never appear on the heap: the pipeline hands control to
//! their external event loop exactly once, on a dedicated thread.

use super::{FilterCell, Registry};
use crate::error::Result;
use crate::filter::FilterRole;
use crate::queue::FilterId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Job {
    due: Instant,
    filter: FilterId,
}

struct Shared {
    jobs: Mutex<BinaryHeap<Reverse<Job>>>,
    available: Condvar,
    running: AtomicBool,
    registry: Registry,
}

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `workers` worker threads over the given filter registry.
    pub(crate) fn start(registry: Registry, workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            registry,
        });
        let workers = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("framewire-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(crate::error::Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(workers = workers.len(), "scheduler started");
        Ok(Self { shared, workers })
    }

    /// Queue a filter for processing at `due`, unless it already has a
    /// pending job.
    pub(crate) fn kick(&self, cell: &FilterCell) {
        if cell.role == FilterRole::Slave || cell.role == FilterRole::Network {
            return;
        }
        if !cell.scheduled.swap(true, Ordering::AcqRel) {
            push_job(&self.shared, cell.id, Instant::now());
        }
    }

    /// Drain the workers and join them.
    pub(crate) fn stop(self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers {
            let _ = worker.join();
        }
        tracing::info!("scheduler stopped");
    }
}

fn push_job(shared: &Shared, filter: FilterId, due: Instant) {
    let mut jobs = shared.jobs.lock().unwrap();
    jobs.push(Reverse(Job { due, filter }));
    drop(jobs);
    shared.available.notify_one();
}

/// Block until a job is due or the scheduler stops.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut jobs = shared.jobs.lock().unwrap();
    loop {
        if !shared.running.load(Ordering::Acquire) {
            return None;
        }
        let now = Instant::now();
        match jobs.peek().copied() {
            Some(Reverse(job)) if job.due <= now => {
                jobs.pop();
                return Some(job);
            }
            Some(Reverse(job)) => {
                let wait = job.due.duration_since(now);
                let (guard, _) = shared.available.wait_timeout(jobs, wait).unwrap();
                jobs = guard;
            }
            None => {
                jobs = shared.available.wait(jobs).unwrap();
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    while let Some(job) = next_job(shared) {
        let cell = {
            let registry = shared.registry.lock().unwrap();
            registry.get(&job.filter).cloned()
        };
        let Some(cell) = cell else { continue };
        cell.scheduled.store(false, Ordering::Release);
        if !cell.running.load(Ordering::Acquire) {
            continue;
        }

        let out = cell.filter.lock().unwrap().process_frame();

        // Enabled downstream filters: slaves run inline on this worker,
        // transitively; everything else gets woken through the heap.
        let mut worklist: VecDeque<FilterId> = out.enabled.iter().copied().collect();
        while let Some(fid) = worklist.pop_front() {
            let target = {
                let registry = shared.registry.lock().unwrap();
                registry.get(&fid).cloned()
            };
            let Some(target) = target else { continue };
            if !target.running.load(Ordering::Acquire) {
                continue;
            }
            match target.role {
                FilterRole::Slave => {
                    let slave_out = target.filter.lock().unwrap().process_frame();
                    worklist.extend(slave_out.enabled.iter().copied());
                }
                FilterRole::Network => {}
                _ => {
                    if !target.scheduled.swap(true, Ordering::AcqRel) {
                        push_job(shared, fid, Instant::now());
                    }
                }
            }
        }

        if matches!(cell.role, FilterRole::Master | FilterRole::Regular)
            && cell.running.load(Ordering::Acquire)
            && !cell.scheduled.swap(true, Ordering::AcqRel)
        {
            push_job(shared, cell.id, Instant::now() + out.delay);
        }
    }
}
