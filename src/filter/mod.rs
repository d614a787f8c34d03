//! Filters: the processing stages wired together by frame queues.
//!
//! A filter is a [`Filter`] runner wrapped around a processor implementing
//! one of five capabilities, one per stage shape:
//!
//! - [`Source`]: no inputs, produces frames (head filters)
//! - [`Transform`]: one input, one output
//! - [`Splitter`]: one input, many outputs
//! - [`Merger`]: many inputs, one output
//! - [`Sink`]: no outputs, consumes frames (tail filters)
//!
//! The runner owns the filter's output queues (allocated through the
//! processor's `alloc_queue` hook) and the reader endpoints into upstream
//! queues, and drives one processing cycle per [`Filter::process_frame`]
//! call: a cycle succeeds iff every input has a frame at the front and
//! every output has a free slot at the rear. Processors signal which
//! outputs to forward by marking the destination frames consumed.

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::queue::{ConnectionData, FilterId, FrameQueue, QueueReader, QueueWriter, ReaderId, WriterId};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay before retrying a cycle that found no input or no output room.
pub const RETRY_DELAY: Duration = Duration::from_micros(1000);

/// How a filter is driven by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterRole {
    /// Drives its own clock from its frame time; forces output slots when
    /// queues are full rather than stalling.
    Master,
    /// Runs only when driven inline by the worker that enabled it.
    Slave,
    /// Integrates with an external event loop; never scheduled. The
    /// pipeline hands control over once via `run_manager`.
    Network,
    /// Runs whenever the scheduler has capacity, no pacing.
    Regular,
}

impl FilterRole {
    /// Short lowercase name for logs and state trees.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Slave => "slave",
            Self::Network => "network",
            Self::Regular => "regular",
        }
    }
}

/// Cooperative stop signal handed to NETWORK filters' event loops.
#[derive(Clone, Debug)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub(crate) fn new(running: Arc<AtomicBool>) -> Self {
        Self(running)
    }

    /// Whether the pipeline asked the event loop to wind down.
    pub fn is_stopped(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }
}

/// Destination slots of one processing cycle: writer id → claimed rear slot.
pub type OutputFrames<'a, 'b> = &'a mut [(WriterId, &'b mut Frame)];
/// Origin slots of one processing cycle: reader id → front slot.
pub type InputFrames<'a, 'b> = &'a [(ReaderId, &'b Frame)];

/// A head-filter processor: produces frames into its output queues.
pub trait Source: Send {
    /// Fill the destination slots for one cycle. Mark each slot to forward
    /// with `set_consumed(true)`. Return `false` to report a failed cycle.
    fn produce(&mut self, outputs: OutputFrames<'_, '_>) -> bool;

    /// Allocate the queue for a new downstream connection.
    fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue>;

    /// Get the name of this source (for debugging/logging).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute processor-specific fields to the filter's state report.
    fn report_state(&self, _state: &mut serde_json::Map<String, serde_json::Value>) {}

    /// Transfer control to the processor's external event loop
    /// (NETWORK role only). Runs until `stop` fires.
    fn run_manager(&mut self, _stop: StopToken) -> Result<()> {
        Err(Error::Filter("source has no external event loop".into()))
    }

    /// Release external resources on pipeline shutdown.
    fn stop(&mut self) {}
}

/// A one-to-one processor: transforms the front input frame into the rear
/// output slot.
pub trait Transform: Send {
    /// Transform `input` into `output`. Mark `output` with
    /// `set_consumed(true)` to forward it. Return `false` to report a
    /// failed cycle (the input is still released).
    fn transform(&mut self, input: &Frame, output: &mut Frame) -> bool;

    /// Allocate the queue for a new downstream connection.
    fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue>;

    /// Get the name of this transform (for debugging/logging).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute processor-specific fields to the filter's state report.
    fn report_state(&self, _state: &mut serde_json::Map<String, serde_json::Value>) {}

    /// Release external resources on pipeline shutdown.
    fn stop(&mut self) {}
}

/// A one-to-many processor: fans the front input frame out into several
/// output slots.
pub trait Splitter: Send {
    /// Write `input` into the destination slots, marking the ones to
    /// forward. Return `false` to report a failed cycle.
    fn split(&mut self, input: &Frame, outputs: OutputFrames<'_, '_>) -> bool;

    /// Allocate the queue for a new downstream connection.
    fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue>;

    /// Get the name of this splitter (for debugging/logging).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute processor-specific fields to the filter's state report.
    fn report_state(&self, _state: &mut serde_json::Map<String, serde_json::Value>) {}

    /// Release external resources on pipeline shutdown.
    fn stop(&mut self) {}
}

/// A many-to-one processor: combines the front frames of all inputs into
/// one output slot.
pub trait Merger: Send {
    /// Combine `inputs` into `output`, marking it to forward. Return
    /// `false` to report a failed cycle.
    fn merge(&mut self, inputs: InputFrames<'_, '_>, output: &mut Frame) -> bool;

    /// Allocate the queue for a new downstream connection.
    fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue>;

    /// Get the name of this merger (for debugging/logging).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute processor-specific fields to the filter's state report.
    fn report_state(&self, _state: &mut serde_json::Map<String, serde_json::Value>) {}

    /// Release external resources on pipeline shutdown.
    fn stop(&mut self) {}
}

/// A tail-filter processor: consumes the front frames of all inputs.
pub trait Sink: Send {
    /// Consume one frame from each input. Return `false` to report a
    /// failed cycle (the inputs are released either way).
    fn consume(&mut self, inputs: InputFrames<'_, '_>) -> bool;

    /// Get the name of this sink (for debugging/logging).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute processor-specific fields to the filter's state report.
    fn report_state(&self, _state: &mut serde_json::Map<String, serde_json::Value>) {}

    /// Transfer control to the processor's external event loop
    /// (NETWORK role only). Runs until `stop` fires.
    fn run_manager(&mut self, _stop: StopToken) -> Result<()> {
        Err(Error::Filter("sink has no external event loop".into()))
    }

    /// Release external resources on pipeline shutdown.
    fn stop(&mut self) {}
}

/// The five filter shapes, each wrapping its boxed processor.
pub enum FilterKind {
    /// Head filter (no inputs).
    Head(Box<dyn Source>),
    /// One-to-one transform.
    OneToOne(Box<dyn Transform>),
    /// One-to-many fan-out.
    OneToMany(Box<dyn Splitter>),
    /// Many-to-one fan-in.
    ManyToOne(Box<dyn Merger>),
    /// Tail filter (no outputs).
    Tail(Box<dyn Sink>),
}

impl FilterKind {
    /// Short lowercase name for logs and state trees.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head(_) => "head",
            Self::OneToOne(_) => "one-to-one",
            Self::OneToMany(_) => "one-to-many",
            Self::ManyToOne(_) => "many-to-one",
            Self::Tail(_) => "tail",
        }
    }

    fn max_readers(&self) -> usize {
        match self {
            Self::Head(_) => 0,
            Self::OneToOne(_) | Self::OneToMany(_) => 1,
            Self::ManyToOne(_) | Self::Tail(_) => usize::MAX,
        }
    }

    fn max_writers(&self) -> usize {
        match self {
            Self::Tail(_) => 0,
            Self::OneToOne(_) | Self::ManyToOne(_) => 1,
            Self::Head(_) | Self::OneToMany(_) => usize::MAX,
        }
    }

    fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
        match self {
            Self::Head(p) => p.alloc_queue(cdata),
            Self::OneToOne(p) => p.alloc_queue(cdata),
            Self::OneToMany(p) => p.alloc_queue(cdata),
            Self::ManyToOne(p) => p.alloc_queue(cdata),
            Self::Tail(_) => Err(Error::Wiring("tail filter has no output queues".into())),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Head(p) => p.name(),
            Self::OneToOne(p) => p.name(),
            Self::OneToMany(p) => p.name(),
            Self::ManyToOne(p) => p.name(),
            Self::Tail(p) => p.name(),
        }
    }

    fn report_state(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        match self {
            Self::Head(p) => p.report_state(state),
            Self::OneToOne(p) => p.report_state(state),
            Self::OneToMany(p) => p.report_state(state),
            Self::ManyToOne(p) => p.report_state(state),
            Self::Tail(p) => p.report_state(state),
        }
    }

    fn stop(&mut self) {
        match self {
            Self::Head(p) => p.stop(),
            Self::OneToOne(p) => p.stop(),
            Self::OneToMany(p) => p.stop(),
            Self::ManyToOne(p) => p.stop(),
            Self::Tail(p) => p.stop(),
        }
    }

    fn run_manager(&mut self, stop: StopToken) -> Result<()> {
        match self {
            Self::Head(p) => p.run_manager(stop),
            Self::Tail(p) => p.run_manager(stop),
            _ => Err(Error::Filter(
                "only head and tail filters integrate an external event loop".into(),
            )),
        }
    }
}

/// Result of one [`Filter::process_frame`] call.
#[derive(Debug)]
pub struct Processed {
    /// Whether a cycle actually ran (inputs and outputs were available).
    pub processed: bool,
    /// Downstream filters whose input queue just became non-empty.
    pub enabled: SmallVec<[FilterId; 4]>,
    /// Delay until the filter wants its next invocation.
    pub delay: Duration,
}

impl Processed {
    fn idle(delay: Duration) -> Self {
        Self {
            processed: false,
            enabled: SmallVec::new(),
            delay,
        }
    }
}

enum Cycle {
    Done { enabled: SmallVec<[FilterId; 4]> },
    NotReady,
    Fault,
}

/// A processing stage: a processor plus its queue endpoints and pacing
/// state. Reentrancy is guarded one level up (the pipeline keeps each
/// filter behind a mutex); the runner itself is single-threaded.
pub struct Filter {
    id: FilterId,
    role: FilterRole,
    frame_time: Duration,
    last_process: Option<Instant>,
    seq: u64,
    faults: u64,
    readers: HashMap<ReaderId, QueueReader>,
    writers: HashMap<WriterId, QueueWriter>,
    kind: FilterKind,
}

impl Filter {
    fn new(id: FilterId, role: FilterRole, kind: FilterKind) -> Self {
        Self {
            id,
            role,
            frame_time: Duration::ZERO,
            last_process: None,
            seq: 0,
            faults: 0,
            readers: HashMap::new(),
            writers: HashMap::new(),
            kind,
        }
    }

    /// Create a head filter around a [`Source`] processor.
    pub fn head(id: FilterId, role: FilterRole, source: impl Source + 'static) -> Self {
        Self::new(id, role, FilterKind::Head(Box::new(source)))
    }

    /// Create a one-to-one filter around a [`Transform`] processor.
    pub fn one_to_one(id: FilterId, role: FilterRole, transform: impl Transform + 'static) -> Self {
        Self::new(id, role, FilterKind::OneToOne(Box::new(transform)))
    }

    /// Create a one-to-many filter around a [`Splitter`] processor.
    pub fn one_to_many(id: FilterId, role: FilterRole, splitter: impl Splitter + 'static) -> Self {
        Self::new(id, role, FilterKind::OneToMany(Box::new(splitter)))
    }

    /// Create a many-to-one filter around a [`Merger`] processor.
    pub fn many_to_one(id: FilterId, role: FilterRole, merger: impl Merger + 'static) -> Self {
        Self::new(id, role, FilterKind::ManyToOne(Box::new(merger)))
    }

    /// Create a tail filter around a [`Sink`] processor.
    pub fn tail(id: FilterId, role: FilterRole, sink: impl Sink + 'static) -> Self {
        Self::new(id, role, FilterKind::Tail(Box::new(sink)))
    }

    /// Set the target period between produced frames (0 = as fast as
    /// possible). Only MASTER filters pace themselves by it.
    pub fn with_frame_time(mut self, frame_time: Duration) -> Self {
        self.frame_time = frame_time;
        self
    }

    /// This filter's id.
    pub fn id(&self) -> FilterId {
        self.id
    }

    /// This filter's scheduling role.
    pub fn role(&self) -> FilterRole {
        self.role
    }

    /// Target period between produced frames.
    pub fn frame_time(&self) -> Duration {
        self.frame_time
    }

    /// Failed processing cycles so far.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub(crate) fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Whether this is a head or tail filter, the only shapes that can
    /// integrate an external event loop.
    pub(crate) fn is_endpoint(&self) -> bool {
        matches!(self.kind, FilterKind::Head(_) | FilterKind::Tail(_))
    }

    pub(crate) fn can_install_writer(&self, id: WriterId) -> Result<()> {
        if self.writers.len() >= self.kind.max_writers() {
            return Err(Error::Wiring(format!(
                "filter {} ({}) cannot take another writer",
                self.id,
                self.kind.as_str()
            )));
        }
        if self.writers.contains_key(&id) {
            return Err(Error::Wiring(format!(
                "filter {} already has writer {}",
                self.id, id
            )));
        }
        Ok(())
    }

    pub(crate) fn can_install_reader(&self, id: ReaderId) -> Result<()> {
        if self.readers.len() >= self.kind.max_readers() {
            return Err(Error::Wiring(format!(
                "filter {} ({}) cannot take another reader",
                self.id,
                self.kind.as_str()
            )));
        }
        if self.readers.contains_key(&id) {
            return Err(Error::Wiring(format!(
                "filter {} already has reader {}",
                self.id, id
            )));
        }
        Ok(())
    }

    pub(crate) fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
        self.kind.alloc_queue(cdata)
    }

    pub(crate) fn install_writer(&mut self, id: WriterId, writer: QueueWriter) {
        self.writers.insert(id, writer);
    }

    pub(crate) fn install_reader(&mut self, id: ReaderId, reader: QueueReader) {
        self.readers.insert(id, reader);
    }

    pub(crate) fn remove_writer(&mut self, id: WriterId) -> Option<QueueWriter> {
        self.writers.remove(&id)
    }

    pub(crate) fn remove_reader(&mut self, id: ReaderId) -> Option<QueueReader> {
        self.readers.remove(&id)
    }

    pub(crate) fn stop(&mut self) {
        self.kind.stop();
    }

    pub(crate) fn run_manager(&mut self, stop: StopToken) -> Result<()> {
        self.kind.run_manager(stop)
    }

    /// Attempt one processing cycle, honoring role pacing.
    pub fn process_frame(&mut self) -> Processed {
        if self.role == FilterRole::Network {
            tracing::debug!(filter = self.id, "network filter invoked by scheduler");
            return Processed::idle(Duration::from_secs(1));
        }

        let started = Instant::now();
        if self.role == FilterRole::Master && !self.frame_time.is_zero() {
            if let Some(last) = self.last_process {
                let due = last + self.frame_time;
                if started < due {
                    return Processed::idle(due - started);
                }
            }
        }

        match self.run_cycle() {
            Cycle::Done { enabled } => {
                self.last_process = Some(started);
                Processed {
                    processed: true,
                    enabled,
                    delay: self.next_delay(started),
                }
            }
            Cycle::NotReady => Processed::idle(RETRY_DELAY),
            Cycle::Fault => {
                self.faults += 1;
                self.last_process = Some(started);
                crate::observability::record_filter_fault(self.id);
                tracing::warn!(
                    filter = self.id,
                    name = self.kind.name(),
                    faults = self.faults,
                    "processing cycle failed"
                );
                Processed::idle(self.next_delay(started))
            }
        }
    }

    fn next_delay(&self, started: Instant) -> Duration {
        match self.role {
            FilterRole::Master => self.frame_time.saturating_sub(started.elapsed()),
            _ => Duration::ZERO,
        }
    }

    fn run_cycle(&mut self) -> Cycle {
        let needs_input = !matches!(self.kind, FilterKind::Head(_));
        let needs_output = !matches!(self.kind, FilterKind::Tail(_));
        if needs_input && self.readers.is_empty() {
            return Cycle::NotReady;
        }
        if needs_output && self.writers.is_empty() {
            return Cycle::NotReady;
        }

        // A MASTER never stalls on a full queue: it overwrites the newest
        // frame and keeps its clock.
        let force_outputs = self.role == FilterRole::Master;

        let mut inputs: SmallVec<[(ReaderId, &Frame); 4]> = SmallVec::new();
        for (id, reader) in self.readers.iter_mut() {
            match reader.front() {
                Some(frame) => inputs.push((*id, frame)),
                None => return Cycle::NotReady,
            }
        }

        let mut outputs: SmallVec<[(WriterId, &mut Frame); 4]> = SmallVec::new();
        for (id, writer) in self.writers.iter_mut() {
            let frame = if force_outputs {
                writer.force_rear()
            } else {
                match writer.rear() {
                    Some(frame) => frame,
                    None => return Cycle::NotReady,
                }
            };
            frame.set_consumed(false);
            outputs.push((*id, frame));
        }

        let consumed_inputs = inputs.len();
        let ok = match &mut self.kind {
            FilterKind::Head(p) => p.produce(&mut outputs),
            FilterKind::OneToOne(p) => p.transform(inputs[0].1, &mut *outputs[0].1),
            FilterKind::OneToMany(p) => p.split(inputs[0].1, &mut outputs),
            FilterKind::ManyToOne(p) => p.merge(&inputs, &mut *outputs[0].1),
            FilterKind::Tail(p) => p.consume(&inputs),
        };
        drop(inputs);
        drop(outputs);

        // Inputs are released whether or not the cycle succeeded.
        for reader in self.readers.values_mut() {
            reader.advance();
        }

        if !ok {
            return Cycle::Fault;
        }

        if matches!(self.kind, FilterKind::Tail(_)) {
            for _ in 0..consumed_inputs {
                crate::observability::record_frame_consumed(self.id);
            }
        }

        self.seq += 1;
        let mut enabled: SmallVec<[FilterId; 4]> = SmallVec::new();
        for writer in self.writers.values_mut() {
            if let Some((downstream, was_empty)) = writer.publish_if_consumed(self.seq) {
                crate::observability::record_frame_published(self.id);
                if was_empty {
                    enabled.push(downstream);
                }
            }
        }
        Cycle::Done { enabled }
    }

    /// This filter's node in the pipeline state tree.
    pub(crate) fn state(&self) -> serde_json::Value {
        let mut node = serde_json::Map::new();
        node.insert("id".into(), self.id.into());
        node.insert("name".into(), self.kind.name().into());
        node.insert("kind".into(), self.kind.as_str().into());
        node.insert("role".into(), self.role.as_str().into());
        node.insert(
            "frame_time_us".into(),
            (self.frame_time.as_micros() as u64).into(),
        );
        node.insert("faults".into(), self.faults.into());

        let mut writers: Vec<_> = self.writers.iter().collect();
        writers.sort_by_key(|(id, _)| **id);
        let writers: Vec<serde_json::Value> = writers
            .into_iter()
            .map(|(id, w)| {
                let cdata = w.connection();
                crate::observability::record_queue_depth(self.id, *id, w.len());
                serde_json::json!({
                    "id": id,
                    "to_filter": cdata.reader_filter,
                    "to_reader": cdata.reader_id,
                    "elements": w.len(),
                    "published": w.published(),
                    "discarded": w.discarded(),
                })
            })
            .collect();
        node.insert("writers".into(), writers.into());

        let mut readers: Vec<_> = self.readers.iter().collect();
        readers.sort_by_key(|(id, _)| **id);
        let readers: Vec<serde_json::Value> = readers
            .into_iter()
            .map(|(id, r)| {
                let cdata = r.connection();
                serde_json::json!({
                    "id": id,
                    "from_filter": cdata.writer_filter,
                    "from_writer": cdata.writer_id,
                    "elements": r.len(),
                })
            })
            .collect();
        node.insert("readers".into(), readers.into());

        self.kind.report_state(&mut node);
        serde_json::Value::Object(node)
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("id", &self.id)
            .field("kind", &self.kind.as_str())
            .field("role", &self.role)
            .field("readers", &self.readers.len())
            .field("writers", &self.writers.len())
            .field("faults", &self.faults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_frames(max: usize) -> Vec<Frame> {
        (0..max).map(|_| Frame::opaque(8)).collect()
    }

    /// Head processor that writes its cycle count into every output slot.
    struct CountingSource {
        produced: u64,
        queue_size: usize,
    }

    impl CountingSource {
        fn new(queue_size: usize) -> Self {
            Self {
                produced: 0,
                queue_size,
            }
        }
    }

    impl Source for CountingSource {
        fn produce(&mut self, outputs: OutputFrames<'_, '_>) -> bool {
            self.produced += 1;
            for (_, frame) in outputs.iter_mut() {
                let bytes = self.produced.to_le_bytes();
                frame.data_mut().unwrap()[..8].copy_from_slice(&bytes);
                frame.set_length(8);
                frame.set_consumed(true);
            }
            true
        }

        fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
            FrameQueue::with_frames(cdata, mock_frames(self.queue_size))
        }
    }

    /// Transform that copies its input and reports success or failure on
    /// demand.
    struct PassThrough {
        got_frame: bool,
        queue_size: usize,
    }

    impl Transform for PassThrough {
        fn transform(&mut self, input: &Frame, output: &mut Frame) -> bool {
            let len = input.length();
            output.data_mut().unwrap()[..len].copy_from_slice(&input.data().unwrap()[..len]);
            output.set_length(len);
            output.set_consumed(self.got_frame);
            self.got_frame
        }

        fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
            FrameQueue::with_frames(cdata, mock_frames(self.queue_size))
        }
    }

    /// Splitter that duplicates its input payload into every output.
    struct FanOut {
        queue_size: usize,
    }

    impl Splitter for FanOut {
        fn split(&mut self, input: &Frame, outputs: OutputFrames<'_, '_>) -> bool {
            let len = input.length();
            for (_, frame) in outputs.iter_mut() {
                frame.data_mut().unwrap()[..len].copy_from_slice(&input.data().unwrap()[..len]);
                frame.set_length(len);
                frame.set_consumed(true);
            }
            true
        }

        fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
            FrameQueue::with_frames(cdata, mock_frames(self.queue_size))
        }
    }

    /// Merger that sums the first payload byte of every input.
    struct SumInputs {
        queue_size: usize,
    }

    impl Merger for SumInputs {
        fn merge(&mut self, inputs: InputFrames<'_, '_>, output: &mut Frame) -> bool {
            let sum = inputs
                .iter()
                .map(|(_, frame)| frame.data().unwrap()[0] as u64)
                .sum::<u64>();
            output.data_mut().unwrap()[0] = sum as u8;
            output.set_length(1);
            output.set_consumed(true);
            true
        }

        fn alloc_queue(&self, cdata: ConnectionData) -> Result<FrameQueue> {
            FrameQueue::with_frames(cdata, mock_frames(self.queue_size))
        }
    }

    /// Sink that records the sequence numbers it consumes, observable from
    /// outside the filter through a shared handle.
    struct CaptureSink {
        seen: std::sync::Arc<std::sync::Mutex<Vec<u64>>>,
    }

    impl CaptureSink {
        fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u64>>>) {
            let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            (
                Self {
                    seen: std::sync::Arc::clone(&seen),
                },
                seen,
            )
        }
    }

    impl Sink for CaptureSink {
        fn consume(&mut self, inputs: InputFrames<'_, '_>) -> bool {
            let mut seen = self.seen.lock().unwrap();
            for (_, frame) in inputs {
                seen.push(frame.sequence());
            }
            true
        }
    }

    fn wire(head: &mut Filter, tail: &mut Filter, writer_id: WriterId, reader_id: ReaderId) {
        let cdata = ConnectionData {
            writer_filter: head.id(),
            writer_id,
            reader_filter: tail.id(),
            reader_id,
        };
        let (writer, reader) = head.alloc_queue(cdata).unwrap().split();
        head.install_writer(writer_id, writer);
        tail.install_reader(reader_id, reader);
    }

    #[test]
    fn test_head_cycle_enables_downstream() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);

        let out = head.process_frame();
        assert!(out.processed);
        assert_eq!(out.enabled.as_slice(), &[2]);
        assert_eq!(out.delay, Duration::ZERO);

        // Queue no longer empty: the next publish enables nothing new.
        let out = head.process_frame();
        assert!(out.processed);
        assert!(out.enabled.is_empty());
    }

    #[test]
    fn test_tail_consumes_in_order() {
        let (sink, seen) = CaptureSink::new();
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(8));
        let mut tail = Filter::tail(2, FilterRole::Regular, sink);
        wire(&mut head, &mut tail, 1, 1);

        for _ in 0..3 {
            assert!(head.process_frame().processed);
        }
        for _ in 0..3 {
            assert!(tail.process_frame().processed);
        }
        // The runner stamps sequence numbers 1, 2, 3 at publication.
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_tail_not_ready_on_empty_queue() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);

        let out = tail.process_frame();
        assert!(!out.processed);
        assert_eq!(out.delay, RETRY_DELAY);
    }

    #[test]
    fn test_master_pacing() {
        let mut head = Filter::head(1, FilterRole::Master, CountingSource::new(4))
            .with_frame_time(Duration::from_millis(50));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);

        assert!(head.process_frame().processed);
        let out = head.process_frame();
        assert!(!out.processed);
        assert!(out.delay > Duration::ZERO && out.delay <= Duration::from_millis(50));
    }

    #[test]
    fn test_master_forces_output_when_full() {
        // Queue of 3 slots (capacity 2): a paced-out consumer never drains,
        // and the master keeps producing by overwriting the newest frame.
        let mut head = Filter::head(1, FilterRole::Master, CountingSource::new(3));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);

        for _ in 0..5 {
            assert!(head.process_frame().processed);
        }
        let writer = head.writers.get(&1).unwrap();
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.discarded(), 3);
    }

    #[test]
    fn test_regular_head_stalls_when_full() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(3));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);

        assert!(head.process_frame().processed);
        assert!(head.process_frame().processed);
        let out = head.process_frame();
        assert!(!out.processed);
        assert_eq!(out.delay, RETRY_DELAY);
    }

    #[test]
    fn test_transform_fault_releases_input() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut transform = Filter::one_to_one(
            2,
            FilterRole::Regular,
            PassThrough {
                got_frame: false,
                queue_size: 4,
            },
        );
        let mut tail = Filter::tail(3, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut transform, 1, 1);
        wire(&mut transform, &mut tail, 1, 1);

        assert!(head.process_frame().processed);
        let out = transform.process_frame();
        assert!(!out.processed);
        assert_eq!(transform.faults(), 1);
        // Input released, nothing forwarded.
        assert!(transform.readers.get(&1).unwrap().is_empty());
        assert!(transform.writers.get(&1).unwrap().is_empty());
    }

    #[test]
    fn test_transform_forwards_payload() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut transform = Filter::one_to_one(
            2,
            FilterRole::Regular,
            PassThrough {
                got_frame: true,
                queue_size: 4,
            },
        );
        let mut tail = Filter::tail(3, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut transform, 1, 1);
        wire(&mut transform, &mut tail, 1, 1);

        assert!(head.process_frame().processed);
        let out = transform.process_frame();
        assert!(out.processed);
        assert_eq!(out.enabled.as_slice(), &[3]);
        assert!(tail.process_frame().processed);
    }

    #[test]
    fn test_splitter_fans_out_to_all_outputs() {
        let mut head = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut splitter =
            Filter::one_to_many(2, FilterRole::Regular, FanOut { queue_size: 4 });
        let (sink_a, seen_a) = CaptureSink::new();
        let (sink_b, seen_b) = CaptureSink::new();
        let mut tail_a = Filter::tail(3, FilterRole::Regular, sink_a);
        let mut tail_b = Filter::tail(4, FilterRole::Regular, sink_b);
        wire(&mut head, &mut splitter, 1, 1);
        wire(&mut splitter, &mut tail_a, 1, 1);
        wire(&mut splitter, &mut tail_b, 2, 1);

        assert!(head.process_frame().processed);
        let out = splitter.process_frame();
        assert!(out.processed);
        let mut enabled = out.enabled.to_vec();
        enabled.sort_unstable();
        assert_eq!(enabled, vec![3, 4]);

        assert!(tail_a.process_frame().processed);
        assert!(tail_b.process_frame().processed);
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[1]);
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_merger_combines_all_inputs() {
        let mut head_a = Filter::head(1, FilterRole::Regular, CountingSource::new(4));
        let mut head_b = Filter::head(2, FilterRole::Regular, CountingSource::new(4));
        let mut merger =
            Filter::many_to_one(3, FilterRole::Regular, SumInputs { queue_size: 4 });
        let (sink, seen) = CaptureSink::new();
        let mut tail = Filter::tail(4, FilterRole::Regular, sink);
        wire(&mut head_a, &mut merger, 1, 1);
        wire(&mut head_b, &mut merger, 1, 2);
        wire(&mut merger, &mut tail, 1, 1);

        // Merger is not ready until every input has a frame.
        assert!(head_a.process_frame().processed);
        assert!(!merger.process_frame().processed);
        assert!(head_b.process_frame().processed);
        assert!(merger.process_frame().processed);

        assert!(tail.process_frame().processed);
        assert_eq!(seen.lock().unwrap().len(), 1);
        // Both inputs were released.
        assert!(merger.readers.values().all(|r| r.is_empty()));
    }

    #[test]
    fn test_network_filter_never_cycles() {
        let mut head = Filter::head(1, FilterRole::Network, CountingSource::new(4));
        let out = head.process_frame();
        assert!(!out.processed);
    }

    #[test]
    fn test_state_tree_shape() {
        let mut head = Filter::head(1, FilterRole::Master, CountingSource::new(4))
            .with_frame_time(Duration::from_millis(40));
        let mut tail = Filter::tail(2, FilterRole::Regular, CaptureSink::new().0);
        wire(&mut head, &mut tail, 1, 1);
        head.process_frame();

        let state = head.state();
        assert_eq!(state["id"], 1);
        assert_eq!(state["kind"], "head");
        assert_eq!(state["role"], "master");
        assert_eq!(state["frame_time_us"], 40_000);
        assert_eq!(state["writers"][0]["to_filter"], 2);
        assert_eq!(state["writers"][0]["elements"], 1);

        let state = tail.state();
        assert_eq!(state["kind"], "tail");
        assert_eq!(state["readers"][0]["from_filter"], 1);
    }
}
