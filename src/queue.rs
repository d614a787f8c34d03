//! Bounded SPSC frame queues connecting one writer filter to one reader.
//!
//! A [`FrameQueue`] is a fixed ring of pre-allocated [`Frame`]s. Nothing is
//! copied on enqueue or dequeue: the producer writes in place into the rear
//! slot and publishes it, the consumer reads in place from the front slot
//! and releases it. Splitting a queue yields a [`QueueWriter`] and a
//! [`QueueReader`]; neither is cloneable, which structurally enforces the
//! single-producer/single-consumer discipline.
//!
//! # Overload policy
//!
//! The queue is lossy at the producer end. When full, the producer calls
//! [`QueueWriter::force_rear`], which retracts the most recently published
//! slot (drop newest, keep oldest) and hands it back for reuse. Every
//! downstream filter must tolerate this.
//!
//! # Synchronization
//!
//! `front`/`rear` and the reader hold-state live under a small index mutex.
//! The lock covers index arithmetic only; frame payload I/O happens outside
//! it, on slots the holding side owns exclusively:
//! - the producer owns the rear slot from peek until publish,
//! - the consumer owns the front slot from peek until release,
//! - slot `front - 1` (the write cursor's reserved neighbor) is never
//!   claimable by the producer, which is what makes [`QueueReader::force_front`]
//!   readable at all.

use crate::error::{Error, Result};
use crate::format::{
    max_samples, AudioCodec, PixelFormat, SampleFormat, VideoCodec, DEFAULT_HEIGHT, DEFAULT_WIDTH,
    MAX_H264_OR_H265_NAL_SIZE, VP8_MAX_FRAME_SIZE,
};
use crate::frame::Frame;
use serde::Serialize;
use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};

/// Identifier of a filter within a pipeline.
pub type FilterId = usize;
/// Identifier of a writer endpoint within its owning filter.
pub type WriterId = usize;
/// Identifier of a reader endpoint within its owning filter.
pub type ReaderId = usize;

/// The 4-tuple identifying one wiring between two filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionData {
    /// Producer-side filter id.
    pub writer_filter: FilterId,
    /// Writer endpoint id within the producer filter.
    pub writer_id: WriterId,
    /// Consumer-side filter id.
    pub reader_filter: FilterId,
    /// Reader endpoint id within the consumer filter.
    pub reader_id: ReaderId,
}

struct Indices {
    front: usize,
    rear: usize,
    /// Slot the reader may currently be dereferencing.
    reader_hold: Option<usize>,
    published: u64,
    removed: u64,
    discarded: u64,
}

struct Shared {
    cdata: ConnectionData,
    max: usize,
    frames: Box<[UnsafeCell<Frame>]>,
    idx: Mutex<Indices>,
    extradata: Option<Box<[u8]>>,
}

// Slot access follows the ownership protocol above: each slot is touched by
// at most one side at a time, and the index mutex orders the hand-offs.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// A bounded SPSC ring of pre-allocated frames, not yet split into its
/// producer and consumer endpoints.
///
/// Constructed by a writer filter's `alloc_queue` hook (or directly in
/// tests), then [`split`](FrameQueue::split) when the connection is
/// installed. Effective capacity is `max - 1`: one slot is always reserved
/// as the write cursor peeked by the producer.
pub struct FrameQueue {
    cdata: ConnectionData,
    frames: Vec<Frame>,
    extradata: Option<Box<[u8]>>,
}

impl FrameQueue {
    /// Build a queue over caller-supplied frames.
    ///
    /// Fails if fewer than 2 slots are given (a ring needs one readable
    /// slot plus the reserved write cursor).
    pub fn with_frames(cdata: ConnectionData, frames: Vec<Frame>) -> Result<Self> {
        if frames.len() < 2 {
            return Err(Error::Wiring(format!(
                "frame queue needs at least 2 slots, got {}",
                frames.len()
            )));
        }
        Ok(Self {
            cdata,
            frames,
            extradata: None,
        })
    }

    /// Build a video queue with slots sized for `codec`.
    ///
    /// `pixel_format` is only consulted for [`VideoCodec::Raw`], where it is
    /// mandatory; raw slots are allocated at default dimensions. Filters
    /// without a reason to deviate pass
    /// [`DEFAULT_VIDEO_FRAMES`](crate::format::DEFAULT_VIDEO_FRAMES) for
    /// `max_frames`.
    pub fn video(
        cdata: ConnectionData,
        codec: VideoCodec,
        max_frames: usize,
        pixel_format: PixelFormat,
    ) -> Result<Self> {
        let frames = match codec {
            VideoCodec::H264 | VideoCodec::H265 => (0..max_frames)
                .map(|_| Frame::interleaved_video(codec, MAX_H264_OR_H265_NAL_SIZE))
                .collect(),
            VideoCodec::Vp8 => (0..max_frames)
                .map(|_| Frame::interleaved_video(codec, VP8_MAX_FRAME_SIZE))
                .collect(),
            VideoCodec::Raw => {
                if pixel_format == PixelFormat::None {
                    return Err(Error::Wiring(
                        "no pixel format defined for raw video queue".into(),
                    ));
                }
                (0..max_frames)
                    .map(|_| Frame::raw_video(DEFAULT_WIDTH, DEFAULT_HEIGHT, pixel_format))
                    .collect()
            }
        };
        Self::with_frames(cdata, frames)
    }

    /// Build an audio queue with slots holding up to 100 ms of audio.
    ///
    /// Codec constraints are applied the way the wire formats demand them:
    /// OPUS/AAC/MP3 force S16 interleaved, PCM/PCMU honor the requested
    /// format (interleaved or planar), G.711 is clamped to mono / 8 kHz / U8.
    /// Filters without a reason to deviate pass
    /// [`DEFAULT_AUDIO_FRAMES`](crate::format::DEFAULT_AUDIO_FRAMES) for
    /// `max_frames`.
    pub fn audio(
        cdata: ConnectionData,
        codec: AudioCodec,
        max_frames: usize,
        sample_rate: u32,
        channels: u32,
        sample_format: SampleFormat,
    ) -> Result<Self> {
        let frames = match codec {
            AudioCodec::Opus | AudioCodec::Aac | AudioCodec::Mp3 => {
                let fmt = SampleFormat::S16;
                (0..max_frames)
                    .map(|_| {
                        Frame::interleaved_audio(
                            codec,
                            channels,
                            sample_rate,
                            max_samples(sample_rate),
                            fmt,
                        )
                    })
                    .collect()
            }
            AudioCodec::Pcm | AudioCodec::Pcmu => {
                if sample_format.is_planar() {
                    (0..max_frames)
                        .map(|_| {
                            Frame::planar_audio(
                                codec,
                                channels,
                                sample_rate,
                                max_samples(sample_rate),
                                sample_format,
                            )
                        })
                        .collect()
                } else {
                    (0..max_frames)
                        .map(|_| {
                            Frame::interleaved_audio(
                                codec,
                                channels,
                                sample_rate,
                                max_samples(sample_rate),
                                sample_format,
                            )
                        })
                        .collect()
                }
            }
            AudioCodec::G711 => (0..max_frames)
                .map(|_| {
                    Frame::interleaved_audio(codec, 1, 8000, max_samples(8000), SampleFormat::U8)
                })
                .collect(),
        };
        Self::with_frames(cdata, frames)
    }

    /// Attach codec extradata (e.g. SPS/PPS) readable from both endpoints.
    pub fn with_extradata(mut self, extradata: Vec<u8>) -> Self {
        self.extradata = Some(extradata.into_boxed_slice());
        self
    }

    /// The wiring this queue was allocated for.
    pub fn connection(&self) -> ConnectionData {
        self.cdata
    }

    /// Slot count (effective capacity is one less).
    pub fn max_frames(&self) -> usize {
        self.frames.len()
    }

    /// Split into the producer and consumer endpoints.
    pub fn split(self) -> (QueueWriter, QueueReader) {
        let max = self.frames.len();
        let shared = Arc::new(Shared {
            cdata: self.cdata,
            max,
            frames: self
                .frames
                .into_iter()
                .map(UnsafeCell::new)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            idx: Mutex::new(Indices {
                front: 0,
                rear: 0,
                reader_hold: None,
                published: 0,
                removed: 0,
                discarded: 0,
            }),
            extradata: self.extradata,
        });
        (
            QueueWriter {
                shared: Arc::clone(&shared),
            },
            QueueReader { shared },
        )
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("connection", &self.cdata)
            .field("max_frames", &self.frames.len())
            .finish()
    }
}

fn elements(front: usize, rear: usize, max: usize) -> usize {
    (rear + max - front) % max
}

/// Producer endpoint of a [`FrameQueue`]. Owned by the writer filter.
pub struct QueueWriter {
    shared: Arc<Shared>,
}

impl QueueWriter {
    /// The wiring this endpoint belongs to.
    pub fn connection(&self) -> ConnectionData {
        self.shared.cdata
    }

    /// Codec extradata attached at construction.
    pub fn extradata(&self) -> Option<&[u8]> {
        self.shared.extradata.as_deref()
    }

    /// Unread frame count.
    pub fn len(&self) -> usize {
        let idx = self.shared.idx.lock().unwrap();
        elements(idx.front, idx.rear, self.shared.max)
    }

    /// Whether no unread frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the next [`rear`](Self::rear) peek would fail.
    pub fn is_full(&self) -> bool {
        let idx = self.shared.idx.lock().unwrap();
        (idx.rear + 1) % self.shared.max == idx.front
    }

    /// Slot count (effective capacity is one less).
    pub fn max_frames(&self) -> usize {
        self.shared.max
    }

    /// Frames dropped by [`force_rear`](Self::force_rear) so far.
    pub fn discarded(&self) -> u64 {
        self.shared.idx.lock().unwrap().discarded
    }

    /// Frames published so far (including any later discarded).
    pub fn published(&self) -> u64 {
        self.shared.idx.lock().unwrap().published
    }

    /// Peek the next slot available for writing, or `None` if the queue is
    /// full. No side effect; the slot is not visible to the reader until
    /// [`publish`](Self::publish).
    pub fn rear(&mut self) -> Option<&mut Frame> {
        let idx = self.shared.idx.lock().unwrap();
        if (idx.rear + 1) % self.shared.max == idx.front {
            return None;
        }
        let slot = idx.rear;
        drop(idx);
        // Producer owns the rear slot until publish; the reader cannot see it.
        Some(unsafe { &mut *self.shared.frames[slot].get() })
    }

    /// Peek a writable slot unconditionally. If the queue is full, the most
    /// recently published frame is discarded (drop newest) and its slot
    /// reused. Never blocks and never fails.
    pub fn force_rear(&mut self) -> &mut Frame {
        loop {
            let mut idx = self.shared.idx.lock().unwrap();
            let max = self.shared.max;
            if (idx.rear + 1) % max != idx.front {
                let slot = idx.rear;
                drop(idx);
                return unsafe { &mut *self.shared.frames[slot].get() };
            }
            // Full: retract the newest published slot. If the reader is
            // holding exactly that slot (only reachable at max == 2), let it
            // finish before reusing the memory.
            let newest = (idx.rear + max - 1) % max;
            if idx.reader_hold == Some(newest) {
                drop(idx);
                std::thread::yield_now();
                continue;
            }
            idx.rear = newest;
            idx.discarded += 1;
            drop(idx);
            tracing::debug!(
                writer_filter = self.shared.cdata.writer_filter,
                reader_filter = self.shared.cdata.reader_filter,
                "frame discarded by full queue"
            );
            crate::observability::record_frame_discarded(self.shared.cdata.writer_filter);
        }
    }

    /// Publish the slot previously returned by [`rear`](Self::rear) /
    /// [`force_rear`](Self::force_rear). The producer must have finished
    /// writing it, including length and timestamps.
    ///
    /// Returns the downstream (reader-side) filter id for scheduler
    /// accounting.
    pub fn publish(&mut self) -> FilterId {
        let mut idx = self.shared.idx.lock().unwrap();
        debug_assert!(
            (idx.rear + 1) % self.shared.max != idx.front,
            "publish without a claimed rear slot"
        );
        idx.rear = (idx.rear + 1) % self.shared.max;
        idx.published += 1;
        self.shared.cdata.reader_filter
    }

    /// Publish the pending rear slot only if the producer marked it
    /// consumed, stamping `sequence` on it first.
    ///
    /// Returns the downstream filter id and whether the queue was empty
    /// before publication (i.e. whether this publish enables a downstream
    /// job), or `None` if the slot was not marked for forwarding.
    pub fn publish_if_consumed(&mut self, sequence: u64) -> Option<(FilterId, bool)> {
        let mut idx = self.shared.idx.lock().unwrap();
        if (idx.rear + 1) % self.shared.max == idx.front {
            return None;
        }
        let slot = idx.rear;
        let frame = unsafe { &mut *self.shared.frames[slot].get() };
        if !frame.consumed() {
            return None;
        }
        frame.set_sequence(sequence);
        let was_empty = idx.front == idx.rear;
        idx.rear = (idx.rear + 1) % self.shared.max;
        idx.published += 1;
        Some((self.shared.cdata.reader_filter, was_empty))
    }
}

impl std::fmt::Debug for QueueWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idx = self.shared.idx.lock().unwrap();
        f.debug_struct("QueueWriter")
            .field("connection", &self.shared.cdata)
            .field("max", &self.shared.max)
            .field("elements", &elements(idx.front, idx.rear, self.shared.max))
            .field("discarded", &idx.discarded)
            .finish()
    }
}

/// Consumer endpoint of a [`FrameQueue`]. Owned by the reader filter.
pub struct QueueReader {
    shared: Arc<Shared>,
}

impl QueueReader {
    /// The wiring this endpoint belongs to.
    pub fn connection(&self) -> ConnectionData {
        self.shared.cdata
    }

    /// Codec extradata attached at construction.
    pub fn extradata(&self) -> Option<&[u8]> {
        self.shared.extradata.as_deref()
    }

    /// Unread frame count.
    pub fn len(&self) -> usize {
        let idx = self.shared.idx.lock().unwrap();
        elements(idx.front, idx.rear, self.shared.max)
    }

    /// Whether no unread frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count (effective capacity is one less).
    pub fn max_frames(&self) -> usize {
        self.shared.max
    }

    /// Peek the oldest unread frame, or `None` if the queue is empty.
    /// No side effect; the slot stays owned by the consumer until
    /// [`advance`](Self::advance).
    pub fn front(&mut self) -> Option<&Frame> {
        let mut idx = self.shared.idx.lock().unwrap();
        if idx.front == idx.rear {
            idx.reader_hold = None;
            return None;
        }
        let slot = idx.front;
        idx.reader_hold = Some(slot);
        drop(idx);
        Some(unsafe { &*self.shared.frames[slot].get() })
    }

    /// Release the slot previously returned by [`front`](Self::front) back
    /// to the producer pool.
    ///
    /// Returns the upstream (writer-side) filter id for scheduler
    /// accounting.
    pub fn advance(&mut self) -> FilterId {
        let mut idx = self.shared.idx.lock().unwrap();
        debug_assert!(idx.front != idx.rear, "advance on an empty queue");
        if idx.front != idx.rear {
            idx.front = (idx.front + 1) % self.shared.max;
            idx.removed += 1;
        }
        idx.reader_hold = None;
        self.shared.cdata.writer_filter
    }

    /// Peek the most recently delivered slot, even though the consumer has
    /// already advanced past it. Carries no freshness guarantee: the
    /// contents are whatever the last delivery left there.
    ///
    /// Returns `None` until at least one frame has been delivered (the
    /// slot would otherwise hold never-written data).
    pub fn force_front(&mut self) -> Option<&Frame> {
        let idx = self.shared.idx.lock().unwrap();
        if idx.removed == 0 {
            return None;
        }
        let slot = (idx.front + self.shared.max - 1) % self.shared.max;
        drop(idx);
        // Slot front-1 is the producer's reserved neighbor: claiming it
        // would require (front-1)+1 != front. It can never be written while
        // front is pinned by this (sole) consumer.
        Some(unsafe { &*self.shared.frames[slot].get() })
    }
}

impl std::fmt::Debug for QueueReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idx = self.shared.idx.lock().unwrap();
        f.debug_struct("QueueReader")
            .field("connection", &self.shared.cdata)
            .field("max", &self.shared.max)
            .field("elements", &elements(idx.front, idx.rear, self.shared.max))
            .finish()
    }
}
