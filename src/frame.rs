//! Frame types: the unit of data exchanged between filters.
//!
//! A [`Frame`] is a fixed-capacity payload buffer plus metadata (timestamps,
//! sequence number, consumed flag) and a shape descriptor. Frames are
//! pre-allocated when a queue is built and reused for the lifetime of the
//! queue: producers write into a slot in place, consumers read it in place.
//!
//! The payload and shape are tagged unions: instead of downcasting a generic
//! frame pointer to a concrete subclass, callers match on
//! [`FramePayload`] / [`FrameShape`].

use crate::format::{AudioCodec, PixelFormat, SampleFormat, VideoCodec};
use std::time::Duration;

/// Frame payload storage.
///
/// Planar storage (one buffer per channel) exists for audio only; video and
/// encoded payloads are always interleaved.
#[derive(Clone, Debug)]
pub enum FramePayload {
    /// Single contiguous byte buffer.
    Interleaved(Box<[u8]>),
    /// One buffer per audio channel.
    Planar(Vec<Box<[u8]>>),
}

/// What kind of media a frame carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameShape {
    /// A video picture, raw or encoded.
    Video {
        /// Codec of the payload.
        codec: VideoCodec,
        /// Picture width in pixels (0 until the producer sets it).
        width: u32,
        /// Picture height in pixels (0 until the producer sets it).
        height: u32,
        /// Pixel format ([`PixelFormat::None`] for encoded payloads).
        pixel_format: PixelFormat,
    },
    /// An audio chunk, raw or encoded.
    Audio {
        /// Codec of the payload.
        codec: AudioCodec,
        /// Channel count.
        channels: u32,
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Sample format.
        sample_format: SampleFormat,
        /// Samples per channel currently valid.
        samples: usize,
    },
    /// No media shape. Used by generic plumbing and tests.
    Opaque,
}

/// One media sample: payload buffer plus metadata.
#[derive(Clone, Debug)]
pub struct Frame {
    payload: FramePayload,
    /// Bytes currently valid (per plane for planar payloads).
    length: usize,
    presentation_time: Duration,
    origin_time: Duration,
    sequence: u64,
    consumed: bool,
    shape: FrameShape,
}

impl Frame {
    fn new(payload: FramePayload, shape: FrameShape) -> Self {
        Self {
            payload,
            length: 0,
            presentation_time: Duration::ZERO,
            origin_time: Duration::ZERO,
            sequence: 0,
            consumed: false,
            shape,
        }
    }

    /// Create an interleaved video frame with a fixed byte capacity.
    ///
    /// Used for encoded payloads, where the slot must hold the worst-case
    /// access unit regardless of picture dimensions.
    pub fn interleaved_video(codec: VideoCodec, capacity: usize) -> Self {
        Self::new(
            FramePayload::Interleaved(vec![0u8; capacity].into_boxed_slice()),
            FrameShape::Video {
                codec,
                width: 0,
                height: 0,
                pixel_format: PixelFormat::None,
            },
        )
    }

    /// Create a raw video frame sized for the given dimensions and format.
    pub fn raw_video(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let capacity = pixel_format.frame_size(width, height);
        Self::new(
            FramePayload::Interleaved(vec![0u8; capacity].into_boxed_slice()),
            FrameShape::Video {
                codec: VideoCodec::Raw,
                width,
                height,
                pixel_format,
            },
        )
    }

    /// Create an interleaved audio frame holding `max_samples` per channel.
    pub fn interleaved_audio(
        codec: AudioCodec,
        channels: u32,
        sample_rate: u32,
        max_samples: usize,
        sample_format: SampleFormat,
    ) -> Self {
        let capacity = max_samples * channels as usize * sample_format.bytes_per_sample();
        Self::new(
            FramePayload::Interleaved(vec![0u8; capacity].into_boxed_slice()),
            FrameShape::Audio {
                codec,
                channels,
                sample_rate,
                sample_format,
                samples: 0,
            },
        )
    }

    /// Create a planar audio frame: one plane per channel, each holding
    /// `max_samples` samples.
    pub fn planar_audio(
        codec: AudioCodec,
        channels: u32,
        sample_rate: u32,
        max_samples: usize,
        sample_format: SampleFormat,
    ) -> Self {
        let plane = max_samples * sample_format.bytes_per_sample();
        let planes = (0..channels)
            .map(|_| vec![0u8; plane].into_boxed_slice())
            .collect();
        Self::new(
            FramePayload::Planar(planes),
            FrameShape::Audio {
                codec,
                channels,
                sample_rate,
                sample_format,
                samples: 0,
            },
        )
    }

    /// Create a shapeless frame with a raw byte capacity.
    pub fn opaque(capacity: usize) -> Self {
        Self::new(
            FramePayload::Interleaved(vec![0u8; capacity].into_boxed_slice()),
            FrameShape::Opaque,
        )
    }

    /// Get the payload.
    pub fn payload(&self) -> &FramePayload {
        &self.payload
    }

    /// Get the payload mutably.
    pub fn payload_mut(&mut self) -> &mut FramePayload {
        &mut self.payload
    }

    /// Interleaved payload bytes (full capacity). `None` for planar frames.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            FramePayload::Interleaved(buf) => Some(buf),
            FramePayload::Planar(_) => None,
        }
    }

    /// Interleaved payload bytes, mutable. `None` for planar frames.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.payload {
            FramePayload::Interleaved(buf) => Some(buf),
            FramePayload::Planar(_) => None,
        }
    }

    /// Per-channel planes. `None` for interleaved frames.
    pub fn planes(&self) -> Option<&[Box<[u8]>]> {
        match &self.payload {
            FramePayload::Interleaved(_) => None,
            FramePayload::Planar(planes) => Some(planes),
        }
    }

    /// Per-channel planes, mutable. `None` for interleaved frames.
    pub fn planes_mut(&mut self) -> Option<&mut [Box<[u8]>]> {
        match &mut self.payload {
            FramePayload::Interleaved(_) => None,
            FramePayload::Planar(planes) => Some(planes),
        }
    }

    /// Payload capacity in bytes (per plane for planar frames).
    pub fn capacity(&self) -> usize {
        match &self.payload {
            FramePayload::Interleaved(buf) => buf.len(),
            FramePayload::Planar(planes) => planes.first().map_or(0, |p| p.len()),
        }
    }

    /// Bytes currently valid (per plane for planar frames).
    pub fn length(&self) -> usize {
        self.length
    }

    /// Set the valid byte count, clamped to capacity.
    pub fn set_length(&mut self, length: usize) {
        self.length = length.min(self.capacity());
    }

    /// Presentation timestamp.
    pub fn presentation_time(&self) -> Duration {
        self.presentation_time
    }

    /// Set the presentation timestamp.
    pub fn set_presentation_time(&mut self, ts: Duration) {
        self.presentation_time = ts;
    }

    /// Origin (capture) timestamp.
    pub fn origin_time(&self) -> Duration {
        self.origin_time
    }

    /// Set the origin timestamp.
    pub fn set_origin_time(&mut self, ts: Duration) {
        self.origin_time = ts;
    }

    /// Producer-assigned monotonic sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Set the sequence number.
    pub fn set_sequence(&mut self, seq: u64) {
        self.sequence = seq;
    }

    /// Whether the producer finished writing this slot.
    pub fn consumed(&self) -> bool {
        self.consumed
    }

    /// Mark the slot as carrying a fresh frame (or clear the mark).
    pub fn set_consumed(&mut self, consumed: bool) {
        self.consumed = consumed;
    }

    /// The frame's shape descriptor.
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Update the picture dimensions of a video frame. No-op otherwise.
    pub fn set_dimensions(&mut self, w: u32, h: u32) {
        if let FrameShape::Video { width, height, .. } = &mut self.shape {
            *width = w;
            *height = h;
        }
    }

    /// Update the valid sample count of an audio frame. No-op otherwise.
    pub fn set_samples(&mut self, count: usize) {
        if let FrameShape::Audio { samples, .. } = &mut self.shape {
            *samples = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_video_capacity() {
        let frame = Frame::interleaved_video(VideoCodec::H264, 1024);
        assert_eq!(frame.capacity(), 1024);
        assert_eq!(frame.length(), 0);
        assert!(frame.data().is_some());
        assert!(frame.planes().is_none());
    }

    #[test]
    fn test_raw_video_sized_by_format() {
        let frame = Frame::raw_video(640, 480, PixelFormat::Yuv420p);
        assert_eq!(frame.capacity(), 640 * 480 * 3 / 2);
        match frame.shape() {
            FrameShape::Video {
                codec,
                width,
                height,
                pixel_format,
            } => {
                assert_eq!(codec, VideoCodec::Raw);
                assert_eq!((width, height), (640, 480));
                assert_eq!(pixel_format, PixelFormat::Yuv420p);
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn test_planar_audio_planes() {
        let frame = Frame::planar_audio(AudioCodec::Pcm, 2, 48000, 4800, SampleFormat::S16p);
        let planes = frame.planes().unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].len(), 4800 * 2);
        assert!(frame.data().is_none());
    }

    #[test]
    fn test_set_length_clamps_to_capacity() {
        let mut frame = Frame::opaque(16);
        frame.set_length(1000);
        assert_eq!(frame.length(), 16);
        frame.set_length(4);
        assert_eq!(frame.length(), 4);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut frame = Frame::opaque(4);
        frame.set_sequence(7);
        frame.set_consumed(true);
        frame.set_presentation_time(Duration::from_micros(40_000));
        frame.set_origin_time(Duration::from_micros(39_000));
        assert_eq!(frame.sequence(), 7);
        assert!(frame.consumed());
        assert_eq!(frame.presentation_time(), Duration::from_micros(40_000));
        assert_eq!(frame.origin_time(), Duration::from_micros(39_000));
    }

    #[test]
    fn test_audio_samples_update() {
        let mut frame = Frame::interleaved_audio(AudioCodec::Pcm, 2, 48000, 4800, SampleFormat::S16);
        frame.set_samples(960);
        match frame.shape() {
            FrameShape::Audio { samples, .. } => assert_eq!(samples, 960),
            other => panic!("unexpected shape: {other:?}"),
        }
    }
}
