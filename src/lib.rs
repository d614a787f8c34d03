//! # framewire
//!
//! The frame-exchange fabric of a real-time audio/video pipeline: bounded
//! single-producer/single-consumer rings of pre-allocated frames connecting
//! pluggable processing stages, plus the worker-pool scheduler that drives
//! them.
//!
//! ## Design
//!
//! - **Zero-copy slot exchange**: a queue never moves frames. The producer
//!   writes in place into the rear slot and publishes it; the consumer reads
//!   in place from the front slot and releases it.
//! - **Lossy under overload, by contract**: when a queue is full the
//!   producer overwrites the newest frame (drop newest, keep oldest), so a
//!   slow consumer catches up without latency spikes. Every downstream
//!   stage must tolerate drops.
//! - **Role-driven scheduling**: MASTER filters pace themselves from their
//!   frame time, SLAVE filters ride the worker that enabled them, REGULAR
//!   filters run opportunistically, NETWORK filters belong to an external
//!   event loop.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use framewire::prelude::*;
//!
//! let mut pipeline = PipelineManager::new();
//! pipeline.add_filter(
//!     Filter::head(1, FilterRole::Master, camera)
//!         .with_frame_time(Duration::from_millis(40)),
//! )?;
//! pipeline.add_filter(Filter::one_to_one(2, FilterRole::Slave, encoder))?;
//! pipeline.add_filter(Filter::tail(3, FilterRole::Regular, recorder))?;
//! pipeline.connect(1, 1, 2, 1)?;
//! pipeline.connect(2, 1, 3, 1)?;
//! pipeline.start(4)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod format;
pub mod frame;
pub mod observability;
pub mod pipeline;
pub mod queue;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::filter::{
        Filter, FilterRole, Merger, Sink, Source, Splitter, StopToken, Transform,
    };
    pub use crate::format::{AudioCodec, PixelFormat, SampleFormat, VideoCodec};
    pub use crate::frame::{Frame, FramePayload, FrameShape};
    pub use crate::pipeline::PipelineManager;
    pub use crate::queue::{
        ConnectionData, FilterId, FrameQueue, QueueReader, QueueWriter, ReaderId, WriterId,
    };
}

pub use error::{Error, Result};
