mod aligner;
mod broadcaster;
pub mod track;

pub use aligner::{time_micros, TimestampAligner};
pub use broadcaster::{Broadcaster, ChannelSink, FrameSink, SinkId};

use std::sync::Arc;

use bytes::Bytes;

use crate::feed::session::Bitstream;

/// Network-ready compressed frame. Shared immutably between all sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub presentation_timestamp_us: i64,
    pub capture_timestamp_us: i64,
    pub keyframe: bool,
    pub width: usize,
    pub height: usize,
    pub frame_index: u64,
}

/// Stamps finished bitstreams with an aligned presentation time and hands
/// them to the broadcaster. Keeps nothing after delivery.
pub struct OutputSink {
    aligner: TimestampAligner,
    broadcaster: Arc<Broadcaster<EncodedFrame>>,
}

impl OutputSink {
    pub fn new(broadcaster: Arc<Broadcaster<EncodedFrame>>) -> Self {
        Self {
            aligner: TimestampAligner::new(),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster<EncodedFrame>> {
        &self.broadcaster
    }

    pub fn deliver(&mut self, bitstream: Bitstream) -> Arc<EncodedFrame> {
        self.deliver_at(bitstream, time_micros())
    }

    pub fn deliver_at(&mut self, bitstream: Bitstream, now_us: i64) -> Arc<EncodedFrame> {
        let presentation_timestamp_us = self
            .aligner
            .translate(bitstream.capture_timestamp_us, now_us);

        let frame = Arc::new(EncodedFrame {
            data: bitstream.data,
            presentation_timestamp_us,
            capture_timestamp_us: bitstream.capture_timestamp_us,
            keyframe: bitstream.keyframe,
            width: bitstream.width,
            height: bitstream.height,
            frame_index: bitstream.frame_index,
        });
        self.broadcaster.deliver(frame.clone());
        frame
    }
}
