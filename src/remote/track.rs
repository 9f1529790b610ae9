use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};
use webrtc::{
    api::media_engine::MIME_TYPE_H264,
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

use super::{Broadcaster, ChannelSink, EncodedFrame, SinkId};

const DEFAULT_SAMPLE_DURATION: Duration = Duration::from_millis(1);

/// An H.264 sample track ready to be added to a peer connection.
pub fn h264_track(id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ))
}

/// Sample durations from consecutive presentation timestamps.
#[derive(Debug, Default)]
struct SampleClock {
    last_pts_us: Option<i64>,
}

impl SampleClock {
    fn duration_for(&mut self, pts_us: i64) -> Duration {
        let duration = match self.last_pts_us {
            Some(last) if pts_us > last => Duration::from_micros((pts_us - last) as u64),
            _ => DEFAULT_SAMPLE_DURATION,
        };
        self.last_pts_us = Some(pts_us);
        duration
    }
}

/// Write every frame from `frames` to `track` until the channel closes.
/// Returns the number of samples written.
pub async fn pump_track(
    mut frames: broadcast::Receiver<Arc<EncodedFrame>>,
    track: Arc<TrackLocalStaticSample>,
) -> Result<u64> {
    let mut clock = SampleClock::default();
    let mut written = 0;

    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "track sink lagging, skipping frames");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        track
            .write_sample(&Sample {
                data: frame.data.clone(),
                duration: clock.duration_for(frame.presentation_timestamp_us),
                ..Default::default()
            })
            .await?;
        written += 1;
    }

    info!(written, "track sink finished");
    Ok(written)
}

/// Keeps a WebRTC track fed from a broadcaster. Dropping the sink detaches it.
pub struct TrackSink {
    broadcaster: Arc<Broadcaster<EncodedFrame>>,
    id: SinkId,
    task: JoinHandle<Result<u64>>,
}

impl TrackSink {
    /// Must be called from within a tokio runtime.
    pub fn attach(
        broadcaster: Arc<Broadcaster<EncodedFrame>>,
        track: Arc<TrackLocalStaticSample>,
        capacity: usize,
    ) -> Self {
        let (sink, rx) = ChannelSink::new(capacity);
        let id = broadcaster.add_sink(Arc::new(sink));
        let task = tokio::spawn(pump_track(rx, track));
        Self {
            broadcaster,
            id,
            task,
        }
    }

    /// Detach from the broadcaster and wait for queued samples to be written.
    pub async fn finish(self) -> Result<u64> {
        self.broadcaster.remove_sink(self.id);
        self.task.await?
    }
}
