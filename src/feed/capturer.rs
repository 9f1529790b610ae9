use std::sync::Arc;

use tracing::{trace, warn};

use super::{
    frame::{I420Frame, PixelFormat, RawFrame},
    scheduler::{Schedule, Scheduler},
};
use crate::remote::{time_micros, Broadcaster, EncodedFrame, FrameSink, SinkId};

/// Raw frame handed to transports that encode on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub frame: I420Frame,
    pub timestamp_us: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareOptions {
    /// Output size. 0 keeps the source size, or derives it from the other
    /// dimension when only one is set.
    pub width: usize,
    pub height: usize,
}

impl SoftwareOptions {
    pub fn output_size(&self, source_width: usize, source_height: usize) -> (usize, usize) {
        let even = |v: usize| (v & !1).max(2);
        match (self.width, self.height) {
            (0, 0) => (source_width, source_height),
            (w, 0) => (w, even(w * source_height / source_width.max(1))),
            (0, h) => (even(h * source_width / source_height.max(1)), h),
            (w, h) => (w, h),
        }
    }
}

enum CapturePath {
    Hardware {
        scheduler: Scheduler,
        encoded: Arc<Broadcaster<EncodedFrame>>,
    },
    Software {
        options: SoftwareOptions,
        raw: Arc<Broadcaster<CapturedFrame>>,
    },
}

/// Renderer-facing entry point. Either forwards frames to an encode
/// scheduler or converts them to I420 for a transport that encodes itself.
pub struct Capturer {
    path: CapturePath,
}

impl Capturer {
    /// `encoded` must be the broadcaster the scheduler's output sink delivers to.
    pub fn hardware(scheduler: Scheduler, encoded: Arc<Broadcaster<EncodedFrame>>) -> Self {
        Self {
            path: CapturePath::Hardware { scheduler, encoded },
        }
    }

    pub fn software(options: SoftwareOptions) -> Self {
        Self {
            path: CapturePath::Software {
                options,
                raw: Arc::new(Broadcaster::new()),
            },
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.path, CapturePath::Hardware { .. })
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        match &self.path {
            CapturePath::Hardware { scheduler, .. } => Some(scheduler),
            CapturePath::Software { .. } => None,
        }
    }

    pub fn on_frame(&self, frame: RawFrame) {
        match &self.path {
            CapturePath::Hardware { scheduler, .. } => scheduler.submit_raw_frame(frame),
            CapturePath::Software { options, raw } => {
                let converted = match frame.to_i420() {
                    Ok(converted) => converted,
                    Err(e) => {
                        warn!(error = %e, "skipping frame, conversion failed");
                        return;
                    }
                };
                let (width, height) = options.output_size(frame.width, frame.height);
                let frame = if (width, height) == (converted.width, converted.height) {
                    converted
                } else {
                    converted.scale_to(width, height)
                };
                let delivered = raw.deliver(Arc::new(CapturedFrame {
                    frame,
                    timestamp_us: time_micros(),
                }));
                trace!(delivered, width, height, "raw frame broadcast");
            }
        }
    }

    /// Borrowed renderer pixels, stamped with the current time.
    pub fn capture_pixels(&self, pixels: &[u8], width: usize, height: usize, format: PixelFormat) {
        match RawFrame::copy_from_slice(pixels, width, height, format, time_micros()) {
            Ok(frame) => self.on_frame(frame),
            Err(e) => warn!(error = %e, width, height, "dropping malformed frame"),
        }
    }

    /// `None` on the software path, which produces no encoded frames.
    pub fn add_encoded_sink(&self, sink: Arc<dyn FrameSink<EncodedFrame>>) -> Option<SinkId> {
        match &self.path {
            CapturePath::Hardware { encoded, .. } => Some(encoded.add_sink(sink)),
            CapturePath::Software { .. } => None,
        }
    }

    /// `None` on the hardware path.
    pub fn add_raw_sink(&self, sink: Arc<dyn FrameSink<CapturedFrame>>) -> Option<SinkId> {
        match &self.path {
            CapturePath::Software { raw, .. } => Some(raw.add_sink(sink)),
            CapturePath::Hardware { .. } => None,
        }
    }

    pub fn remove_sink(&self, id: SinkId) -> bool {
        match &self.path {
            CapturePath::Hardware { encoded, .. } => encoded.remove_sink(id),
            CapturePath::Software { raw, .. } => raw.remove_sink(id),
        }
    }

    pub fn shutdown(&self) {
        if let CapturePath::Hardware { scheduler, .. } = &self.path {
            scheduler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::{
        config::SchedMode,
        feed::{
            encoders::fake::{FakeBehavior, FakeDevice},
            scheduler::tests::{session_params, tiny_frame},
        },
        remote::OutputSink,
    };

    fn rgba(width: usize, height: usize) -> RawFrame {
        RawFrame::cpu(
            width,
            height,
            PixelFormat::Rgba,
            0,
            Bytes::from(vec![200u8; width * height * 4]),
        )
    }

    #[test]
    fn output_size_keeps_aspect_when_one_side_is_zero() {
        let keep = SoftwareOptions::default();
        assert_eq!(keep.output_size(640, 480), (640, 480));

        let by_width = SoftwareOptions { width: 320, height: 0 };
        assert_eq!(by_width.output_size(640, 480), (320, 240));

        let by_height = SoftwareOptions { width: 0, height: 90 };
        assert_eq!(by_height.output_size(1280, 720), (160, 90));

        let fixed = SoftwareOptions { width: 64, height: 64 };
        assert_eq!(fixed.output_size(640, 480), (64, 64));
    }

    #[test]
    fn software_path_broadcasts_scaled_i420() {
        let capturer = Capturer::software(SoftwareOptions { width: 8, height: 0 });
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            capturer
                .add_raw_sink(Arc::new(move |f: &Arc<CapturedFrame>| {
                    seen.lock().unwrap().push(f.clone())
                }))
                .unwrap();
        }
        assert!(capturer.add_encoded_sink(Arc::new(|_: &Arc<EncodedFrame>| {})).is_none());

        capturer.on_frame(rgba(16, 8));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].frame.width, seen[0].frame.height), (8, 4));
        assert_eq!(seen[0].frame.u.len(), 4 * 2);
        assert!(seen[0].timestamp_us >= 0);
    }

    #[test]
    fn software_path_skips_bad_frames() {
        let capturer = Capturer::software(SoftwareOptions::default());
        let count = Arc::new(Mutex::new(0));
        let id = {
            let count = count.clone();
            capturer
                .add_raw_sink(Arc::new(move |_: &Arc<CapturedFrame>| *count.lock().unwrap() += 1))
                .unwrap()
        };

        capturer.capture_pixels(&[0u8; 3], 16, 16, PixelFormat::Rgba);
        capturer.on_frame(RawFrame::cpu(4, 4, PixelFormat::Rgba, 0, Bytes::from_static(&[1, 2])));
        assert_eq!(*count.lock().unwrap(), 0);

        capturer.capture_pixels(&[0u8; 16 * 16 * 4], 16, 16, PixelFormat::Rgba);
        assert_eq!(*count.lock().unwrap(), 1);

        assert!(capturer.remove_sink(id));
        capturer.on_frame(rgba(4, 4));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn hardware_path_forwards_to_the_scheduler() {
        let (factory, handle) = FakeDevice::factory(FakeBehavior::default());
        let encoded = Arc::new(Broadcaster::new());
        let scheduler = Scheduler::start_with(
            SchedMode::Hook,
            session_params(),
            factory,
            OutputSink::new(encoded.clone()),
            1000.,
        )
        .unwrap();
        let capturer = Capturer::hardware(scheduler, encoded);
        assert!(capturer.is_hardware());

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            capturer
                .add_encoded_sink(Arc::new(move |f: &Arc<EncodedFrame>| {
                    seen.lock().unwrap().push(f.capture_timestamp_us)
                }))
                .unwrap();
        }

        capturer.on_frame(tiny_frame(11));
        let scheduler = capturer.scheduler().unwrap();
        assert!(scheduler.fire("readPixels"));
        assert!(scheduler.fire("commit"));
        capturer.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![11]);
        assert_eq!(handle.log().destroyed, 1);
    }
}
