use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};

use tracing::{debug, info, trace};

use super::{
    engine::{EncoderCore, SchedulerState, SchedulerStats, Shared, Task},
    lock, Schedule,
};
use crate::{
    feed::{
        encoders::DeviceFactory,
        error::SessionError,
        frame::RawFrame,
        session::{EncodeSession, SessionParams},
    },
    remote::{EncodedFrame, OutputSink},
};

const NONE_WAITING: i64 = -1;

/// Named points in the render pipeline the hook scheduler is driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// The frame's pixels have been read back and posted.
    PixelsReady,
    /// The frame is committed; collect whatever is still being encoded.
    Commit,
}

impl RenderEvent {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "readPixels" => Some(Self::PixelsReady),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// No thread of its own: encoding happens on whichever thread fires render
/// events. At most one picture is awaiting retrieval at any time.
pub struct HookScheduler {
    shared: Arc<Shared>,
    core: Mutex<Option<EncoderCore>>,
    /// Slot of the last submit still to be retrieved, or -1.
    waiting: AtomicI64,
}

impl HookScheduler {
    /// Opens the session on the calling thread.
    pub fn start(
        params: SessionParams,
        factory: DeviceFactory,
        output: OutputSink,
        max_fps: f32,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared::new(max_fps));
        let session = EncodeSession::initialize(&params, factory)?;
        let core = EncoderCore::new(session, output, shared.clone());
        shared.set_state(SchedulerState::Running);
        info!(max_fps, "hook scheduler running");

        Ok(Self {
            shared,
            core: Mutex::new(Some(core)),
            waiting: AtomicI64::new(NONE_WAITING),
        })
    }

    /// Look up `name` and run the matching event. Unknown names are ignored.
    pub fn fire(&self, name: &str) -> bool {
        match RenderEvent::from_name(name) {
            Some(event) => {
                self.on_render_event(event);
                true
            }
            None => {
                trace!(name, "ignoring unknown render event");
                false
            }
        }
    }

    /// Returns the frame delivered during this event, if any.
    pub fn on_render_event(&self, event: RenderEvent) -> Option<Arc<EncodedFrame>> {
        if self.shared.end_requested() {
            return None;
        }
        let mut guard = lock(&self.core);
        let core = guard.as_mut()?;
        core.run_tasks();

        match event {
            RenderEvent::PixelsReady => {
                if !self.shared.has_frame() || !self.shared.keep() {
                    return None;
                }
                let frame = self.shared.take_frame()?;
                let finished = self.finish_waiting(core);
                if let Some(slot) = core.submit(&frame) {
                    self.waiting.store(slot as i64, Ordering::SeqCst);
                }
                finished
            }
            RenderEvent::Commit => self.finish_waiting(core),
        }
    }

    pub fn waiting_slot(&self) -> Option<usize> {
        usize::try_from(self.waiting.load(Ordering::SeqCst)).ok()
    }

    fn finish_waiting(&self, core: &mut EncoderCore) -> Option<Arc<EncodedFrame>> {
        let slot = usize::try_from(self.waiting.swap(NONE_WAITING, Ordering::SeqCst)).ok()?;
        core.complete(slot)
    }
}

impl Schedule for HookScheduler {
    fn submit_raw_frame(&self, frame: RawFrame) {
        if self.shared.end_requested() {
            return;
        }
        self.shared.post_frame(frame);
    }

    fn set_rates(&self, target_bitrate: u32, frame_rate: u32) {
        let task: Task = Box::new(move |core: &mut EncoderCore| {
            core.session_mut().set_rates(target_bitrate, frame_rate)
        });
        self.shared.defer(task);
    }

    fn request_keyframe(&self) {
        let task: Task = Box::new(|core: &mut EncoderCore| core.session_mut().request_keyframe());
        self.shared.defer(task);
    }

    /// Waits for an in-progress event, collects the outstanding picture and
    /// releases the session on the calling thread.
    fn shutdown(&self) {
        self.shared.request_end();
        let Some(mut core) = lock(&self.core).take() else {
            return;
        };
        self.shared.set_state(SchedulerState::Draining);
        core.run_tasks();
        self.finish_waiting(&mut core);
        core.shutdown();
        self.shared.set_state(SchedulerState::Stopped);
        debug!("hook scheduler stopped");
    }

    fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }
}

impl Drop for HookScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        feed::{
            encoders::{
                fake::{FakeBehavior, FakeDevice, FakeHandle},
                RateParameters,
            },
            scheduler::tests::{session_params, tiny_frame},
        },
        remote::Broadcaster,
    };

    fn start_with(behavior: FakeBehavior, max_fps: f32) -> (HookScheduler, FakeHandle) {
        let (factory, handle) = FakeDevice::factory(behavior);
        let scheduler = HookScheduler::start(
            session_params(),
            factory,
            OutputSink::new(Arc::new(Broadcaster::new())),
            max_fps,
        )
        .unwrap();
        (scheduler, handle)
    }

    fn start(max_fps: f32) -> (HookScheduler, FakeHandle) {
        start_with(FakeBehavior::default(), max_fps)
    }

    #[test]
    fn event_names() {
        assert_eq!(RenderEvent::from_name("readPixels"), Some(RenderEvent::PixelsReady));
        assert_eq!(RenderEvent::from_name("commit"), Some(RenderEvent::Commit));
        assert_eq!(RenderEvent::from_name("present"), None);
    }

    #[test]
    fn pixels_ready_submits_and_commit_delivers() {
        let (scheduler, handle) = start(1000.);
        scheduler.submit_raw_frame(tiny_frame(42));

        assert!(scheduler.on_render_event(RenderEvent::PixelsReady).is_none());
        assert_eq!(scheduler.waiting_slot(), Some(0));
        assert_eq!(handle.log().encode_threads, vec![thread::current().id()]);

        let frame = scheduler.on_render_event(RenderEvent::Commit).unwrap();
        assert_eq!(frame.capture_timestamp_us, 42);
        assert!(frame.keyframe);
        assert_eq!(scheduler.waiting_slot(), None);
        assert!(scheduler.on_render_event(RenderEvent::Commit).is_none());
    }

    #[test]
    fn empty_mailbox_submits_nothing() {
        let (scheduler, handle) = start(1000.);
        assert!(scheduler.fire("readPixels"));
        assert!(handle.log().pictures.is_empty());
        assert_eq!(scheduler.stats().throttled, 0);
    }

    #[test]
    fn next_submit_collects_the_previous_picture_first() {
        let (scheduler, _handle) = start(0.);
        scheduler.submit_raw_frame(tiny_frame(1));
        scheduler.on_render_event(RenderEvent::PixelsReady);
        scheduler.submit_raw_frame(tiny_frame(2));

        let previous = scheduler.on_render_event(RenderEvent::PixelsReady).unwrap();
        assert_eq!(previous.capture_timestamp_us, 1);
        assert_eq!(scheduler.waiting_slot(), Some(1));
        assert_eq!(scheduler.stats().delivered, 1);
    }

    #[test]
    fn deferred_rates_apply_at_the_next_submit() {
        let (scheduler, handle) = start(1000.);
        scheduler.set_rates(2_500_000, 24);
        assert!(handle.log().reconfigures.is_empty());

        scheduler.submit_raw_frame(tiny_frame(1));
        scheduler.fire("readPixels");
        assert_eq!(
            handle.log().reconfigures,
            vec![RateParameters {
                target_bitrate: 2_500_000,
                frame_rate: 24
            }]
        );
    }

    #[test]
    fn throttled_frame_stays_in_the_mailbox() {
        let (scheduler, handle) = start(1.);
        scheduler.submit_raw_frame(tiny_frame(1));
        scheduler.fire("readPixels");
        scheduler.fire("commit");
        scheduler.submit_raw_frame(tiny_frame(2));
        scheduler.fire("readPixels");

        assert_eq!(handle.log().uploads, vec![1]);
        let stats = scheduler.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.submitted, 1);
    }

    #[test]
    fn commit_on_a_stuck_encoder_times_out() {
        let (scheduler, _handle) = start_with(
            FakeBehavior {
                never_complete: true,
                ..Default::default()
            },
            1000.,
        );
        scheduler.submit_raw_frame(tiny_frame(1));
        scheduler.fire("readPixels");
        assert!(scheduler.on_render_event(RenderEvent::Commit).is_none());
        assert_eq!(scheduler.stats().timeouts, 1);
        assert_eq!(scheduler.waiting_slot(), None);
    }

    #[test]
    fn shutdown_collects_the_outstanding_picture() {
        let (scheduler, handle) = start(1000.);
        scheduler.submit_raw_frame(tiny_frame(5));
        scheduler.fire("readPixels");
        scheduler.shutdown();
        scheduler.shutdown();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.stats().delivered, 1);
        assert_eq!(handle.log().destroyed, 1);
        assert!(scheduler.on_render_event(RenderEvent::PixelsReady).is_none());
        assert!(!scheduler.fire("resize"));
    }

    #[test]
    fn init_errors_surface_synchronously() {
        let (factory, _) = FakeDevice::factory(FakeBehavior {
            fail_open: true,
            ..Default::default()
        });
        let err = HookScheduler::start(
            session_params(),
            factory,
            OutputSink::new(Arc::new(Broadcaster::new())),
            30.,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::SessionOpenFailed(_)));
    }
}
