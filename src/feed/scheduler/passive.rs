use std::{
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info};

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
    remote::{time_micros, OutputSink},
};

const SLEEP_STEP: Duration = Duration::from_millis(5);

/// Dedicated encode thread pulling frames from the mailbox at the throttle's
/// pace. Between fresh frames it re-encodes and delivers the last input so
/// the stream keeps its cadence.
pub struct PassiveScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PassiveScheduler {
    pub fn start(
        params: SessionParams,
        factory: DeviceFactory,
        output: OutputSink,
        max_fps: f32,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared::new(max_fps));
        let (init_tx, init_rx) = mpsc::sync_channel(1);

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("framefeed-passive".into())
                .spawn(move || {
                    let session = match EncodeSession::initialize(&params, factory) {
                        Ok(session) => session,
                        Err(e) => {
                            shared.set_state(SchedulerState::Stopped);
                            init_tx.send(Err(e)).ok();
                            return;
                        }
                    };
                    let core = EncoderCore::new(session, output, shared.clone());
                    shared.set_state(SchedulerState::Running);
                    init_tx.send(Ok(())).ok();
                    run(core, &shared);
                })
                .map_err(|e| SessionError::SessionOpenFailed(format!("encode thread: {e}")))?
        };

        match init_rx.recv() {
            Ok(Ok(())) => {
                info!(max_fps, "passive scheduler running");
                Ok(Self {
                    shared,
                    worker: Mutex::new(Some(worker)),
                })
            }
            Ok(Err(e)) => {
                worker.join().ok();
                Err(e)
            }
            Err(_) => {
                worker.join().ok();
                Err(SessionError::SchedulerStopped)
            }
        }
    }
}

/// Capture time of a repeat: the last real capture advanced by wall time.
fn repeat_timestamp(last_capture: Option<(i64, Instant)>) -> i64 {
    match last_capture {
        Some((capture_us, at)) => {
            let elapsed = i64::try_from(at.elapsed().as_micros()).unwrap_or(i64::MAX);
            capture_us.saturating_add(elapsed)
        }
        None => time_micros(),
    }
}

fn run(mut core: EncoderCore, shared: &Shared) {
    let mut last_capture = None;
    while !shared.end_requested() {
        core.run_tasks();

        let wait = shared.until_next(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait.min(SLEEP_STEP));
            continue;
        }
        shared.keep();

        match shared.take_frame() {
            Some(frame) => {
                core.encode(&frame);
                last_capture = Some((frame.timestamp_us, Instant::now()));
            }
            None if core.session().has_uploaded() => {
                if let Some(slot) = core.submit_repeat(repeat_timestamp(last_capture)) {
                    core.complete(slot);
                }
            }
            None => {}
        }
    }

    shared.set_state(SchedulerState::Draining);
    debug!("passive scheduler draining");
    core.run_tasks();
    if let Some(frame) = shared.take_frame() {
        if shared.keep() {
            core.encode(&frame);
        }
    }
    core.shutdown();
    shared.set_state(SchedulerState::Stopped);
}

impl Schedule for PassiveScheduler {
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

    /// Raise the end flag and wait for the encode thread to tear down.
    fn shutdown(&self) {
        self.shared.request_end();
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.join().is_err() {
            error!("passive encode thread panicked");
            self.shared.set_state(SchedulerState::Stopped);
        }
    }

    fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }
}

impl Drop for PassiveScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
