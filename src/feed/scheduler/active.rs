use std::{
    sync::{mpsc as std_mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

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
    remote::OutputSink,
};

/// Every operation is a closure queued to one worker thread and executed in
/// arrival order. Submit, rate changes and teardown never run concurrently.
/// Raw frames wait in the mailbox rather than the queue, so a slow encoder
/// only ever has the newest frame waiting; at most one encode job is queued
/// for it.
pub struct ActiveScheduler {
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveScheduler {
    pub fn start(
        params: SessionParams,
        factory: DeviceFactory,
        output: OutputSink,
        max_fps: f32,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared::new(max_fps));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = std_mpsc::sync_channel(1);

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("framefeed-active".into())
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
                    run(core, jobs_rx, &shared);
                })
                .map_err(|e| SessionError::SessionOpenFailed(format!("encode thread: {e}")))?
        };

        match init_rx.recv() {
            Ok(Ok(())) => {
                info!(max_fps, "active scheduler running");
                Ok(Self {
                    shared,
                    jobs: Mutex::new(Some(jobs_tx)),
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

    fn post(&self, task: Task) -> bool {
        match lock(&self.jobs).as_ref() {
            Some(jobs) => jobs.send(task).is_ok(),
            None => false,
        }
    }
}

fn run(mut core: EncoderCore, mut jobs: mpsc::UnboundedReceiver<Task>, shared: &Shared) {
    while let Some(job) = jobs.blocking_recv() {
        job(&mut core);
    }
    // Sender gone: everything queued before shutdown has run.
    core.shutdown();
    shared.set_state(SchedulerState::Stopped);
    debug!("active scheduler stopped");
}

impl Schedule for ActiveScheduler {
    fn submit_raw_frame(&self, frame: RawFrame) {
        if self.shared.end_requested() {
            return;
        }
        self.shared.received();
        if let Err(e) = self.shared.admit() {
            trace!(timestamp_us = frame.timestamp_us, error = %e, "frame not stashed");
            return;
        }
        if self.shared.stash(frame) {
            self.post(Box::new(|core: &mut EncoderCore| {
                core.encode_pending();
            }));
        }
    }

    fn set_rates(&self, target_bitrate: u32, frame_rate: u32) {
        self.post(Box::new(move |core: &mut EncoderCore| {
            core.session_mut().set_rates(target_bitrate, frame_rate)
        }));
    }

    fn request_keyframe(&self) {
        self.post(Box::new(|core: &mut EncoderCore| {
            core.session_mut().request_keyframe()
        }));
    }

    /// Close the queue and wait for the worker to finish what is queued.
    fn shutdown(&self) {
        self.shared.request_end();
        if lock(&self.jobs).take().is_some() && self.shared.state() == SchedulerState::Running {
            self.shared.set_state(SchedulerState::Draining);
        }
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.join().is_err() {
            error!("active encode thread panicked");
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

impl Drop for ActiveScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
