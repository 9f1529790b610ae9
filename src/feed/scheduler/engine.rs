use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use super::{lock, mailbox::Mailbox};
use crate::{
    feed::{
        error::EncodeError,
        frame::RawFrame,
        session::{EncodeSession, FrameThrottle},
    },
    remote::{EncodedFrame, OutputSink},
    timing_stats::TimingStats,
};

/// Deferred action executed on whichever thread owns the encoder.
pub type Task = Box<dyn FnOnce(&mut EncoderCore) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Raw frames handed to the scheduler.
    pub received: u64,
    /// Pictures issued to the encoder for fresh frames.
    pub submitted: u64,
    pub delivered: u64,
    pub throttled: u64,
    /// Mailbox frames replaced before the encoder got to them.
    pub overwritten: u64,
    /// Idle re-encodes of the last input. Delivered, but not part of `delivered`.
    pub repeated: u64,
    pub timeouts: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    submitted: AtomicU64,
    delivered: AtomicU64,
    throttled: AtomicU64,
    overwritten: AtomicU64,
    repeated: AtomicU64,
    timeouts: AtomicU64,
    failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            received: self.received.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            repeated: self.repeated.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the producer side of a scheduler and the thread that
/// drives the encoder.
pub struct Shared {
    mailbox: Mailbox<RawFrame>,
    tasks: Mutex<Vec<Task>>,
    throttle: Mutex<FrameThrottle>,
    end: AtomicBool,
    state: AtomicU8,
    counters: Counters,
}

impl Shared {
    pub fn new(max_fps: f32) -> Self {
        Self {
            mailbox: Mailbox::default(),
            tasks: Mutex::new(Vec::new()),
            throttle: Mutex::new(FrameThrottle::new(max_fps)),
            end: AtomicBool::new(false),
            state: AtomicU8::new(SchedulerState::Idle as u8),
            counters: Counters::default(),
        }
    }

    pub fn received(&self) {
        bump(&self.counters.received);
    }

    /// Leave `frame` in the mailbox for the encoder thread.
    pub fn post_frame(&self, frame: RawFrame) {
        self.received();
        self.stash(frame);
    }

    /// Put `frame` in the mailbox without counting it as received. Returns
    /// true when the mailbox was empty, false when an older frame was replaced.
    pub fn stash(&self, frame: RawFrame) -> bool {
        let replaced = self.mailbox.put(frame).is_some();
        if replaced {
            bump(&self.counters.overwritten);
        }
        !replaced
    }

    pub fn take_frame(&self) -> Option<RawFrame> {
        self.mailbox.take()
    }

    pub fn has_frame(&self) -> bool {
        !self.mailbox.is_empty()
    }

    /// Queue `task` for the next drain.
    pub fn defer(&self, task: Task) {
        lock(&self.tasks).push(task);
    }

    pub fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut *lock(&self.tasks))
    }

    /// Throttle gate. Dropped frames are counted.
    pub fn keep(&self) -> bool {
        let kept = lock(&self.throttle).keep();
        if !kept {
            bump(&self.counters.throttled);
        }
        kept
    }

    pub fn admit(&self) -> Result<(), EncodeError> {
        if self.keep() {
            Ok(())
        } else {
            Err(EncodeError::FrameDropped)
        }
    }

    /// Time until the throttle would accept the next frame.
    pub fn until_next(&self, now: Instant) -> Duration {
        lock(&self.throttle).remaining(now)
    }

    pub fn request_end(&self) {
        self.end.store(true, Ordering::SeqCst);
    }

    pub fn end_requested(&self) -> bool {
        self.end.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }
}

/// Bitstream size in bits, pinned at `u32::MAX` for oversized pictures.
fn bits_per_frame(bytes: usize) -> u32 {
    u32::try_from(bytes.saturating_mul(8)).unwrap_or(u32::MAX)
}

/// The encode session plus everything needed to turn a submit into a delivery.
/// Owned by exactly one thread at a time.
pub struct EncoderCore {
    session: EncodeSession,
    output: OutputSink,
    shared: Arc<Shared>,
    timing: TimingStats,
}

impl EncoderCore {
    pub fn new(session: EncodeSession, output: OutputSink, shared: Arc<Shared>) -> Self {
        Self {
            session,
            output,
            shared,
            timing: TimingStats::new("encoder"),
        }
    }

    pub fn session(&self) -> &EncodeSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut EncodeSession {
        &mut self.session
    }

    /// Run every deferred task queued so far, in queue order.
    pub fn run_tasks(&mut self) -> usize {
        let tasks = self.shared.take_tasks();
        let count = tasks.len();
        for task in tasks {
            task(self);
        }
        count
    }

    pub fn submit(&mut self, frame: &RawFrame) -> Option<usize> {
        self.timing.start("submit");
        let submitted = self.session.submit(frame);
        self.timing.end("submit");

        match submitted {
            Ok(slot) => {
                bump(&self.shared.counters.submitted);
                Some(slot)
            }
            Err(e) => {
                bump(&self.shared.counters.failed);
                warn!(error = %e, timestamp_us = frame.timestamp_us, "dropping frame, submit failed");
                None
            }
        }
    }

    pub fn submit_repeat(&mut self, timestamp_us: i64) -> Option<usize> {
        match self.session.submit_repeat(timestamp_us) {
            Ok(slot) => {
                bump(&self.shared.counters.repeated);
                Some(slot)
            }
            Err(e) => {
                trace!(error = %e, "repeat encode skipped");
                None
            }
        }
    }

    /// Collect the bitstream in `slot` and deliver it. Empty bitstreams
    /// (encoder-side skips) are consumed without delivery. Repeats are
    /// delivered but counted under `repeated` only.
    pub fn complete(&mut self, slot: usize) -> Option<Arc<EncodedFrame>> {
        self.timing.start("retrieve");
        let retrieved = self.session.retrieve(slot);
        self.timing.end("retrieve");

        let bitstream = match retrieved {
            Ok(bitstream) => bitstream,
            Err(EncodeError::EncodeTimeout { .. }) => {
                bump(&self.shared.counters.timeouts);
                return None;
            }
            Err(e) => {
                bump(&self.shared.counters.failed);
                warn!(slot, error = %e, "dropping frame, retrieve failed");
                return None;
            }
        };

        if bitstream.data.is_empty() {
            return None;
        }

        self.timing
            .track("bitrate", bits_per_frame(bitstream.data.len()), " bits/frame");
        self.timing.tick();
        if !bitstream.repeat {
            bump(&self.shared.counters.delivered);
        }
        Some(self.output.deliver(bitstream))
    }

    /// Encode whatever frame is waiting in the mailbox.
    pub fn encode_pending(&mut self) -> Option<Arc<EncodedFrame>> {
        let frame = self.shared.take_frame()?;
        self.encode(&frame)
    }

    pub fn encode(&mut self, frame: &RawFrame) -> Option<Arc<EncodedFrame>> {
        let slot = self.submit(frame)?;
        self.complete(slot)
    }

    pub fn shutdown(&mut self) {
        self.session.shutdown();
    }
}
