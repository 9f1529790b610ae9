mod active;
mod engine;
mod hook;
mod mailbox;
mod passive;

pub use engine::{EncoderCore, SchedulerState, SchedulerStats};
pub use active::ActiveScheduler;
pub use hook::{HookScheduler, RenderEvent};
pub use mailbox::Mailbox;
pub use passive::PassiveScheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::{
    encoders::{DeviceFactory, DeviceHandle, TextureFormat},
    error::SessionError,
    frame::{PixelFormat, RawFrame},
    session::SessionParams,
};
use crate::{
    config::{SchedMode, StreamConfig},
    remote::OutputSink,
};

/// A panicking holder must not take the whole pipeline down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control surface shared by every scheduling strategy. All methods may be
/// called from any thread.
#[enum_delegate::register]
pub trait Schedule {
    /// Hand a captured frame to the encoder. Never blocks on encoding.
    fn submit_raw_frame(&self, frame: RawFrame);

    /// Rate update; takes effect before the next submit.
    fn set_rates(&self, target_bitrate: u32, frame_rate: u32);

    /// The next encoded picture will be an IDR.
    fn request_keyframe(&self);

    /// Tear the encode session down on its owning thread and wait for it.
    fn shutdown(&self);

    fn state(&self) -> SchedulerState;

    fn stats(&self) -> SchedulerStats;
}

#[enum_delegate::implement(Schedule)]
pub enum Scheduler {
    Passive(PassiveScheduler),
    Active(ActiveScheduler),
    Hook(HookScheduler),
}

impl Scheduler {
    /// Open a CPU-input session sized by `config` and start the configured
    /// strategy. Blocks until the session is open.
    pub fn start(
        config: &StreamConfig,
        factory: DeviceFactory,
        output: OutputSink,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let params = config.session_params(DeviceHandle::Cpu, TextureFormat::Rgba8);
        Self::start_with(config.sched_mode, params, factory, output, config.max_fps)
    }

    pub fn start_with(
        mode: SchedMode,
        params: SessionParams,
        factory: DeviceFactory,
        output: OutputSink,
        max_fps: f32,
    ) -> Result<Self, SessionError> {
        Ok(match mode {
            SchedMode::Passive => {
                Self::Passive(PassiveScheduler::start(params, factory, output, max_fps)?)
            }
            SchedMode::Active => {
                Self::Active(ActiveScheduler::start(params, factory, output, max_fps)?)
            }
            SchedMode::Hook => Self::Hook(HookScheduler::start(params, factory, output, max_fps)?),
        })
    }

    pub fn mode(&self) -> SchedMode {
        match self {
            Self::Passive(_) => SchedMode::Passive,
            Self::Active(_) => SchedMode::Active,
            Self::Hook(_) => SchedMode::Hook,
        }
    }

    /// Copy `pixels` into an owned frame and submit it. Malformed buffers are
    /// dropped with a warning.
    pub fn submit_pixels(
        &self,
        pixels: &[u8],
        width: usize,
        height: usize,
        format: PixelFormat,
        timestamp_us: i64,
    ) {
        match RawFrame::copy_from_slice(pixels, width, height, format, timestamp_us) {
            Ok(frame) => self.submit_raw_frame(frame),
            Err(e) => warn!(error = %e, width, height, "dropping malformed frame"),
        }
    }

    pub fn as_hook(&self) -> Option<&HookScheduler> {
        match self {
            Self::Hook(hook) => Some(hook),
            _ => None,
        }
    }

    /// Forward a named render-pipeline event. Returns false when the
    /// scheduler does not run in hook mode or the name is unknown.
    pub fn fire(&self, event: &str) -> bool {
        self.as_hook().is_some_and(|hook| hook.fire(event))
    }
}
