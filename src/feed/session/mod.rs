mod rate;
mod slots;
mod throttle;

pub use rate::{RateController, MAX_FRAME_RATE};
pub use slots::{FrameSlot, FrameSlotRing, PendingPicture};
pub use throttle::FrameThrottle;

use std::{
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{
    encoders::{
        BufferFormat, DeviceFactory, DeviceHandle, DeviceParams, EncoderDevice, PictureParams,
        RateParameters, TextureFormat,
    },
    error::{EncodeError, SessionError},
    frame::{FrameData, RawFrame},
};

const POLL_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub width: usize,
    pub height: usize,
    pub device: DeviceHandle,
    pub texture_format: TextureFormat,
    pub rate: RateParameters,
    /// 0 leaves the lower bound open.
    pub min_bitrate: u32,
    /// 0 leaves the upper bound open.
    pub max_bitrate: u32,
    pub slot_count: usize,
    pub retrieve_timeout: Duration,
}

/// Compressed output of one picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitstream {
    pub data: Bytes,
    pub keyframe: bool,
    pub frame_index: u64,
    pub capture_timestamp_us: i64,
    pub width: usize,
    pub height: usize,
    pub repeat: bool,
}

/// Owns the device handle and its frame slots. Every method must be called
/// from the thread that owns the session; schedulers enforce that.
pub struct EncodeSession {
    width: usize,
    height: usize,
    device: Option<Box<dyn EncoderDevice>>,
    slots: FrameSlotRing,
    rates: RateController,
    frame_count: u64,
    retrieve_timeout: Duration,
    /// Slot whose input was uploaded most recently.
    last_upload: Option<usize>,
}

impl EncodeSession {
    pub fn initialize(params: &SessionParams, factory: DeviceFactory) -> Result<Self, SessionError> {
        if params.slot_count == 0 {
            return Err(SessionError::InvalidConfig("slot count must be at least 1".into()));
        }
        if params.width == 0 || params.height == 0 {
            return Err(SessionError::InvalidConfig(format!(
                "invalid frame size {}x{}",
                params.width, params.height
            )));
        }

        let rates = RateController::new(params.rate, params.min_bitrate, params.max_bitrate);
        let device_params = DeviceParams {
            width: params.width,
            height: params.height,
            device: params.device,
            texture_format: params.texture_format,
            buffer_format: BufferFormat::from(params.texture_format),
            rate: rates.current(),
        };
        let mut device = factory(&device_params)?;

        let mut slots = FrameSlotRing::default();
        if let Err(e) = slots.allocate(
            device.as_mut(),
            params.slot_count,
            params.width,
            params.height,
        ) {
            slots.release_all(device.as_mut());
            device.destroy();
            return Err(SessionError::SessionOpenFailed(format!(
                "frame slot allocation failed: {e}"
            )));
        }

        info!(
            width = params.width,
            height = params.height,
            slots = params.slot_count,
            bitrate = rates.current().target_bitrate,
            fps = rates.current().frame_rate,
            "encode session initialized"
        );

        Ok(Self {
            width: params.width,
            height: params.height,
            device: Some(device),
            slots,
            rates,
            frame_count: 0,
            retrieve_timeout: params.retrieve_timeout,
            last_upload: None,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_running(&self) -> bool {
        self.device.is_some()
    }

    pub fn rates(&self) -> &RateController {
        &self.rates
    }

    pub fn set_rates(&mut self, target_bitrate: u32, frame_rate: u32) {
        self.rates.set_rates(target_bitrate, frame_rate);
    }

    pub fn request_keyframe(&mut self) {
        self.rates.request_keyframe();
    }

    /// Whether any input has been uploaded yet, i.e. whether a repeat is possible.
    pub fn has_uploaded(&self) -> bool {
        self.last_upload.is_some()
    }

    /// Upload `frame` into the current slot and queue it for encoding. Pending
    /// rate and keyframe changes take effect here. Returns the slot index.
    pub fn submit(&mut self, frame: &RawFrame) -> Result<usize, EncodeError> {
        let device = self.device.as_mut().ok_or(EncodeError::NotRunning)?;
        let index = self.slots.index_for(self.frame_count);
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(EncodeError::NotRunning)?;
        if slot.is_busy() {
            return Err(EncodeError::SlotBusy(index));
        }
        let input = slot.input().ok_or(EncodeError::NotRunning)?;
        let output = slot.output().ok_or(EncodeError::NotRunning)?;

        if let Err(e) = self.rates.apply(device.as_mut()) {
            debug!(error = %e, "continuing with previous rates");
        }

        match &frame.data {
            FrameData::Cpu(_) => {
                frame.validate()?;
                device.copy_from_cpu(input, frame)?;
            }
            FrameData::Native(handle) => device.copy_from_native(input, *handle)?,
        }
        self.last_upload = Some(index);

        let force_idr = self.rates.take_keyframe();
        let picture = PictureParams {
            input,
            output,
            frame_index: self.frame_count,
            width: self.width,
            height: self.height,
            force_idr,
        };
        if let Err(e) = device.encode_picture(&picture) {
            if force_idr {
                self.rates.request_keyframe();
            }
            return Err(e.into());
        }

        slot.set_pending(PendingPicture {
            frame_index: self.frame_count,
            capture_timestamp_us: frame.timestamp_us,
            force_idr,
            repeat: false,
        });
        self.frame_count += 1;
        Ok(index)
    }

    /// Encode the most recently uploaded input again into the next slot. The
    /// repeat is a regular picture of the stream and must be delivered like
    /// one, since later pictures may reference it. Pending rate and keyframe
    /// changes apply here too.
    pub fn submit_repeat(&mut self, timestamp_us: i64) -> Result<usize, EncodeError> {
        let device = self.device.as_mut().ok_or(EncodeError::NotRunning)?;
        let source = self.last_upload.ok_or(EncodeError::NothingSubmitted(0))?;
        let input = self
            .slots
            .get(source)
            .and_then(FrameSlot::input)
            .ok_or(EncodeError::NotRunning)?;

        let index = self.slots.index_for(self.frame_count);
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(EncodeError::NotRunning)?;
        if slot.is_busy() {
            return Err(EncodeError::SlotBusy(index));
        }
        let output = slot.output().ok_or(EncodeError::NotRunning)?;

        if let Err(e) = self.rates.apply(device.as_mut()) {
            debug!(error = %e, "continuing with previous rates");
        }

        let force_idr = self.rates.take_keyframe();
        let picture = PictureParams {
            input,
            output,
            frame_index: self.frame_count,
            width: self.width,
            height: self.height,
            force_idr,
        };
        if let Err(e) = device.encode_picture(&picture) {
            if force_idr {
                self.rates.request_keyframe();
            }
            return Err(e.into());
        }

        slot.set_pending(PendingPicture {
            frame_index: self.frame_count,
            capture_timestamp_us: timestamp_us,
            force_idr,
            repeat: true,
        });
        self.frame_count += 1;
        Ok(index)
    }

    /// Collect the bitstream of the picture last submitted into `index`,
    /// polling the device until it completes or the retrieve timeout passes.
    /// A timed out picture is abandoned and its slot freed.
    pub fn retrieve(&mut self, index: usize) -> Result<Bitstream, EncodeError> {
        let device = self.device.as_mut().ok_or(EncodeError::NotRunning)?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(EncodeError::NothingSubmitted(index))?;
        let pending = *slot.pending().ok_or(EncodeError::NothingSubmitted(index))?;
        let output = slot.output().ok_or(EncodeError::NotRunning)?;

        let started = Instant::now();
        let deadline = started + self.retrieve_timeout;
        let lock = loop {
            match device.try_lock_bitstream(output) {
                Ok(Some(lock)) => break lock,
                Ok(None) => {}
                Err(e) => {
                    slot.take_pending();
                    if pending.force_idr {
                        self.rates.request_keyframe();
                    }
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                slot.take_pending();
                // The receiver never gets this IDR, so the next picture has to be one.
                if pending.force_idr {
                    self.rates.request_keyframe();
                }
                warn!(slot = index, frame = pending.frame_index, "bitstream retrieval timed out");
                return Err(EncodeError::EncodeTimeout {
                    slot: index,
                    waited: now - started,
                });
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        };

        slot.take_pending();
        let unlocked = device.unlock_bitstream(output);
        let keyframe = lock.keyframe || pending.force_idr;
        let data = slot.store_encoded(lock.data);
        unlocked?;

        Ok(Bitstream {
            data,
            keyframe,
            frame_index: pending.frame_index,
            capture_timestamp_us: pending.capture_timestamp_us,
            width: self.width,
            height: self.height,
            repeat: pending.repeat,
        })
    }

    /// Release every slot and the device. Later calls are no-ops.
    pub fn shutdown(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        self.slots.release_all(device.as_mut());
        device.destroy();
        self.last_upload = None;
        info!(frames = self.frame_count, "encode session shut down");
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
