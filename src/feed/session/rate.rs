use tracing::{debug, warn};

use crate::feed::{
    encoders::{EncoderDevice, RateParameters},
    error::EncodeError,
};

/// H.264 level 5.1 tops out at 120 fps.
pub const MAX_FRAME_RATE: u32 = 120;

/// Pending rate and keyframe state. Writes overwrite in place; nothing reaches
/// the device until [`RateController::apply`] runs at a submit boundary.
#[derive(Debug, Clone)]
pub struct RateController {
    current: RateParameters,
    pending: Option<RateParameters>,
    keyframe: bool,
    min_bitrate: u32,
    max_bitrate: u32,
}

impl RateController {
    /// `min_bitrate`/`max_bitrate` of 0 leave that side unbounded.
    pub fn new(initial: RateParameters, min_bitrate: u32, max_bitrate: u32) -> Self {
        let mut controller = Self {
            current: initial,
            pending: None,
            // The very first picture has to be decodable on its own.
            keyframe: true,
            min_bitrate,
            max_bitrate,
        };
        controller.current = controller.clamp(initial);
        controller
    }

    pub fn current(&self) -> RateParameters {
        self.current
    }

    pub fn pending(&self) -> Option<RateParameters> {
        self.pending
    }

    pub fn set_rates(&mut self, target_bitrate: u32, frame_rate: u32) {
        self.pending = Some(self.clamp(RateParameters {
            target_bitrate,
            frame_rate,
        }));
    }

    pub fn request_keyframe(&mut self) {
        self.keyframe = true;
    }

    pub fn keyframe_pending(&self) -> bool {
        self.keyframe
    }

    /// Consume the keyframe request, if any.
    pub fn take_keyframe(&mut self) -> bool {
        std::mem::replace(&mut self.keyframe, false)
    }

    /// Push pending rates to the device. Returns whether the device was
    /// reconfigured. A rejected reconfiguration keeps the previous settings.
    pub fn apply(&mut self, device: &mut dyn EncoderDevice) -> Result<bool, EncodeError> {
        let Some(next) = self.pending.take() else {
            return Ok(false);
        };
        if next == self.current {
            return Ok(false);
        }

        if let Err(source) = device.reconfigure(&next) {
            warn!(
                bitrate = next.target_bitrate,
                fps = next.frame_rate,
                error = %source,
                "encoder rejected new rates, keeping previous settings"
            );
            return Err(EncodeError::ReconfigureFailed {
                bitrate: next.target_bitrate,
                frame_rate: next.frame_rate,
                source,
            });
        }

        debug!(
            from_bitrate = self.current.target_bitrate,
            to_bitrate = next.target_bitrate,
            fps = next.frame_rate,
            "encoder reconfigured"
        );
        self.current = next;
        self.keyframe = true;
        Ok(true)
    }

    fn clamp(&self, rate: RateParameters) -> RateParameters {
        let target_bitrate = match (self.min_bitrate, self.max_bitrate) {
            (0, 0) => rate.target_bitrate,
            (0, max) => rate.target_bitrate.min(max),
            (min, 0) => rate.target_bitrate.max(min),
            (min, max) => rate.target_bitrate.clamp(min, max.max(min)),
        };

        RateParameters {
            target_bitrate,
            frame_rate: rate.frame_rate.clamp(1, MAX_FRAME_RATE),
        }
    }
}
