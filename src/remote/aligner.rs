use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{info, warn};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds on the process-wide monotonic clock.
pub fn time_micros() -> i64 {
    EPOCH.elapsed().as_micros().try_into().unwrap_or(i64::MAX)
}

const MIN_FRAME_INTERVAL_US: i64 = 1_000;
const RESET_THRESHOLD_US: i64 = 300_000;
const WINDOW_SIZE: i64 = 100;

/// Translates capture timestamps into the local clock domain, filtering jitter
/// in the offset between the two clocks.
///
/// Output never runs ahead of system time, never decreases, and keeps at least
/// 1 ms between consecutive frames unless that would put it in the future.
#[derive(Debug, Clone)]
pub struct TimestampAligner {
    frames_seen: i64,
    offset_us: i64,
    clip_bias_us: i64,
    prev_translated_us: i64,
}

impl Default for TimestampAligner {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampAligner {
    pub fn new() -> Self {
        Self {
            frames_seen: 0,
            offset_us: 0,
            clip_bias_us: 0,
            prev_translated_us: i64::MIN,
        }
    }

    pub fn translate(&mut self, capture_us: i64, system_us: i64) -> i64 {
        let offset = self.update_offset(capture_us, system_us);
        self.clip(capture_us.saturating_add(offset), system_us)
    }

    fn update_offset(&mut self, capture_us: i64, system_us: i64) -> i64 {
        let observed_us = system_us.saturating_sub(capture_us);
        let diff_us = observed_us.saturating_sub(self.offset_us);

        if diff_us.saturating_abs() > RESET_THRESHOLD_US {
            info!(
                frames = self.frames_seen,
                old_offset_us = self.offset_us,
                new_offset_us = observed_us,
                "resetting timestamp translation"
            );
            self.frames_seen = 0;
            self.clip_bias_us = 0;
        }

        if self.frames_seen < WINDOW_SIZE {
            self.frames_seen += 1;
        }
        self.offset_us = self.offset_us.saturating_add(diff_us / self.frames_seen);
        self.offset_us
    }

    fn clip(&mut self, filtered_us: i64, system_us: i64) -> i64 {
        let mut time_us = filtered_us.saturating_sub(self.clip_bias_us);
        if time_us > system_us {
            self.clip_bias_us = self
                .clip_bias_us
                .saturating_add(time_us.saturating_sub(system_us));
            time_us = system_us;
        }

        let earliest = self.prev_translated_us.saturating_add(MIN_FRAME_INTERVAL_US);
        if time_us < earliest {
            time_us = earliest;
            if time_us > system_us {
                warn!(
                    system_us,
                    prev_us = self.prev_translated_us,
                    "translated timestamps closer than the minimum frame interval"
                );
                time_us = self.prev_translated_us.max(system_us);
            }
        }

        self.prev_translated_us = time_us;
        time_us
    }
}
