use std::time::{Duration, Instant};

/// Minimum-interval gate in front of the encoder. A frame is kept only if at
/// least `interval` has passed since the last kept frame; anything else is
/// dropped on the spot, never queued.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl FrameThrottle {
    pub fn new(max_fps: f32) -> Self {
        Self {
            interval: interval_for(max_fps),
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_max_fps(&mut self, max_fps: f32) {
        self.interval = interval_for(max_fps);
    }

    pub fn keep(&mut self) -> bool {
        self.keep_at(Instant::now())
    }

    pub fn keep_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }

    /// Time left until the next frame would be kept.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => (last + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

fn interval_for(max_fps: f32) -> Duration {
    if max_fps > 0. && max_fps.is_finite() {
        Duration::from_secs_f32(1. / max_fps)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_rate_over_a_window() {
        let fps = 30.;
        let mut throttle = FrameThrottle::new(fps);
        let start = Instant::now();

        // Offer a frame every millisecond for two seconds.
        let window = Duration::from_secs(2);
        let kept = (0..window.as_millis() as u64)
            .filter(|ms| throttle.keep_at(start + Duration::from_millis(*ms)))
            .count();

        let bound = (fps * window.as_secs_f32()) as usize + 1;
        assert!(kept <= bound, "kept {kept} frames, bound {bound}");
        assert!(kept >= bound - 2, "kept only {kept} frames");
    }

    #[test]
    fn first_frame_always_passes() {
        let mut throttle = FrameThrottle::new(1.);
        let now = Instant::now();
        assert!(throttle.keep_at(now));
        assert!(!throttle.keep_at(now + Duration::from_millis(999)));
        assert!(throttle.keep_at(now + Duration::from_millis(1000)));
    }

    #[test]
    fn remaining_counts_down_to_zero() {
        let mut throttle = FrameThrottle::new(10.);
        let now = Instant::now();
        assert_eq!(throttle.remaining(now), Duration::ZERO);
        throttle.keep_at(now);
        assert_eq!(throttle.remaining(now), throttle.interval());
        assert_eq!(throttle.remaining(now + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn zero_fps_disables_throttling() {
        let mut throttle = FrameThrottle::new(0.);
        let now = Instant::now();
        assert!(throttle.keep_at(now));
        assert!(throttle.keep_at(now));
    }
}
