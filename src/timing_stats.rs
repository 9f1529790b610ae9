use std::{collections::HashMap, time::Instant};

use tracing::{debug, warn};

const TIMING_ACCUMULATOR_SIZE: usize = 120;

/// Rolling frame-interval and stage-timing statistics. Every
/// `TIMING_ACCUMULATOR_SIZE` ticks a summary is logged and the window resets.
pub struct TimingStats {
    last_frame: Option<Instant>,
    label: String,
    accumulator: Vec<u32>,

    trackers: HashMap<String, Instant>,
    additional_accumulators: HashMap<String, Vec<u32>>,
    labelled_values: HashMap<String, (Vec<u32>, String)>,
}

/// One finished window, as logged.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSummary {
    pub average_interval_us: u32,
    pub fps: f32,
    pub stages: Vec<(String, f32)>,
    pub values: Vec<(String, f32, String)>,
}

fn micros_since(start: Instant) -> u32 {
    start.elapsed().as_micros().try_into().unwrap_or(u32::MAX)
}

fn average(values: &[u32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    values.iter().map(|v| *v as f32).sum::<f32>() / values.len() as f32
}

impl TimingStats {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_frame: None,
            accumulator: Vec::with_capacity(TIMING_ACCUMULATOR_SIZE),
            trackers: HashMap::new(),
            additional_accumulators: HashMap::new(),
            labelled_values: HashMap::new(),
        }
    }

    /// Mark one frame. Returns the summary when this tick closed a window.
    pub fn tick(&mut self) -> Option<TimingSummary> {
        if let Some(last_frame) = self.last_frame {
            self.accumulator.push(micros_since(last_frame));
        }

        let summary = (self.accumulator.len() == TIMING_ACCUMULATOR_SIZE).then(|| {
            let summary = self.summarize();
            self.log(&summary);

            self.additional_accumulators.clear();
            self.trackers.clear();
            self.accumulator.clear();
            self.labelled_values.clear();
            summary
        });

        self.last_frame = Some(Instant::now());
        summary
    }

    fn summarize(&self) -> TimingSummary {
        let sum: u64 = self.accumulator.iter().map(|v| *v as u64).sum();
        let average_interval_us = (sum / TIMING_ACCUMULATOR_SIZE as u64) as u32;
        let fps = if average_interval_us == 0 {
            0.
        } else {
            1_000_000f32 / average_interval_us as f32
        };

        let mut stages: Vec<_> = self
            .additional_accumulators
            .iter()
            .map(|(k, v)| (k.clone(), average(v)))
            .collect();
        stages.sort_by(|a, b| a.0.cmp(&b.0));

        let mut values: Vec<_> = self
            .labelled_values
            .iter()
            .map(|(k, (v, unit))| (k.clone(), average(v), unit.clone()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));

        TimingSummary {
            average_interval_us,
            fps,
            stages,
            values,
        }
    }

    fn log(&self, summary: &TimingSummary) {
        debug!(
            label = %self.label,
            interval_us = summary.average_interval_us,
            fps = format_args!("{:.2}", summary.fps),
            "timing stats"
        );
        for (stage, avg) in &summary.stages {
            debug!(label = %self.label, stage = %stage, "   - {avg:.2}μs");
        }
        for (name, avg, unit) in &summary.values {
            debug!(label = %self.label, value = %name, "   - {avg:.2}{unit}");
        }
    }

    pub fn start(&mut self, label: &str) {
        if self.trackers.contains_key(label) {
            warn!(stats = %self.label, timer = label, "ignoring start, timer already running");
            return;
        }

        self.trackers.insert(label.to_string(), Instant::now());
    }

    pub fn end(&mut self, label: &str) {
        let Some(started) = self.trackers.remove(label) else {
            warn!(stats = %self.label, timer = label, "ignoring end, no such timer");
            return;
        };

        let duration = micros_since(started);
        self.additional_accumulators
            .entry(label.to_string())
            .or_default()
            .push(duration);
    }

    pub fn track(&mut self, label: &str, value: u32, unit: &str) {
        match self.labelled_values.get_mut(label) {
            Some((vec, old_unit)) => {
                old_unit.replace_range(0..old_unit.len(), unit);
                vec.push(value)
            }
            None => {
                self.labelled_values
                    .insert(label.into(), (vec![value], unit.into()));
            }
        }
    }
}
