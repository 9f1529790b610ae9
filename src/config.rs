use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feed::{
    encoders::{DeviceHandle, EncoderBackend, RateParameters, TextureFormat},
    error::SessionError,
    session::{SessionParams, MAX_FRAME_RATE},
};

pub const ENV_WIDTH: &str = "FRAMEFEED_WIDTH";
pub const ENV_HEIGHT: &str = "FRAMEFEED_HEIGHT";
pub const ENV_MAX_FPS: &str = "FRAMEFEED_MAX_FPS";
pub const ENV_SCHED_MODE: &str = "FRAMEFEED_SCHED_MODE";
pub const ENV_CODEC_LIBRARY: &str = "FRAMEFEED_CODEC_LIBRARY";

/// Which trigger drives the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedMode {
    /// Dedicated polling thread fed through a mailbox.
    #[default]
    Passive,
    /// FIFO worker thread; every operation is a queued closure.
    Active,
    /// Runs inside render-pipeline callbacks.
    Hook,
}

impl FromStr for SchedMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passive" => Ok(Self::Passive),
            "active" => Ok(Self::Active),
            "hook" => Ok(Self::Hook),
            other => Err(SessionError::InvalidConfig(format!(
                "unknown scheduling mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub width: usize,
    pub height: usize,
    /// Upper bound on the encode rate.
    pub max_fps: f32,
    pub sched_mode: SchedMode,

    /// Bounds applied to rate updates, in bits per second. 0 is unbounded.
    pub min_bitrate: u32,
    pub start_bitrate: u32,
    pub max_bitrate: u32,

    pub slot_count: usize,
    pub retrieve_timeout_ms: u64,

    /// Shared codec library to load at runtime instead of the built-in codec.
    pub codec_library: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_fps: 60.,
            sched_mode: SchedMode::Passive,
            min_bitrate: 1_000_000,
            start_bitrate: 2_000_000,
            max_bitrate: 0,
            slot_count: 3,
            retrieve_timeout_ms: 200,
            codec_library: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, SessionError> {
    value
        .trim()
        .parse()
        .map_err(|_| SessionError::InvalidConfig(format!("{name}={value:?} is not valid")))
}

impl StreamConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), SessionError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SessionError> {
        if let Some(v) = lookup(ENV_WIDTH) {
            self.width = parse_var(ENV_WIDTH, &v)?;
        }
        if let Some(v) = lookup(ENV_HEIGHT) {
            self.height = parse_var(ENV_HEIGHT, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_FPS) {
            self.max_fps = parse_var(ENV_MAX_FPS, &v)?;
        }
        if let Some(v) = lookup(ENV_SCHED_MODE) {
            self.sched_mode = v.parse()?;
        }
        if let Some(v) = lookup(ENV_CODEC_LIBRARY) {
            self.codec_library = (!v.trim().is_empty()).then(|| PathBuf::from(v.trim()));
        }
        debug!(config = ?self, "configuration after overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: String| Err(SessionError::InvalidConfig(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!("frame size {}x{} is empty", self.width, self.height));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return invalid(format!(
                "frame size {}x{} must be even for 4:2:0 output",
                self.width, self.height
            ));
        }
        if !(self.max_fps > 0.) || !self.max_fps.is_finite() {
            return invalid(format!("maxFps must be positive, got {}", self.max_fps));
        }
        if self.slot_count == 0 {
            return invalid("slotCount must be at least 1".into());
        }
        if self.retrieve_timeout_ms == 0 {
            return invalid("retrieveTimeoutMs must be at least 1".into());
        }
        if self.max_bitrate != 0 && self.min_bitrate > self.max_bitrate {
            return invalid(format!(
                "minBitrate {} exceeds maxBitrate {}",
                self.min_bitrate, self.max_bitrate
            ));
        }
        Ok(())
    }

    pub fn frame_rate(&self) -> u32 {
        (self.max_fps.round() as u32).clamp(1, MAX_FRAME_RATE)
    }

    pub fn session_params(&self, device: DeviceHandle, texture_format: TextureFormat) -> SessionParams {
        SessionParams {
            width: self.width,
            height: self.height,
            device,
            texture_format,
            rate: RateParameters {
                target_bitrate: self.start_bitrate,
                frame_rate: self.frame_rate(),
            },
            min_bitrate: self.min_bitrate,
            max_bitrate: self.max_bitrate,
            slot_count: self.slot_count,
            retrieve_timeout: Duration::from_millis(self.retrieve_timeout_ms),
        }
    }

    pub fn backend(&self) -> EncoderBackend {
        EncoderBackend::OpenH264 {
            library: self.codec_library.clone(),
        }
    }
}

#[derive(Default)]
pub struct StreamConfigBuilder {
    width: Option<usize>,
    height: Option<usize>,

    /// The encoding pipeline will not exceed this FPS limit.
    max_fps: Option<f32>,
    sched_mode: Option<SchedMode>,

    /// Minimum bitrate due to bandwidth-related adjustments. (bps)
    min_bitrate: Option<u32>,
    /// Initial bitrate pre bandwidth-related adjustments. (bps)
    start_bitrate: Option<u32>,
    /// Maximum bitrate due to bandwidth-related adjustments. (bps)
    max_bitrate: Option<u32>,

    slot_count: Option<usize>,
    retrieve_timeout: Option<Duration>,
    codec_library: Option<PathBuf>,
}

impl StreamConfigBuilder {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn resolution(mut self, width: usize, height: usize) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn fps(mut self, max_fps: f32) -> Self {
        self.max_fps = Some(max_fps);
        self
    }

    pub fn sched_mode(mut self, mode: SchedMode) -> Self {
        self.sched_mode = Some(mode);
        self
    }

    pub fn bitrate(mut self, min: u32, start: u32, max: u32) -> Self {
        self.min_bitrate = Some(min);
        self.start_bitrate = Some(start);
        self.max_bitrate = Some(max);
        self
    }

    pub fn slots(mut self, count: usize) -> Self {
        self.slot_count = Some(count);
        self
    }

    pub fn retrieve_timeout(mut self, timeout: Duration) -> Self {
        self.retrieve_timeout = Some(timeout);
        self
    }

    pub fn codec_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.codec_library = Some(path.into());
        self
    }

    pub fn build(self) -> Result<StreamConfig, SessionError> {
        let defaults = StreamConfig::default();

        let config = StreamConfig {
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            max_fps: self.max_fps.unwrap_or(defaults.max_fps),
            sched_mode: self.sched_mode.unwrap_or_default(),

            min_bitrate: self.min_bitrate.unwrap_or(defaults.min_bitrate),
            start_bitrate: self.start_bitrate.unwrap_or(defaults.start_bitrate),
            max_bitrate: self.max_bitrate.unwrap_or(defaults.max_bitrate),

            slot_count: self.slot_count.unwrap_or(defaults.slot_count),
            retrieve_timeout_ms: self
                .retrieve_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(defaults.retrieve_timeout_ms),
            codec_library: self.codec_library,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use serial_test::serial;

    use super::*;

    #[test]
    fn builder_defaults() {
        let config = StreamConfigBuilder::new().build().unwrap();
        assert_eq!(config.max_fps, 60.);
        assert_eq!(config.start_bitrate, 2_000_000);
        assert_eq!(config.sched_mode, SchedMode::Passive);
        assert_eq!(config.slot_count, 3);
    }

    #[test]
    fn builder_rejects_odd_and_empty_sizes() {
        for (w, h) in [(0, 480), (641, 480), (640, 0)] {
            let err = StreamConfigBuilder::new().resolution(w, h).build().unwrap_err();
            assert!(matches!(err, SessionError::InvalidConfig(_)), "{w}x{h}");
        }
        assert!(StreamConfigBuilder::new().fps(0.).build().is_err());
        assert!(StreamConfigBuilder::new().slots(0).build().is_err());
        assert!(StreamConfigBuilder::new()
            .bitrate(5_000_000, 1_000_000, 2_000_000)
            .build()
            .is_err());
    }

    #[test]
    fn parses_camel_case_json() {
        let config = StreamConfig::from_json(
            r#"{"width": 640, "height": 480, "maxFps": 30, "schedMode": "hook", "slotCount": 2}"#,
        )
        .unwrap();
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.max_fps, 30.);
        assert_eq!(config.sched_mode, SchedMode::Hook);
        assert_eq!(config.slot_count, 2);
        assert_eq!(config.retrieve_timeout_ms, 200);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(StreamConfig::from_json(r#"{"schedMode": "turbo"}"#).is_err());
        assert!("turbo".parse::<SchedMode>().is_err());
        assert_eq!(" Active ".parse::<SchedMode>().unwrap(), SchedMode::Active);
    }

    #[test]
    fn overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_WIDTH, "800"),
            (ENV_HEIGHT, "600"),
            (ENV_SCHED_MODE, "active"),
            (ENV_CODEC_LIBRARY, "/opt/codec/libopenh264.so"),
        ]
        .into();
        let mut config = StreamConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.sched_mode, SchedMode::Active);
        assert_eq!(
            config.codec_library.as_deref(),
            Some(Path::new("/opt/codec/libopenh264.so"))
        );
        assert_eq!(config.max_fps, 60.);
    }

    #[test]
    fn bad_override_is_reported() {
        let mut config = StreamConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_MAX_FPS).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_FPS));
    }

    #[test]
    #[serial]
    fn load_reads_file_then_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"width": 320, "height": 240, "maxFps": 15}}"#).unwrap();

        std::env::set_var(ENV_MAX_FPS, "24");
        let loaded = StreamConfig::load(Some(file.path()));
        std::env::remove_var(ENV_MAX_FPS);

        let config = loaded.unwrap();
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.max_fps, 24.);
    }

    #[test]
    #[serial]
    fn load_without_file_uses_defaults() {
        std::env::remove_var(ENV_WIDTH);
        std::env::remove_var(ENV_HEIGHT);
        let config = StreamConfig::load(None).unwrap();
        assert_eq!(config.width, StreamConfig::default().width);
    }

    #[test]
    fn missing_file_has_context() {
        let err = StreamConfig::load(Some(Path::new("/nonexistent/framefeed.json"))).unwrap_err();
        assert!(err.to_string().contains("unable to read config"));
    }

    #[test]
    fn session_params_follow_config() {
        let config = StreamConfigBuilder::new()
            .resolution(640, 480)
            .fps(240.)
            .retrieve_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let params = config.session_params(DeviceHandle::Cpu, TextureFormat::Rgba8);
        assert_eq!(params.rate.frame_rate, MAX_FRAME_RATE);
        assert_eq!(params.retrieve_timeout, Duration::from_millis(50));
        assert_eq!(params.slot_count, 3);
    }
}
