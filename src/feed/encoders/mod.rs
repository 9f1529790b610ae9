#[cfg(test)]
pub mod fake;
pub mod h264;
pub mod library;
pub mod openh264;

use std::path::PathBuf;

use super::error::{DeviceError, SessionError};
use super::frame::{NativeHandle, RawFrame};

use self::openh264::OpenH264Device;

/// Registered input resource (texture, device buffer or host staging plane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle(pub u64);

/// Output bitstream buffer owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitstreamHandle(pub u64);

/// Where input frames live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHandle {
    Cpu,
    /// Graphics or compute context the input resources are allocated on.
    Native(NativeHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    Rgb8,
}

/// Layout the encoder reads its input resources in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    Abgr,
    Argb,
}

impl From<TextureFormat> for BufferFormat {
    fn from(format: TextureFormat) -> Self {
        match format {
            // Byte order R,G,B,A is ABGR in little-endian word terms. RGB
            // textures are uploaded with an opaque alpha channel.
            TextureFormat::Rgba8 | TextureFormat::Rgb8 => Self::Abgr,
            TextureFormat::Bgra8 => Self::Argb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateParameters {
    /// Target average bitrate in bits per second.
    pub target_bitrate: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub width: usize,
    pub height: usize,
    pub device: DeviceHandle,
    pub texture_format: TextureFormat,
    pub buffer_format: BufferFormat,
    pub rate: RateParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureParams {
    pub input: InputHandle,
    pub output: BitstreamHandle,
    pub frame_index: u64,
    pub width: usize,
    pub height: usize,
    /// Emit an IDR picture coded intra-only.
    pub force_idr: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitstreamLock {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Capability interface of an encoder backend. An implementation is driven from
/// exactly one thread at a time; the scheduler guarantees that.
pub trait EncoderDevice: Send {
    /// Allocate and register one input resource.
    fn register_input(&mut self, width: usize, height: usize) -> Result<InputHandle, DeviceError>;
    fn map_input(&mut self, input: InputHandle) -> Result<(), DeviceError>;
    fn unmap_input(&mut self, input: InputHandle) -> Result<(), DeviceError>;
    fn unregister_input(&mut self, input: InputHandle) -> Result<(), DeviceError>;

    fn create_bitstream(&mut self) -> Result<BitstreamHandle, DeviceError>;
    fn destroy_bitstream(&mut self, output: BitstreamHandle) -> Result<(), DeviceError>;

    fn copy_from_cpu(&mut self, input: InputHandle, frame: &RawFrame) -> Result<(), DeviceError>;
    fn copy_from_native(
        &mut self,
        input: InputHandle,
        source: NativeHandle,
    ) -> Result<(), DeviceError>;

    /// Queue one picture. Must not wait for the bitstream.
    fn encode_picture(&mut self, params: &PictureParams) -> Result<(), DeviceError>;
    /// Non-blocking poll; `None` while the hardware is still busy.
    fn try_lock_bitstream(
        &mut self,
        output: BitstreamHandle,
    ) -> Result<Option<BitstreamLock>, DeviceError>;
    fn unlock_bitstream(&mut self, output: BitstreamHandle) -> Result<(), DeviceError>;

    fn reconfigure(&mut self, rate: &RateParameters) -> Result<(), DeviceError>;

    /// Tear down the native encoder handle. Called once, after every resource
    /// has been released.
    fn destroy(&mut self);
}

/// Opens a device on the thread that will own it.
pub type DeviceFactory =
    Box<dyn FnOnce(&DeviceParams) -> Result<Box<dyn EncoderDevice>, SessionError> + Send>;

#[derive(Debug, Clone)]
pub enum EncoderBackend {
    /// Software H.264. `library` selects a runtime-loaded codec library
    /// instead of the compiled-in one.
    OpenH264 { library: Option<PathBuf> },
}

impl Default for EncoderBackend {
    fn default() -> Self {
        Self::OpenH264 { library: None }
    }
}

impl EncoderBackend {
    pub fn factory(self) -> DeviceFactory {
        match self {
            Self::OpenH264 { library } => Box::new(move |params: &DeviceParams| {
                OpenH264Device::open(params, library.as_deref())
                    .map(|device| Box::new(device) as Box<dyn EncoderDevice>)
            }),
        }
    }
}
