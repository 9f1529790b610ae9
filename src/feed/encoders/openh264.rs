use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use openh264::{
    encoder::{Encoder, EncoderConfig},
    formats::YUVSource,
    OpenH264API, Timestamp,
};
use tracing::{debug, info};

use super::{
    h264, library::CodecLibrary, BitstreamHandle, BitstreamLock, DeviceHandle, DeviceParams,
    EncoderDevice, InputHandle, PictureParams, RateParameters,
};
use crate::feed::{
    error::{DeviceError, SessionError},
    frame::{I420Frame, NativeHandle, RawFrame},
};

impl YUVSource for I420Frame {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.chroma_width(), self.chroma_width())
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

enum ApiSource {
    Builtin,
    Library(PathBuf),
}

impl ApiSource {
    fn api(&self) -> Result<OpenH264API, openh264::Error> {
        match self {
            Self::Builtin => Ok(OpenH264API::from_source()),
            Self::Library(path) => OpenH264API::from_blob_path(path)
                .map_err(|e| openh264::Error::msg_string(e.to_string())),
        }
    }
}

fn build_encoder(source: &ApiSource, rate: &RateParameters) -> Result<Encoder, openh264::Error> {
    let config = EncoderConfig::new()
        .set_bitrate_bps(rate.target_bitrate)
        .max_frame_rate(rate.frame_rate as f32)
        .enable_skip_frame(false);

    Encoder::with_api_config(source.api()?, config)
}

struct StagedInput {
    frame: I420Frame,
    mapped: bool,
}

/// Software H.264 backend. Pictures are encoded synchronously inside
/// `encode_picture`, so bitstreams are always ready by the first poll.
pub struct OpenH264Device {
    source: ApiSource,
    encoder: Encoder,
    rate: RateParameters,
    next_handle: u64,
    inputs: HashMap<u64, StagedInput>,
    outputs: HashMap<u64, Option<BitstreamLock>>,
}

// SAFETY: the encoder is only ever driven from the scheduler's encode thread;
// ownership may move between threads but calls never overlap.
unsafe impl Send for OpenH264Device {}

impl OpenH264Device {
    pub fn open(params: &DeviceParams, library: Option<&Path>) -> Result<Self, SessionError> {
        if params.device != DeviceHandle::Cpu {
            return Err(SessionError::SessionOpenFailed(
                "openh264 encodes from host memory only".into(),
            ));
        }

        let source = match library {
            Some(path) => {
                let library = CodecLibrary::load(path)?;
                ApiSource::Library(library.path().to_owned())
            }
            None => ApiSource::Builtin,
        };

        let encoder = build_encoder(&source, &params.rate)
            .map_err(|e| SessionError::SessionOpenFailed(format!("openh264: {e}")))?;

        info!(
            width = params.width,
            height = params.height,
            bitrate = params.rate.target_bitrate,
            fps = params.rate.frame_rate,
            "openh264 encoder opened"
        );

        Ok(Self {
            source,
            encoder,
            rate: params.rate,
            next_handle: 1,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        })
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn staged(&mut self, input: InputHandle) -> Result<&mut StagedInput, DeviceError> {
        self.inputs
            .get_mut(&input.0)
            .ok_or(DeviceError::UnknownResource(input.0))
    }
}

impl EncoderDevice for OpenH264Device {
    fn register_input(&mut self, width: usize, height: usize) -> Result<InputHandle, DeviceError> {
        let handle = self.next_handle();
        self.inputs.insert(
            handle,
            StagedInput {
                frame: I420Frame::new(width, height),
                mapped: false,
            },
        );
        Ok(InputHandle(handle))
    }

    fn map_input(&mut self, input: InputHandle) -> Result<(), DeviceError> {
        self.staged(input)?.mapped = true;
        Ok(())
    }

    fn unmap_input(&mut self, input: InputHandle) -> Result<(), DeviceError> {
        self.staged(input)?.mapped = false;
        Ok(())
    }

    fn unregister_input(&mut self, input: InputHandle) -> Result<(), DeviceError> {
        self.inputs
            .remove(&input.0)
            .map(|_| ())
            .ok_or(DeviceError::UnknownResource(input.0))
    }

    fn create_bitstream(&mut self) -> Result<BitstreamHandle, DeviceError> {
        let handle = self.next_handle();
        self.outputs.insert(handle, None);
        Ok(BitstreamHandle(handle))
    }

    fn destroy_bitstream(&mut self, output: BitstreamHandle) -> Result<(), DeviceError> {
        self.outputs
            .remove(&output.0)
            .map(|_| ())
            .ok_or(DeviceError::UnknownResource(output.0))
    }

    fn copy_from_cpu(&mut self, input: InputHandle, frame: &RawFrame) -> Result<(), DeviceError> {
        let i420 = frame
            .to_i420()
            .map_err(|e| DeviceError::Other(e.to_string()))?;
        self.staged(input)?.frame.fill_from(&i420);
        Ok(())
    }

    fn copy_from_native(
        &mut self,
        _input: InputHandle,
        _source: NativeHandle,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("GPU-resident input"))
    }

    fn encode_picture(&mut self, params: &PictureParams) -> Result<(), DeviceError> {
        if !self.outputs.contains_key(&params.output.0) {
            return Err(DeviceError::UnknownResource(params.output.0));
        }
        let staged = self
            .inputs
            .get(&params.input.0)
            .ok_or(DeviceError::UnknownResource(params.input.0))?;
        if !staged.mapped {
            return Err(DeviceError::Other(format!(
                "input {} is not mapped",
                params.input.0
            )));
        }

        if params.force_idr {
            unsafe { self.encoder.raw_api().force_intra_frame(true) };
        }

        let millis = params.frame_index * 1000 / u64::from(self.rate.frame_rate.max(1));
        let data = self
            .encoder
            .encode_at(&staged.frame, Timestamp::from_millis(millis))
            .map_err(|e| DeviceError::Other(format!("openh264 encode: {e}")))?
            .to_vec();

        let keyframe = h264::contains_idr(&data);
        self.outputs
            .insert(params.output.0, Some(BitstreamLock { data, keyframe }));
        Ok(())
    }

    fn try_lock_bitstream(
        &mut self,
        output: BitstreamHandle,
    ) -> Result<Option<BitstreamLock>, DeviceError> {
        self.outputs
            .get_mut(&output.0)
            .map(Option::take)
            .ok_or(DeviceError::UnknownResource(output.0))
    }

    fn unlock_bitstream(&mut self, output: BitstreamHandle) -> Result<(), DeviceError> {
        if !self.outputs.contains_key(&output.0) {
            return Err(DeviceError::UnknownResource(output.0));
        }
        Ok(())
    }

    fn reconfigure(&mut self, rate: &RateParameters) -> Result<(), DeviceError> {
        self.encoder = build_encoder(&self.source, rate)
            .map_err(|e| DeviceError::Other(format!("openh264 reconfigure: {e}")))?;
        self.rate = *rate;
        debug!(bitrate = rate.target_bitrate, fps = rate.frame_rate, "openh264 reconfigured");
        Ok(())
    }

    fn destroy(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::feed::{
        encoders::{BufferFormat, TextureFormat},
        frame::PixelFormat,
    };

    fn params(device: DeviceHandle) -> DeviceParams {
        DeviceParams {
            width: 64,
            height: 48,
            device,
            texture_format: TextureFormat::Rgba8,
            buffer_format: BufferFormat::Abgr,
            rate: RateParameters {
                target_bitrate: 500_000,
                frame_rate: 30,
            },
        }
    }

    fn gradient(seed: u8) -> RawFrame {
        let mut data = Vec::with_capacity(64 * 48 * 4);
        for y in 0..48u32 {
            for x in 0..64u32 {
                data.extend_from_slice(&[(x * 4) as u8 ^ seed, (y * 5) as u8, seed, 255]);
            }
        }
        RawFrame::cpu(64, 48, PixelFormat::Rgba, 0, Bytes::from(data))
    }

    fn encode(device: &mut OpenH264Device, frame_index: u64, force_idr: bool) -> BitstreamLock {
        let input = device.register_input(64, 48).unwrap();
        device.map_input(input).unwrap();
        let output = device.create_bitstream().unwrap();
        device.copy_from_cpu(input, &gradient(frame_index as u8)).unwrap();
        device
            .encode_picture(&PictureParams {
                input,
                output,
                frame_index,
                width: 64,
                height: 48,
                force_idr,
            })
            .unwrap();
        let lock = device.try_lock_bitstream(output).unwrap().unwrap();
        device.unlock_bitstream(output).unwrap();
        lock
    }

    #[test]
    fn missing_codec_library_is_an_api_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ApiSource::Library(dir.path().join("libopenh264.so"));
        assert!(source.api().is_err());
    }

    #[test]
    fn native_devices_are_refused() {
        let err = OpenH264Device::open(&params(DeviceHandle::Native(NativeHandle(1))), None)
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::SessionOpenFailed(_)));
    }

    #[test]
    fn first_picture_is_a_standalone_keyframe() {
        let mut device = OpenH264Device::open(&params(DeviceHandle::Cpu), None).unwrap();
        let lock = encode(&mut device, 0, false);
        assert!(!lock.data.is_empty());
        assert!(lock.keyframe);
        assert!(h264::is_standalone_keyframe(&lock.data));
    }

    #[test]
    fn forced_idr_after_delta_frames() {
        let mut device = OpenH264Device::open(&params(DeviceHandle::Cpu), None).unwrap();
        for i in 0..3 {
            encode(&mut device, i, false);
        }
        let lock = encode(&mut device, 3, true);
        assert!(lock.keyframe);
        assert!(h264::is_standalone_keyframe(&lock.data));
    }

    #[test]
    fn bitstream_is_handed_out_once() {
        let mut device = OpenH264Device::open(&params(DeviceHandle::Cpu), None).unwrap();
        let input = device.register_input(64, 48).unwrap();
        device.map_input(input).unwrap();
        let output = device.create_bitstream().unwrap();
        assert_eq!(device.try_lock_bitstream(output).unwrap(), None);

        device.copy_from_cpu(input, &gradient(1)).unwrap();
        let pic = PictureParams {
            input,
            output,
            frame_index: 0,
            width: 64,
            height: 48,
            force_idr: false,
        };
        device.encode_picture(&pic).unwrap();
        assert!(device.try_lock_bitstream(output).unwrap().is_some());
        assert_eq!(device.try_lock_bitstream(output).unwrap(), None);
    }

    #[test]
    fn unmapped_inputs_cannot_be_encoded() {
        let mut device = OpenH264Device::open(&params(DeviceHandle::Cpu), None).unwrap();
        let input = device.register_input(64, 48).unwrap();
        let output = device.create_bitstream().unwrap();
        let err = device
            .encode_picture(&PictureParams {
                input,
                output,
                frame_index: 0,
                width: 64,
                height: 48,
                force_idr: false,
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Other(_)));
    }

    #[test]
    fn reconfigure_keeps_encoding() {
        let mut device = OpenH264Device::open(&params(DeviceHandle::Cpu), None).unwrap();
        encode(&mut device, 0, false);
        device
            .reconfigure(&RateParameters {
                target_bitrate: 250_000,
                frame_rate: 15,
            })
            .unwrap();
        let lock = encode(&mut device, 1, false);
        assert!(!lock.data.is_empty());
    }
}
