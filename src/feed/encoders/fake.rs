//! Scriptable stand-in for an encoder device. Everything it is asked to do is
//! recorded in a shared [`FakeLog`] the test keeps a handle to.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use super::{
    BitstreamHandle, BitstreamLock, DeviceFactory, DeviceParams, EncoderDevice, InputHandle,
    PictureParams, RateParameters,
};
use crate::feed::{
    error::{DeviceError, SessionError},
    frame::{NativeHandle, RawFrame},
};

const IDR_PAYLOAD: [u8; 15] = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 1];

#[derive(Debug, Default, Clone)]
pub struct FakeLog {
    pub opened: Option<DeviceParams>,
    pub pictures: Vec<PictureParams>,
    pub reconfigures: Vec<RateParameters>,
    pub uploads: Vec<i64>,
    pub native_uploads: Vec<NativeHandle>,
    pub released_inputs: Vec<InputHandle>,
    pub destroyed_outputs: Vec<BitstreamHandle>,
    pub destroyed: u32,
    /// Thread each picture was encoded on, in order.
    pub encode_threads: Vec<std::thread::ThreadId>,
    /// Free-form markers (e.g. "destroy") in call order.
    pub events: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FakeBehavior {
    pub never_complete: bool,
    pub reject_reconfigure: bool,
    pub fail_open: bool,
    /// Fail input registration once this many inputs exist.
    pub max_inputs: Option<usize>,
    /// Block inside `encode_picture` for this long.
    pub encode_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeHandle {
    log: Arc<Mutex<FakeLog>>,
}

impl FakeHandle {
    pub fn log(&self) -> MutexGuard<'_, FakeLog> {
        self.log.lock().unwrap()
    }
}

pub struct FakeDevice {
    behavior: FakeBehavior,
    log: Arc<Mutex<FakeLog>>,
    next_handle: u64,
    inputs: HashSet<u64>,
    outputs: HashMap<u64, Option<BitstreamLock>>,
}

impl FakeDevice {
    pub fn factory(behavior: FakeBehavior) -> (DeviceFactory, FakeHandle) {
        let handle = FakeHandle::default();
        let log = handle.log.clone();
        let factory: DeviceFactory = Box::new(move |params: &DeviceParams| {
            if behavior.fail_open {
                return Err(SessionError::SessionOpenFailed("fake device refused".into()));
            }
            log.lock().unwrap().opened = Some(params.clone());
            Ok(Box::new(FakeDevice {
                behavior,
                log,
                next_handle: 1,
                inputs: HashSet::new(),
                outputs: HashMap::new(),
            }) as Box<dyn EncoderDevice>)
        });
        (factory, handle)
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn log(&self) -> MutexGuard<'_, FakeLog> {
        self.log.lock().unwrap()
    }
}

impl EncoderDevice for FakeDevice {
    fn register_input(&mut self, _width: usize, _height: usize) -> Result<InputHandle, DeviceError> {
        if let Some(max) = self.behavior.max_inputs {
            if self.inputs.len() >= max {
                return Err(DeviceError::Call {
                    operation: "register_input",
                    code: -2,
                });
            }
        }
        let handle = self.next_handle();
        self.inputs.insert(handle);
        Ok(InputHandle(handle))
    }

    fn map_input(&mut self, _input: InputHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn unmap_input(&mut self, _input: InputHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn unregister_input(&mut self, input: InputHandle) -> Result<(), DeviceError> {
        if !self.inputs.remove(&input.0) {
            return Err(DeviceError::UnknownResource(input.0));
        }
        self.log().released_inputs.push(input);
        Ok(())
    }

    fn create_bitstream(&mut self) -> Result<BitstreamHandle, DeviceError> {
        let handle = self.next_handle();
        self.outputs.insert(handle, None);
        Ok(BitstreamHandle(handle))
    }

    fn destroy_bitstream(&mut self, output: BitstreamHandle) -> Result<(), DeviceError> {
        if self.outputs.remove(&output.0).is_none() {
            return Err(DeviceError::UnknownResource(output.0));
        }
        self.log().destroyed_outputs.push(output);
        Ok(())
    }

    fn copy_from_cpu(&mut self, _input: InputHandle, frame: &RawFrame) -> Result<(), DeviceError> {
        self.log().uploads.push(frame.timestamp_us);
        Ok(())
    }

    fn copy_from_native(
        &mut self,
        _input: InputHandle,
        source: NativeHandle,
    ) -> Result<(), DeviceError> {
        self.log().native_uploads.push(source);
        Ok(())
    }

    fn encode_picture(&mut self, params: &PictureParams) -> Result<(), DeviceError> {
        {
            let mut log = self.log();
            log.pictures.push(*params);
            log.encode_threads.push(std::thread::current().id());
            log.events.push(format!("encode {}", params.frame_index));
        }
        if let Some(delay) = self.behavior.encode_delay {
            std::thread::sleep(delay);
        }
        if self.behavior.never_complete {
            return Ok(());
        }

        let mut data = Vec::new();
        if params.force_idr {
            data.extend_from_slice(&IDR_PAYLOAD);
            data.extend_from_slice(&[0x65, params.frame_index as u8]);
        } else {
            data.extend_from_slice(&[0, 0, 0, 1, 0x41, params.frame_index as u8]);
        }
        let lock = BitstreamLock {
            data,
            keyframe: params.force_idr,
        };
        self.outputs.insert(params.output.0, Some(lock));
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

    fn unlock_bitstream(&mut self, _output: BitstreamHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn reconfigure(&mut self, rate: &RateParameters) -> Result<(), DeviceError> {
        if self.behavior.reject_reconfigure {
            return Err(DeviceError::Call {
                operation: "reconfigure",
                code: -8,
            });
        }
        let mut log = self.log();
        log.reconfigures.push(*rate);
        log.events.push(format!("reconfigure {}", rate.target_bitrate));
        Ok(())
    }

    fn destroy(&mut self) {
        let mut log = self.log();
        log.destroyed += 1;
        log.events.push("destroy".into());
    }
}
