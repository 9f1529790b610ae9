use bytes::Bytes;
use tracing::warn;

use crate::feed::{
    encoders::{BitstreamHandle, EncoderDevice, InputHandle},
    error::DeviceError,
};

/// A picture issued to the device whose bitstream has not been collected yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPicture {
    pub frame_index: u64,
    pub capture_timestamp_us: i64,
    pub force_idr: bool,
    /// Re-encode of an already submitted input, kept off the output path.
    pub repeat: bool,
}

/// One input resource plus one output bitstream, owned for the session's
/// lifetime.
#[derive(Debug, Default)]
pub struct FrameSlot {
    input: Option<InputHandle>,
    mapped: bool,
    output: Option<BitstreamHandle>,
    last_encoded: Bytes,
    pending: Option<PendingPicture>,
}

impl FrameSlot {
    fn allocate(
        &mut self,
        device: &mut dyn EncoderDevice,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let input = device.register_input(width, height)?;
        self.input = Some(input);
        device.map_input(input)?;
        self.mapped = true;
        self.output = Some(device.create_bitstream()?);
        Ok(())
    }

    pub fn input(&self) -> Option<InputHandle> {
        self.input
    }

    pub fn output(&self) -> Option<BitstreamHandle> {
        self.output
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingPicture> {
        self.pending.as_ref()
    }

    pub(super) fn set_pending(&mut self, picture: PendingPicture) {
        self.pending = Some(picture);
    }

    pub(super) fn take_pending(&mut self) -> Option<PendingPicture> {
        self.pending.take()
    }

    pub fn last_encoded(&self) -> &Bytes {
        &self.last_encoded
    }

    pub(super) fn store_encoded(&mut self, data: Vec<u8>) -> Bytes {
        self.last_encoded = Bytes::from(data);
        self.last_encoded.clone()
    }

    /// Give every resource back to the device. Safe to call repeatedly and on a
    /// slot that was only partly allocated.
    pub fn release(&mut self, device: &mut dyn EncoderDevice) {
        if let Some(input) = self.input {
            if std::mem::take(&mut self.mapped) {
                if let Err(e) = device.unmap_input(input) {
                    warn!(input = input.0, error = %e, "failed to unmap input");
                }
            }
        }
        if let Some(input) = self.input.take() {
            if let Err(e) = device.unregister_input(input) {
                warn!(input = input.0, error = %e, "failed to unregister input");
            }
        }
        if let Some(output) = self.output.take() {
            if let Err(e) = device.destroy_bitstream(output) {
                warn!(output = output.0, error = %e, "failed to destroy bitstream buffer");
            }
        }
        self.pending = None;
        self.last_encoded = Bytes::new();
    }
}

/// Fixed ring of frame slots. The slot for a submit is `frame_count % len`.
#[derive(Debug, Default)]
pub struct FrameSlotRing {
    slots: Vec<FrameSlot>,
}

impl FrameSlotRing {
    /// Allocate `count` slots. On failure the slots allocated so far stay in
    /// the ring so [`FrameSlotRing::release_all`] can clean them up.
    pub fn allocate(
        &mut self,
        device: &mut dyn EncoderDevice,
        count: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        for _ in 0..count {
            let mut slot = FrameSlot::default();
            let allocated = slot.allocate(device, width, height);
            self.slots.push(slot);
            allocated?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_for(&self, frame_count: u64) -> usize {
        (frame_count % self.slots.len().max(1) as u64) as usize
    }

    pub fn get(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FrameSlot> {
        self.slots.get_mut(index)
    }

    pub fn release_all(&mut self, device: &mut dyn EncoderDevice) {
        for slot in &mut self.slots {
            slot.release(device);
        }
        self.slots.clear();
    }
}
