use std::ops::{Deref, DerefMut};

use crate::command::cmd_buffer::CmdBuffer;
use crate::command::sync_mask::SyncMask;
use crate::device::error::DeviceError;
use crate::device::queue::{Queue, QueueType};
use crate::device::Device;

/// Records commands for a single queue.
///
/// Always holds a command buffer in the recording state. Submitting sends the current buffer to the
/// queue and continues recording into a fresh one. Queries in progress carry over to the new buffer.
pub struct CommandBuffer {
    device: Device,
    queue_type: QueueType,
    queue_idx: u32,
    secondary: bool,
    buffer: CmdBuffer,
}

impl CommandBuffer {
    pub fn new(device: Device, queue_type: QueueType, queue_idx: u32, secondary: bool) -> Result<Self, DeviceError> {
        assert!(device.get_queue(queue_type, queue_idx).is_some(), "Device has no queue {:?}/{}", queue_type, queue_idx);

        let mut buffer = device.get_cmd_buffer(queue_type, secondary)?;
        buffer.begin()?;

        Ok(Self {
            device,
            queue_type,
            queue_idx,
            secondary,
            buffer,
        })
    }

    pub fn get_device(&self) -> &Device {
        &self.device
    }

    pub fn get_queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn get_queue(&self) -> &Queue {
        self.device.get_queue(self.queue_type, self.queue_idx)
            .unwrap_or_else(|| panic!("Device has no queue {:?}/{}", self.queue_type, self.queue_idx))
    }

    /// Mask selecting the queue this buffer submits to. Other buffers pass it to wait on this one.
    pub fn queue_mask(&self) -> SyncMask {
        SyncMask::for_queue(self.queue_type, self.queue_idx)
    }

    /// Submits everything recorded so far.
    ///
    /// The submission waits on the last submission of every other queue in `sync_mask`. Waiting on
    /// the own queue is implicit.
    pub fn submit(&mut self, sync_mask: SyncMask) -> Result<(), DeviceError> {
        let sync_mask = sync_mask.without(self.queue_mask());

        let mut next = self.device.get_cmd_buffer(self.queue_type, self.secondary)?;
        next.begin()?;
        let mut buffer = std::mem::replace(&mut self.buffer, next);

        if buffer.is_in_render_pass() {
            buffer.end_render_pass();
        }

        let queries = buffer.get_in_progress_queries();
        for query in queries.iter() {
            buffer.interrupt_query(query);
        }

        buffer.end()?;

        log::trace!("Submitting command buffer {} to queue {:?}/{}", buffer.get_id(), self.queue_type, self.queue_idx);
        buffer.submit(&self.device, self.get_queue(), sync_mask)?;

        self.device.refresh_states(false)?;

        for query in queries.iter() {
            self.buffer.resume_query(query);
        }

        Ok(())
    }
}

impl Deref for CommandBuffer {
    type Target = CmdBuffer;

    fn deref(&self) -> &CmdBuffer {
        &self.buffer
    }
}

impl DerefMut for CommandBuffer {
    fn deref_mut(&mut self) -> &mut CmdBuffer {
        &mut self.buffer
    }
}
