use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::command::cmd_buffer::{CmdBuffer, CmdBufferState};
use crate::command::sync_mask::global_queue_idx;
use crate::device::backend::DeviceBackend;
use crate::device::error::DeviceError;
use crate::objects::resource::UseFlags;
use crate::objects::sync::Semaphore;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
}

impl QueueType {
    pub const COUNT: usize = 3;

    pub const ALL: [QueueType; Self::COUNT] = [QueueType::Graphics, QueueType::Compute, QueueType::Transfer];
}

/// Describes one native queue handed to [`crate::device::Device::new`].
#[derive(Copy, Clone, Debug)]
pub struct QueueDesc {
    pub handle: vk::Queue,
    pub family: u32,
    pub queue_type: QueueType,
}

impl QueueDesc {
    pub fn new(handle: vk::Queue, family: u32, queue_type: QueueType) -> Self {
        Self {
            handle,
            family,
            queue_type,
        }
    }
}

struct Submission {
    buffer: CmdBuffer,
    waits: Vec<Semaphore>,

    /// The driver rejected the submission. Its fence never signals.
    failed: bool,
}

struct QueueState {
    queued: Vec<Submission>,
    active: VecDeque<Submission>,

    /// Signaled by the most recently submitted buffer. The next submission waits on it.
    last_intra: Option<Semaphore>,
}

/// A native queue and the command buffers currently executing on it.
///
/// Submitted buffers are kept alive until their fence signals and are then handed back through
/// [`Queue::refresh_states`]. Consecutive submissions are ordered by a semaphore signaled by each
/// buffer and waited on by the next one.
pub struct Queue {
    handle: vk::Queue,
    family: u32,
    queue_type: QueueType,
    index: u32,
    global_idx: u32,
    backend: Arc<dyn DeviceBackend>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub(crate) fn new(backend: Arc<dyn DeviceBackend>, desc: &QueueDesc, index: u32) -> Self {
        Self {
            handle: desc.handle,
            family: desc.family,
            queue_type: desc.queue_type,
            index,
            global_idx: global_queue_idx(desc.queue_type, index),
            backend,
            state: Mutex::new(QueueState {
                queued: Vec::new(),
                active: VecDeque::new(),
                last_intra: None,
            }),
        }
    }

    pub fn get_handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn get_family(&self) -> u32 {
        self.family
    }

    pub fn get_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn get_index(&self) -> u32 {
        self.index
    }

    pub fn get_global_idx(&self) -> u32 {
        self.global_idx
    }

    /// Returns true if any submitted command buffer has not been retired yet.
    pub fn is_executing(&self) -> bool {
        !self.state.lock().unwrap().active.is_empty()
    }

    /// Id of the most recently submitted command buffer that has not been retired yet.
    pub fn last_command_buffer_id(&self) -> Option<u32> {
        self.state.lock().unwrap().active.back().map(|s| s.buffer.get_id())
    }

    /// Queues a finished buffer for submission. Nothing is sent to the driver until
    /// [`Queue::submit_queued`] is called.
    ///
    /// The wait semaphores must already be bound. They are released once the buffer retires.
    pub fn queue_submit(&self, buffer: CmdBuffer, waits: Vec<Semaphore>) {
        assert_eq!(buffer.get_state(), CmdBufferState::RecordingDone, "Only finished command buffers can be submitted");
        assert_eq!(buffer.get_queue_family(), self.family, "Command buffer submitted to a queue of a different family");

        self.state.lock().unwrap().queued.push(Submission {
            buffer,
            waits,
            failed: false,
        });
    }

    /// Submits a single buffer immediately.
    pub fn submit(&self, buffer: CmdBuffer, waits: Vec<Semaphore>) -> Result<(), DeviceError> {
        self.queue_submit(buffer, waits);
        self.submit_queued()
    }

    /// Sends every queued buffer to the driver in the order it was queued.
    ///
    /// Once a submission fails the remaining buffers are not sent. Failed and skipped buffers stay
    /// in the executing list without a pending fence and are retired by the next
    /// [`Queue::refresh_states`], which releases their resources.
    pub fn submit_queued(&self) -> Result<(), DeviceError> {
        let mut guard = self.state.lock().unwrap();
        let queued = std::mem::take(&mut guard.queued);

        let mut result = Ok(());
        for mut submission in queued {
            if result.is_err() {
                for wait in submission.waits.drain(..) {
                    wait.as_resource().notify_unbound();
                }
                submission.buffer.mark_failed(self.global_idx);
                submission.failed = true;
                guard.active.push_back(submission);
                continue;
            }

            if let Some(intra) = guard.last_intra.clone() {
                intra.as_resource().notify_bound();
                submission.waits.push(intra);
            }

            for wait in submission.waits.iter() {
                wait.as_resource().notify_used(self.global_idx, self.family, UseFlags::READ_WRITE);
            }

            match self.submit_one(&mut submission) {
                Ok(()) => {
                    submission.buffer.mark_submitted(self.global_idx);
                    guard.last_intra = submission.buffer.get_intra_queue_semaphore().cloned();
                }
                Err(err) => {
                    // The next submission keeps waiting on the last buffer that reached the queue
                    log::error!("Failed to submit command buffer {} to queue {:?}/{}: {:?}", submission.buffer.get_id(), self.queue_type, self.index, err);
                    submission.buffer.mark_failed(self.global_idx);
                    submission.failed = true;
                    result = Err(err);
                }
            }
            guard.active.push_back(submission);
        }

        result
    }

    fn submit_one(&self, submission: &mut Submission) -> Result<(), DeviceError> {
        let signals = submission.buffer.allocate_semaphores()?;
        let waits: Vec<_> = submission.waits.iter().map(Semaphore::get_handle).collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let command_buffers = [submission.buffer.get_handle()];

        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signals);

        log::trace!("Submitting command buffer {} on queue {:?}/{} waiting on {} semaphores", submission.buffer.get_id(), self.queue_type, self.index, waits.len());

        unsafe {
            self.backend.queue_submit(self.handle, std::slice::from_ref(&info), submission.buffer.get_fence())
        }.map_err(DeviceError::from)
    }

    /// Requests a semaphore from the most recently submitted buffer that other queues can wait on.
    ///
    /// Returns [`None`] if nothing is executing or if the buffer ran out of semaphores. The returned
    /// semaphore is bound and must be passed as a wait semaphore to a submission.
    pub fn get_sync_semaphore(&self) -> Option<Semaphore> {
        let mut guard = self.state.lock().unwrap();
        let last = guard.active.iter_mut().rev().find(|submission| !submission.failed)?;

        match last.buffer.request_inter_queue_semaphore() {
            Some(semaphore) => {
                semaphore.as_resource().notify_bound();
                Some(semaphore)
            }
            None => {
                log::warn!("Command buffer {} on queue {:?}/{} has no semaphores left for further dependencies. The dependency is skipped",
                    last.buffer.get_id(), self.queue_type, self.index);
                None
            }
        }
    }

    /// Retires completed buffers in submission order and returns them reset.
    ///
    /// If `force_wait` is set every executing buffer is waited on. If `queue_empty` is set the queue
    /// is drained before checking fences.
    pub fn refresh_states(&self, force_wait: bool, queue_empty: bool) -> Result<Vec<CmdBuffer>, DeviceError> {
        if queue_empty {
            unsafe { self.backend.queue_wait_idle(self.handle) }.map_err(|err| {
                log::error!("Failed to wait for queue idle {:?}", err);
                DeviceError::from(err)
            })?;
        }

        let mut guard = self.state.lock().unwrap();
        let mut retired = Vec::new();
        while let Some(front) = guard.active.front_mut() {
            if !front.failed && !front.buffer.check_fence_status(force_wait)? {
                if force_wait {
                    log::warn!("Timed out waiting for command buffer {} on queue {:?}/{}", front.buffer.get_id(), self.queue_type, self.index);
                }
                break;
            }

            let Some(mut submission) = guard.active.pop_front() else {
                break;
            };

            for wait in submission.waits.drain(..) {
                wait.as_resource().notify_done(self.global_idx, UseFlags::READ_WRITE);
            }

            if guard.last_intra.is_some() && guard.last_intra.as_ref() == submission.buffer.get_intra_queue_semaphore() {
                guard.last_intra = None;
            }

            submission.buffer.reset()?;
            retired.push(submission.buffer);
        }

        Ok(retired)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let guard = self.state.get_mut().unwrap();
        if !guard.queued.is_empty() {
            log::warn!("Queue {:?}/{} dropped with {} unsubmitted command buffers", self.queue_type, self.index, guard.queued.len());
        }
        for mut submission in guard.queued.drain(..) {
            for wait in submission.waits.drain(..) {
                wait.as_resource().notify_unbound();
            }
        }

        for mut submission in guard.active.drain(..) {
            if submission.failed {
                for wait in submission.waits.drain(..) {
                    wait.as_resource().notify_done(self.global_idx, UseFlags::READ_WRITE);
                }
                continue;
            }
            if let Err(err) = submission.buffer.check_fence_status(true) {
                log::error!("Failed to wait for command buffer {}: {:?}", submission.buffer.get_id(), err);
            }
            for wait in submission.waits.drain(..) {
                wait.as_resource().notify_done(self.global_idx, UseFlags::READ_WRITE);
            }
        }
        guard.last_intra = None;
    }
}

assert_impl_all!(Queue: Send, Sync);
