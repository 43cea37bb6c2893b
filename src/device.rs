//! The logical device and the queues created with it.

pub mod ash_backend;
pub mod backend;
pub mod config;
pub mod error;
pub mod queue;

use std::sync::{Arc, Mutex};

use crate::command::cmd_buffer::CmdBuffer;
use crate::command::pool::CmdBufferPool;
use crate::command::sync_mask::{SyncMask, MAX_QUEUES_PER_TYPE};
use crate::device::backend::DeviceBackend;
use crate::device::config::DeviceConfig;
use crate::device::error::DeviceError;
use crate::device::queue::{Queue, QueueDesc, QueueType};
use crate::objects::descriptor::DescriptorPool;
use crate::objects::manager::ResourceManager;
use crate::objects::sync::Semaphore;

pub struct DeviceImpl {
    backend: Arc<dyn DeviceBackend>,
    config: DeviceConfig,
    queues: [Vec<Queue>; QueueType::COUNT],
    pool: Mutex<CmdBufferPool>,
    descriptor_pool: DescriptorPool,
    manager: ResourceManager,
}

impl DeviceImpl {
    fn all_queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.iter().flatten()
    }

    fn recycle(&self, retired: Vec<CmdBuffer>) {
        if retired.is_empty() {
            return;
        }

        let mut pool = self.pool.lock().unwrap();
        for buffer in retired {
            pool.recycle(buffer);
        }
    }
}

impl Drop for DeviceImpl {
    fn drop(&mut self) {
        for queue in self.queues.iter().flatten() {
            match queue.refresh_states(true, true) {
                Ok(retired) => {
                    let mut pool = self.pool.lock().unwrap();
                    for buffer in retired {
                        pool.recycle(buffer);
                    }
                }
                Err(err) => log::error!("Failed to drain queue {:?}/{} during device shutdown {:?}", queue.get_type(), queue.get_index(), err),
            }
        }
    }
}

/// A logical device.
///
/// Owns the native backend, the resource manager, the queues and the command buffer and
/// descriptor pools. Cloning is cheap, all clones refer to the same device.
#[derive(Clone)]
pub struct Device(Arc<DeviceImpl>);

impl Device {
    /// Wraps the queues of an already created logical device.
    ///
    /// Queues are indexed per type in the order they are provided. At most
    /// [`MAX_QUEUES_PER_TYPE`] queues of each type are supported.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: DeviceConfig, queues: &[QueueDesc]) -> Result<Self, DeviceError> {
        let mut by_type: [Vec<Queue>; QueueType::COUNT] = Default::default();
        for desc in queues {
            let list = &mut by_type[desc.queue_type as usize];
            assert!((list.len() as u32) < MAX_QUEUES_PER_TYPE, "At most {} queues of type {:?} are supported", MAX_QUEUES_PER_TYPE, desc.queue_type);

            let index = list.len() as u32;
            list.push(Queue::new(backend.clone(), desc, index));
        }

        let manager = ResourceManager::new(backend.clone());
        let pool = CmdBufferPool::new(manager.clone(), &config, queues.iter().map(|desc| desc.family))?;
        let descriptor_pool = DescriptorPool::new(backend.clone(), &config)?;

        log::info!("Created device with {} graphics, {} compute and {} transfer queues",
            by_type[QueueType::Graphics as usize].len(), by_type[QueueType::Compute as usize].len(), by_type[QueueType::Transfer as usize].len());

        Ok(Self(Arc::new(DeviceImpl {
            backend,
            config,
            queues: by_type,
            pool: Mutex::new(pool),
            descriptor_pool,
            manager,
        })))
    }

    pub fn get_backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.0.backend
    }

    pub fn get_config(&self) -> &DeviceConfig {
        &self.0.config
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.0.manager
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.0.descriptor_pool
    }

    pub fn get_queue(&self, queue_type: QueueType, index: u32) -> Option<&Queue> {
        self.0.queues[queue_type as usize].get(index as usize)
    }

    pub fn get_queue_count(&self, queue_type: QueueType) -> u32 {
        self.0.queues[queue_type as usize].len() as u32
    }

    /// Family of the first queue of the type.
    pub fn queue_family(&self, queue_type: QueueType) -> Option<u32> {
        self.get_queue(queue_type, 0).map(Queue::get_family)
    }

    /// Returns any queue of the family.
    pub fn find_queue_for_family(&self, family: u32) -> Option<&Queue> {
        self.0.all_queues().find(|queue| queue.get_family() == family)
    }

    /// Returns a ready primary command buffer for the queue family.
    pub fn get_cmd_buffer_for_family(&self, family: u32) -> Result<CmdBuffer, DeviceError> {
        self.0.pool.lock().unwrap().get_buffer(family, false)
    }

    /// Returns a ready command buffer for queues of the type.
    pub fn get_cmd_buffer(&self, queue_type: QueueType, secondary: bool) -> Result<CmdBuffer, DeviceError> {
        let family = self.queue_family(queue_type)
            .unwrap_or_else(|| panic!("Device has no queue of type {:?}", queue_type));

        self.0.pool.lock().unwrap().get_buffer(family, secondary)
    }

    /// Collects one semaphore from each queue in the mask that is currently executing.
    ///
    /// Queues that are idle, that do not exist, or whose last buffer has no semaphores left are
    /// skipped. The returned semaphores are bound and must be passed to a submission.
    pub fn get_sync_semaphores(&self, mask: SyncMask) -> Vec<Semaphore> {
        let mut semaphores = Vec::new();
        for (queue_type, index) in mask.iter_queues() {
            let Some(queue) = self.get_queue(queue_type, index) else {
                log::trace!("Skipping dependency on missing queue {:?}/{}", queue_type, index);
                continue;
            };

            if let Some(semaphore) = queue.get_sync_semaphore() {
                semaphores.push(semaphore);
            }
        }

        semaphores
    }

    /// Retires completed command buffers on every queue and returns them to the pool.
    pub fn refresh_states(&self, force_wait: bool) -> Result<(), DeviceError> {
        for queue in self.0.all_queues() {
            let retired = queue.refresh_states(force_wait, false)?;
            self.0.recycle(retired);
        }
        Ok(())
    }

    /// Blocks until every queue is idle and retires all command buffers.
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        for queue in self.0.all_queues() {
            let retired = queue.refresh_states(true, true)?;
            self.0.recycle(retired);
        }
        Ok(())
    }

    /// Number of command buffers of the family that exist, including those in flight.
    pub fn get_cmd_buffer_count(&self, family: u32) -> u32 {
        self.0.pool.lock().unwrap().get_live_count(family)
    }
}

assert_impl_all!(Device: Send, Sync);

#[cfg(test)]
mod tests {
    use ash::vk;
    use ash::vk::Handle;

    use crate::command::subresource::ResourceUsage;
    use crate::objects::buffer::{Buffer, BufferDesc};
    use crate::objects::image::{Image, ImageDesc, ImageUsage};
    use crate::objects::resource::UseFlags;
    use crate::test::*;

    use super::*;

    fn make_device() -> (Arc<RecordingBackend>, Device) {
        let backend = RecordingBackend::new();
        let queues = [
            QueueDesc::new(backend.make(), 0, QueueType::Graphics),
            QueueDesc::new(backend.make(), 1, QueueType::Compute),
            QueueDesc::new(backend.make(), 2, QueueType::Transfer),
        ];
        let device = Device::new(backend.clone(), DeviceConfig::new(), &queues).unwrap();
        (backend, device)
    }

    fn submit_empty(device: &Device, queue_type: QueueType, mask: SyncMask) {
        let mut cmd = device.get_cmd_buffer(queue_type, false).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();

        let queue = device.get_queue(queue_type, 0).unwrap();
        cmd.submit(device, queue, mask).unwrap();
    }

    /// Command buffers sent to the queue, in submission order.
    fn submitted_on(backend: &RecordingBackend, queue: &Queue) -> Vec<vk::CommandBuffer> {
        let raw = queue.get_handle().as_raw();
        backend.calls().into_iter().flat_map(|call| match call {
            Call::Submit { queue, submits, .. } if queue == raw => submits.into_iter().flat_map(|submit| submit.command_buffers).collect(),
            _ => Vec::new(),
        }).map(vk::CommandBuffer::from_raw).collect()
    }

    fn make_image(backend: &RecordingBackend, device: &Device) -> Image {
        device.resource_manager().create::<Image>(ImageDesc::new(backend.make(), vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR, 1, 1, ImageUsage::SAMPLED), false)
    }

    fn submit_image_use(device: &Device, queue_type: QueueType, image: &Image, layout: vk::ImageLayout) -> Result<vk::CommandBuffer, DeviceError> {
        let mut cmd = device.get_cmd_buffer(queue_type, false)?;
        cmd.begin()?;
        cmd.register_image(image, &image.get_range(), layout, layout, UseFlags::READ, ResourceUsage::ShaderBind);
        cmd.end()?;

        let handle = cmd.get_handle();
        cmd.submit(device, device.get_queue(queue_type, 0).unwrap(), SyncMask::NONE)?;
        Ok(handle)
    }

    #[test]
    fn test_queue_lookup() {
        let (_backend, device) = make_device();
        assert_eq!(device.queue_family(QueueType::Compute), Some(1));
        assert_eq!(device.get_queue_count(QueueType::Graphics), 1);
        assert!(device.get_queue(QueueType::Graphics, 1).is_none());
        assert_eq!(device.find_queue_for_family(2).map(Queue::get_type), Some(QueueType::Transfer));
        assert!(device.find_queue_for_family(7).is_none());
    }

    #[test]
    fn test_waits_match_dependencies() {
        let (backend, device) = make_device();

        submit_empty(&device, QueueType::Compute, SyncMask::NONE);
        submit_empty(&device, QueueType::Transfer, SyncMask::NONE);

        let mask = SyncMask::for_queue(QueueType::Compute, 0)
            .union(SyncMask::for_queue(QueueType::Transfer, 0))
            .union(SyncMask::for_queue(QueueType::Graphics, 0));
        submit_empty(&device, QueueType::Graphics, mask);

        let submits = backend.submits();
        assert_eq!(submits.len(), 3);
        assert_eq!(submits[2].wait_semaphores.len(), 2);

        // Every wait is signaled by one of the earlier submissions
        for wait in submits[2].wait_semaphores.iter() {
            assert!(submits[0].signal_semaphores.contains(wait) || submits[1].signal_semaphores.contains(wait));
        }

        device.wait_idle().unwrap();
    }

    #[test]
    fn test_waits_on_idle_or_missing_queues_are_skipped() {
        let (backend, device) = make_device();

        // Nothing executes on the compute queue and the second graphics queue does not exist
        let mask = SyncMask::for_queue(QueueType::Compute, 0).union(SyncMask::for_queue(QueueType::Graphics, 1));
        submit_empty(&device, QueueType::Graphics, mask);

        let submits = backend.submits();
        assert_eq!(submits.len(), 1);
        assert!(submits[0].wait_semaphores.is_empty());

        device.wait_idle().unwrap();
    }

    #[test]
    fn test_dependencies_are_bounded() {
        let (backend, device) = make_device();
        submit_empty(&device, QueueType::Compute, SyncMask::NONE);

        let compute = SyncMask::for_queue(QueueType::Compute, 0);
        for _ in 0..(DeviceConfig::DEFAULT_MAX_DEPENDENCIES + 1) {
            submit_empty(&device, QueueType::Transfer, compute);
        }

        let submits = backend.submits();
        let waits: Vec<_> = submits[1..].iter().map(|submit| submit.wait_semaphores.iter().filter(|wait| submits[0].signal_semaphores.contains(wait)).count()).collect();
        assert_eq!(waits, vec![1, 1, 0]);

        device.wait_idle().unwrap();
    }

    #[test]
    fn test_consecutive_submissions_are_ordered() {
        let (backend, device) = make_device();
        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);
        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);

        let submits = backend.submits();
        assert_eq!(submits[1].wait_semaphores, vec![submits[0].signal_semaphores[0]]);

        device.wait_idle().unwrap();
    }

    #[test]
    fn test_refresh_recycles_completed_buffers() {
        let (backend, device) = make_device();
        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);
        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);
        assert_eq!(device.get_cmd_buffer_count(0), 2);

        device.refresh_states(false).unwrap();
        assert!(device.get_queue(QueueType::Graphics, 0).unwrap().is_executing());

        backend.complete_submissions();
        device.refresh_states(false).unwrap();
        assert!(!device.get_queue(QueueType::Graphics, 0).unwrap().is_executing());

        // Recycled buffers are handed out again
        let reused = device.get_cmd_buffer(QueueType::Graphics, false).unwrap();
        assert_eq!(device.get_cmd_buffer_count(0), 2);
        drop(reused);
    }

    #[test]
    fn test_resources_released_after_completion() {
        let (backend, device) = make_device();
        let resource = device.resource_manager().create_generic(false);

        let mut cmd = device.get_cmd_buffer(QueueType::Graphics, false).unwrap();
        cmd.begin().unwrap();
        cmd.register_resource(&resource, UseFlags::WRITE);
        cmd.end().unwrap();
        cmd.submit(&device, device.get_queue(QueueType::Graphics, 0).unwrap(), SyncMask::NONE).unwrap();

        assert!(resource.is_used());
        assert_eq!(resource.get_queue_family(), Some(0));

        resource.destroy();
        assert!(device.resource_manager().is_live(resource.get_id()));

        backend.complete_submissions();
        device.refresh_states(false).unwrap();
        assert!(!device.resource_manager().is_live(resource.get_id()));
    }

    #[test]
    fn test_ownership_transfer_at_submit() {
        let (backend, device) = make_device();
        let buffer = device.resource_manager().create::<Buffer>(BufferDesc::new(backend.make(), 256), false);
        let graphics = device.get_queue(QueueType::Graphics, 0).unwrap();
        let compute = device.get_queue(QueueType::Compute, 0).unwrap();

        let mut cmd = device.get_cmd_buffer(QueueType::Graphics, false).unwrap();
        cmd.begin().unwrap();
        cmd.register_buffer(&buffer, vk::AccessFlags::SHADER_READ, UseFlags::READ);
        cmd.end().unwrap();
        cmd.submit(&device, graphics, SyncMask::NONE).unwrap();

        // Never used by another family, nothing to transfer
        assert_eq!(submitted_on(&backend, graphics).len(), 1);
        backend.complete_submissions();
        device.refresh_states(false).unwrap();

        let mut cmd = device.get_cmd_buffer(QueueType::Compute, false).unwrap();
        cmd.begin().unwrap();
        cmd.register_buffer(&buffer, vk::AccessFlags::SHADER_READ, UseFlags::READ);
        cmd.end().unwrap();
        let handle = cmd.get_handle();
        cmd.submit(&device, compute, SyncMask::NONE).unwrap();

        let transfer = |barrier: &BufferBarrierRecord| (barrier.buffer, barrier.src_queue_family, barrier.dst_queue_family);
        let expected = vec![(buffer.get_handle().as_raw(), 0, 1)];

        // Released on the graphics queue
        let release = submitted_on(&backend, graphics);
        assert_eq!(release.len(), 2);
        assert_eq!(backend.buffer_barriers(release[1]).iter().map(transfer).collect::<Vec<_>>(), expected);

        // Acquired on the compute queue right before the buffer itself
        let acquire = submitted_on(&backend, compute);
        assert_eq!(acquire.len(), 2);
        assert_eq!(acquire[1], handle);
        assert_eq!(backend.buffer_barriers(acquire[0]).iter().map(transfer).collect::<Vec<_>>(), expected);
        assert!(backend.buffer_barriers(handle).is_empty());

        // The acquiring submission waits on the release
        let submits = backend.submits();
        let release_signal = submits.iter().rev().find(|submit| submit.command_buffers.contains(&release[1].as_raw())).unwrap().signal_semaphores.clone();
        let acquire_waits = submits.iter().rev().find(|submit| submit.command_buffers.contains(&acquire[0].as_raw())).unwrap().wait_semaphores.clone();
        assert!(acquire_waits.iter().any(|wait| release_signal.contains(wait)));
        assert_eq!(buffer.as_resource().get_queue_family(), Some(1));

        device.wait_idle().unwrap();
        buffer.as_resource().destroy();
    }

    #[test]
    fn test_initial_transition_recorded_in_helper() {
        let (backend, device) = make_device();
        let image = make_image(&backend, &device);
        let graphics = device.get_queue(QueueType::Graphics, 0).unwrap();
        let sro = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        image.set_layout(&image.get_range(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let handle = submit_image_use(&device, QueueType::Graphics, &image, sro).unwrap();

        let submitted = submitted_on(&backend, graphics);
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1], handle);

        let barriers = backend.image_barriers(submitted[0]);
        assert_eq!(barriers.len(), 1);
        assert_eq!((barriers[0].old_layout, barriers[0].new_layout), (vk::ImageLayout::TRANSFER_DST_OPTIMAL, sro));
        assert_eq!(barriers[0].src_queue_family, vk::QUEUE_FAMILY_IGNORED);
        assert!(backend.image_barriers(handle).iter().all(|barrier| barrier.old_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL));
        assert_eq!(image.get_layout(0, 0), sro);

        // Already in the expected layout, no helper needed
        submit_image_use(&device, QueueType::Graphics, &image, sro).unwrap();
        assert_eq!(submitted_on(&backend, graphics).len(), 3);

        device.wait_idle().unwrap();
        image.as_resource().destroy();
    }

    #[test]
    fn test_failed_submit_keeps_global_layout() {
        let (backend, device) = make_device();
        let image = make_image(&backend, &device);
        let sro = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        let general = vk::ImageLayout::GENERAL;

        submit_image_use(&device, QueueType::Graphics, &image, sro).unwrap();
        backend.complete_submissions();
        device.refresh_states(false).unwrap();
        assert_eq!(image.get_layout(0, 0), sro);

        backend.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let result = submit_image_use(&device, QueueType::Compute, &image, general);
        assert_eq!(result, Err(DeviceError::OutOfDeviceMemory));
        assert_eq!(image.get_layout(0, 0), sro);
        assert_eq!(image.as_resource().get_bound_count(), 0);

        device.wait_idle().unwrap();

        // The next attempt starts from the layout the image is really in
        submit_image_use(&device, QueueType::Compute, &image, general).unwrap();
        let compute = device.get_queue(QueueType::Compute, 0).unwrap();
        let helper = submitted_on(&backend, compute)[0];
        assert!(backend.image_barriers(helper).iter().any(|barrier| barrier.old_layout == sro && barrier.new_layout == general));
        assert_eq!(image.get_layout(0, 0), general);

        device.wait_idle().unwrap();
        image.as_resource().destroy();
    }

    #[test]
    fn test_failed_submit_does_not_stall_queue() {
        let (backend, device) = make_device();
        let resource = device.resource_manager().create_generic(false);
        let queue = device.get_queue(QueueType::Graphics, 0).unwrap();

        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);

        backend.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let mut cmd = device.get_cmd_buffer(QueueType::Graphics, false).unwrap();
        cmd.begin().unwrap();
        cmd.register_resource(&resource, UseFlags::WRITE);
        cmd.end().unwrap();
        assert_eq!(cmd.submit(&device, queue, SyncMask::NONE), Err(DeviceError::OutOfHostMemory));

        submit_empty(&device, QueueType::Graphics, SyncMask::NONE);

        // The failed buffer never signals, later submissions keep waiting on the last one that ran
        let submits = backend.submits();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[1].wait_semaphores, vec![submits[0].signal_semaphores[0]]);

        backend.complete_submissions();
        device.refresh_states(false).unwrap();
        assert!(!queue.is_executing());
        assert_eq!(resource.get_bound_count(), 0);
        assert_eq!(resource.get_used_count(), 0);

        resource.destroy();
        assert!(!device.resource_manager().is_live(resource.get_id()));
    }

    #[test]
    fn test_submit_failure_is_reported() {
        let (backend, device) = make_device();
        backend.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let mut cmd = device.get_cmd_buffer(QueueType::Graphics, false).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        let handle = cmd.get_handle().as_raw();

        let result = cmd.submit(&device, device.get_queue(QueueType::Graphics, 0).unwrap(), SyncMask::NONE);
        assert_eq!(result, Err(DeviceError::DeviceLost));
        assert!(backend.submits().iter().all(|submit| !submit.command_buffers.contains(&handle)));

        device.wait_idle().unwrap();
    }
}
