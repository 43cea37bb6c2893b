use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use core::panic::{RefUnwindSafe, UnwindSafe};

use ash::vk;
use bitflags::bitflags;

use crate::command::sync_mask::MAX_UNIQUE_QUEUES;
use crate::device::backend::DeviceBackend;
use crate::objects::buffer::BufferData;
use crate::objects::descriptor::DescriptorSetData;
use crate::objects::framebuffer::FramebufferData;
use crate::objects::id::{ObjectType, ResourceId};
use crate::objects::image::ImageData;
use crate::objects::manager::ManagerShared;
use crate::objects::query::QueryPoolData;

bitflags! {
    /// How a command buffer accesses a resource.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct UseFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// Exclusive to one queue family at a time.
    Normal,

    /// May be used by multiple queue families concurrently.
    Shared,

    /// Destruction has been requested. Terminal.
    Destroyed,
}

/// The native objects backing a resource.
pub enum ResourcePayload {
    None,
    Buffer(BufferData),
    Image(ImageData),
    Semaphore(vk::Semaphore),
    Event(vk::Event),
    QueryPool(QueryPoolData),
    Framebuffer(FramebufferData),
    Pipeline(vk::Pipeline),
    DescriptorSet(DescriptorSetData),
}

impl ResourcePayload {
    pub fn object_type(&self) -> u8 {
        match self {
            ResourcePayload::None => ObjectType::GENERIC,
            ResourcePayload::Buffer(_) => ObjectType::BUFFER,
            ResourcePayload::Image(_) => ObjectType::IMAGE,
            ResourcePayload::Semaphore(_) => ObjectType::SEMAPHORE,
            ResourcePayload::Event(_) => ObjectType::EVENT,
            ResourcePayload::QueryPool(_) => ObjectType::QUERY_POOL,
            ResourcePayload::Framebuffer(_) => ObjectType::FRAMEBUFFER,
            ResourcePayload::Pipeline(_) => ObjectType::PIPELINE,
            ResourcePayload::DescriptorSet(_) => ObjectType::DESCRIPTOR_SET,
        }
    }

    /// Destroys all native objects.
    ///
    /// # Safety
    /// The objects must not be in use by the device.
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        match self {
            ResourcePayload::None => {}
            ResourcePayload::Buffer(data) => data.destroy(backend),
            ResourcePayload::Image(data) => data.destroy(backend),
            ResourcePayload::Semaphore(semaphore) => backend.destroy_semaphore(*semaphore),
            ResourcePayload::Event(event) => backend.destroy_event(*event),
            ResourcePayload::QueryPool(data) => data.destroy(backend),
            ResourcePayload::Framebuffer(data) => data.destroy(backend),
            ResourcePayload::Pipeline(pipeline) => backend.destroy_pipeline(*pipeline),
            ResourcePayload::DescriptorSet(data) => data.destroy(backend),
        }
    }
}

struct UseState {
    state: ResourceState,
    read_uses: [u8; MAX_UNIQUE_QUEUES as usize],
    write_uses: [u8; MAX_UNIQUE_QUEUES as usize],
    bound_count: u32,
    used_count: u32,
    queue_family: Option<u32>,
    freed: bool,
}

impl UseState {
    fn new(shared: bool) -> Self {
        Self {
            state: if shared { ResourceState::Shared } else { ResourceState::Normal },
            read_uses: [0u8; MAX_UNIQUE_QUEUES as usize],
            write_uses: [0u8; MAX_UNIQUE_QUEUES as usize],
            bound_count: 0,
            used_count: 0,
            queue_family: None,
            freed: false,
        }
    }

    /// Returns true if the resource must be physically deleted now. Can only return true once.
    fn take_free_request(&mut self) -> bool {
        if self.state == ResourceState::Destroyed && self.bound_count == 0 && !self.freed {
            self.freed = true;
            true
        } else {
            false
        }
    }
}

pub struct ResourceImpl {
    id: ResourceId,
    exclusive: bool,
    manager: Weak<ManagerShared>,
    payload: ResourcePayload,
    use_state: Mutex<UseState>,
}

impl ResourceImpl {
    pub(crate) fn new(id: ResourceId, manager: Weak<ManagerShared>, payload: ResourcePayload, shared: bool) -> Self {
        Self {
            id,
            exclusive: !shared,
            manager,
            payload,
            use_state: Mutex::new(UseState::new(shared)),
        }
    }

    pub(crate) fn get_id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn get_payload(&self) -> &ResourcePayload {
        &self.payload
    }

    fn free(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.destroy(self);
        } else {
            log::error!("Resource {:?} released after its manager was destroyed. The native objects are leaked", self.id);
        }
    }
}

/// A reference counted handle to a resource owned by a [`crate::objects::ResourceManager`].
///
/// Command buffers keep clones of the handle for as long as they reference the resource.
/// Dropping handles never destroys the resource. Destruction is requested through
/// [`Resource::destroy`] and carried out once no command buffer is bound to it anymore.
#[derive(Clone)]
pub struct Resource(Arc<ResourceImpl>);

impl Resource {
    pub(crate) fn from_impl(inner: Arc<ResourceImpl>) -> Self {
        Self(inner)
    }

    pub fn get_id(&self) -> ResourceId {
        self.0.id
    }

    pub fn get_payload(&self) -> &ResourcePayload {
        self.0.get_payload()
    }

    /// Returns true if the resource was created without the shared flag.
    pub fn is_exclusive(&self) -> bool {
        self.0.exclusive
    }

    pub fn get_state(&self) -> ResourceState {
        self.0.use_state.lock().unwrap().state
    }

    pub fn get_bound_count(&self) -> u32 {
        self.0.use_state.lock().unwrap().bound_count
    }

    pub fn get_used_count(&self) -> u32 {
        self.0.use_state.lock().unwrap().used_count
    }

    pub fn is_bound(&self) -> bool {
        self.get_bound_count() > 0
    }

    pub fn is_used(&self) -> bool {
        self.get_used_count() > 0
    }

    /// The queue family that last used the resource.
    pub fn get_queue_family(&self) -> Option<u32> {
        self.0.use_state.lock().unwrap().queue_family
    }

    /// Called when a command buffer starts referencing this resource.
    pub fn notify_bound(&self) {
        let mut guard = self.0.use_state.lock().unwrap();
        assert_ne!(guard.state, ResourceState::Destroyed, "Bound destroyed resource {:?}", self.0.id);

        guard.bound_count += 1;
    }

    /// Called when a command buffer referencing this resource is submitted on a queue.
    pub fn notify_used(&self, global_queue_idx: u32, queue_family: u32, flags: UseFlags) {
        let mut guard = self.0.use_state.lock().unwrap();
        assert_ne!(guard.state, ResourceState::Destroyed, "Used destroyed resource {:?}", self.0.id);

        if guard.state == ResourceState::Normal && guard.used_count > 0 {
            assert_eq!(guard.queue_family, Some(queue_family),
                       "Exclusive resource {:?} used by queue family {} while in use by another family", self.0.id, queue_family);
        }
        assert!(guard.used_count < guard.bound_count, "Resource {:?} used more often than bound", self.0.id);

        let idx = global_queue_idx as usize;
        assert!(idx < MAX_UNIQUE_QUEUES as usize, "Global queue index {} out of range", global_queue_idx);

        guard.used_count += 1;
        guard.queue_family = Some(queue_family);

        if flags.contains(UseFlags::READ) {
            assert!(guard.read_uses[idx] < u8::MAX, "Read use counter overflow on {:?}", self.0.id);
            guard.read_uses[idx] += 1;
        }
        if flags.contains(UseFlags::WRITE) {
            assert!(guard.write_uses[idx] < u8::MAX, "Write use counter overflow on {:?}", self.0.id);
            guard.write_uses[idx] += 1;
        }
    }

    /// Called when a command buffer that used this resource finished executing.
    pub fn notify_done(&self, global_queue_idx: u32, flags: UseFlags) {
        let free = {
            let mut guard = self.0.use_state.lock().unwrap();
            assert!(guard.used_count > 0, "Used count underflow on {:?}", self.0.id);
            assert!(guard.bound_count > 0, "Bound count underflow on {:?}", self.0.id);

            let idx = global_queue_idx as usize;
            assert!(idx < MAX_UNIQUE_QUEUES as usize, "Global queue index {} out of range", global_queue_idx);

            guard.used_count -= 1;
            guard.bound_count -= 1;

            if flags.contains(UseFlags::READ) {
                assert!(guard.read_uses[idx] > 0, "Read use counter underflow on {:?}", self.0.id);
                guard.read_uses[idx] -= 1;
            }
            if flags.contains(UseFlags::WRITE) {
                assert!(guard.write_uses[idx] > 0, "Write use counter underflow on {:?}", self.0.id);
                guard.write_uses[idx] -= 1;
            }

            guard.take_free_request()
        };

        if free {
            self.0.free();
        }
    }

    /// Called when a command buffer stops referencing this resource without having submitted it.
    pub fn notify_unbound(&self) {
        let free = {
            let mut guard = self.0.use_state.lock().unwrap();
            assert!(guard.bound_count > guard.used_count, "Unbound resource {:?} that is still in use", self.0.id);

            guard.bound_count -= 1;
            guard.take_free_request()
        };

        if free {
            self.0.free();
        }
    }

    /// Returns a mask with one bit set per global queue index that currently uses the resource
    /// with any of the provided flags.
    pub fn get_use_info(&self, flags: UseFlags) -> u32 {
        let guard = self.0.use_state.lock().unwrap();

        let mut mask = 0u32;
        for idx in 0..(MAX_UNIQUE_QUEUES as usize) {
            if flags.contains(UseFlags::READ) && guard.read_uses[idx] > 0 {
                mask |= 1u32 << idx;
            }
            if flags.contains(UseFlags::WRITE) && guard.write_uses[idx] > 0 {
                mask |= 1u32 << idx;
            }
        }
        mask
    }

    /// Requests destruction of the resource.
    ///
    /// The native objects are released immediately if no command buffer is bound to the resource,
    /// otherwise once the last bound command buffer completes or unbinds it.
    pub fn destroy(&self) {
        let free = {
            let mut guard = self.0.use_state.lock().unwrap();
            assert_ne!(guard.state, ResourceState::Destroyed, "Resource {:?} destroyed twice", self.0.id);

            guard.state = ResourceState::Destroyed;
            guard.take_free_request()
        };

        if free {
            self.0.free();
        }
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.0.id.eq(&other.0.id)
    }
}

impl Eq for Resource {
}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Resource({:?})", self.0.id))
    }
}

assert_impl_all!(Resource: Send, Sync, UnwindSafe, RefUnwindSafe);
