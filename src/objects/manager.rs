//! Creation and deferred destruction of resources.
//!
//! Every resource belongs to exactly one [`ResourceManager`]. The manager keeps the resource in
//! an arena until the resource requests physical deletion, which happens once destruction has been
//! requested and no command buffer is bound to the resource anymore. Command buffers only hold
//! reference counted [`Resource`] handles, so a destroyed resource never leaves dangling
//! references behind.

use std::sync::{Arc, Mutex};

use core::panic::{RefUnwindSafe, UnwindSafe};

use crate::device::backend::DeviceBackend;
use crate::device::error::DeviceError;
use crate::objects::id::{ObjectType, ResourceId};
use crate::objects::resource::{Resource, ResourceImpl, ResourcePayload};
use crate::objects::sync::{Event, Semaphore};

/// A resource type that can be created through [`ResourceManager::create`].
pub trait ResourceKind: Sized {
    type Desc;

    fn into_payload(desc: Self::Desc) -> ResourcePayload;

    fn from_resource(resource: Resource) -> Self;
}

struct Slot {
    generation: u32,
    resource: Option<Arc<ResourceImpl>>,
}

struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

pub(crate) struct ManagerShared {
    backend: Arc<dyn DeviceBackend>,
    slots: Mutex<Slots>,
}

impl ManagerShared {
    fn insert(self: &Arc<Self>, payload: ResourcePayload, shared: bool) -> Resource {
        let object_type = payload.object_type();

        let mut guard = self.slots.lock().unwrap();
        let index = match guard.free.pop() {
            Some(index) => index,
            None => {
                let index = guard.entries.len();
                if index as u64 > ResourceId::INDEX_MAX {
                    panic!("Resource arena exhausted");
                }
                guard.entries.push(Slot {
                    generation: 0,
                    resource: None,
                });
                index as u32
            }
        };

        let slot = &mut guard.entries[index as usize];
        let id = ResourceId::make(index, slot.generation, object_type);
        let resource = Arc::new(ResourceImpl::new(id, Arc::downgrade(self), payload, shared));
        slot.resource = Some(resource.clone());
        guard.live += 1;

        Resource::from_impl(resource)
    }

    /// Physically deletes a resource.
    ///
    /// Only called by the resource itself once it has been destroyed and is no longer bound.
    pub(crate) fn destroy(&self, resource: &ResourceImpl) {
        let id = resource_id(resource);

        let removed = {
            let mut guard = self.slots.lock().unwrap();
            let slot = guard.entries.get_mut(id.get_index() as usize)
                .unwrap_or_else(|| panic!("Destroyed unknown resource {:?}", id));

            assert_eq!(slot.generation & (ResourceId::GENERATION_MAX as u32), id.get_generation(), "Destroyed stale resource {:?}", id);
            let removed = slot.resource.take()
                .unwrap_or_else(|| panic!("Resource {:?} destroyed twice", id));

            slot.generation = slot.generation.wrapping_add(1);
            guard.free.push(id.get_index());
            guard.live -= 1;

            removed
        };

        log::trace!("Destroying resource {:?}", id);
        unsafe {
            removed.get_payload().destroy(self.backend.as_ref());
        }
    }

    fn is_live(&self, id: ResourceId) -> bool {
        let guard = self.slots.lock().unwrap();
        match guard.entries.get(id.get_index() as usize) {
            Some(slot) => slot.resource.as_ref().map(|r| resource_id(r) == id).unwrap_or(false),
            None => false,
        }
    }
}

fn resource_id(resource: &ResourceImpl) -> ResourceId {
    resource.get_id()
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let guard = self.slots.lock().unwrap();
        if guard.live == 0 {
            return;
        }

        for slot in guard.entries.iter() {
            if let Some(resource) = &slot.resource {
                log::error!("Resource {:?} leaked past resource manager shutdown", resource_id(resource));
            }
        }

        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!("{} resources leaked past resource manager shutdown", guard.live);
        }
    }
}

/// Creates resources for one logical device and performs their deferred deletion.
#[derive(Clone)]
pub struct ResourceManager(Arc<ManagerShared>);

impl ResourceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self(Arc::new(ManagerShared {
            backend,
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }))
    }

    pub fn get_backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.0.backend
    }

    /// Creates a new resource of type `T`.
    ///
    /// If `shared` is true the resource may be used by multiple queue families concurrently.
    pub fn create<T: ResourceKind>(&self, desc: T::Desc, shared: bool) -> T {
        T::from_resource(self.0.insert(T::into_payload(desc), shared))
    }

    /// Creates a resource without native objects. Useful to track the lifetime of externally
    /// managed objects.
    pub fn create_generic(&self, shared: bool) -> Resource {
        self.0.insert(ResourcePayload::None, shared)
    }

    /// Creates a binary semaphore. Semaphores are always shared.
    pub fn create_semaphore(&self) -> Result<Semaphore, DeviceError> {
        let handle = unsafe { self.0.backend.create_semaphore() }.map_err(|err| {
            log::error!("Failed to create semaphore {:?}", err);
            DeviceError::from(err)
        })?;

        Ok(self.create::<Semaphore>(handle, true))
    }

    pub fn create_event(&self) -> Result<Event, DeviceError> {
        let handle = unsafe { self.0.backend.create_event() }.map_err(|err| {
            log::error!("Failed to create event {:?}", err);
            DeviceError::from(err)
        })?;

        Ok(self.create::<Event>(handle, false))
    }

    /// Returns true if the resource has not been physically deleted yet.
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.0.is_live(id)
    }

    pub fn live_count(&self) -> usize {
        self.0.slots.lock().unwrap().live
    }

    /// Counts live resources of a specific [`ObjectType`].
    pub fn live_count_of(&self, object_type: u8) -> usize {
        let guard = self.0.slots.lock().unwrap();
        guard.entries.iter()
            .filter_map(|slot| slot.resource.as_ref())
            .filter(|r| resource_id(r).get_type() == object_type)
            .count()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.live_count_of(ObjectType::SEMAPHORE)
    }
}

assert_impl_all!(ResourceManager: Send, Sync, UnwindSafe, RefUnwindSafe);

#[cfg(test)]
mod tests {
    use ash::vk;
    use ash::vk::Handle;

    use crate::objects::buffer::{Buffer, BufferDesc};
    use crate::test::*;

    use super::*;

    #[test]
    fn test_create_destroy() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());

        let buffer = manager.create::<Buffer>(BufferDesc::new(backend.make(), 256), false);
        let generic = manager.create_generic(true);
        assert_eq!(manager.live_count(), 2);
        assert_eq!(manager.live_count_of(ObjectType::BUFFER), 1);
        assert_eq!(buffer.as_resource().get_id().get_type(), ObjectType::BUFFER);

        let handle = buffer.get_handle();
        buffer.as_resource().destroy();
        generic.destroy();
        assert_eq!(manager.live_count(), 0);
        assert_eq!(backend.count_calls(|c| matches!(c, Call::DestroyBuffer(h) if *h == handle.as_raw())), 1);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());

        let first = manager.create_generic(false);
        let first_id = first.get_id();
        first.destroy();

        let second = manager.create_generic(false);
        assert_eq!(second.get_id().get_index(), first_id.get_index());
        assert_ne!(second.get_id(), first_id);
        assert!(!manager.is_live(first_id));
        assert!(manager.is_live(second.get_id()));

        second.destroy();
    }

    #[test]
    fn test_external_buffer_not_destroyed() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());

        let buffer = manager.create::<Buffer>(BufferDesc::new(backend.make(), 16).external(), false);
        buffer.as_resource().destroy();
        assert_eq!(backend.count_calls(|c| matches!(c, Call::DestroyBuffer(_))), 0);
    }

    #[test]
    fn test_semaphore() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());

        let semaphore = manager.create_semaphore().unwrap();
        assert!(!semaphore.as_resource().is_exclusive());
        assert_ne!(semaphore.get_handle(), vk::Semaphore::null());
        assert_eq!(manager.live_semaphore_count(), 1);
        semaphore.as_resource().destroy();
        assert_eq!(manager.live_semaphore_count(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "leaked")]
    fn test_leak_detection() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());

        let _resource = manager.create_generic(false);
        drop(manager);
    }
}
