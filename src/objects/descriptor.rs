use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;

use crate::device::backend::DeviceBackend;
use crate::device::config::DeviceConfig;
use crate::device::error::DeviceError;
use crate::objects::manager::{ResourceKind, ResourceManager};
use crate::objects::resource::{Resource, ResourcePayload};

struct PoolShared {
    backend: Arc<dyn DeviceBackend>,
    handle: vk::DescriptorPool,
    capacity: u32,
    allocated: AtomicU32,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        unsafe {
            self.backend.destroy_descriptor_pool(self.handle);
        }
    }
}

/// A fixed capacity descriptor pool.
///
/// Every allocated set keeps the pool alive. Exceeding the capacity is a fatal error.
#[derive(Clone)]
pub struct DescriptorPool(Arc<PoolShared>);

impl DescriptorPool {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: &DeviceConfig) -> Result<Self, DeviceError> {
        let sizes: Vec<_> = config.get_descriptor_pool_sizes().iter().map(|(ty, count)| {
            vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: *count,
            }
        }).collect();
        let capacity = config.get_descriptor_pool_sets();

        let handle = unsafe { backend.create_descriptor_pool(capacity, &sizes) }.map_err(|err| {
            log::error!("Failed to create descriptor pool {:?}", err);
            DeviceError::from(err)
        })?;

        Ok(Self(Arc::new(PoolShared {
            backend,
            handle,
            capacity,
            allocated: AtomicU32::new(0),
        })))
    }

    pub fn get_handle(&self) -> vk::DescriptorPool {
        self.0.handle
    }

    pub fn get_capacity(&self) -> u32 {
        self.0.capacity
    }

    pub fn get_allocated(&self) -> u32 {
        self.0.allocated.load(Ordering::Acquire)
    }

    pub fn allocate(&self, manager: &ResourceManager, layout: vk::DescriptorSetLayout) -> Result<DescriptorSet, DeviceError> {
        let previous = self.0.allocated.fetch_add(1, Ordering::AcqRel);
        assert!(previous < self.0.capacity, "Descriptor pool exhausted ({} sets)", self.0.capacity);

        let handle = match unsafe { self.0.backend.allocate_descriptor_set(self.0.handle, layout) } {
            Ok(handle) => handle,
            Err(err) => {
                self.0.allocated.fetch_sub(1, Ordering::AcqRel);
                log::error!("Failed to allocate descriptor set {:?}", err);
                return Err(DeviceError::from(err));
            }
        };

        Ok(manager.create::<DescriptorSet>(DescriptorSetDesc {
            handle,
            layout,
            pool: self.clone(),
        }, false))
    }
}

pub struct DescriptorSetDesc {
    handle: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
}

pub struct DescriptorSetData {
    handle: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
}

impl DescriptorSetData {
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        backend.free_descriptor_set(self.pool.get_handle(), self.handle);
        self.pool.0.allocated.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorSet(Resource);

impl DescriptorSet {
    fn data(&self) -> &DescriptorSetData {
        match self.0.get_payload() {
            ResourcePayload::DescriptorSet(data) => data,
            _ => unreachable!(),
        }
    }

    pub fn get_handle(&self) -> vk::DescriptorSet {
        self.data().handle
    }

    pub fn get_layout(&self) -> vk::DescriptorSetLayout {
        self.data().layout
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }
}

impl ResourceKind for DescriptorSet {
    type Desc = DescriptorSetDesc;

    fn into_payload(desc: DescriptorSetDesc) -> ResourcePayload {
        ResourcePayload::DescriptorSet(DescriptorSetData {
            handle: desc.handle,
            layout: desc.layout,
            pool: desc.pool,
        })
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use crate::test::*;

    use super::*;

    fn small_config() -> DeviceConfig {
        let mut config = DeviceConfig::new();
        config.set_descriptor_pool_sets(2);
        config
    }

    #[test]
    fn test_allocate_free() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let pool = DescriptorPool::new(backend.clone(), &small_config()).unwrap();

        let set = pool.allocate(&manager, backend.make()).unwrap();
        assert_eq!(pool.get_allocated(), 1);

        let handle = set.get_handle();
        set.as_resource().destroy();
        assert_eq!(pool.get_allocated(), 0);
        assert_eq!(backend.count_calls(|c| matches!(c, Call::FreeDescriptorSet(h) if *h == handle.as_raw())), 1);

        drop(set);
        drop(pool);
        assert_eq!(backend.count_calls(|c| matches!(c, Call::DestroyDescriptorPool(_))), 1);
    }

    #[test]
    fn test_sets_keep_pool_alive() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let pool = DescriptorPool::new(backend.clone(), &small_config()).unwrap();

        let set = pool.allocate(&manager, backend.make()).unwrap();
        drop(pool);
        assert_eq!(backend.count_calls(|c| matches!(c, Call::DestroyDescriptorPool(_))), 0);

        set.as_resource().destroy();
        drop(set);
        assert_eq!(backend.count_calls(|c| matches!(c, Call::DestroyDescriptorPool(_))), 1);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhaustion() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let pool = DescriptorPool::new(backend.clone(), &small_config()).unwrap();

        let _a = pool.allocate(&manager, backend.make()).unwrap();
        let _b = pool.allocate(&manager, backend.make()).unwrap();
        let _c = pool.allocate(&manager, backend.make()).unwrap();
    }
}
