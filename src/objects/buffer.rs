use ash::vk;

use crate::device::backend::DeviceBackend;
use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

/// Contains a description for a vulkan buffer.
///
/// The buffer and its memory are created by the caller. If the buffer is owned it is destroyed
/// together with the resource.
#[derive(Copy, Clone, Debug)]
pub struct BufferDesc {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub owned: bool,
}

impl BufferDesc {
    pub fn new(handle: vk::Buffer, size: vk::DeviceSize) -> Self {
        Self {
            handle,
            size,
            owned: true,
        }
    }

    /// Marks the buffer as externally owned. The handle is not destroyed with the resource.
    pub fn external(mut self) -> Self {
        self.owned = false;
        self
    }
}

pub struct BufferData {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    owned: bool,
}

impl BufferData {
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        if self.owned {
            backend.destroy_buffer(self.handle);
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Buffer(Resource);

impl Buffer {
    fn data(&self) -> &BufferData {
        match self.0.get_payload() {
            ResourcePayload::Buffer(data) => data,
            _ => unreachable!(),
        }
    }

    pub fn get_handle(&self) -> vk::Buffer {
        self.data().handle
    }

    pub fn get_size(&self) -> vk::DeviceSize {
        self.data().size
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }
}

impl ResourceKind for Buffer {
    type Desc = BufferDesc;

    fn into_payload(desc: BufferDesc) -> ResourcePayload {
        ResourcePayload::Buffer(BufferData {
            handle: desc.handle,
            size: desc.size,
            owned: desc.owned,
        })
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}
