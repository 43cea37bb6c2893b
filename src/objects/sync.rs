use ash::vk;

use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

/// A binary semaphore.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Semaphore(Resource);

impl Semaphore {
    pub fn get_handle(&self) -> vk::Semaphore {
        match self.0.get_payload() {
            ResourcePayload::Semaphore(handle) => *handle,
            _ => unreachable!(),
        }
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }
}

impl ResourceKind for Semaphore {
    type Desc = vk::Semaphore;

    fn into_payload(desc: vk::Semaphore) -> ResourcePayload {
        ResourcePayload::Semaphore(desc)
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Event(Resource);

impl Event {
    pub fn get_handle(&self) -> vk::Event {
        match self.0.get_payload() {
            ResourcePayload::Event(handle) => *handle,
            _ => unreachable!(),
        }
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }
}

impl ResourceKind for Event {
    type Desc = vk::Event;

    fn into_payload(desc: vk::Event) -> ResourcePayload {
        ResourcePayload::Event(desc)
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}
