use ash::vk;

use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

/// A native graphics or compute pipeline.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Pipeline(Resource);

impl Pipeline {
    pub fn get_handle(&self) -> vk::Pipeline {
        match self.0.get_payload() {
            ResourcePayload::Pipeline(handle) => *handle,
            _ => unreachable!(),
        }
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }
}

impl ResourceKind for Pipeline {
    type Desc = vk::Pipeline;

    fn into_payload(desc: vk::Pipeline) -> ResourcePayload {
        ResourcePayload::Pipeline(desc)
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}
