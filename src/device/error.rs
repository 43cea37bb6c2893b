use std::fmt::{Display, Formatter};

use ash::vk;

/// Failure reported by the driver while recording, submitting or waiting.
///
/// Contract violations by the caller are never reported through this type, they panic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    DeviceLost,
    Other(vk::Result),
}

impl DeviceError {
    pub fn is_device_lost(&self) -> bool {
        *self == DeviceError::DeviceLost
    }
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
            other => DeviceError::Other(other),
        }
    }
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::OutOfHostMemory => f.write_str("out of host memory"),
            DeviceError::OutOfDeviceMemory => f.write_str("out of device memory"),
            DeviceError::DeviceLost => f.write_str("device lost"),
            DeviceError::Other(result) => f.write_fmt(format_args!("vulkan error {:?}", result)),
        }
    }
}

impl std::error::Error for DeviceError {
}
