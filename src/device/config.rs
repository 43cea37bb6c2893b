use std::time::Duration;

use crate::command::sync_mask::MAX_QUEUES_PER_TYPE;

/// Limits and timeouts applied to a [`crate::device::Device`].
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    max_cmd_buffers_per_family: u32,
    max_dependencies: u32,
    fence_timeout: Duration,
    descriptor_pool_sets: u32,
    descriptor_pool_sizes: Vec<(ash::vk::DescriptorType, u32)>,
}

impl DeviceConfig {
    pub const DEFAULT_MAX_DEPENDENCIES: u32 = 2;

    pub fn new() -> Self {
        Self {
            max_cmd_buffers_per_family: MAX_QUEUES_PER_TYPE * 32,
            max_dependencies: Self::DEFAULT_MAX_DEPENDENCIES,
            fence_timeout: Duration::from_secs(1),
            descriptor_pool_sets: 8192,
            descriptor_pool_sizes: vec![
                (ash::vk::DescriptorType::SAMPLER, 4096),
                (ash::vk::DescriptorType::SAMPLED_IMAGE, 4096),
                (ash::vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4096),
                (ash::vk::DescriptorType::STORAGE_IMAGE, 2048),
                (ash::vk::DescriptorType::UNIFORM_BUFFER, 4096),
                (ash::vk::DescriptorType::STORAGE_BUFFER, 2048),
                (ash::vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1024),
                (ash::vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1024),
            ],
        }
    }

    /// Sets the maximum number of command buffers that may exist for a single queue family.
    /// Requesting more is a fatal error.
    pub fn set_max_cmd_buffers_per_family(&mut self, max: u32) -> &mut Self {
        assert!(max > 0);
        self.max_cmd_buffers_per_family = max;
        self
    }

    /// Sets how many other queues may wait on a single submitted command buffer.
    pub fn set_max_dependencies(&mut self, max: u32) -> &mut Self {
        self.max_dependencies = max;
        self
    }

    pub fn set_fence_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn set_descriptor_pool_sets(&mut self, sets: u32) -> &mut Self {
        assert!(sets > 0);
        self.descriptor_pool_sets = sets;
        self
    }

    pub fn set_descriptor_pool_size(&mut self, ty: ash::vk::DescriptorType, count: u32) -> &mut Self {
        if let Some(entry) = self.descriptor_pool_sizes.iter_mut().find(|(t, _)| *t == ty) {
            entry.1 = count;
        } else {
            self.descriptor_pool_sizes.push((ty, count));
        }
        self
    }

    pub fn get_max_cmd_buffers_per_family(&self) -> u32 {
        self.max_cmd_buffers_per_family
    }

    pub fn get_max_dependencies(&self) -> u32 {
        self.max_dependencies
    }

    pub fn get_fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    /// The fence timeout in nanoseconds as expected by `vkWaitForFences`.
    pub fn get_fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn get_descriptor_pool_sets(&self) -> u32 {
        self.descriptor_pool_sets
    }

    pub fn get_descriptor_pool_sizes(&self) -> &[(ash::vk::DescriptorType, u32)] {
        &self.descriptor_pool_sizes
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::new();
        assert_eq!(config.get_max_cmd_buffers_per_family(), 256);
        assert_eq!(config.get_max_dependencies(), 2);
        assert_eq!(config.get_fence_timeout_ns(), 1_000_000_000);
    }

    #[test]
    fn test_setters() {
        let mut config = DeviceConfig::new();
        config.set_max_cmd_buffers_per_family(4)
            .set_max_dependencies(3)
            .set_descriptor_pool_size(ash::vk::DescriptorType::INPUT_ATTACHMENT, 16)
            .set_descriptor_pool_size(ash::vk::DescriptorType::SAMPLER, 1);

        assert_eq!(config.get_max_cmd_buffers_per_family(), 4);
        assert_eq!(config.get_max_dependencies(), 3);
        assert!(config.get_descriptor_pool_sizes().contains(&(ash::vk::DescriptorType::INPUT_ATTACHMENT, 16)));
        assert!(config.get_descriptor_pool_sizes().contains(&(ash::vk::DescriptorType::SAMPLER, 1)));
    }
}
