use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;

use crate::command::cmd_buffer::{CmdBuffer, CmdBufferState};
use crate::device::backend::DeviceBackend;
use crate::device::config::DeviceConfig;
use crate::device::error::DeviceError;
use crate::objects::manager::ResourceManager;

/// The native command pool of one queue family.
///
/// Every command buffer allocated from the pool keeps it alive, the pool is destroyed once the last
/// of them is dropped.
pub(crate) struct FamilyShared {
    backend: Arc<dyn DeviceBackend>,
    handle: vk::CommandPool,
    queue_family: u32,
    live: AtomicU32,
}

impl FamilyShared {
    pub(crate) fn get_backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub(crate) fn get_handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub(crate) fn get_queue_family(&self) -> u32 {
        self.queue_family
    }

    pub(crate) fn notify_allocated(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn notify_freed(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for FamilyShared {
    fn drop(&mut self) {
        unsafe {
            self.backend.destroy_command_pool(self.handle);
        }
    }
}

struct FamilyPool {
    shared: Arc<FamilyShared>,
    primary: Vec<CmdBuffer>,
    secondary: Vec<CmdBuffer>,
}

/// Hands out command buffers per queue family and takes back buffers that finished executing.
///
/// The number of command buffers per family is capped by
/// [`DeviceConfig::get_max_cmd_buffers_per_family`]. Requesting more is a fatal error.
pub struct CmdBufferPool {
    manager: ResourceManager,
    config: DeviceConfig,
    families: HashMap<u32, FamilyPool>,
    next_id: u32,
}

impl CmdBufferPool {
    pub fn new<I: IntoIterator<Item = u32>>(manager: ResourceManager, config: &DeviceConfig, queue_families: I) -> Result<Self, DeviceError> {
        let backend = manager.get_backend().clone();

        let mut families = HashMap::new();
        for queue_family in queue_families {
            if families.contains_key(&queue_family) {
                continue;
            }

            let handle = unsafe { backend.create_command_pool(queue_family) }.map_err(|err| {
                log::error!("Failed to create command pool for queue family {} {:?}", queue_family, err);
                DeviceError::from(err)
            })?;

            families.insert(queue_family, FamilyPool {
                shared: Arc::new(FamilyShared {
                    backend: backend.clone(),
                    handle,
                    queue_family,
                    live: AtomicU32::new(0),
                }),
                primary: Vec::new(),
                secondary: Vec::new(),
            });
        }

        Ok(Self {
            manager,
            config: config.clone(),
            families,
            next_id: 0,
        })
    }

    /// Returns a command buffer in the ready state, reusing a recycled one if possible.
    pub fn get_buffer(&mut self, queue_family: u32, secondary: bool) -> Result<CmdBuffer, DeviceError> {
        let family = self.families.get_mut(&queue_family)
            .unwrap_or_else(|| panic!("No command pool for queue family {}", queue_family));

        let ready = if secondary { &mut family.secondary } else { &mut family.primary };
        if let Some(buffer) = ready.pop() {
            return Ok(buffer);
        }

        let max = self.config.get_max_cmd_buffers_per_family();
        let live = family.shared.live.load(Ordering::Acquire);
        assert!(live < max, "Command buffer pool exhausted ({} buffers for queue family {})", max, queue_family);

        let id = self.next_id;
        self.next_id += 1;

        log::debug!("Allocating command buffer {} for queue family {}", id, queue_family);
        CmdBuffer::new(family.shared.clone(), self.manager.clone(), id, secondary, &self.config)
    }

    /// Returns a ready buffer to the pool.
    pub fn recycle(&mut self, buffer: CmdBuffer) {
        assert_eq!(buffer.get_state(), CmdBufferState::Ready, "Only ready command buffers can be recycled");

        if let Some(family) = self.families.get_mut(&buffer.get_queue_family()) {
            if buffer.is_secondary() {
                family.secondary.push(buffer);
            } else {
                family.primary.push(buffer);
            }
        }
    }

    /// Number of command buffers of the family that currently exist, including recycled ones.
    pub fn get_live_count(&self, queue_family: u32) -> u32 {
        self.families.get(&queue_family).map(|f| f.shared.live.load(Ordering::Acquire)).unwrap_or(0)
    }

    pub fn get_ready_count(&self, queue_family: u32) -> usize {
        self.families.get(&queue_family).map(|f| f.primary.len() + f.secondary.len()).unwrap_or(0)
    }
}
