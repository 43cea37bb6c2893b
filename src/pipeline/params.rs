//! Descriptor sets together with the resources they reference.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::command::cmd_buffer::CmdBuffer;
use crate::command::subresource::ResourceUsage;
use crate::device::backend::DescriptorWrite;
use crate::objects::buffer::Buffer;
use crate::objects::descriptor::DescriptorSet;
use crate::objects::image::Image;
use crate::objects::resource::UseFlags;

#[derive(Clone, Debug)]
pub enum ParamBinding {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: Buffer,
        access: vk::AccessFlags,
    },
    Image {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        image: Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
        write: bool,
    },
}

/// One descriptor set and the bindings written into it.
pub struct ParamSet {
    set: DescriptorSet,
    bindings: Vec<ParamBinding>,
}

impl ParamSet {
    pub fn new(set: DescriptorSet) -> Self {
        Self {
            set,
            bindings: Vec::new(),
        }
    }

    pub fn buffer(mut self, binding: u32, descriptor_type: vk::DescriptorType, buffer: Buffer, access: vk::AccessFlags) -> Self {
        self.bindings.push(ParamBinding::Buffer {
            binding,
            descriptor_type,
            buffer,
            access,
        });
        self
    }

    /// Binds an image view. `layout` is the layout the shader expects outside of render passes,
    /// attachments of the current render target are written with their render pass layout.
    #[allow(clippy::too_many_arguments)]
    pub fn image(mut self, binding: u32, descriptor_type: vk::DescriptorType, image: Image, view: vk::ImageView, sampler: vk::Sampler, range: vk::ImageSubresourceRange, layout: vk::ImageLayout, write: bool) -> Self {
        self.bindings.push(ParamBinding::Image {
            binding,
            descriptor_type,
            image,
            view,
            sampler,
            range,
            layout,
            write,
        });
        self
    }

    pub fn get_set(&self) -> &DescriptorSet {
        &self.set
    }

    pub fn get_bindings(&self) -> &[ParamBinding] {
        &self.bindings
    }
}

/// Last value written per binding. Buffers only need to be written once.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Written {
    No,
    Buffer,
    Image(vk::ImageLayout),
}

struct GpuParamsInner {
    sets: Vec<ParamSet>,
    written: Mutex<Vec<Vec<Written>>>,
}

/// Descriptor sets bound together.
///
/// Binding the parameters registers every referenced resource on the command buffer. Image
/// descriptors are rewritten whenever the layout an image is in at the time of the draw or dispatch
/// changes, for example when it becomes an attachment of the render target.
#[derive(Clone)]
pub struct GpuParams(Arc<GpuParamsInner>);

impl GpuParams {
    pub fn new(sets: Vec<ParamSet>) -> Self {
        let written = sets.iter().map(|set| vec![Written::No; set.bindings.len()]).collect();
        Self(Arc::new(GpuParamsInner {
            sets,
            written: Mutex::new(written),
        }))
    }

    pub fn get_sets(&self) -> &[ParamSet] {
        &self.0.sets
    }

    /// Registers the referenced resources, updates stale descriptors and returns the set handles in
    /// binding order.
    ///
    /// Registration may end the active render pass, `in_render_pass` selects the layouts for the
    /// render pass the next draw happens in.
    pub(crate) fn prepare_for_bind(&self, cmd: &mut CmdBuffer, in_render_pass: bool) -> Vec<vk::DescriptorSet> {
        let mut written = self.0.written.lock().unwrap();
        let mut handles = Vec::with_capacity(self.0.sets.len());

        for (set, written) in self.0.sets.iter().zip(written.iter_mut()) {
            cmd.register_resource(set.set.as_resource(), UseFlags::READ);

            let mut writes = Vec::new();
            for (binding, written) in set.bindings.iter().zip(written.iter_mut()) {
                match binding {
                    ParamBinding::Buffer { binding, descriptor_type, buffer, access } => {
                        let flags = if access.contains(vk::AccessFlags::SHADER_WRITE) { UseFlags::READ_WRITE } else { UseFlags::READ };
                        cmd.register_buffer(buffer, *access, flags);

                        if *written == Written::No {
                            writes.push(DescriptorWrite::Buffer {
                                binding: *binding,
                                descriptor_type: *descriptor_type,
                                buffer: buffer.get_handle(),
                                offset: 0,
                                range: vk::WHOLE_SIZE,
                            });
                            *written = Written::Buffer;
                        }
                    }
                    ParamBinding::Image { binding, descriptor_type, image, view, sampler, range, layout, write } => {
                        let flags = if *write { UseFlags::READ_WRITE } else { UseFlags::READ };
                        cmd.register_image(image, range, *layout, *layout, flags, ResourceUsage::ShaderBind);

                        let current = cmd.get_current_layout(image, range, in_render_pass);
                        if *written != Written::Image(current) {
                            writes.push(DescriptorWrite::Image {
                                binding: *binding,
                                descriptor_type: *descriptor_type,
                                view: *view,
                                sampler: *sampler,
                                layout: current,
                            });
                            *written = Written::Image(current);
                        }
                    }
                }
            }

            if !writes.is_empty() {
                log::trace!("Updating {} descriptors of set {:?}", writes.len(), set.set.as_resource().get_id());
                unsafe { cmd.get_backend().update_descriptor_set(set.set.get_handle(), &writes) };
            }

            handles.push(set.set.get_handle());
        }

        handles
    }

    pub fn ptr_eq(&self, other: &GpuParams) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

assert_impl_all!(GpuParams: Send, Sync);
