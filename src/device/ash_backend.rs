use ash::prelude::VkResult;
use ash::vk;

use crate::device::backend::*;

/// [`DeviceBackend`] forwarding every call to an [`ash::Device`].
///
/// The backend does not own the device. Destroying the device after all users of the backend
/// are gone is the responsibility of the caller.
pub struct AshBackend {
    device: ash::Device,
}

impl AshBackend {
    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
        }
    }

    pub fn vk(&self) -> &ash::Device {
        &self.device
    }
}

impl DeviceBackend for AshBackend {
    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        self.device.create_semaphore(&info, None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None)
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let info = vk::FenceCreateInfo::builder().flags(flags);
        self.device.create_fence(&info, None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None)
    }

    unsafe fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.device.get_fence_status(fence)
    }

    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        self.device.wait_for_fences(fences, true, timeout)
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        self.device.reset_fences(fences)
    }

    unsafe fn create_event(&self) -> VkResult<vk::Event> {
        let info = vk::EventCreateInfo::builder();
        self.device.create_event(&info, None)
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        self.device.destroy_event(event, None)
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.device.destroy_query_pool(pool, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.device.destroy_buffer(buffer, None)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.device.destroy_image(image, None)
    }

    unsafe fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        self.device.create_command_pool(&info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None)
    }

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool, secondary: bool) -> VkResult<vk::CommandBuffer> {
        let level = if secondary {
            vk::CommandBufferLevel::SECONDARY
        } else {
            vk::CommandBufferLevel::PRIMARY
        };

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        Ok(*self.device.allocate_command_buffers(&info)?.get(0).ok_or(vk::Result::ERROR_UNKNOWN)?)
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.device.free_command_buffers(pool, std::slice::from_ref(&command_buffer))
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, secondary: bool) -> VkResult<()> {
        let inheritance = vk::CommandBufferInheritanceInfo::builder();

        let mut info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if secondary {
            info = info.inheritance_info(&inheritance);
        }

        self.device.begin_command_buffer(command_buffer, &info)
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(command_buffer)
    }

    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
    }

    unsafe fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let attachments: Vec<_> = desc.attachments.iter().map(|attachment| {
            vk::AttachmentDescription::builder()
                .format(attachment.format)
                .samples(attachment.samples)
                .load_op(attachment.load_op)
                .store_op(attachment.store_op)
                .stencil_load_op(attachment.stencil_load_op)
                .stencil_store_op(attachment.stencil_store_op)
                .initial_layout(attachment.initial_layout)
                .final_layout(attachment.final_layout)
                .build()
        }).collect();

        let color_refs: Vec<_> = desc.color_layouts.iter().enumerate().map(|(index, layout)| {
            vk::AttachmentReference {
                attachment: index as u32,
                layout: *layout,
            }
        }).collect();

        let depth_ref = vk::AttachmentReference {
            attachment: desc.color_layouts.len() as u32,
            layout: desc.depth_layout,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.has_depth {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpass = subpass.build();

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass));

        self.device.create_render_pass(&info, None)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.device.destroy_render_pass(render_pass, None)
    }

    unsafe fn create_framebuffer(&self, render_pass: vk::RenderPass, views: &[vk::ImageView], extent: vk::Extent2D, layers: u32) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);

        self.device.create_framebuffer(&info, None)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.device.destroy_framebuffer(framebuffer, None)
    }

    unsafe fn create_graphics_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> VkResult<vk::Pipeline> {
        let desc = info.desc;

        let shader_stages: Vec<_> = desc.stages.iter().map(|stage| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage.stage)
                .module(stage.module)
                .name(stage.entry.as_c_str())
                .build()
        }).collect();

        let input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(info.vertex_input.get_bindings())
            .vertex_attribute_descriptions(info.vertex_input.get_attributes());

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(info.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1f32);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(info.samples)
            .sample_shading_enable(false);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write && !info.depth_read_only)
            .depth_compare_op(desc.depth_compare_op)
            .stencil_test_enable(desc.stencil_test);

        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(desc.blend_enable)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build();
        let blend_attachments = vec![blend_attachment; info.color_attachment_count as usize];

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(info.render_pass)
            .subpass(0)
            .build();

        let pipelines = self.device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&create_info), None)
            .map_err(|(_, err)| err)?;

        pipelines.get(0).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn create_compute_pipeline(&self, layout: vk::PipelineLayout, stage: &ShaderStage) -> VkResult<vk::Pipeline> {
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage.stage)
            .module(stage.module)
            .name(stage.entry.as_c_str());

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(*stage_info)
            .layout(layout)
            .build();

        let pipelines = self.device.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&create_info), None)
            .map_err(|(_, err)| err)?;

        pipelines.get(0).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device.destroy_pipeline(pipeline, None)
    }

    unsafe fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);

        self.device.create_descriptor_pool(&info, None)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device.destroy_descriptor_pool(pool, None)
    }

    unsafe fn allocate_descriptor_set(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&layout));

        Ok(*self.device.allocate_descriptor_sets(&info)?.get(0).ok_or(vk::Result::ERROR_UNKNOWN)?)
    }

    unsafe fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(err) = self.device.free_descriptor_sets(pool, std::slice::from_ref(&set)) {
            log::error!("Failed to free descriptor set {:?}", err);
        }
    }

    unsafe fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<_> = writes.iter().map(|write| match write {
            DescriptorWrite::Buffer { buffer, offset, range, .. } => vk::DescriptorBufferInfo {
                buffer: *buffer,
                offset: *offset,
                range: *range,
            },
            _ => vk::DescriptorBufferInfo::default(),
        }).collect();

        let image_infos: Vec<_> = writes.iter().map(|write| match write {
            DescriptorWrite::Image { view, sampler, layout, .. } => vk::DescriptorImageInfo {
                sampler: *sampler,
                image_view: *view,
                image_layout: *layout,
            },
            _ => vk::DescriptorImageInfo::default(),
        }).collect();

        let infos: Vec<_> = writes.iter().enumerate().map(|(index, write)| {
            let info = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(write.get_binding())
                .dst_array_element(0);

            match write {
                DescriptorWrite::Buffer { descriptor_type, .. } => info
                    .descriptor_type(*descriptor_type)
                    .buffer_info(std::slice::from_ref(&buffer_infos[index]))
                    .build(),
                DescriptorWrite::Image { descriptor_type, .. } => info
                    .descriptor_type(*descriptor_type)
                    .image_info(std::slice::from_ref(&image_infos[index]))
                    .build(),
            }
        }).collect();

        self.device.update_descriptor_sets(&infos, &[]);
    }

    unsafe fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, src_stage_mask: vk::PipelineStageFlags, dst_stage_mask: vk::PipelineStageFlags, memory_barriers: &[vk::MemoryBarrier], buffer_barriers: &[vk::BufferMemoryBarrier], image_barriers: &[vk::ImageMemoryBarrier]) {
        self.device.cmd_pipeline_barrier(
            command_buffer,
            src_stage_mask,
            dst_stage_mask,
            vk::DependencyFlags::empty(),
            memory_barriers,
            buffer_barriers,
            image_barriers
        )
    }

    unsafe fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        self.device.cmd_begin_render_pass(command_buffer, info, vk::SubpassContents::INLINE)
    }

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.device.cmd_end_render_pass(command_buffer)
    }

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.device.cmd_bind_pipeline(command_buffer, bind_point, pipeline)
    }

    unsafe fn cmd_bind_descriptor_sets(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, layout: vk::PipelineLayout, first_set: u32, sets: &[vk::DescriptorSet]) {
        self.device.cmd_bind_descriptor_sets(command_buffer, bind_point, layout, first_set, sets, &[])
    }

    unsafe fn cmd_bind_vertex_buffers(&self, command_buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        self.device.cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
    }

    unsafe fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.device.cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
    }

    unsafe fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.device.cmd_set_viewport(command_buffer, 0, std::slice::from_ref(viewport))
    }

    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &vk::Rect2D) {
        self.device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(scissor))
    }

    unsafe fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        self.device.cmd_set_stencil_reference(command_buffer, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
    }

    unsafe fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.device.cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance)
    }

    unsafe fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        self.device.cmd_draw_indexed(command_buffer, index_count, instance_count, first_index, vertex_offset, first_instance)
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(command_buffer, x, y, z)
    }

    unsafe fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event, stage_mask: vk::PipelineStageFlags) {
        self.device.cmd_set_event(command_buffer, event, stage_mask)
    }

    unsafe fn cmd_reset_query_pool(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.device.cmd_reset_query_pool(command_buffer, pool, first_query, query_count)
    }

    unsafe fn cmd_begin_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32, flags: vk::QueryControlFlags) {
        self.device.cmd_begin_query(command_buffer, pool, query, flags)
    }

    unsafe fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        self.device.cmd_end_query(command_buffer, pool, query)
    }

    unsafe fn cmd_write_timestamp(&self, command_buffer: vk::CommandBuffer, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        self.device.cmd_write_timestamp(command_buffer, stage, pool, query)
    }

    unsafe fn cmd_clear_attachments(&self, command_buffer: vk::CommandBuffer, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        self.device.cmd_clear_attachments(command_buffer, attachments, rects)
    }

    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        self.device.queue_submit(queue, submits, fence)
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.device.queue_wait_idle(queue)
    }
}

static_assertions::assert_impl_all!(AshBackend: Send, Sync);
