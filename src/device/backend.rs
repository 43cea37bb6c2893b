use std::ffi::CString;
use std::panic::{RefUnwindSafe, UnwindSafe};

use ash::prelude::VkResult;
use ash::vk;

use crate::pipeline::vertex::VertexInput;

/// The native calls issued by this crate.
///
/// All functions are thin wrappers around the Vulkan entry points of the same name and carry the
/// same safety requirements. [`crate::device::ash_backend::AshBackend`] forwards them to an
/// [`ash::Device`].
pub trait DeviceBackend: Send + Sync + UnwindSafe + RefUnwindSafe {
    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    unsafe fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()>;

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    unsafe fn create_event(&self) -> VkResult<vk::Event>;

    unsafe fn destroy_event(&self, event: vk::Event);

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool);

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn destroy_image(&self, image: vk::Image);

    unsafe fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool, secondary: bool) -> VkResult<vk::CommandBuffer>;

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, secondary: bool) -> VkResult<()>;

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass>;

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    unsafe fn create_framebuffer(&self, render_pass: vk::RenderPass, views: &[vk::ImageView], extent: vk::Extent2D, layers: u32) -> VkResult<vk::Framebuffer>;

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    unsafe fn create_graphics_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> VkResult<vk::Pipeline>;

    unsafe fn create_compute_pipeline(&self, layout: vk::PipelineLayout, stage: &ShaderStage) -> VkResult<vk::Pipeline>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    unsafe fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool>;

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    unsafe fn allocate_descriptor_set(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet>;

    unsafe fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet);

    unsafe fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );

    unsafe fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo);

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);

    unsafe fn cmd_bind_descriptor_sets(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, layout: vk::PipelineLayout, first_set: u32, sets: &[vk::DescriptorSet]);

    unsafe fn cmd_bind_vertex_buffers(&self, command_buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]);

    unsafe fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);

    unsafe fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &vk::Viewport);

    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &vk::Rect2D);

    unsafe fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32);

    unsafe fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    unsafe fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32);

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);

    unsafe fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event, stage_mask: vk::PipelineStageFlags);

    unsafe fn cmd_reset_query_pool(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, query_count: u32);

    unsafe fn cmd_begin_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32, flags: vk::QueryControlFlags);

    unsafe fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32);

    unsafe fn cmd_write_timestamp(&self, command_buffer: vk::CommandBuffer, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32);

    unsafe fn cmd_clear_attachments(&self, command_buffer: vk::CommandBuffer, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]);

    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()>;

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
}

/// A single descriptor update.
#[derive(Copy, Clone, Debug)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl DescriptorWrite {
    pub fn get_binding(&self) -> u32 {
        match self {
            DescriptorWrite::Buffer { binding, .. } => *binding,
            DescriptorWrite::Image { binding, .. } => *binding,
        }
    }
}

/// A single attachment of a render pass.
#[derive(Copy, Clone, Debug)]
pub struct RenderPassAttachment {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// A render pass with a single subpass.
///
/// Color attachments are referenced in order using the layouts in `color_layouts`. The depth
/// attachment, if any, is the last entry of `attachments`.
#[derive(Clone, Debug)]
pub struct RenderPassDesc {
    pub attachments: Vec<RenderPassAttachment>,
    pub color_layouts: Vec<vk::ImageLayout>,
    pub has_depth: bool,
    pub depth_layout: vk::ImageLayout,
}

#[derive(Clone, Debug)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

/// Fixed function state of a graphics pipeline that does not depend on the render target or
/// the vertex input.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub layout: vk::PipelineLayout,
    pub stages: Vec<ShaderStage>,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub stencil_test: bool,
    pub blend_enable: bool,

    /// If false the scissor rect always covers the whole render target.
    pub scissor_test: bool,
}

impl GraphicsPipelineDesc {
    pub fn new(layout: vk::PipelineLayout, stages: Vec<ShaderStage>) -> Self {
        Self {
            layout,
            stages,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            stencil_test: false,
            blend_enable: false,
            scissor_test: false,
        }
    }
}

/// Everything needed to create one variant of a graphics pipeline.
pub struct GraphicsPipelineCreateInfo<'a> {
    pub desc: &'a GraphicsPipelineDesc,
    pub vertex_input: &'a VertexInput,
    pub topology: vk::PrimitiveTopology,
    pub render_pass: vk::RenderPass,
    pub color_attachment_count: u32,
    pub samples: vk::SampleCountFlags,
    pub depth_read_only: bool,
}
