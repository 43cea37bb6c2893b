//! Helpers for tests. Provides a [`DeviceBackend`] that records every call instead of talking to
//! a driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;

use crate::device::backend::*;

/// Routes log output of the crate to the test harness. Set `RUST_LOG` to see it.
pub fn init_test_logger() {
    #[cfg(test)]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    }
}

#[derive(Clone, Debug)]
pub struct ImageBarrierRecord {
    pub image: u64,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Clone, Debug)]
pub struct BufferBarrierRecord {
    pub buffer: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub command_buffers: Vec<u64>,
    pub wait_semaphores: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
}

#[derive(Clone, Debug)]
pub enum Call {
    CreateSemaphore(u64),
    DestroySemaphore(u64),
    CreateFence(u64),
    DestroyFence(u64),
    ResetFences(Vec<u64>),
    CreateEvent(u64),
    DestroyEvent(u64),
    DestroyQueryPool(u64),
    DestroyBuffer(u64),
    DestroyImage(u64),
    CreateCommandPool { pool: u64, queue_family: u32 },
    DestroyCommandPool(u64),
    AllocateCommandBuffer { pool: u64, command_buffer: u64, secondary: bool },
    FreeCommandBuffer(u64),
    BeginCommandBuffer(u64),
    EndCommandBuffer(u64),
    ResetCommandBuffer(u64),
    CreateRenderPass { render_pass: u64, desc: RenderPassDesc },
    DestroyRenderPass(u64),
    CreateFramebuffer { framebuffer: u64, render_pass: u64 },
    DestroyFramebuffer(u64),
    CreatePipeline { pipeline: u64, compute: bool },
    DestroyPipeline(u64),
    CreateDescriptorPool(u64),
    DestroyDescriptorPool(u64),
    AllocateDescriptorSet(u64),
    FreeDescriptorSet(u64),
    UpdateDescriptorSet { set: u64, writes: Vec<DescriptorWrite> },
    PipelineBarrier {
        command_buffer: u64,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: usize,
        buffers: Vec<BufferBarrierRecord>,
        images: Vec<ImageBarrierRecord>,
    },
    BeginRenderPass { command_buffer: u64, render_pass: u64, framebuffer: u64, clear_values: u32 },
    EndRenderPass(u64),
    BindPipeline { command_buffer: u64, bind_point: vk::PipelineBindPoint, pipeline: u64 },
    BindDescriptorSets { command_buffer: u64, first_set: u32, sets: Vec<u64> },
    BindVertexBuffers { command_buffer: u64, first_binding: u32, buffers: Vec<u64> },
    BindIndexBuffer { command_buffer: u64, buffer: u64 },
    SetViewport(u64),
    SetScissor(u64),
    SetStencilReference { command_buffer: u64, reference: u32 },
    Draw { command_buffer: u64, vertex_count: u32, instance_count: u32 },
    DrawIndexed { command_buffer: u64, index_count: u32, instance_count: u32 },
    Dispatch { command_buffer: u64, x: u32, y: u32, z: u32 },
    SetEvent { command_buffer: u64, event: u64 },
    ResetQueryPool { command_buffer: u64, pool: u64, first_query: u32, query_count: u32 },
    BeginQuery { command_buffer: u64, pool: u64, query: u32 },
    EndQuery { command_buffer: u64, pool: u64, query: u32 },
    WriteTimestamp { command_buffer: u64, pool: u64, query: u32 },
    ClearAttachments { command_buffer: u64, attachments: usize, rects: usize },
    Submit { queue: u64, submits: Vec<SubmitRecord>, fence: u64 },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct State {
    calls: Vec<Call>,
    fences: HashMap<u64, FenceState>,
    auto_complete: bool,
    submit_error: Option<vk::Result>,
}

/// A backend that hands out fake handles and records every call.
///
/// Submitted fences stay pending until [`RecordingBackend::complete_submissions`] is called,
/// unless auto completion is enabled.
pub struct RecordingBackend {
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        init_test_logger();

        Arc::new(Self {
            next_handle: AtomicU64::new(0x1000),
            state: Mutex::new(State {
                calls: Vec::new(),
                fences: HashMap::new(),
                auto_complete: false,
                submit_error: None,
            }),
        })
    }

    /// Creates a new unique raw handle.
    pub fn make_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn make<T: Handle>(&self) -> T {
        T::from_raw(self.make_handle())
    }

    /// If enabled every fence signals as soon as it is submitted.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().unwrap().auto_complete = auto_complete;
    }

    /// The next queue submission fails with the provided result.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().unwrap().submit_error = Some(result);
    }

    /// Signals every fence that has been submitted.
    pub fn complete_submissions(&self) {
        let mut guard = self.state.lock().unwrap();
        for state in guard.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().unwrap().fences.get(&fence.as_raw()) == Some(&FenceState::Signaled)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn count_calls<F: Fn(&Call) -> bool>(&self, filter: F) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| filter(c)).count()
    }

    /// All image barriers recorded into the provided command buffer, in order.
    pub fn image_barriers(&self, command_buffer: vk::CommandBuffer) -> Vec<ImageBarrierRecord> {
        let raw = command_buffer.as_raw();
        self.state.lock().unwrap().calls.iter().flat_map(|call| match call {
            Call::PipelineBarrier { command_buffer, images, .. } if *command_buffer == raw => images.clone(),
            _ => Vec::new(),
        }).collect()
    }

    /// All buffer barriers recorded into the provided command buffer, in order.
    pub fn buffer_barriers(&self, command_buffer: vk::CommandBuffer) -> Vec<BufferBarrierRecord> {
        let raw = command_buffer.as_raw();
        self.state.lock().unwrap().calls.iter().flat_map(|call| match call {
            Call::PipelineBarrier { command_buffer, buffers, .. } if *command_buffer == raw => buffers.clone(),
            _ => Vec::new(),
        }).collect()
    }

    /// Every submit info passed to `vkQueueSubmit`, in order.
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().unwrap().calls.iter().flat_map(|call| match call {
            Call::Submit { submits, .. } => submits.clone(),
            _ => Vec::new(),
        }).collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if count == 0 || ptr.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count as usize)
    }
}

impl DeviceBackend for RecordingBackend {
    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let handle = self.make_handle();
        self.record(Call::CreateSemaphore(handle));
        Ok(vk::Semaphore::from_raw(handle))
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.record(Call::DestroySemaphore(semaphore.as_raw()));
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let handle = self.make_handle();
        let mut guard = self.state.lock().unwrap();
        guard.fences.insert(handle, if signaled { FenceState::Signaled } else { FenceState::Unsignaled });
        guard.calls.push(Call::CreateFence(handle));
        Ok(vk::Fence::from_raw(handle))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut guard = self.state.lock().unwrap();
        guard.fences.remove(&fence.as_raw());
        guard.calls.push(Call::DestroyFence(fence.as_raw()));
    }

    unsafe fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.is_fence_signaled(fence))
    }

    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], _: u64) -> VkResult<()> {
        if fences.iter().all(|fence| self.is_fence_signaled(*fence)) {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut guard = self.state.lock().unwrap();
        for fence in fences {
            guard.fences.insert(fence.as_raw(), FenceState::Unsignaled);
        }
        guard.calls.push(Call::ResetFences(fences.iter().map(|f| f.as_raw()).collect()));
        Ok(())
    }

    unsafe fn create_event(&self) -> VkResult<vk::Event> {
        let handle = self.make_handle();
        self.record(Call::CreateEvent(handle));
        Ok(vk::Event::from_raw(handle))
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        self.record(Call::DestroyEvent(event.as_raw()));
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.record(Call::DestroyQueryPool(pool.as_raw()));
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.record(Call::DestroyBuffer(buffer.as_raw()));
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.record(Call::DestroyImage(image.as_raw()));
    }

    unsafe fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let pool = self.make_handle();
        self.record(Call::CreateCommandPool { pool, queue_family });
        Ok(vk::CommandPool::from_raw(pool))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.record(Call::DestroyCommandPool(pool.as_raw()));
    }

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool, secondary: bool) -> VkResult<vk::CommandBuffer> {
        let command_buffer = self.make_handle();
        self.record(Call::AllocateCommandBuffer { pool: pool.as_raw(), command_buffer, secondary });
        Ok(vk::CommandBuffer::from_raw(command_buffer))
    }

    unsafe fn free_command_buffer(&self, _: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.record(Call::FreeCommandBuffer(command_buffer.as_raw()));
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, _: bool) -> VkResult<()> {
        self.record(Call::BeginCommandBuffer(command_buffer.as_raw()));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::EndCommandBuffer(command_buffer.as_raw()));
        Ok(())
    }

    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::ResetCommandBuffer(command_buffer.as_raw()));
        Ok(())
    }

    unsafe fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let render_pass = self.make_handle();
        self.record(Call::CreateRenderPass { render_pass, desc: desc.clone() });
        Ok(vk::RenderPass::from_raw(render_pass))
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.record(Call::DestroyRenderPass(render_pass.as_raw()));
    }

    unsafe fn create_framebuffer(&self, render_pass: vk::RenderPass, _: &[vk::ImageView], _: vk::Extent2D, _: u32) -> VkResult<vk::Framebuffer> {
        let framebuffer = self.make_handle();
        self.record(Call::CreateFramebuffer { framebuffer, render_pass: render_pass.as_raw() });
        Ok(vk::Framebuffer::from_raw(framebuffer))
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.record(Call::DestroyFramebuffer(framebuffer.as_raw()));
    }

    unsafe fn create_graphics_pipeline(&self, _: &GraphicsPipelineCreateInfo) -> VkResult<vk::Pipeline> {
        let pipeline = self.make_handle();
        self.record(Call::CreatePipeline { pipeline, compute: false });
        Ok(vk::Pipeline::from_raw(pipeline))
    }

    unsafe fn create_compute_pipeline(&self, _: vk::PipelineLayout, _: &ShaderStage) -> VkResult<vk::Pipeline> {
        let pipeline = self.make_handle();
        self.record(Call::CreatePipeline { pipeline, compute: true });
        Ok(vk::Pipeline::from_raw(pipeline))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(Call::DestroyPipeline(pipeline.as_raw()));
    }

    unsafe fn create_descriptor_pool(&self, _: u32, _: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        let pool = self.make_handle();
        self.record(Call::CreateDescriptorPool(pool));
        Ok(vk::DescriptorPool::from_raw(pool))
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.record(Call::DestroyDescriptorPool(pool.as_raw()));
    }

    unsafe fn allocate_descriptor_set(&self, _: vk::DescriptorPool, _: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        let set = self.make_handle();
        self.record(Call::AllocateDescriptorSet(set));
        Ok(vk::DescriptorSet::from_raw(set))
    }

    unsafe fn free_descriptor_set(&self, _: vk::DescriptorPool, set: vk::DescriptorSet) {
        self.record(Call::FreeDescriptorSet(set.as_raw()));
    }

    unsafe fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.record(Call::UpdateDescriptorSet { set: set.as_raw(), writes: writes.to_vec() });
    }

    unsafe fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, src_stage_mask: vk::PipelineStageFlags, dst_stage_mask: vk::PipelineStageFlags, memory_barriers: &[vk::MemoryBarrier], buffer_barriers: &[vk::BufferMemoryBarrier], image_barriers: &[vk::ImageMemoryBarrier]) {
        let buffers = buffer_barriers.iter().map(|barrier| BufferBarrierRecord {
            buffer: barrier.buffer.as_raw(),
            src_access: barrier.src_access_mask,
            dst_access: barrier.dst_access_mask,
            src_queue_family: barrier.src_queue_family_index,
            dst_queue_family: barrier.dst_queue_family_index,
        }).collect();

        let images = image_barriers.iter().map(|barrier| ImageBarrierRecord {
            image: barrier.image.as_raw(),
            range: barrier.subresource_range,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_access: barrier.src_access_mask,
            dst_access: barrier.dst_access_mask,
            src_queue_family: barrier.src_queue_family_index,
            dst_queue_family: barrier.dst_queue_family_index,
        }).collect();

        self.record(Call::PipelineBarrier {
            command_buffer: command_buffer.as_raw(),
            src_stage: src_stage_mask,
            dst_stage: dst_stage_mask,
            memory_barriers: memory_barriers.len(),
            buffers,
            images,
        });
    }

    unsafe fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        self.record(Call::BeginRenderPass {
            command_buffer: command_buffer.as_raw(),
            render_pass: info.render_pass.as_raw(),
            framebuffer: info.framebuffer.as_raw(),
            clear_values: info.clear_value_count,
        });
    }

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record(Call::EndRenderPass(command_buffer.as_raw()));
    }

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.record(Call::BindPipeline { command_buffer: command_buffer.as_raw(), bind_point, pipeline: pipeline.as_raw() });
    }

    unsafe fn cmd_bind_descriptor_sets(&self, command_buffer: vk::CommandBuffer, _: vk::PipelineBindPoint, _: vk::PipelineLayout, first_set: u32, sets: &[vk::DescriptorSet]) {
        self.record(Call::BindDescriptorSets {
            command_buffer: command_buffer.as_raw(),
            first_set,
            sets: sets.iter().map(|s| s.as_raw()).collect(),
        });
    }

    unsafe fn cmd_bind_vertex_buffers(&self, command_buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], _: &[vk::DeviceSize]) {
        self.record(Call::BindVertexBuffers {
            command_buffer: command_buffer.as_raw(),
            first_binding,
            buffers: buffers.iter().map(|b| b.as_raw()).collect(),
        });
    }

    unsafe fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, _: vk::DeviceSize, _: vk::IndexType) {
        self.record(Call::BindIndexBuffer { command_buffer: command_buffer.as_raw(), buffer: buffer.as_raw() });
    }

    unsafe fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, _: &vk::Viewport) {
        self.record(Call::SetViewport(command_buffer.as_raw()));
    }

    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, _: &vk::Rect2D) {
        self.record(Call::SetScissor(command_buffer.as_raw()));
    }

    unsafe fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        self.record(Call::SetStencilReference { command_buffer: command_buffer.as_raw(), reference });
    }

    unsafe fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, _: u32, _: u32) {
        self.record(Call::Draw { command_buffer: command_buffer.as_raw(), vertex_count, instance_count });
    }

    unsafe fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32, _: u32, _: i32, _: u32) {
        self.record(Call::DrawIndexed { command_buffer: command_buffer.as_raw(), index_count, instance_count });
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(Call::Dispatch { command_buffer: command_buffer.as_raw(), x, y, z });
    }

    unsafe fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event, _: vk::PipelineStageFlags) {
        self.record(Call::SetEvent { command_buffer: command_buffer.as_raw(), event: event.as_raw() });
    }

    unsafe fn cmd_reset_query_pool(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.record(Call::ResetQueryPool { command_buffer: command_buffer.as_raw(), pool: pool.as_raw(), first_query, query_count });
    }

    unsafe fn cmd_begin_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32, _: vk::QueryControlFlags) {
        self.record(Call::BeginQuery { command_buffer: command_buffer.as_raw(), pool: pool.as_raw(), query });
    }

    unsafe fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        self.record(Call::EndQuery { command_buffer: command_buffer.as_raw(), pool: pool.as_raw(), query });
    }

    unsafe fn cmd_write_timestamp(&self, command_buffer: vk::CommandBuffer, _: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        self.record(Call::WriteTimestamp { command_buffer: command_buffer.as_raw(), pool: pool.as_raw(), query });
    }

    unsafe fn cmd_clear_attachments(&self, command_buffer: vk::CommandBuffer, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        self.record(Call::ClearAttachments { command_buffer: command_buffer.as_raw(), attachments: attachments.len(), rects: rects.len() });
    }

    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        let mut guard = self.state.lock().unwrap();
        if let Some(err) = guard.submit_error.take() {
            return Err(err);
        }

        let records = submits.iter().map(|submit| SubmitRecord {
            command_buffers: raw_slice(submit.p_command_buffers, submit.command_buffer_count).iter().map(|c| c.as_raw()).collect(),
            wait_semaphores: raw_slice(submit.p_wait_semaphores, submit.wait_semaphore_count).iter().map(|s| s.as_raw()).collect(),
            signal_semaphores: raw_slice(submit.p_signal_semaphores, submit.signal_semaphore_count).iter().map(|s| s.as_raw()).collect(),
        }).collect();

        if fence != vk::Fence::null() {
            let state = if guard.auto_complete { FenceState::Signaled } else { FenceState::Pending };
            guard.fences.insert(fence.as_raw(), state);
        }

        guard.calls.push(Call::Submit { queue: queue.as_raw(), submits: records, fence: fence.as_raw() });
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _: vk::Queue) -> VkResult<()> {
        self.complete_submissions();
        Ok(())
    }
}
