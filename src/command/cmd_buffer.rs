//! Low level command buffer with resource and image layout tracking.
//!
//! A [`CmdBuffer`] records the native commands issued through it and keeps track of every resource
//! those commands reference. Resources are bound when first registered and marked as used when the
//! buffer is submitted. Once the buffer completes or is reset they are released again, which allows
//! the [`crate::objects::ResourceManager`] to delete destroyed resources at the right time.
//!
//! Images additionally track the layout of every referenced sub-resource. Transitions are batched
//! and issued right before they are needed, transitions into the layout expected at the start of
//! the buffer are recorded into a separate buffer submitted just before this one.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;

use crate::command::barrier::{buffer_barrier, image_barrier, pipeline_stage_flags, pipeline_stage_flags_for, SHADER_STAGES};
use crate::command::pool::FamilyShared;
use crate::command::subresource::{ImageInfo, ImageSubresourceInfo, RegisterContext, ResourceUsage, ShaderBarrier};
use crate::command::sync_mask::SyncMask;
use crate::device::backend::DeviceBackend;
use crate::device::config::DeviceConfig;
use crate::device::error::DeviceError;
use crate::device::queue::Queue;
use crate::device::Device;
use crate::objects::buffer::Buffer;
use crate::objects::framebuffer::{color_attachment_layout, depth_attachment_layout, Framebuffer, FramebufferAttachment, RenderSurfaceMask, MAX_COLOR_ATTACHMENTS};
use crate::objects::id::ResourceId;
use crate::objects::image::Image;
use crate::objects::manager::ResourceManager;
use crate::objects::query::{Query, QueryKind, QueryPool};
use crate::objects::resource::{Resource, UseFlags};
use crate::objects::swapchain::SwapChain;
use crate::objects::sync::{Event, Semaphore};
use crate::pipeline::params::GpuParams;
use crate::pipeline::state::{ComputePipelineState, GraphicsPipelineState};
use crate::pipeline::vertex::VertexInput;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdBufferState {
    Ready,
    Recording,
    RecordingRenderPass,
    RecordingDone,
    Submitted,
}

bitflags! {
    /// Pipeline bind points whose descriptor sets must be rebound before the next draw or dispatch.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DescriptorBindFlags: u8 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
    }
}

/// What a command buffer renders to.
#[derive(Clone)]
pub enum RenderTarget {
    Framebuffer(Framebuffer),

    /// The currently acquired back buffer of the swap chain. The first submission rendering to it
    /// waits on the acquire semaphore.
    SwapChain(SwapChain),
}

/// A rectangle in normalized render target coordinates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewportRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ViewportRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }
}

impl Default for ViewportRect {
    fn default() -> Self {
        Self::full()
    }
}

struct ResourceInfo {
    resource: Resource,
    flags: UseFlags,
    used: bool,
}

struct BufferInfo {
    buffer: Buffer,
    access: vk::AccessFlags,
    flags: UseFlags,
    used: bool,

    /// Written by a shader since the last barrier.
    needs_barrier: bool,
}

#[derive(Copy, Clone)]
struct QueryReset {
    pool: vk::QueryPool,
    first: u32,
    count: u32,
}

/// Clears requested outside of a render pass. They are folded into the next render pass or
/// executed by an otherwise empty one.
struct ClearState {
    mask: RenderSurfaceMask,
    area: vk::Rect2D,
    values: [vk::ClearValue; MAX_COLOR_ATTACHMENTS as usize + 1],
}

impl ClearState {
    fn new() -> Self {
        Self {
            mask: RenderSurfaceMask::empty(),
            area: vk::Rect2D::default(),
            values: [vk::ClearValue::default(); MAX_COLOR_ATTACHMENTS as usize + 1],
        }
    }
}

#[derive(Default)]
struct OwnershipTransfer {
    buffers: Vec<vk::BufferMemoryBarrier>,
    images: Vec<vk::ImageMemoryBarrier>,
}

pub struct CmdBuffer {
    id: u32,
    family: Arc<FamilyShared>,
    backend: Arc<dyn DeviceBackend>,
    manager: ResourceManager,
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    secondary: bool,
    state: CmdBufferState,
    global_queue_idx: Option<u32>,
    fence_timeout_ns: u64,
    max_dependencies: u32,

    intra_queue_semaphore: Option<Semaphore>,
    inter_queue_semaphores: Vec<Semaphore>,
    used_inter_queue_semaphores: usize,

    resources: Vec<ResourceInfo>,
    resource_lookup: HashMap<ResourceId, usize>,
    images: Vec<ImageInfo>,
    image_lookup: HashMap<ResourceId, usize>,
    buffers: Vec<BufferInfo>,
    buffer_lookup: HashMap<ResourceId, usize>,
    queued_transitions: BTreeSet<usize>,

    swap_chains: Vec<SwapChain>,
    queries: Vec<Query>,
    queued_query_resets: Vec<QueryReset>,
    queued_events: Vec<Event>,

    framebuffer: Option<Framebuffer>,
    render_target_read_only: RenderSurfaceMask,
    render_target_load: RenderSurfaceMask,
    clear: ClearState,

    graphics_pipeline: Option<GraphicsPipelineState>,
    compute_pipeline: Option<ComputePipelineState>,
    bound_params: Option<GpuParams>,
    bound_params_dirty: bool,
    bound_sets: Vec<vk::DescriptorSet>,
    descriptor_bind_state: DescriptorBindFlags,
    gfx_pipeline_requires_bind: bool,
    cmp_pipeline_requires_bind: bool,
    viewport: ViewportRect,
    viewport_requires_bind: bool,
    scissor: vk::Rect2D,
    scissor_requires_bind: bool,
    stencil_ref: u32,
    stencil_ref_requires_bind: bool,
    draw_op: vk::PrimitiveTopology,
    vertex_input: Option<VertexInput>,

    _not_sync: PhantomData<Cell<()>>,
}

impl CmdBuffer {
    pub(crate) fn new(family: Arc<FamilyShared>, manager: ResourceManager, id: u32, secondary: bool, config: &DeviceConfig) -> Result<Self, DeviceError> {
        let backend = family.get_backend().clone();

        let handle = unsafe { backend.allocate_command_buffer(family.get_handle(), secondary) }.map_err(|err| {
            log::error!("Failed to allocate command buffer {:?}", err);
            DeviceError::from(err)
        })?;

        let fence = match unsafe { backend.create_fence(false) } {
            Ok(fence) => fence,
            Err(err) => {
                log::error!("Failed to create command buffer fence {:?}", err);
                unsafe { backend.free_command_buffer(family.get_handle(), handle) };
                return Err(err.into());
            }
        };

        family.notify_allocated();

        Ok(Self {
            id,
            family,
            backend,
            manager,
            handle,
            fence,
            secondary,
            state: CmdBufferState::Ready,
            global_queue_idx: None,
            fence_timeout_ns: config.get_fence_timeout_ns(),
            max_dependencies: config.get_max_dependencies(),

            intra_queue_semaphore: None,
            inter_queue_semaphores: Vec::new(),
            used_inter_queue_semaphores: 0,

            resources: Vec::new(),
            resource_lookup: HashMap::new(),
            images: Vec::new(),
            image_lookup: HashMap::new(),
            buffers: Vec::new(),
            buffer_lookup: HashMap::new(),
            queued_transitions: BTreeSet::new(),

            swap_chains: Vec::new(),
            queries: Vec::new(),
            queued_query_resets: Vec::new(),
            queued_events: Vec::new(),

            framebuffer: None,
            render_target_read_only: RenderSurfaceMask::empty(),
            render_target_load: RenderSurfaceMask::empty(),
            clear: ClearState::new(),

            graphics_pipeline: None,
            compute_pipeline: None,
            bound_params: None,
            bound_params_dirty: false,
            bound_sets: Vec::new(),
            descriptor_bind_state: DescriptorBindFlags::empty(),
            gfx_pipeline_requires_bind: true,
            cmp_pipeline_requires_bind: true,
            viewport: ViewportRect::full(),
            viewport_requires_bind: true,
            scissor: vk::Rect2D::default(),
            scissor_requires_bind: true,
            stencil_ref: 0,
            stencil_ref_requires_bind: true,
            draw_op: vk::PrimitiveTopology::TRIANGLE_LIST,
            vertex_input: None,

            _not_sync: PhantomData,
        })
    }

    /// Unique id of the buffer. Ids are never reused by the pool that created the buffer.
    pub fn get_id(&self) -> u32 {
        self.id
    }

    pub fn get_state(&self) -> CmdBufferState {
        self.state
    }

    pub fn get_queue_family(&self) -> u32 {
        self.family.get_queue_family()
    }

    pub fn get_handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn get_fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn get_manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn get_backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, CmdBufferState::Recording | CmdBufferState::RecordingRenderPass)
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.state == CmdBufferState::RecordingRenderPass
    }

    pub fn is_submitted(&self) -> bool {
        self.state == CmdBufferState::Submitted
    }

    pub fn get_render_target(&self) -> Option<&Framebuffer> {
        self.framebuffer.as_ref()
    }

    pub fn begin(&mut self) -> Result<(), DeviceError> {
        assert_eq!(self.state, CmdBufferState::Ready, "Command buffer {} must be ready to begin recording", self.id);

        unsafe { self.backend.begin_command_buffer(self.handle, self.secondary) }.map_err(|err| {
            log::error!("Failed to begin command buffer {} {:?}", self.id, err);
            DeviceError::from(err)
        })?;

        self.state = CmdBufferState::Recording;
        Ok(())
    }

    /// Finishes recording. Pending clears and layout transitions are flushed first.
    pub fn end(&mut self) -> Result<(), DeviceError> {
        assert_eq!(self.state, CmdBufferState::Recording, "Command buffer {} must be recording outside of a render pass to end", self.id);

        if !self.clear.mask.is_empty() {
            self.execute_clear_pass()?;
        }
        self.execute_layout_transitions();

        unsafe { self.backend.end_command_buffer(self.handle) }.map_err(|err| {
            log::error!("Failed to end command buffer {} {:?}", self.id, err);
            DeviceError::from(err)
        })?;

        self.state = CmdBufferState::RecordingDone;
        Ok(())
    }

    /// Begins a render pass on the current render target.
    ///
    /// Attachment layouts are prepared first. A queued clear covering the whole target is folded
    /// into the render pass, any other queued clear is executed by a separate pass.
    pub fn begin_render_pass(&mut self) -> Result<(), DeviceError> {
        assert_eq!(self.state, CmdBufferState::Recording, "Command buffer {} must be recording outside of a render pass to begin a render pass", self.id);

        let Some(framebuffer) = self.framebuffer.clone() else {
            log::warn!("Attempting to begin a render pass without a render target");
            return Ok(());
        };

        let full = full_area(&framebuffer);
        if !self.clear.mask.is_empty() && !rect_eq(&self.clear.area, &full) {
            self.execute_clear_pass()?;
        }

        let read = self.get_fb_read_mask();
        self.prepare_attachment_layouts(&framebuffer, self.render_target_load, read);
        self.execute_layout_transitions();

        let clear_mask = self.clear.mask;
        let variant = framebuffer.get_variant(self.backend.as_ref(), self.render_target_load, read, clear_mask)?;
        let clear_count = framebuffer.clear_entry_count(clear_mask) as usize;

        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(variant.render_pass)
            .framebuffer(variant.framebuffer)
            .render_area(full)
            .clear_values(&self.clear.values[..clear_count]);

        unsafe { self.backend.cmd_begin_render_pass(self.handle, &info) };

        self.clear.mask = RenderSurfaceMask::empty();
        self.state = CmdBufferState::RecordingRenderPass;
        Ok(())
    }

    /// Ends the active render pass. Events set during the pass are signaled now.
    pub fn end_render_pass(&mut self) {
        assert_eq!(self.state, CmdBufferState::RecordingRenderPass, "Command buffer {} has no active render pass", self.id);

        unsafe { self.backend.cmd_end_render_pass(self.handle) };

        for event in std::mem::take(&mut self.queued_events) {
            unsafe { self.backend.cmd_set_event(self.handle, event.get_handle(), vk::PipelineStageFlags::ALL_COMMANDS) };
        }

        for info in self.images.iter_mut() {
            info.reset_pass_flags();
        }
        self.update_final_layouts();

        self.state = CmdBufferState::Recording;

        // Shader inputs are registered per pass
        if self.bound_params.is_some() {
            self.bound_params_dirty = true;
        }
    }

    /// Registers a resource without special tracking requirements.
    pub fn register_resource(&mut self, resource: &Resource, flags: UseFlags) {
        match self.resource_lookup.get(&resource.get_id()) {
            Some(idx) => self.resources[*idx].flags |= flags,
            None => {
                resource.notify_bound();
                self.resource_lookup.insert(resource.get_id(), self.resources.len());
                self.resources.push(ResourceInfo {
                    resource: resource.clone(),
                    flags,
                    used: false,
                });
            }
        }
    }

    /// Registers a use of the sub-resources in `range`.
    ///
    /// The layout state of the affected sub-resources is updated and transitions are queued if
    /// needed. Uses that are incompatible with the active render pass end it.
    pub fn register_image(&mut self, image: &Image, range: &vk::ImageSubresourceRange, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage) {
        let id = image.as_resource().get_id();
        let Some(&idx) = self.image_lookup.get(&id) else {
            image.as_resource().notify_bound();
            self.image_lookup.insert(id, self.images.len());
            self.images.push(ImageInfo::new(image.clone(), *range, new_layout, final_layout, flags, usage));
            return;
        };

        let ctx = RegisterContext {
            in_render_pass: self.is_in_render_pass(),
            depth_stencil_read_only: self.render_target_read_only.intersects(RenderSurfaceMask::DEPTH_STENCIL),
        };

        let mut outcome = self.images[idx].register(range, new_layout, final_layout, flags, usage, &ctx);
        if outcome.end_render_pass {
            self.end_render_pass();

            let ctx = RegisterContext {
                in_render_pass: false,
                ..ctx
            };
            let again = self.images[idx].register(range, new_layout, final_layout, flags, usage, &ctx);
            outcome.queue_transition |= again.queue_transition;
            outcome.barriers = again.barriers;
        }

        if outcome.queue_transition {
            self.queued_transitions.insert(idx);
        }

        if !outcome.barriers.is_empty() {
            let handle = image.get_handle();
            self.issue_shader_barriers(image, handle, &outcome.barriers);
        }
    }

    fn issue_shader_barriers(&mut self, image: &Image, handle: vk::Image, barriers: &[ShaderBarrier]) {
        if self.is_in_render_pass() {
            self.end_render_pass();
        }

        let barriers: Vec<_> = barriers.iter().map(|barrier| image_barrier(
            handle,
            &barrier.range,
            vk::AccessFlags::SHADER_WRITE,
            image.get_access_flags(barrier.layout, barrier.read_only),
            barrier.layout,
            barrier.layout,
        )).collect();

        unsafe { self.backend.cmd_pipeline_barrier(self.handle, SHADER_STAGES, SHADER_STAGES, &[], &[], &barriers) };
    }

    /// Registers a use of a buffer with the access flags of the use.
    ///
    /// A shader write followed by any other shader or vertex input access gets a memory barrier.
    pub fn register_buffer(&mut self, buffer: &Buffer, access: vk::AccessFlags, flags: UseFlags) {
        let is_shader_write = access.contains(vk::AccessFlags::SHADER_WRITE);

        let Some(&idx) = self.buffer_lookup.get(&buffer.as_resource().get_id()) else {
            buffer.as_resource().notify_bound();
            self.buffer_lookup.insert(buffer.as_resource().get_id(), self.buffers.len());
            self.buffers.push(BufferInfo {
                buffer: buffer.clone(),
                access,
                flags,
                used: false,
                needs_barrier: is_shader_write,
            });
            return;
        };

        let hazard = vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::UNIFORM_READ |
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ | vk::AccessFlags::INDIRECT_COMMAND_READ;

        let info = &mut self.buffers[idx];
        info.access |= access;
        info.flags |= flags;

        if !(info.needs_barrier && access.intersects(hazard)) {
            info.needs_barrier |= is_shader_write;
            return;
        }

        info.needs_barrier = is_shader_write;
        let barrier = buffer_barrier(info.buffer.get_handle(), vk::AccessFlags::SHADER_WRITE, access);

        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        unsafe { self.backend.cmd_pipeline_barrier(self.handle, SHADER_STAGES, pipeline_stage_flags(access), &[], &[barrier], &[]) };
    }

    /// Registers the framebuffer and its attachments. Loaded attachments require their attachment
    /// layout, the others are treated as undefined at the start of the render pass.
    pub fn register_framebuffer(&mut self, framebuffer: &Framebuffer, load: RenderSurfaceMask, read_only: RenderSurfaceMask) {
        self.register_resource(framebuffer.as_resource(), UseFlags::WRITE);

        for (index, attachment) in framebuffer.get_color_attachments().iter().enumerate() {
            let layout = if load.contains(RenderSurfaceMask::color(index as u32)) {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            };

            self.register_image(&attachment.image, &attachment.get_range(), layout, attachment.final_layout, UseFlags::WRITE, ResourceUsage::Framebuffer);
        }

        if let Some(attachment) = framebuffer.get_depth_attachment() {
            let layout = if load.intersects(RenderSurfaceMask::DEPTH_STENCIL) {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            };
            let flags = if read_only.contains(RenderSurfaceMask::DEPTH_STENCIL) {
                UseFlags::READ
            } else {
                UseFlags::WRITE
            };

            self.register_image(&attachment.image, &attachment.get_range(), layout, attachment.final_layout, flags, ResourceUsage::Framebuffer);
        }
    }

    /// Records every queued layout transition.
    pub fn execute_layout_transitions(&mut self) {
        let mut barriers = Vec::new();
        for idx in std::mem::take(&mut self.queued_transitions) {
            barriers.extend(self.images[idx].take_transitions());
        }

        self.record_barriers(&[], &barriers);
    }

    /// The transitions [`CmdBuffer::execute_layout_transitions`] would record.
    pub fn pending_layout_transitions(&self) -> Vec<vk::ImageMemoryBarrier> {
        self.queued_transitions.iter().flat_map(|idx| self.images[*idx].pending_transitions()).collect()
    }

    /// Records a single pipeline barrier covering all provided barriers.
    pub(crate) fn record_barriers(&mut self, buffers: &[vk::BufferMemoryBarrier], images: &[vk::ImageMemoryBarrier]) {
        if buffers.is_empty() && images.is_empty() {
            return;
        }

        let (src_stage, dst_stage) = if buffers.is_empty() {
            pipeline_stage_flags_for(images)
        } else if images.is_empty() {
            pipeline_stage_flags_for(buffers)
        } else {
            let (buffer_src, buffer_dst) = pipeline_stage_flags_for(buffers);
            let (image_src, image_dst) = pipeline_stage_flags_for(images);
            (buffer_src | image_src, buffer_dst | image_dst)
        };

        unsafe { self.backend.cmd_pipeline_barrier(self.handle, src_stage, dst_stage, &[], buffers, images) };
    }

    /// Layout the sub-resource at the start of `range` is in at this point of the recording.
    ///
    /// Attachments of the current framebuffer report their render pass layout if
    /// `in_render_pass` is set. Images not referenced by the buffer report their global layout.
    pub fn get_current_layout(&self, image: &Image, range: &vk::ImageSubresourceRange, in_render_pass: bool) -> vk::ImageLayout {
        let global = || image.get_layout(range.base_array_layer, range.base_mip_level);

        let Some(&idx) = self.image_lookup.get(&image.as_resource().get_id()) else {
            return global();
        };
        let Some(record) = self.images[idx].find(range.base_array_layer, range.base_mip_level) else {
            return global();
        };

        if record.is_fb_attachment && in_render_pass {
            if let Some(framebuffer) = &self.framebuffer {
                let read = self.get_fb_read_mask();

                if framebuffer.get_depth_attachment().map(|attachment| attachment.image == *image).unwrap_or(false) {
                    return depth_attachment_layout(read);
                }

                let color = framebuffer.get_color_attachments().iter().position(|attachment| attachment.image == *image);
                if let Some(index) = color {
                    return color_attachment_layout(read.contains(RenderSurfaceMask::color(index as u32)));
                }
            }
        }

        record.required_layout
    }

    fn attachment_record(&self, attachment: &FramebufferAttachment) -> Option<&ImageSubresourceInfo> {
        let idx = self.image_lookup.get(&attachment.image.as_resource().get_id())?;
        self.images[*idx].find(attachment.surface.base_layer, attachment.surface.mip_level)
    }

    /// Surfaces of the current render target that are read by shaders or bound read only.
    pub fn get_fb_read_mask(&self) -> RenderSurfaceMask {
        let Some(framebuffer) = &self.framebuffer else {
            return RenderSurfaceMask::empty();
        };

        let mut mask = RenderSurfaceMask::empty();
        for (index, attachment) in framebuffer.get_color_attachments().iter().enumerate() {
            if self.attachment_record(attachment).map(|record| record.is_shader_input).unwrap_or(false) {
                mask |= RenderSurfaceMask::color(index as u32);
            }
        }

        if let Some(attachment) = framebuffer.get_depth_attachment() {
            if self.attachment_record(attachment).map(|record| record.is_shader_input).unwrap_or(false) {
                mask |= RenderSurfaceMask::DEPTH;
            }
        }

        if self.render_target_read_only.contains(RenderSurfaceMask::DEPTH) {
            mask |= RenderSurfaceMask::DEPTH;
        }
        if self.render_target_read_only.contains(RenderSurfaceMask::STENCIL) {
            mask |= RenderSurfaceMask::STENCIL;
        }

        mask
    }

    /// Requires the in-pass layout on every loaded attachment.
    fn prepare_attachment_layouts(&mut self, framebuffer: &Framebuffer, load: RenderSurfaceMask, read: RenderSurfaceMask) {
        for (index, attachment) in framebuffer.get_color_attachments().iter().enumerate() {
            if load.contains(RenderSurfaceMask::color(index as u32)) {
                let layout = framebuffer.get_attachment_layout(Some(index as u32), read);
                self.require_attachment_layout(attachment, layout);
            }
        }

        if let Some(attachment) = framebuffer.get_depth_attachment() {
            if load.intersects(RenderSurfaceMask::DEPTH_STENCIL) {
                let layout = framebuffer.get_attachment_layout(None, read);
                self.require_attachment_layout(attachment, layout);
            }
        }
    }

    fn require_attachment_layout(&mut self, attachment: &FramebufferAttachment, layout: vk::ImageLayout) {
        let Some(&idx) = self.image_lookup.get(&attachment.image.as_resource().get_id()) else {
            return;
        };

        let range = attachment.get_range();
        for record in self.images[idx].overlapping_mut(&range) {
            record.required_layout = layout;
            if !record.has_transitioned {
                record.initial_layout = layout;
                record.current_layout = layout;
                record.has_transitioned = true;
            }
        }
        self.queued_transitions.insert(idx);
    }

    /// Attachments are left in their final layout once a render pass ends.
    fn update_final_layouts(&mut self) {
        let Some(framebuffer) = self.framebuffer.clone() else {
            return;
        };

        let attachments = framebuffer.get_color_attachments().iter().chain(framebuffer.get_depth_attachment());
        for attachment in attachments {
            let Some(&idx) = self.image_lookup.get(&attachment.image.as_resource().get_id()) else {
                continue;
            };

            let range = attachment.get_range();
            for record in self.images[idx].overlapping_mut(&range) {
                if record.is_fb_attachment {
                    record.current_layout = record.final_layout;
                    record.required_layout = record.final_layout;
                    record.has_transitioned = true;
                }
            }
        }
    }

    /// Changes the render target. Masks select which attachments are bound read only and which
    /// keep their previous contents.
    ///
    /// An active render pass is ended and queued clears of the previous target are executed.
    pub fn set_render_target(&mut self, target: Option<RenderTarget>, read_only: RenderSurfaceMask, load: RenderSurfaceMask) -> Result<(), DeviceError> {
        assert!(self.is_recording(), "Command buffer {} must be recording to change the render target", self.id);

        let mut load = load;
        if load.intersects(RenderSurfaceMask::DEPTH_STENCIL) && !load.contains(RenderSurfaceMask::DEPTH_STENCIL) {
            log::warn!("Depth and stencil can only be loaded together. Loading both");
            load |= RenderSurfaceMask::DEPTH_STENCIL;
        }

        let framebuffer = match &target {
            Some(RenderTarget::Framebuffer(framebuffer)) => Some(framebuffer.clone()),
            Some(RenderTarget::SwapChain(swap_chain)) => {
                let back_buffer = swap_chain.get_back_buffer()
                    .unwrap_or_else(|| panic!("Swap chain used as render target without an acquired back buffer"));
                Some(back_buffer.framebuffer)
            }
            None => None,
        };

        if self.framebuffer == framebuffer && self.render_target_read_only == read_only && self.render_target_load == load {
            return Ok(());
        }

        if self.is_in_render_pass() {
            self.end_render_pass();
        } else if !self.clear.mask.is_empty() {
            self.execute_clear_pass()?;
        }

        if let Some(previous) = self.framebuffer.take() {
            for attachment in previous.get_color_attachments().iter().chain(previous.get_depth_attachment()) {
                if let Some(&idx) = self.image_lookup.get(&attachment.image.as_resource().get_id()) {
                    self.images[idx].clear_fb_attachment(&attachment.get_range());
                }
            }
        }

        self.framebuffer = framebuffer;
        self.render_target_read_only = read_only;
        self.render_target_load = load;

        if let Some(framebuffer) = self.framebuffer.clone() {
            self.register_framebuffer(&framebuffer, load, read_only);
        }

        if let Some(RenderTarget::SwapChain(swap_chain)) = target {
            if !self.swap_chains.iter().any(|tracked| tracked.ptr_eq(&swap_chain)) {
                self.swap_chains.push(swap_chain);
            }
        }

        // Attachment usage may have changed the layouts bound parameters need
        if self.bound_params.is_some() {
            self.bound_params_dirty = true;
            self.descriptor_bind_state = DescriptorBindFlags::GRAPHICS | DescriptorBindFlags::COMPUTE;
        }

        self.gfx_pipeline_requires_bind = true;
        self.viewport_requires_bind = true;
        self.scissor_requires_bind = true;
        Ok(())
    }

    /// Clears the selected surfaces of the whole render target.
    pub fn clear_render_target(&mut self, mask: RenderSurfaceMask, color: [f32; 4], depth: f32, stencil: u32) -> Result<(), DeviceError> {
        let Some(framebuffer) = &self.framebuffer else {
            return Ok(());
        };

        let area = full_area(framebuffer);
        self.clear_area(area, mask, color, depth, stencil)
    }

    /// Clears the selected surfaces inside the current viewport.
    pub fn clear_viewport(&mut self, mask: RenderSurfaceMask, color: [f32; 4], depth: f32, stencil: u32) -> Result<(), DeviceError> {
        let Some(framebuffer) = &self.framebuffer else {
            return Ok(());
        };

        let width = framebuffer.get_width() as f32;
        let height = framebuffer.get_height() as f32;
        let area = vk::Rect2D {
            offset: vk::Offset2D {
                x: (self.viewport.x * width) as i32,
                y: (self.viewport.y * height) as i32,
            },
            extent: vk::Extent2D {
                width: (self.viewport.width * width) as u32,
                height: (self.viewport.height * height) as u32,
            },
        };

        self.clear_area(area, mask, color, depth, stencil)
    }

    fn clear_area(&mut self, area: vk::Rect2D, mask: RenderSurfaceMask, color: [f32; 4], depth: f32, stencil: u32) -> Result<(), DeviceError> {
        assert!(self.is_recording(), "Command buffer {} must be recording to clear", self.id);

        let Some(framebuffer) = self.framebuffer.clone() else {
            return Ok(());
        };

        let color_count = framebuffer.get_color_attachments().len() as u32;
        let mut available = RenderSurfaceMask::empty();
        for index in 0..color_count {
            available |= RenderSurfaceMask::color(index);
        }
        if framebuffer.get_depth_attachment().is_some() {
            available |= RenderSurfaceMask::DEPTH_STENCIL;
        }

        let mask = mask & available;
        if mask.is_empty() {
            return Ok(());
        }

        let color_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: color,
            },
        };
        let depth_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth,
                stencil,
            },
        };

        if self.is_in_render_pass() {
            let mut attachments = Vec::new();
            for index in 0..color_count {
                if mask.contains(RenderSurfaceMask::color(index)) {
                    attachments.push(vk::ClearAttachment {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        color_attachment: index,
                        clear_value: color_value,
                    });
                }
            }

            if mask.intersects(RenderSurfaceMask::DEPTH_STENCIL) {
                let mut aspect_mask = vk::ImageAspectFlags::empty();
                if mask.contains(RenderSurfaceMask::DEPTH) {
                    aspect_mask |= vk::ImageAspectFlags::DEPTH;
                }
                if mask.contains(RenderSurfaceMask::STENCIL) {
                    aspect_mask |= vk::ImageAspectFlags::STENCIL;
                }

                attachments.push(vk::ClearAttachment {
                    aspect_mask,
                    color_attachment: 0,
                    clear_value: depth_value,
                });
            }

            let rect = vk::ClearRect {
                rect: area,
                base_array_layer: 0,
                layer_count: framebuffer.get_layers(),
            };

            unsafe { self.backend.cmd_clear_attachments(self.handle, &attachments, std::slice::from_ref(&rect)) };
            return Ok(());
        }

        // A render pass can only clear a single area and each surface once
        if !self.clear.mask.is_empty() && (self.clear.mask.intersects(mask) || !rect_eq(&self.clear.area, &area)) {
            self.execute_clear_pass()?;
        }

        for index in 0..color_count {
            if mask.contains(RenderSurfaceMask::color(index)) {
                self.clear.values[index as usize] = color_value;
            }
        }
        if mask.intersects(RenderSurfaceMask::DEPTH_STENCIL) {
            self.clear.values[color_count as usize] = depth_value;
        }

        self.clear.mask |= mask;
        self.clear.area = area;
        Ok(())
    }

    /// Executes the queued clear with an otherwise empty render pass.
    fn execute_clear_pass(&mut self) -> Result<(), DeviceError> {
        assert_eq!(self.state, CmdBufferState::Recording, "Clears outside of a render pass require the buffer to be recording");

        let Some(framebuffer) = self.framebuffer.clone() else {
            self.clear.mask = RenderSurfaceMask::empty();
            return Ok(());
        };

        let load = self.render_target_load;
        self.prepare_attachment_layouts(&framebuffer, load, RenderSurfaceMask::empty());
        self.execute_layout_transitions();

        let clear_mask = self.clear.mask;
        let variant = framebuffer.get_variant(self.backend.as_ref(), load, RenderSurfaceMask::empty(), clear_mask)?;
        let clear_count = framebuffer.clear_entry_count(clear_mask) as usize;

        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(variant.render_pass)
            .framebuffer(variant.framebuffer)
            .render_area(self.clear.area)
            .clear_values(&self.clear.values[..clear_count]);

        unsafe {
            self.backend.cmd_begin_render_pass(self.handle, &info);
            self.backend.cmd_end_render_pass(self.handle);
        }

        self.update_final_layouts();
        self.clear.mask = RenderSurfaceMask::empty();
        Ok(())
    }

    pub fn set_pipeline_state(&mut self, state: Option<GraphicsPipelineState>) {
        let same = match (&self.graphics_pipeline, &state) {
            (Some(current), Some(new)) => current.ptr_eq(new),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }

        self.graphics_pipeline = state;
        self.gfx_pipeline_requires_bind = true;
    }

    pub fn set_compute_pipeline(&mut self, state: Option<ComputePipelineState>) {
        let same = match (&self.compute_pipeline, &state) {
            (Some(current), Some(new)) => current.ptr_eq(new),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }

        self.compute_pipeline = state;
        self.cmp_pipeline_requires_bind = true;
    }

    /// Binds descriptor sets. Their resources are registered before the next draw or dispatch.
    pub fn set_gpu_params(&mut self, params: Option<GpuParams>) {
        self.bound_params_dirty = params.is_some();
        if params.is_none() {
            self.bound_sets.clear();
        }

        self.bound_params = params;
        self.descriptor_bind_state = DescriptorBindFlags::GRAPHICS | DescriptorBindFlags::COMPUTE;
    }

    pub fn set_viewport(&mut self, viewport: ViewportRect) {
        if self.viewport == viewport {
            return;
        }

        self.viewport = viewport;
        self.viewport_requires_bind = true;
    }

    /// Only has an effect with pipelines that enable the scissor test.
    pub fn set_scissor_rect(&mut self, rect: vk::Rect2D) {
        if rect_eq(&self.scissor, &rect) {
            return;
        }

        self.scissor = rect;
        self.scissor_requires_bind = true;
    }

    pub fn set_stencil_ref(&mut self, value: u32) {
        if self.stencil_ref == value {
            return;
        }

        self.stencil_ref = value;
        self.stencil_ref_requires_bind = true;
    }

    pub fn set_draw_op(&mut self, topology: vk::PrimitiveTopology) {
        if self.draw_op == topology {
            return;
        }

        self.draw_op = topology;
        self.gfx_pipeline_requires_bind = true;
    }

    pub fn set_vertex_input(&mut self, vertex_input: Option<VertexInput>) {
        if self.vertex_input == vertex_input {
            return;
        }

        self.vertex_input = vertex_input;
        self.gfx_pipeline_requires_bind = true;
    }

    pub fn set_vertex_buffers(&mut self, first_binding: u32, buffers: &[Buffer]) {
        if buffers.is_empty() {
            return;
        }

        for buffer in buffers {
            self.register_buffer(buffer, vk::AccessFlags::VERTEX_ATTRIBUTE_READ, UseFlags::READ);
        }

        let handles: Vec<_> = buffers.iter().map(Buffer::get_handle).collect();
        let offsets = vec![0; handles.len()];
        unsafe { self.backend.cmd_bind_vertex_buffers(self.handle, first_binding, &handles, &offsets) };
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        self.register_buffer(buffer, vk::AccessFlags::INDEX_READ, UseFlags::READ);
        unsafe { self.backend.cmd_bind_index_buffer(self.handle, buffer.get_handle(), 0, index_type) };
    }

    /// A graphics pipeline, a render target and a vertex input are set.
    pub fn is_ready_for_render(&self) -> bool {
        self.graphics_pipeline.is_some() && self.framebuffer.is_some() && self.vertex_input.is_some()
    }

    pub fn draw(&mut self, vertex_offset: u32, vertex_count: u32, instance_count: u32) -> Result<(), DeviceError> {
        self.prepare_draw()?;
        unsafe { self.backend.cmd_draw(self.handle, vertex_count, instance_count.max(1), vertex_offset, 0) };
        Ok(())
    }

    pub fn draw_indexed(&mut self, start_index: u32, index_count: u32, vertex_offset: i32, instance_count: u32) -> Result<(), DeviceError> {
        self.prepare_draw()?;
        unsafe { self.backend.cmd_draw_indexed(self.handle, index_count, instance_count.max(1), start_index, vertex_offset, 0) };
        Ok(())
    }

    fn prepare_draw(&mut self) -> Result<(), DeviceError> {
        assert!(self.is_recording(), "Command buffer {} must be recording to draw", self.id);
        assert!(self.is_ready_for_render(), "Command buffer {} needs a graphics pipeline, render target and vertex input to draw", self.id);

        self.bind_gpu_params(true);

        if !self.is_in_render_pass() {
            self.begin_render_pass()?;
        }

        if self.gfx_pipeline_requires_bind {
            self.bind_graphics_pipeline()?;
        } else {
            self.bind_dynamic_states(false);
        }

        if self.descriptor_bind_state.contains(DescriptorBindFlags::GRAPHICS) {
            if let Some(state) = &self.graphics_pipeline {
                if !self.bound_sets.is_empty() {
                    unsafe { self.backend.cmd_bind_descriptor_sets(self.handle, vk::PipelineBindPoint::GRAPHICS, state.get_layout(), 0, &self.bound_sets) };
                }
            }
            self.descriptor_bind_state.remove(DescriptorBindFlags::GRAPHICS);
        }

        Ok(())
    }

    fn bind_graphics_pipeline(&mut self) -> Result<(), DeviceError> {
        let (Some(state), Some(framebuffer), Some(vertex_input)) = (self.graphics_pipeline.clone(), self.framebuffer.clone(), self.vertex_input.clone()) else {
            return Ok(());
        };

        let pipeline = state.get_pipeline(&framebuffer, self.render_target_read_only, self.draw_op, &vertex_input)?;
        self.register_resource(pipeline.as_resource(), UseFlags::READ);

        unsafe { self.backend.cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::GRAPHICS, pipeline.get_handle()) };

        self.bind_dynamic_states(true);
        self.gfx_pipeline_requires_bind = false;
        Ok(())
    }

    fn bind_dynamic_states(&mut self, force: bool) {
        let Some(framebuffer) = &self.framebuffer else {
            return;
        };

        let width = framebuffer.get_width() as f32;
        let height = framebuffer.get_height() as f32;

        if self.viewport_requires_bind || force {
            let viewport = vk::Viewport {
                x: self.viewport.x * width,
                y: self.viewport.y * height,
                width: self.viewport.width * width,
                height: self.viewport.height * height,
                min_depth: 0.0,
                max_depth: 1.0,
            };

            unsafe { self.backend.cmd_set_viewport(self.handle, &viewport) };
            self.viewport_requires_bind = false;
        }

        if self.stencil_ref_requires_bind || force {
            unsafe { self.backend.cmd_set_stencil_reference(self.handle, self.stencil_ref) };
            self.stencil_ref_requires_bind = false;
        }

        if self.scissor_requires_bind || force {
            let scissor_enabled = self.graphics_pipeline.as_ref().map(GraphicsPipelineState::is_scissor_enabled).unwrap_or(false);
            let rect = if scissor_enabled {
                self.scissor
            } else {
                full_area(framebuffer)
            };

            unsafe { self.backend.cmd_set_scissor(self.handle, &rect) };
            self.scissor_requires_bind = false;
        }
    }

    /// Registers the resources of the bound parameters and resolves the sets to bind.
    fn bind_gpu_params(&mut self, in_render_pass: bool) {
        // Registration may end the render pass, which marks the parameters dirty again
        while self.bound_params_dirty {
            self.bound_params_dirty = false;

            match self.bound_params.clone() {
                Some(params) => self.bound_sets = params.prepare_for_bind(self, in_render_pass),
                None => self.bound_sets.clear(),
            }
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        assert!(self.is_recording(), "Command buffer {} must be recording to dispatch", self.id);

        let state = self.compute_pipeline.clone()
            .unwrap_or_else(|| panic!("Command buffer {} needs a compute pipeline to dispatch", self.id));

        if self.is_in_render_pass() {
            self.end_render_pass();
        }

        self.bind_gpu_params(false);
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        self.execute_layout_transitions();

        if self.cmp_pipeline_requires_bind {
            let pipeline = state.get_pipeline().clone();
            self.register_resource(pipeline.as_resource(), UseFlags::READ);

            unsafe { self.backend.cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::COMPUTE, pipeline.get_handle()) };
            self.cmp_pipeline_requires_bind = false;
        }

        if self.descriptor_bind_state.contains(DescriptorBindFlags::COMPUTE) {
            if !self.bound_sets.is_empty() {
                unsafe { self.backend.cmd_bind_descriptor_sets(self.handle, vk::PipelineBindPoint::COMPUTE, state.get_layout(), 0, &self.bound_sets) };
            }
            self.descriptor_bind_state.remove(DescriptorBindFlags::COMPUTE);
        }

        unsafe { self.backend.cmd_dispatch(self.handle, x, y, z) };

        // Shader usage flags only matter until the next dispatch or render pass
        for info in self.images.iter_mut() {
            info.reset_pass_flags();
        }
        if self.bound_params.is_some() {
            self.bound_params_dirty = true;
        }

        Ok(())
    }

    /// Signals the event once all previously recorded commands completed. Inside a render pass the
    /// event is signaled when the pass ends.
    pub fn set_event(&mut self, event: &Event) {
        assert!(self.is_recording(), "Command buffer {} must be recording to set an event", self.id);

        self.register_resource(event.as_resource(), UseFlags::WRITE);

        if self.is_in_render_pass() {
            self.queued_events.push(event.clone());
        } else {
            unsafe { self.backend.cmd_set_event(self.handle, event.get_handle(), vk::PipelineStageFlags::ALL_COMMANDS) };
        }
    }

    /// Resets query slots. Inside a render pass the reset is deferred to a helper buffer executed
    /// before this one.
    pub fn reset_query(&mut self, pool: &QueryPool, first: u32, count: u32) {
        assert!(self.is_recording(), "Command buffer {} must be recording to reset queries", self.id);

        self.register_resource(pool.as_resource(), UseFlags::WRITE);

        if self.is_in_render_pass() {
            self.queued_query_resets.push(QueryReset {
                pool: pool.get_handle(),
                first,
                count,
            });
        } else {
            unsafe { self.backend.cmd_reset_query_pool(self.handle, pool.get_handle(), first, count) };
        }
    }

    pub fn begin_query(&mut self, query: &Query) {
        assert!(self.is_recording(), "Command buffer {} must be recording to begin a query", self.id);
        assert!(!query.is_in_progress(), "Query is already in progress");

        let slot = query.current_slot();
        self.begin_query_segment(query, slot);
    }

    pub fn end_query(&mut self, query: &Query) {
        assert!(self.is_recording(), "Command buffer {} must be recording to end a query", self.id);
        assert!(query.is_in_progress(), "Query is not in progress");

        self.end_query_segment(query);
        query.set_in_progress(false);
        self.queries.retain(|tracked| !tracked.ptr_eq(query));
    }

    /// Ends the current segment of an in progress query without ending the query.
    pub fn interrupt_query(&mut self, query: &Query) {
        assert!(query.is_in_progress(), "Query is not in progress");
        self.end_query_segment(query);
    }

    /// Continues an interrupted query in a new segment.
    pub fn resume_query(&mut self, query: &Query) {
        assert!(self.is_recording(), "Command buffer {} must be recording to resume a query", self.id);
        assert!(query.is_in_progress(), "Query is not in progress");

        let slot = query.next_segment();
        self.begin_query_segment(query, slot);
    }

    /// Queries begun on this buffer that have not been ended.
    pub fn get_in_progress_queries(&self) -> Vec<Query> {
        self.queries.iter().filter(|query| query.is_in_progress()).cloned().collect()
    }

    fn begin_query_segment(&mut self, query: &Query, slot: u32) {
        let pool = query.get_pool().clone();
        let kind = query.get_kind();
        self.reset_query(&pool, slot, kind.slot_count());

        match kind {
            QueryKind::Occlusion => unsafe {
                self.backend.cmd_begin_query(self.handle, pool.get_handle(), slot, vk::QueryControlFlags::empty())
            },
            QueryKind::Timestamp => unsafe {
                self.backend.cmd_write_timestamp(self.handle, vk::PipelineStageFlags::TOP_OF_PIPE, pool.get_handle(), slot)
            },
        }

        query.set_in_progress(true);
        if !self.queries.iter().any(|tracked| tracked.ptr_eq(query)) {
            self.queries.push(query.clone());
        }
    }

    fn end_query_segment(&mut self, query: &Query) {
        let pool = query.get_pool().get_handle();
        let slot = query.current_slot();

        match query.get_kind() {
            QueryKind::Occlusion => unsafe {
                self.backend.cmd_end_query(self.handle, pool, slot)
            },
            QueryKind::Timestamp => unsafe {
                self.backend.cmd_write_timestamp(self.handle, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, slot + 1)
            },
        }
    }

    /// Records a barrier on the whole buffer.
    pub fn memory_barrier(&mut self, buffer: &Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) {
        assert!(self.is_recording(), "Command buffer {} must be recording to record a barrier", self.id);

        if self.is_in_render_pass() {
            self.end_render_pass();
        }

        self.register_buffer(buffer, dst_access, UseFlags::READ);

        let barrier = buffer_barrier(buffer.get_handle(), src_access, dst_access);
        unsafe { self.backend.cmd_pipeline_barrier(self.handle, src_stage, dst_stage, &[], &[barrier], &[]) };
    }

    /// Records a memory dependency on sub-resources without changing their layout.
    pub fn image_memory_barrier(&mut self, image: &Image, range: &vk::ImageSubresourceRange, src_access: vk::AccessFlags, dst_access: vk::AccessFlags, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) {
        assert!(self.is_recording(), "Command buffer {} must be recording to record a barrier", self.id);

        if self.is_in_render_pass() {
            self.end_render_pass();
        }

        let layout = self.get_current_layout(image, range, false);
        let barrier = image_barrier(image.get_handle(), range, src_access, dst_access, layout, layout);
        unsafe { self.backend.cmd_pipeline_barrier(self.handle, src_stage, dst_stage, &[], &[], std::slice::from_ref(&barrier)) };
    }

    /// Transitions sub-resources to a new layout immediately. The tracked layout of the range is
    /// replaced and no transition into it is issued at submission.
    pub fn set_layout(&mut self, image: &Image, range: &vk::ImageSubresourceRange, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) {
        assert!(self.is_recording(), "Command buffer {} must be recording to change an image layout", self.id);

        if self.is_in_render_pass() {
            self.end_render_pass();
        }

        self.register_image(image, range, new_layout, new_layout, UseFlags::WRITE, ResourceUsage::Transfer);

        let barrier = image_barrier(image.get_handle(), range, src_access, dst_access, old_layout, new_layout);
        unsafe {
            self.backend.cmd_pipeline_barrier(self.handle, vk::PipelineStageFlags::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS, &[], &[], std::slice::from_ref(&barrier))
        };
    }

    /// Submits the buffer on `queue`.
    ///
    /// The buffer waits on every queue in `sync_mask` and on every queue still using one of its
    /// resources in a conflicting way. Queue family ownership transfers, deferred query resets and
    /// transitions into the layouts expected at the start of the buffer are recorded into helper
    /// buffers submitted right before this one.
    pub fn submit(mut self, device: &Device, queue: &Queue, sync_mask: SyncMask) -> Result<(), DeviceError> {
        assert_eq!(self.state, CmdBufferState::RecordingDone, "Command buffer {} must be ended before submitting", self.id);
        assert_eq!(queue.get_family(), self.get_queue_family(), "Command buffer {} submitted to a queue of a different family", self.id);

        let family = self.get_queue_family();

        unsafe { self.backend.reset_fences(std::slice::from_ref(&self.fence)) }.map_err(|err| {
            log::error!("Failed to reset fence of command buffer {} {:?}", self.id, err);
            DeviceError::from(err)
        })?;

        let mut sync_mask = sync_mask;
        for (resource, flags, _) in self.tracked_mut() {
            let conflicting = if flags.contains(UseFlags::WRITE) { UseFlags::READ_WRITE } else { UseFlags::WRITE };
            sync_mask = sync_mask.union(SyncMask::from_raw(resource.get_use_info(conflicting)));
        }

        let mut transfers: HashMap<u32, OwnershipTransfer> = HashMap::new();
        let mut local_buffers = Vec::new();
        let mut local_images = Vec::new();
        let mut final_layouts = Vec::new();

        for info in self.buffers.iter() {
            let resource = info.buffer.as_resource();
            if !resource.is_exclusive() {
                continue;
            }

            if let Some(current) = resource.get_queue_family().filter(|current| *current != family) {
                let barrier = vk::BufferMemoryBarrier::builder()
                    .src_access_mask(info.access)
                    .dst_access_mask(info.access)
                    .src_queue_family_index(current)
                    .dst_queue_family_index(family)
                    .buffer(info.buffer.get_handle())
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();

                transfers.entry(current).or_default().buffers.push(barrier);
                local_buffers.push(barrier);
            }
        }

        for info in self.images.iter() {
            let resource = info.image.as_resource();
            let transfer_from = if resource.is_exclusive() {
                resource.get_queue_family().filter(|current| *current != family)
            } else {
                None
            };

            for record in info.records.iter() {
                if let Some(current) = transfer_from {
                    let mut barriers = info.image.get_barriers(&record.range);
                    for barrier in barriers.iter_mut() {
                        barrier.dst_access_mask = barrier.src_access_mask;
                        barrier.src_queue_family_index = current;
                        barrier.dst_queue_family_index = family;
                    }

                    transfers.entry(current).or_default().images.extend(barriers.iter().copied());
                    local_images.extend(barriers);
                }

                if !record.has_external_transition && record.has_transitioned && record.initial_layout != vk::ImageLayout::UNDEFINED {
                    local_images.extend(info.image.layout_barriers(&record.range, record.initial_layout, record.is_initial_read_only));
                }

                final_layouts.push((info.image.clone(), record.range, record.final_layout));
            }
        }

        for (src_family, transfer) in transfers {
            let Some(other) = device.find_queue_for_family(src_family) else {
                log::warn!("No queue of family {} to release resources used by command buffer {}", src_family, self.id);
                continue;
            };

            let mut helper = device.get_cmd_buffer_for_family(src_family)?;
            helper.begin()?;
            helper.record_barriers(&transfer.buffers, &transfer.images);
            helper.end()?;
            other.submit(helper, Vec::new())?;

            sync_mask = sync_mask.union(SyncMask::for_queue(other.get_type(), other.get_index()));
        }

        let query_resets = std::mem::take(&mut self.queued_query_resets);
        let local_helper = if !query_resets.is_empty() || !local_buffers.is_empty() || !local_images.is_empty() {
            let mut helper = device.get_cmd_buffer_for_family(family)?;
            helper.begin()?;
            for reset in query_resets {
                unsafe { helper.backend.cmd_reset_query_pool(helper.handle, reset.pool, reset.first, reset.count) };
            }
            helper.record_barriers(&local_buffers, &local_images);
            helper.end()?;
            Some(helper)
        } else {
            None
        };

        sync_mask = sync_mask.without(SyncMask::for_queue(queue.get_type(), queue.get_index()));
        let mut waits = device.get_sync_semaphores(sync_mask);
        for swap_chain in std::mem::take(&mut self.swap_chains) {
            if let Some(semaphore) = swap_chain.take_wait_semaphore() {
                semaphore.as_resource().notify_bound();
                waits.push(semaphore);
            }
        }

        if let Some(helper) = local_helper {
            queue.queue_submit(helper, std::mem::take(&mut waits));
        }

        let global_idx = queue.get_global_idx();
        for (resource, flags, used) in self.tracked_mut() {
            resource.notify_used(global_idx, family, flags);
            *used = true;
        }
        self.global_queue_idx = Some(global_idx);
        self.clear_binding_state();

        queue.queue_submit(self, waits);
        queue.submit_queued()?;

        // Only a buffer that reached the queue leaves its images in the final layouts
        for (image, range, layout) in final_layouts {
            image.set_layout(&range, layout);
        }
        Ok(())
    }

    /// Records a submission that never reached the queue. The buffer is retired without waiting
    /// on its fence and releases its resources as if it had executed.
    pub(crate) fn mark_failed(&mut self, global_queue_idx: u32) {
        self.global_queue_idx = Some(global_queue_idx);
    }

    pub(crate) fn mark_submitted(&mut self, global_queue_idx: u32) {
        self.global_queue_idx = Some(global_queue_idx);
        self.state = CmdBufferState::Submitted;
    }

    /// Creates the semaphores signaled by the next submission and returns their handles.
    ///
    /// The first one orders the next submission on the same queue, the rest are handed out to
    /// other queues through [`CmdBuffer::request_inter_queue_semaphore`]. Semaphores of the
    /// previous submission are destroyed.
    pub(crate) fn allocate_semaphores(&mut self) -> Result<Vec<vk::Semaphore>, DeviceError> {
        self.destroy_semaphores();

        let intra = self.manager.create_semaphore()?;
        let mut handles = vec![intra.get_handle()];
        self.intra_queue_semaphore = Some(intra);

        for _ in 0..self.max_dependencies {
            let semaphore = self.manager.create_semaphore()?;
            handles.push(semaphore.get_handle());
            self.inter_queue_semaphores.push(semaphore);
        }
        self.used_inter_queue_semaphores = 0;

        Ok(handles)
    }

    pub fn get_intra_queue_semaphore(&self) -> Option<&Semaphore> {
        self.intra_queue_semaphore.as_ref()
    }

    /// Hands out the next unused inter queue semaphore, or [`None`] once all are taken.
    pub fn request_inter_queue_semaphore(&mut self) -> Option<Semaphore> {
        let semaphore = self.inter_queue_semaphores.get(self.used_inter_queue_semaphores)?.clone();
        self.used_inter_queue_semaphores += 1;
        Some(semaphore)
    }

    fn destroy_semaphores(&mut self) {
        if let Some(semaphore) = self.intra_queue_semaphore.take() {
            semaphore.as_resource().destroy();
        }
        for semaphore in self.inter_queue_semaphores.drain(..) {
            semaphore.as_resource().destroy();
        }
        self.used_inter_queue_semaphores = 0;
    }

    /// Returns true once the last submission completed. Blocks up to the configured fence timeout
    /// if `block` is set. A timeout is not an error.
    pub fn check_fence_status(&self, block: bool) -> Result<bool, DeviceError> {
        let timeout = if block { self.fence_timeout_ns } else { 0 };

        match unsafe { self.backend.wait_for_fences(std::slice::from_ref(&self.fence), timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => {
                log::error!("Failed to wait for fence of command buffer {} {:?}", self.id, err);
                Err(err.into())
            }
        }
    }

    /// Releases every tracked resource and returns the buffer to the ready state.
    ///
    /// Resources are marked done if the buffer was submitted and unbound otherwise. A submitted
    /// buffer must have completed.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        self.release_resources();
        self.clear_binding_state();
        self.state = CmdBufferState::Ready;

        unsafe { self.backend.reset_command_buffer(self.handle) }.map_err(|err| {
            log::error!("Failed to reset command buffer {} {:?}", self.id, err);
            DeviceError::from(err)
        })
    }

    fn tracked_mut(&mut self) -> impl Iterator<Item = (&Resource, UseFlags, &mut bool)> + '_ {
        let resources = self.resources.iter_mut().map(|info| (&info.resource, info.flags, &mut info.used));
        let images = self.images.iter_mut().map(|info| (info.image.as_resource(), info.use_flags, &mut info.used));
        let buffers = self.buffers.iter_mut().map(|info| (info.buffer.as_resource(), info.flags, &mut info.used));

        resources.chain(images).chain(buffers)
    }

    fn release_resources(&mut self) {
        let global_idx = self.global_queue_idx.take();
        for (resource, flags, used) in self.tracked_mut() {
            match global_idx {
                Some(idx) if *used => resource.notify_done(idx, flags),
                _ => resource.notify_unbound(),
            }
        }

        self.resources.clear();
        self.resource_lookup.clear();
        self.images.clear();
        self.image_lookup.clear();
        self.buffers.clear();
        self.buffer_lookup.clear();
        self.queued_transitions.clear();
        self.swap_chains.clear();
        self.queries.clear();
        self.queued_query_resets.clear();
        self.queued_events.clear();
    }

    fn clear_binding_state(&mut self) {
        self.framebuffer = None;
        self.render_target_read_only = RenderSurfaceMask::empty();
        self.render_target_load = RenderSurfaceMask::empty();
        self.clear.mask = RenderSurfaceMask::empty();

        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.bound_params = None;
        self.bound_params_dirty = false;
        self.bound_sets.clear();
        self.descriptor_bind_state = DescriptorBindFlags::empty();
        self.gfx_pipeline_requires_bind = true;
        self.cmp_pipeline_requires_bind = true;
        self.viewport = ViewportRect::full();
        self.viewport_requires_bind = true;
        self.scissor = vk::Rect2D::default();
        self.scissor_requires_bind = true;
        self.stencil_ref = 0;
        self.stencil_ref_requires_bind = true;
        self.draw_op = vk::PrimitiveTopology::TRIANGLE_LIST;
        self.vertex_input = None;
    }
}

impl Drop for CmdBuffer {
    fn drop(&mut self) {
        if self.state == CmdBufferState::Submitted {
            match self.check_fence_status(true) {
                Ok(true) => {}
                Ok(false) => log::warn!("Freeing command buffer {} that is still executing", self.id),
                Err(err) => log::error!("Failed to wait for command buffer {} before freeing it {:?}", self.id, err),
            }
        }

        if self.state != CmdBufferState::Ready {
            self.release_resources();
        }
        self.destroy_semaphores();

        unsafe {
            self.backend.destroy_fence(self.fence);
            self.backend.free_command_buffer(self.family.get_handle(), self.handle);
        }
        self.family.notify_freed();
    }
}

assert_impl_all!(CmdBuffer: Send);
assert_not_impl_any!(CmdBuffer: Sync);

fn full_area(framebuffer: &Framebuffer) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: framebuffer.get_extent(),
    }
}

fn rect_eq(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x && a.offset.y == b.offset.y && a.extent.width == b.extent.width && a.extent.height == b.extent.height
}
