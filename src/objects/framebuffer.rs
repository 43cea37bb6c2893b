use std::collections::HashMap;
use std::sync::Mutex;

use ash::vk;
use bitflags::bitflags;

use crate::device::backend::{DeviceBackend, RenderPassAttachment, RenderPassDesc};
use crate::device::error::DeviceError;
use crate::objects::image::{Image, ImageSurface};
use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

pub const MAX_COLOR_ATTACHMENTS: u32 = 8;

bitflags! {
    /// Selects surfaces of a render target. Used for load, read-only and clear masks.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct RenderSurfaceMask: u32 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const DEPTH = 1 << 30;
        const STENCIL = 1 << 31;

        const ALL_COLOR = 0xFF;
        const DEPTH_STENCIL = Self::DEPTH.bits() | Self::STENCIL.bits();
        const ALL = Self::ALL_COLOR.bits() | Self::DEPTH_STENCIL.bits();
    }
}

impl RenderSurfaceMask {
    pub fn color(index: u32) -> Self {
        assert!(index < MAX_COLOR_ATTACHMENTS, "Color attachment index {} out of range", index);
        Self::from_bits_truncate(1u32 << index)
    }
}

#[derive(Clone, Debug)]
pub struct FramebufferAttachment {
    pub image: Image,
    pub view: vk::ImageView,
    pub surface: ImageSurface,

    /// Layout the render pass leaves the attachment in.
    pub final_layout: vk::ImageLayout,
}

impl FramebufferAttachment {
    pub fn new(image: Image, view: vk::ImageView, surface: ImageSurface, final_layout: vk::ImageLayout) -> Self {
        Self {
            image,
            view,
            surface,
            final_layout,
        }
    }

    pub fn get_range(&self) -> vk::ImageSubresourceRange {
        self.image.get_surface_range(&self.surface)
    }
}

#[derive(Clone, Debug)]
pub struct FramebufferDesc {
    pub color: Vec<FramebufferAttachment>,
    pub depth: Option<FramebufferAttachment>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub samples: vk::SampleCountFlags,
}

impl FramebufferDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            color: Vec::new(),
            depth: None,
            width,
            height,
            layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn color(mut self, attachment: FramebufferAttachment) -> Self {
        assert!((self.color.len() as u32) < MAX_COLOR_ATTACHMENTS, "Too many color attachments");
        self.color.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: FramebufferAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }

    pub fn layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

/// A render pass and framebuffer compatible with one combination of load, read-only and clear masks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FramebufferVariant {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
}

type VariantKey = (RenderSurfaceMask, RenderSurfaceMask, RenderSurfaceMask);

pub struct FramebufferData {
    desc: FramebufferDesc,
    variants: Mutex<HashMap<VariantKey, FramebufferVariant>>,
}

impl FramebufferData {
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        let mut guard = self.variants.lock().unwrap();
        for (_, variant) in guard.drain() {
            backend.destroy_framebuffer(variant.framebuffer);
            backend.destroy_render_pass(variant.render_pass);
        }
    }
}

/// Layout a color attachment has inside a render pass.
pub fn color_attachment_layout(read_only: bool) -> vk::ImageLayout {
    if read_only {
        vk::ImageLayout::GENERAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// Layout the depth stencil attachment has inside a render pass given which aspects are read only.
pub fn depth_attachment_layout(read_mask: RenderSurfaceMask) -> vk::ImageLayout {
    match (read_mask.contains(RenderSurfaceMask::DEPTH), read_mask.contains(RenderSurfaceMask::STENCIL)) {
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
        (false, true) => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
        (false, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

fn load_op(load: bool, clear: bool) -> vk::AttachmentLoadOp {
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else if load {
        vk::AttachmentLoadOp::LOAD
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    }
}

/// A set of attachments rendered to together.
///
/// Render passes and native framebuffers are created lazily per combination of masks and cached
/// for the lifetime of the resource.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Framebuffer(Resource);

impl Framebuffer {
    fn data(&self) -> &FramebufferData {
        match self.0.get_payload() {
            ResourcePayload::Framebuffer(data) => data,
            _ => unreachable!(),
        }
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }

    pub fn get_desc(&self) -> &FramebufferDesc {
        &self.data().desc
    }

    pub fn get_color_attachments(&self) -> &[FramebufferAttachment] {
        &self.data().desc.color
    }

    pub fn get_depth_attachment(&self) -> Option<&FramebufferAttachment> {
        self.data().desc.depth.as_ref()
    }

    pub fn get_width(&self) -> u32 {
        self.data().desc.width
    }

    pub fn get_height(&self) -> u32 {
        self.data().desc.height
    }

    pub fn get_layers(&self) -> u32 {
        self.data().desc.layers
    }

    pub fn get_samples(&self) -> vk::SampleCountFlags {
        self.data().desc.samples
    }

    pub fn get_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.get_width(),
            height: self.get_height(),
        }
    }

    /// Number of clear values a render pass begin needs for the clear mask.
    pub fn clear_entry_count(&self, clear: RenderSurfaceMask) -> u32 {
        if clear.is_empty() {
            return 0;
        }

        let color_count = self.get_color_attachments().len() as u32;
        if clear.intersects(RenderSurfaceMask::DEPTH_STENCIL) && self.get_depth_attachment().is_some() {
            return color_count + 1;
        }

        let color_bits = (clear & RenderSurfaceMask::ALL_COLOR).bits();
        if color_bits == 0 {
            0
        } else {
            (u32::BITS - color_bits.leading_zeros()).min(color_count)
        }
    }

    /// Layout the attachment is in while a render pass with the read mask is active.
    pub fn get_attachment_layout(&self, color_index: Option<u32>, read: RenderSurfaceMask) -> vk::ImageLayout {
        match color_index {
            Some(index) => color_attachment_layout(read.contains(RenderSurfaceMask::color(index))),
            None => depth_attachment_layout(read),
        }
    }

    /// Returns the render pass and framebuffer for the provided masks, creating them if needed.
    pub fn get_variant(&self, backend: &dyn DeviceBackend, load: RenderSurfaceMask, read: RenderSurfaceMask, clear: RenderSurfaceMask) -> Result<FramebufferVariant, DeviceError> {
        let data = self.data();
        let mut guard = data.variants.lock().unwrap();
        if let Some(variant) = guard.get(&(load, read, clear)) {
            return Ok(*variant);
        }

        let desc = self.build_render_pass(load, read, clear);
        let render_pass = unsafe { backend.create_render_pass(&desc) }.map_err(|err| {
            log::error!("Failed to create render pass {:?}", err);
            DeviceError::from(err)
        })?;

        let views: Vec<_> = data.desc.color.iter()
            .chain(data.desc.depth.iter())
            .map(|attachment| attachment.view)
            .collect();

        let framebuffer = match unsafe { backend.create_framebuffer(render_pass, &views, self.get_extent(), data.desc.layers) } {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                log::error!("Failed to create framebuffer {:?}", err);
                unsafe { backend.destroy_render_pass(render_pass) };
                return Err(DeviceError::from(err));
            }
        };

        log::debug!("Created framebuffer variant for {:?} (load {:?}, read {:?}, clear {:?})", self.0.get_id(), load, read, clear);

        let variant = FramebufferVariant {
            render_pass,
            framebuffer,
        };
        guard.insert((load, read, clear), variant);
        Ok(variant)
    }

    fn build_render_pass(&self, load: RenderSurfaceMask, read: RenderSurfaceMask, clear: RenderSurfaceMask) -> RenderPassDesc {
        let desc = &self.data().desc;

        let mut attachments = Vec::with_capacity(desc.color.len() + 1);
        let mut color_layouts = Vec::with_capacity(desc.color.len());
        for (index, attachment) in desc.color.iter().enumerate() {
            let bit = RenderSurfaceMask::color(index as u32);
            let loaded = load.contains(bit);
            let layout = color_attachment_layout(read.contains(bit));

            attachments.push(RenderPassAttachment {
                format: attachment.image.get_format(),
                samples: desc.samples,
                load_op: load_op(loaded, clear.contains(bit)),
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if loaded { layout } else { vk::ImageLayout::UNDEFINED },
                final_layout: attachment.final_layout,
            });
            color_layouts.push(layout);
        }

        let depth_layout = depth_attachment_layout(read);
        if let Some(attachment) = &desc.depth {
            let loaded = load.intersects(RenderSurfaceMask::DEPTH_STENCIL);

            attachments.push(RenderPassAttachment {
                format: attachment.image.get_format(),
                samples: desc.samples,
                load_op: load_op(loaded, clear.contains(RenderSurfaceMask::DEPTH)),
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: load_op(loaded, clear.contains(RenderSurfaceMask::STENCIL)),
                stencil_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: if loaded { depth_layout } else { vk::ImageLayout::UNDEFINED },
                final_layout: attachment.final_layout,
            });
        }

        RenderPassDesc {
            attachments,
            color_layouts,
            has_depth: desc.depth.is_some(),
            depth_layout,
        }
    }
}

impl ResourceKind for Framebuffer {
    type Desc = FramebufferDesc;

    fn into_payload(desc: FramebufferDesc) -> ResourcePayload {
        ResourcePayload::Framebuffer(FramebufferData {
            desc,
            variants: Mutex::new(HashMap::new()),
        })
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}
