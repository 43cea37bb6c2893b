use std::sync::Mutex;

use ash::vk;
use bitflags::bitflags;

use crate::device::backend::DeviceBackend;
use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

bitflags! {
    /// How an image is used by the renderer. Determines its optimal layout and the access flags
    /// of its layouts.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const LOAD_STORE = 1 << 3;
        const DYNAMIC = 1 << 4;
    }
}

/// A single mip level of a range of array layers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageSurface {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageSurface {
    pub fn new(mip_level: u32, base_layer: u32, layer_count: u32) -> Self {
        Self {
            mip_level,
            base_layer,
            layer_count,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ImageDesc {
    pub handle: vk::Image,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: ImageUsage,
    pub initial_layout: vk::ImageLayout,
    pub owned: bool,
}

impl ImageDesc {
    pub fn new(handle: vk::Image, format: vk::Format, aspect_mask: vk::ImageAspectFlags, mip_levels: u32, array_layers: u32, usage: ImageUsage) -> Self {
        Self {
            handle,
            format,
            aspect_mask,
            mip_levels,
            array_layers,
            usage,
            initial_layout: vk::ImageLayout::UNDEFINED,
            owned: true,
        }
    }

    /// The layout the image is in when it is handed to the resource manager.
    pub fn initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }

    /// Marks the image as externally owned. The handle is not destroyed with the resource.
    pub fn external(mut self) -> Self {
        self.owned = false;
        self
    }
}

pub struct ImageData {
    desc: ImageDesc,

    /// Layout of every sub-resource as of the last submission, indexed by `layer * mip_levels + mip`.
    layouts: Mutex<Vec<vk::ImageLayout>>,
}

impl ImageData {
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        if self.desc.owned {
            backend.destroy_image(self.desc.handle);
        }
    }

    fn layout_index(&self, layer: u32, mip: u32) -> usize {
        assert!(layer < self.desc.array_layers && mip < self.desc.mip_levels,
                "Sub-resource (layer {}, mip {}) out of bounds", layer, mip);
        (layer * self.desc.mip_levels + mip) as usize
    }
}

/// An image with a global per sub-resource layout table.
///
/// The table reflects the layouts the image is left in by submitted command buffers. It is updated
/// at submission time, not while recording.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Image(Resource);

impl Image {
    fn data(&self) -> &ImageData {
        match self.0.get_payload() {
            ResourcePayload::Image(data) => data,
            _ => unreachable!(),
        }
    }

    pub fn get_handle(&self) -> vk::Image {
        self.data().desc.handle
    }

    pub fn get_desc(&self) -> &ImageDesc {
        &self.data().desc
    }

    pub fn get_format(&self) -> vk::Format {
        self.data().desc.format
    }

    pub fn get_usage(&self) -> ImageUsage {
        self.data().desc.usage
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }

    /// The range covering every sub-resource of the image.
    pub fn get_range(&self) -> vk::ImageSubresourceRange {
        let desc = &self.data().desc;
        vk::ImageSubresourceRange {
            aspect_mask: desc.aspect_mask,
            base_mip_level: 0,
            level_count: desc.mip_levels,
            base_array_layer: 0,
            layer_count: desc.array_layers,
        }
    }

    pub fn get_surface_range(&self, surface: &ImageSurface) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.data().desc.aspect_mask,
            base_mip_level: surface.mip_level,
            level_count: 1,
            base_array_layer: surface.base_layer,
            layer_count: surface.layer_count,
        }
    }

    pub fn get_layout(&self, layer: u32, mip: u32) -> vk::ImageLayout {
        let data = self.data();
        let index = data.layout_index(layer, mip);
        data.layouts.lock().unwrap()[index]
    }

    pub fn set_layout(&self, range: &vk::ImageSubresourceRange, layout: vk::ImageLayout) {
        let data = self.data();
        let mut guard = data.layouts.lock().unwrap();
        for layer in range.base_array_layer..(range.base_array_layer + range.layer_count) {
            for mip in range.base_mip_level..(range.base_mip_level + range.level_count) {
                guard[data.layout_index(layer, mip)] = layout;
            }
        }
    }

    /// Returns true if every sub-resource in the range is in the provided layout.
    pub fn is_in_layout(&self, range: &vk::ImageSubresourceRange, layout: vk::ImageLayout) -> bool {
        let data = self.data();
        let guard = data.layouts.lock().unwrap();
        (range.base_array_layer..(range.base_array_layer + range.layer_count)).all(|layer| {
            (range.base_mip_level..(range.base_mip_level + range.level_count)).all(|mip| {
                guard[data.layout_index(layer, mip)] == layout
            })
        })
    }

    /// The layout the image is kept in when not used as an attachment or transfer target.
    pub fn optimal_layout(&self) -> vk::ImageLayout {
        let usage = self.get_usage();
        if usage.contains(ImageUsage::LOAD_STORE) {
            vk::ImageLayout::GENERAL
        } else if usage.contains(ImageUsage::RENDER_TARGET) {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else if usage.contains(ImageUsage::DEPTH_STENCIL) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else if usage.contains(ImageUsage::DYNAMIC) {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    }

    /// Access flags valid for a layout given how the image is used.
    pub fn get_access_flags(&self, layout: vk::ImageLayout, read_only: bool) -> vk::AccessFlags {
        let usage = self.get_usage();
        match layout {
            vk::ImageLayout::GENERAL => {
                let mut flags = vk::AccessFlags::SHADER_READ;

                if usage.contains(ImageUsage::LOAD_STORE) && !read_only {
                    flags |= vk::AccessFlags::SHADER_WRITE;
                }

                if usage.contains(ImageUsage::RENDER_TARGET) {
                    flags |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
                    if !read_only {
                        flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
                    }
                } else if usage.contains(ImageUsage::DEPTH_STENCIL) {
                    flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
                    if !read_only {
                        flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
                    }
                }

                flags
            }
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL |
            vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL |
            vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::empty(),
            _ => {
                log::warn!("Unsupported image layout {:?} in access flag query", layout);
                vk::AccessFlags::empty()
            }
        }
    }

    /// Builds barriers covering `range` grouped by their current global layout.
    ///
    /// Consecutive array layers of the same mip level sharing a layout are merged into one
    /// barrier. The new layout of every barrier equals its old layout and the destination access
    /// is empty, callers fill these in.
    pub fn get_barriers(&self, range: &vk::ImageSubresourceRange) -> Vec<vk::ImageMemoryBarrier> {
        let data = self.data();
        let guard = data.layouts.lock().unwrap();
        let handle = data.desc.handle;

        let mut barriers = Vec::new();
        let layer_end = range.base_array_layer + range.layer_count;
        for mip in range.base_mip_level..(range.base_mip_level + range.level_count) {
            let mut layer = range.base_array_layer;
            while layer < layer_end {
                let layout = guard[data.layout_index(layer, mip)];

                let mut end = layer + 1;
                while end < layer_end && guard[data.layout_index(end, mip)] == layout {
                    end += 1;
                }

                barriers.push(vk::ImageMemoryBarrier::builder()
                    .src_access_mask(self.get_access_flags(layout, false))
                    .old_layout(layout)
                    .new_layout(layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(handle)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: range.aspect_mask,
                        base_mip_level: mip,
                        level_count: 1,
                        base_array_layer: layer,
                        layer_count: end - layer,
                    })
                    .build()
                );

                layer = end;
            }
        }

        barriers
    }

    /// Builds the barriers needed to move every sub-resource in `range` from its global layout to
    /// `new_layout`. Sub-resources already in `new_layout` are skipped.
    pub fn layout_barriers(&self, range: &vk::ImageSubresourceRange, new_layout: vk::ImageLayout, read_only: bool) -> Vec<vk::ImageMemoryBarrier> {
        let dst_access = self.get_access_flags(new_layout, read_only);
        let mut barriers = self.get_barriers(range);
        barriers.retain(|barrier| barrier.old_layout != new_layout);
        for barrier in barriers.iter_mut() {
            barrier.new_layout = new_layout;
            barrier.dst_access_mask = dst_access;
        }
        barriers
    }
}

impl ResourceKind for Image {
    type Desc = ImageDesc;

    fn into_payload(desc: ImageDesc) -> ResourcePayload {
        let count = (desc.mip_levels * desc.array_layers) as usize;
        ResourcePayload::Image(ImageData {
            desc,
            layouts: Mutex::new(vec![desc.initial_layout; count]),
        })
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}
