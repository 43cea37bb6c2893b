//! Per sub-resource layout tracking of images referenced by a command buffer.
//!
//! An image is tracked as a list of disjoint sub-resource ranges, each with its own layout state.
//! Registering a range that partially overlaps existing records splits them so that every record
//! keeps a uniform state.

use ash::vk;

use crate::objects::image::Image;
use crate::objects::resource::UseFlags;
use crate::util::range::{cut_range, range_contains_subresource, ranges_overlap, subtract_ranges};

/// The context an image is registered in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Bound through a descriptor.
    ShaderBind,

    /// Attachment of the current framebuffer.
    Framebuffer,

    /// The caller transitions the layout itself, for example as part of a copy.
    Transfer,
}

/// State of the command buffer relevant to a registration.
#[derive(Copy, Clone, Debug, Default)]
pub struct RegisterContext {
    pub in_render_pass: bool,

    /// The current render target has read only depth or stencil.
    pub depth_stencil_read_only: bool,
}

/// A shader write hazard on a sub-resource that must be resolved with a barrier before the next
/// shader access.
#[derive(Copy, Clone, Debug)]
pub struct ShaderBarrier {
    pub range: vk::ImageSubresourceRange,
    pub layout: vk::ImageLayout,
    pub read_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RegisterOutcome {
    /// The active render pass must be ended before the registration takes effect.
    pub end_render_pass: bool,

    /// At least one record needs a layout transition before its next use.
    pub queue_transition: bool,

    pub barriers: Vec<ShaderBarrier>,
}

/// Layout state of one range of sub-resources.
#[derive(Copy, Clone, Debug)]
pub struct ImageSubresourceInfo {
    pub range: vk::ImageSubresourceRange,

    /// Layout the range must be in when the command buffer starts executing.
    pub initial_layout: vk::ImageLayout,

    /// Layout as of the last recorded command.
    pub current_layout: vk::ImageLayout,

    /// Layout needed by the next use.
    pub required_layout: vk::ImageLayout,

    /// Layout the range is left in once the command buffer finishes.
    pub final_layout: vk::ImageLayout,

    pub is_fb_attachment: bool,
    pub is_shader_input: bool,
    pub has_transitioned: bool,
    pub has_external_transition: bool,
    pub is_read_only: bool,
    pub is_initial_read_only: bool,
    pub needs_barrier: bool,

    /// Touched since the last render pass ended. Cleared by [`ImageInfo::reset_pass_flags`].
    pub pass_touched: bool,
}

impl ImageSubresourceInfo {
    pub fn new(range: vk::ImageSubresourceRange, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage) -> Self {
        let is_transfer = usage == ResourceUsage::Transfer;
        let is_write = flags.contains(UseFlags::WRITE);
        let is_read_only = is_transfer || !is_write;

        Self {
            range,
            initial_layout: new_layout,
            current_layout: new_layout,
            required_layout: new_layout,
            final_layout,
            is_fb_attachment: usage == ResourceUsage::Framebuffer,
            is_shader_input: usage == ResourceUsage::ShaderBind,
            has_transitioned: is_transfer || new_layout != vk::ImageLayout::UNDEFINED,
            has_external_transition: is_transfer,
            is_read_only,
            is_initial_read_only: is_read_only,
            needs_barrier: usage == ResourceUsage::ShaderBind && is_write,
            pass_touched: true,
        }
    }

    /// Applies a registration to the record. Returns whether the render pass must be restarted for
    /// the new use and whether the record needs a layout transition.
    fn update(&mut self, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage, ctx: &RegisterContext) -> (bool, bool) {
        let is_transfer = usage == ResourceUsage::Transfer;
        let is_fb = usage == ResourceUsage::Framebuffer;
        let is_shader = usage == ResourceUsage::ShaderBind;

        self.pass_touched = true;
        if !is_transfer {
            self.is_read_only &= !flags.contains(UseFlags::WRITE);
        }

        if is_transfer {
            self.required_layout = new_layout;
        } else if new_layout != vk::ImageLayout::UNDEFINED {
            if is_fb {
                self.required_layout = new_layout;
            } else if !self.is_fb_attachment {
                let first_use = !self.is_shader_input;
                if first_use || self.required_layout == vk::ImageLayout::UNDEFINED {
                    self.required_layout = new_layout;
                } else if self.required_layout != new_layout {
                    // Two different layouts within one pass
                    self.required_layout = vk::ImageLayout::GENERAL;
                }
            }
        }

        if is_fb {
            self.final_layout = final_layout;
        } else if !self.is_fb_attachment {
            self.final_layout = self.required_layout;
        }

        let mut queue_transition = false;
        if is_transfer {
            self.current_layout = self.required_layout;
            self.has_transitioned = true;
        } else if !self.has_transitioned {
            self.initial_layout = self.required_layout;
            self.current_layout = self.required_layout;
            self.is_initial_read_only = self.is_read_only;
            self.has_transitioned = self.required_layout != vk::ImageLayout::UNDEFINED;
        } else if self.current_layout != self.required_layout {
            queue_transition = true;
        }

        let mut reset_render_pass = false;
        if is_fb && !self.is_fb_attachment {
            self.is_fb_attachment = true;
            reset_render_pass = self.is_shader_input;
        } else if is_shader && !self.is_shader_input {
            self.is_shader_input = true;

            if self.is_fb_attachment {
                let read_only_depth = self.required_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL && ctx.depth_stencil_read_only;
                reset_render_pass = !read_only_depth;
            } else {
                reset_render_pass = self.current_layout != self.required_layout;
            }
        }

        (reset_render_pass, queue_transition)
    }

    /// Returns true if the record contains the sub-resource.
    pub fn contains(&self, layer: u32, mip: u32) -> bool {
        range_contains_subresource(&self.range, layer, mip)
    }
}

/// All sub-resource records of one image referenced by a command buffer.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub image: Image,
    pub use_flags: UseFlags,
    pub used: bool,
    pub records: Vec<ImageSubresourceInfo>,
}

impl ImageInfo {
    pub fn new(image: Image, range: vk::ImageSubresourceRange, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage) -> Self {
        Self {
            image,
            use_flags: flags,
            used: false,
            records: vec![ImageSubresourceInfo::new(range, new_layout, final_layout, flags, usage)],
        }
    }

    /// Registers a new use of `range`.
    ///
    /// If the first overlapping record covers exactly `range` it is updated in place. Otherwise
    /// every overlapping record is split into the part covered by `range`, which is updated, and
    /// the parts outside of it, which keep their state. Parts of `range` not covered by any record
    /// become new records.
    pub fn register(&mut self, range: &vk::ImageSubresourceRange, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage, ctx: &RegisterContext) -> RegisterOutcome {
        self.use_flags |= flags;

        let mut outcome = RegisterOutcome::default();
        let mut ctx = *ctx;

        let exact = self.records.iter().position(|record| ranges_overlap(&record.range, range))
            .filter(|idx| same_bounds(&self.records[*idx].range, range));

        if let Some(idx) = exact {
            Self::apply(&mut self.records[idx], new_layout, final_layout, flags, usage, &mut ctx, &mut outcome);
            return outcome;
        }

        let mut records = Vec::with_capacity(self.records.len() + 4);
        let mut covered = Vec::new();
        for record in self.records.drain(..) {
            if !ranges_overlap(&record.range, range) {
                records.push(record);
                continue;
            }

            let cut = cut_range(&record.range, range);
            for remainder in cut.remainders {
                records.push(ImageSubresourceInfo {
                    range: remainder,
                    ..record
                });
            }

            if let Some(intersection) = cut.intersection {
                let mut split = ImageSubresourceInfo {
                    range: intersection,
                    ..record
                };
                Self::apply(&mut split, new_layout, final_layout, flags, usage, &mut ctx, &mut outcome);
                records.push(split);
                covered.push(intersection);
            }
        }

        for uncovered in subtract_ranges(range, covered.iter()) {
            records.push(ImageSubresourceInfo::new(uncovered, new_layout, final_layout, flags, usage));
        }

        self.records = records;
        outcome
    }

    fn apply(record: &mut ImageSubresourceInfo, new_layout: vk::ImageLayout, final_layout: vk::ImageLayout, flags: UseFlags, usage: ResourceUsage, ctx: &mut RegisterContext, outcome: &mut RegisterOutcome) {
        let (reset, queue_transition) = record.update(new_layout, final_layout, flags, usage, ctx);
        outcome.queue_transition |= queue_transition;

        if reset && ctx.in_render_pass {
            outcome.end_render_pass = true;
            ctx.in_render_pass = false;
        } else if record.needs_barrier && usage == ResourceUsage::ShaderBind {
            outcome.barriers.push(ShaderBarrier {
                range: record.range,
                layout: record.required_layout,
                read_only: !flags.contains(UseFlags::WRITE),
            });
            record.needs_barrier = flags.contains(UseFlags::WRITE);
        }
    }

    pub fn find(&self, layer: u32, mip: u32) -> Option<&ImageSubresourceInfo> {
        self.records.iter().find(|record| record.contains(layer, mip))
    }

    pub fn find_mut(&mut self, layer: u32, mip: u32) -> Option<&mut ImageSubresourceInfo> {
        self.records.iter_mut().find(|record| record.contains(layer, mip))
    }

    /// Records overlapping the range.
    pub fn overlapping_mut<'a>(&'a mut self, range: &'a vk::ImageSubresourceRange) -> impl Iterator<Item = &'a mut ImageSubresourceInfo> + 'a {
        self.records.iter_mut().filter(move |record| ranges_overlap(&record.range, range))
    }

    /// Clears the per render pass state of every record touched since the last call.
    pub fn reset_pass_flags(&mut self) {
        for record in self.records.iter_mut().filter(|record| record.pass_touched) {
            record.is_shader_input = false;
            record.is_read_only = true;
            record.needs_barrier = false;
            record.pass_touched = false;
        }
    }

    pub fn clear_fb_attachment(&mut self, range: &vk::ImageSubresourceRange) {
        for record in self.overlapping_mut(range) {
            record.is_fb_attachment = false;
        }
    }

    /// Barriers moving every record from its current to its required layout, without applying them.
    pub fn pending_transitions(&self) -> Vec<vk::ImageMemoryBarrier> {
        let handle = self.image.get_handle();
        self.records.iter()
            .filter(|record| record.has_transitioned && record.current_layout != record.required_layout)
            .map(|record| crate::command::barrier::image_barrier(
                handle,
                &record.range,
                self.image.get_access_flags(record.current_layout, false),
                self.image.get_access_flags(record.required_layout, record.is_read_only),
                record.current_layout,
                record.required_layout,
            ))
            .collect()
    }

    /// Like [`ImageInfo::pending_transitions`] but also marks the transitions as executed.
    pub fn take_transitions(&mut self) -> Vec<vk::ImageMemoryBarrier> {
        let barriers = self.pending_transitions();
        for record in self.records.iter_mut() {
            if record.has_transitioned && record.current_layout != record.required_layout {
                record.current_layout = record.required_layout;
                record.is_read_only = true;
            }
        }
        barriers
    }
}

fn same_bounds(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.base_array_layer == b.base_array_layer &&
        a.layer_count == b.layer_count &&
        a.base_mip_level == b.base_mip_level &&
        a.level_count == b.level_count
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use crate::objects::image::{ImageDesc, ImageUsage};
    use crate::objects::manager::ResourceManager;
    use crate::test::*;
    use crate::util::range::range_subresource_count;

    use super::*;

    const LAYERS: u32 = 6;
    const MIPS: u32 = 8;

    fn make_image(manager: &ResourceManager, backend: &RecordingBackend) -> Image {
        manager.create::<Image>(ImageDesc::new(backend.make(), vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR, MIPS, LAYERS, ImageUsage::SAMPLED | ImageUsage::RENDER_TARGET), false)
    }

    fn range(base_layer: u32, layers: u32, base_mip: u32, mips: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_mip,
            level_count: mips,
            base_array_layer: base_layer,
            layer_count: layers,
        }
    }

    fn assert_partition(info: &ImageInfo, expected_covered: u32) {
        let mut total = 0;
        for (i, a) in info.records.iter().enumerate() {
            total += range_subresource_count(&a.range);
            for b in info.records.iter().skip(i + 1) {
                assert!(!ranges_overlap(&a.range, &b.range), "Records {:?} and {:?} overlap", a.range, b.range);
            }
        }
        assert_eq!(total, expected_covered);
    }

    #[test]
    fn test_partial_overlap_split() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();

        let sro = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        let general = vk::ImageLayout::GENERAL;

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 4), sro, sro, UseFlags::READ, ResourceUsage::ShaderBind);
        info.reset_pass_flags();
        info.register(&range(0, 1, 2, 4), general, general, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);

        assert_partition(&info, 6);
        assert_eq!(info.find(0, 0).unwrap().required_layout, sro);
        assert_eq!(info.find(0, 1).unwrap().required_layout, sro);
        assert_eq!(info.find(0, 2).unwrap().required_layout, general);
        assert_eq!(info.find(0, 3).unwrap().required_layout, general);
        assert_eq!(info.find(0, 4).unwrap().required_layout, general);
        assert_eq!(info.find(0, 5).unwrap().initial_layout, general);
        assert!(info.find(0, 6).is_none());

        // The split part keeps its committed layout and needs a transition
        assert_eq!(info.find(0, 2).unwrap().current_layout, sro);
        assert_eq!(info.pending_transitions().len(), 1);

        image.as_resource().destroy();
    }

    #[test]
    fn test_repeated_registration_is_stable() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();
        let sro = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        let mut info = ImageInfo::new(image.clone(), range(0, 2, 0, 1), sro, sro, UseFlags::READ, ResourceUsage::ShaderBind);
        let outcome = info.register(&range(0, 2, 0, 1), sro, sro, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);

        assert!(!outcome.queue_transition);
        assert!(!outcome.end_render_pass);
        assert_eq!(info.records.len(), 1);
        assert!(info.pending_transitions().is_empty());

        image.as_resource().destroy();
    }

    #[test]
    fn test_conflicting_layouts_in_pass_use_general() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 1), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, UseFlags::READ, ResourceUsage::ShaderBind);
        let outcome = info.register(&range(0, 1, 0, 1), vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);

        let record = info.find(0, 0).unwrap();
        assert_eq!(record.required_layout, vk::ImageLayout::GENERAL);
        assert_eq!(record.final_layout, vk::ImageLayout::GENERAL);
        assert!(outcome.queue_transition);

        image.as_resource().destroy();
    }

    #[test]
    fn test_undefined_adopts_layout() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 1), vk::ImageLayout::UNDEFINED, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, UseFlags::WRITE, ResourceUsage::Framebuffer);
        assert!(!info.records[0].has_transitioned);

        info.register(&range(0, 1, 0, 1), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, UseFlags::WRITE, ResourceUsage::Framebuffer, &ctx);

        let record = info.find(0, 0).unwrap();
        assert!(record.has_transitioned);
        assert_eq!(record.initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(record.current_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(record.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(info.pending_transitions().is_empty());

        image.as_resource().destroy();
    }

    #[test]
    fn test_shader_read_of_attachment_ends_pass() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext {
            in_render_pass: true,
            depth_stencil_read_only: false,
        };

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 1), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, UseFlags::WRITE, ResourceUsage::Framebuffer);
        let outcome = info.register(&range(0, 1, 0, 1), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);

        assert!(outcome.end_render_pass);
        let record = info.find(0, 0).unwrap();
        assert!(record.is_shader_input);
        assert!(record.is_fb_attachment);
        assert_eq!(record.required_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        image.as_resource().destroy();
    }

    #[test]
    fn test_shader_write_barrier() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();
        let general = vk::ImageLayout::GENERAL;

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 1), general, general, UseFlags::READ_WRITE, ResourceUsage::ShaderBind);
        assert!(info.records[0].needs_barrier);

        let outcome = info.register(&range(0, 1, 0, 1), general, general, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);
        assert_eq!(outcome.barriers.len(), 1);
        assert!(outcome.barriers[0].read_only);
        assert!(!info.records[0].needs_barrier);

        image.as_resource().destroy();
    }

    #[test]
    fn test_reset_pass_flags() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let general = vk::ImageLayout::GENERAL;

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 1), general, general, UseFlags::READ_WRITE, ResourceUsage::ShaderBind);
        info.reset_pass_flags();

        let record = info.find(0, 0).unwrap();
        assert!(!record.is_shader_input);
        assert!(!record.needs_barrier);
        assert!(record.is_read_only);
        assert!(!record.pass_touched);

        image.as_resource().destroy();
    }

    #[test]
    fn test_untouched_records_keep_pass_flags() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let general = vk::ImageLayout::GENERAL;
        let ctx = RegisterContext::default();

        let mut info = ImageInfo::new(image.clone(), range(0, 1, 0, 4), general, general, UseFlags::READ, ResourceUsage::ShaderBind);
        info.reset_pass_flags();

        // Disjoint from the existing record
        info.register(&range(1, 1, 0, 1), general, general, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);
        assert!(!info.find(0, 0).unwrap().pass_touched);
        assert!(info.find(1, 0).unwrap().pass_touched);

        // Splits the first record, only the intersection is touched
        info.register(&range(0, 1, 2, 2), general, general, UseFlags::READ, ResourceUsage::ShaderBind, &ctx);
        assert!(!info.find(0, 0).unwrap().pass_touched);
        assert!(!info.find(0, 1).unwrap().pass_touched);
        assert!(info.find(0, 2).unwrap().pass_touched);
        assert!(info.find(0, 3).unwrap().pass_touched);

        image.as_resource().destroy();
    }

    #[test]
    fn test_random_registrations_partition() {
        let backend = RecordingBackend::new();
        let manager = ResourceManager::new(backend.clone());
        let image = make_image(&manager, &backend);
        let ctx = RegisterContext::default();

        let layouts = [
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ];

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..32 {
            let mut expected = [[None; MIPS as usize]; LAYERS as usize];
            let mut info: Option<ImageInfo> = None;

            for _ in 0..24 {
                let base_layer = rng.gen_range(0..LAYERS);
                let layers = rng.gen_range(1..=(LAYERS - base_layer));
                let base_mip = rng.gen_range(0..MIPS);
                let mips = rng.gen_range(1..=(MIPS - base_mip));
                let layout = layouts[rng.gen_range(0..layouts.len())];
                let r = range(base_layer, layers, base_mip, mips);

                match info.as_mut() {
                    Some(info) => {
                        info.register(&r, layout, layout, UseFlags::READ, ResourceUsage::Transfer, &ctx);
                    }
                    None => info = Some(ImageInfo::new(image.clone(), r, layout, layout, UseFlags::READ, ResourceUsage::Transfer)),
                }

                for layer in base_layer..(base_layer + layers) {
                    for mip in base_mip..(base_mip + mips) {
                        expected[layer as usize][mip as usize] = Some(layout);
                    }
                }

                let info = info.as_ref().unwrap();
                let covered = expected.iter().flatten().filter(|e| e.is_some()).count() as u32;
                assert_partition(info, covered);

                for layer in 0..LAYERS {
                    for mip in 0..MIPS {
                        let found = info.find(layer, mip).map(|record| record.required_layout);
                        assert_eq!(found, expected[layer as usize][mip as usize], "Mismatch at layer {} mip {}", layer, mip);
                    }
                }
            }
        }

        image.as_resource().destroy();
    }
}
