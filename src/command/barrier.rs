//! Pipeline stage derivation and barrier construction.

use ash::vk;

/// Every programmable stage that can access descriptors.
pub const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER.as_raw()
        | vk::PipelineStageFlags::GEOMETRY_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw()
);

/// Returns the pipeline stages that may perform any of the accesses in `access`.
///
/// An empty access mask maps to `TOP_OF_PIPE`.
pub fn pipeline_stage_flags(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();

    if access.contains(vk::AccessFlags::INDIRECT_COMMAND_READ) {
        flags |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }

    if access.intersects(vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ) {
        flags |= vk::PipelineStageFlags::VERTEX_INPUT;
    }

    if access.intersects(vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE) {
        flags |= SHADER_STAGES;
    }

    if access.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }

    if access.intersects(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE) {
        flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }

    if access.intersects(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        flags |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }

    if access.intersects(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }

    if access.intersects(vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE) {
        flags |= vk::PipelineStageFlags::HOST;
    }

    if flags.is_empty() {
        flags = vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    flags
}

/// A barrier with source and destination access masks.
pub trait AccessBarrier {
    fn src_access(&self) -> vk::AccessFlags;

    fn dst_access(&self) -> vk::AccessFlags;
}

impl AccessBarrier for vk::ImageMemoryBarrier {
    fn src_access(&self) -> vk::AccessFlags {
        self.src_access_mask
    }

    fn dst_access(&self) -> vk::AccessFlags {
        self.dst_access_mask
    }
}

impl AccessBarrier for vk::BufferMemoryBarrier {
    fn src_access(&self) -> vk::AccessFlags {
        self.src_access_mask
    }

    fn dst_access(&self) -> vk::AccessFlags {
        self.dst_access_mask
    }
}

/// Computes the source and destination stage masks covering every barrier in `barriers`.
pub fn pipeline_stage_flags_for<'a, T, I>(barriers: I) -> (vk::PipelineStageFlags, vk::PipelineStageFlags)
    where T: AccessBarrier + 'a, I: IntoIterator<Item = &'a T> {

    let mut src_access = vk::AccessFlags::empty();
    let mut dst_access = vk::AccessFlags::empty();
    for barrier in barriers {
        src_access |= barrier.src_access();
        dst_access |= barrier.dst_access();
    }

    (pipeline_stage_flags(src_access), pipeline_stage_flags(dst_access))
}

/// Builds a barrier on the whole buffer without a queue family transfer.
pub fn buffer_barrier(buffer: vk::Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

/// Builds a layout transition without a queue family transfer.
pub fn image_barrier(
    image: vk::Image,
    range: &vk::ImageSubresourceRange,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(*range)
        .build()
}
