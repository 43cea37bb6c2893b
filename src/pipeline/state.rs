//! Pipeline templates that create native pipelines on demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::backend::{GraphicsPipelineCreateInfo, GraphicsPipelineDesc, ShaderStage};
use crate::device::error::DeviceError;
use crate::objects::framebuffer::{Framebuffer, RenderSurfaceMask};
use crate::objects::id::ResourceId;
use crate::objects::manager::ResourceManager;
use crate::objects::pipeline::Pipeline;
use crate::pipeline::vertex::VertexInput;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
struct PipelineKey {
    framebuffer: ResourceId,
    read_only: RenderSurfaceMask,
    topology: vk::PrimitiveTopology,
    vertex_input: u64,
}

struct GraphicsPipelineInner {
    manager: ResourceManager,
    desc: GraphicsPipelineDesc,
    cache: Mutex<HashMap<PipelineKey, Pipeline>>,
}

impl Drop for GraphicsPipelineInner {
    fn drop(&mut self) {
        let cache = self.cache.get_mut().unwrap();
        log::debug!("Destroying {} cached graphics pipelines", cache.len());

        for (_, pipeline) in cache.drain() {
            pipeline.as_resource().destroy();
        }
    }
}

/// A graphics pipeline template.
///
/// Native pipelines depend on the render target, its read only surfaces, the primitive topology and
/// the vertex input. A variant is created the first time a combination is drawn with and cached
/// afterwards. Cached pipelines are destroyed once the last clone of the state is dropped and no
/// command buffer references them anymore.
#[derive(Clone)]
pub struct GraphicsPipelineState(Arc<GraphicsPipelineInner>);

impl GraphicsPipelineState {
    pub fn new(manager: ResourceManager, desc: GraphicsPipelineDesc) -> Self {
        Self(Arc::new(GraphicsPipelineInner {
            manager,
            desc,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    pub fn get_desc(&self) -> &GraphicsPipelineDesc {
        &self.0.desc
    }

    pub fn get_layout(&self) -> vk::PipelineLayout {
        self.0.desc.layout
    }

    pub fn is_scissor_enabled(&self) -> bool {
        self.0.desc.scissor_test
    }

    /// Number of pipeline variants created so far.
    pub fn get_variant_count(&self) -> usize {
        self.0.cache.lock().unwrap().len()
    }

    /// Returns the pipeline for the combination, creating it if needed.
    pub fn get_pipeline(&self, framebuffer: &Framebuffer, read_only: RenderSurfaceMask, topology: vk::PrimitiveTopology, vertex_input: &VertexInput) -> Result<Pipeline, DeviceError> {
        let key = PipelineKey {
            framebuffer: framebuffer.as_resource().get_id(),
            read_only,
            topology,
            vertex_input: vertex_input.get_fingerprint(),
        };

        let mut cache = self.0.cache.lock().unwrap();
        if let Some(pipeline) = cache.get(&key) {
            return Ok(pipeline.clone());
        }

        let backend = self.0.manager.get_backend();

        // Any render pass compatible with the framebuffer works
        let variant = framebuffer.get_variant(backend.as_ref(), RenderSurfaceMask::empty(), read_only, RenderSurfaceMask::empty())?;

        let info = GraphicsPipelineCreateInfo {
            desc: &self.0.desc,
            vertex_input,
            topology,
            render_pass: variant.render_pass,
            color_attachment_count: framebuffer.get_color_attachments().len() as u32,
            samples: framebuffer.get_samples(),
            depth_read_only: read_only.intersects(RenderSurfaceMask::DEPTH_STENCIL),
        };

        let handle = unsafe { backend.create_graphics_pipeline(&info) }.map_err(|err| {
            log::error!("Failed to create graphics pipeline {:?}", err);
            DeviceError::from(err)
        })?;

        log::debug!("Created graphics pipeline variant for framebuffer {:?} topology {:?}", key.framebuffer, topology);

        let pipeline = self.0.manager.create::<Pipeline>(handle, false);
        cache.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    pub fn ptr_eq(&self, other: &GraphicsPipelineState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct ComputePipelineInner {
    layout: vk::PipelineLayout,
    pipeline: Pipeline,
}

impl Drop for ComputePipelineInner {
    fn drop(&mut self) {
        self.pipeline.as_resource().destroy();
    }
}

/// A compute pipeline. Unlike graphics pipelines there is only a single variant.
#[derive(Clone)]
pub struct ComputePipelineState(Arc<ComputePipelineInner>);

impl ComputePipelineState {
    pub fn new(manager: &ResourceManager, layout: vk::PipelineLayout, stage: &ShaderStage) -> Result<Self, DeviceError> {
        let handle = unsafe { manager.get_backend().create_compute_pipeline(layout, stage) }.map_err(|err| {
            log::error!("Failed to create compute pipeline {:?}", err);
            DeviceError::from(err)
        })?;

        Ok(Self(Arc::new(ComputePipelineInner {
            layout,
            pipeline: manager.create::<Pipeline>(handle, false),
        })))
    }

    pub fn get_layout(&self) -> vk::PipelineLayout {
        self.0.layout
    }

    pub fn get_pipeline(&self) -> &Pipeline {
        &self.0.pipeline
    }

    pub fn ptr_eq(&self, other: &ComputePipelineState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

assert_impl_all!(GraphicsPipelineState: Send, Sync);
assert_impl_all!(ComputePipelineState: Send, Sync);
