//! Command buffer recording and resource lifetime tracking on top of [`ash`].
//!
//! Renderer code records through [`command::CommandBuffer`]. Every resource a command references is
//! tracked so that image layouts, barriers, queue family transfers and deferred deletion are
//! handled without further input.

#[macro_use]
extern crate static_assertions;

pub mod command;
pub mod device;
pub mod objects;
pub mod pipeline;
pub mod util;

#[cfg(any(test, feature = "__internal_doc_test"))]
pub use util::test;

pub mod prelude {
    pub use crate::command::{CmdBuffer, CommandBuffer, RenderTarget, SyncMask, ViewportRect};
    pub use crate::device::Device;
    pub use crate::device::config::DeviceConfig;
    pub use crate::device::error::DeviceError;
    pub use crate::device::queue::{QueueDesc, QueueType};
    pub use crate::objects::{Buffer, Framebuffer, Image, RenderSurfaceMask, Resource, ResourceManager, UseFlags};
    pub use crate::pipeline::{GpuParams, GraphicsPipelineState, VertexInput};
}
