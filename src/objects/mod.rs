//! Vulkan objects tracked by command buffers.

pub mod buffer;
pub mod descriptor;
pub mod framebuffer;
pub mod id;
pub mod image;
pub mod manager;
pub mod pipeline;
pub mod query;
pub mod resource;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use descriptor::{DescriptorPool, DescriptorSet};
pub use framebuffer::{Framebuffer, RenderSurfaceMask};
pub use id::ResourceId;
pub use image::Image;
pub use manager::ResourceManager;
pub use pipeline::Pipeline;
pub use query::{Query, QueryPool};
pub use resource::{Resource, UseFlags};
pub use swapchain::SwapChain;
pub use sync::{Event, Semaphore};
