pub mod params;
pub mod state;
pub mod vertex;

pub use params::{GpuParams, ParamSet};
pub use state::{ComputePipelineState, GraphicsPipelineState};
pub use vertex::{VertexInput, VertexInputBuilder};
