pub mod barrier;
pub mod cmd_buffer;
pub mod command_buffer;
pub mod pool;
pub mod subresource;
pub mod sync_mask;

pub use cmd_buffer::{CmdBuffer, CmdBufferState, RenderTarget, ViewportRect};
pub use command_buffer::CommandBuffer;
pub use pool::CmdBufferPool;
pub use sync_mask::SyncMask;
