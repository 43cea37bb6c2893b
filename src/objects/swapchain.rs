use std::sync::{Arc, Mutex};

use crate::objects::framebuffer::Framebuffer;
use crate::objects::image::Image;
use crate::objects::sync::Semaphore;

/// One presentable image of a swap chain and the framebuffer rendering to it.
#[derive(Clone, Debug)]
pub struct BackBuffer {
    pub image: Image,
    pub framebuffer: Framebuffer,
}

struct BackBufferState {
    current: Option<u32>,
    sync: Option<Semaphore>,
    needs_wait: bool,
}

struct SwapChainInner {
    back_buffers: Vec<BackBuffer>,
    state: Mutex<BackBufferState>,
}

/// Tracks the back buffer acquired from a presentation engine.
///
/// The acquire itself is performed by the caller, which reports the acquired index together with
/// the semaphore the presentation engine signals. The first submission rendering to the back
/// buffer waits on that semaphore.
#[derive(Clone)]
pub struct SwapChain(Arc<SwapChainInner>);

impl SwapChain {
    pub fn new(back_buffers: Vec<BackBuffer>) -> Self {
        Self(Arc::new(SwapChainInner {
            back_buffers,
            state: Mutex::new(BackBufferState {
                current: None,
                sync: None,
                needs_wait: false,
            }),
        }))
    }

    pub fn get_back_buffers(&self) -> &[BackBuffer] {
        &self.0.back_buffers
    }

    pub fn notify_acquired(&self, index: u32, sync: Semaphore) {
        assert!((index as usize) < self.0.back_buffers.len(), "Back buffer index {} out of range", index);

        let mut guard = self.0.state.lock().unwrap();
        guard.current = Some(index);
        guard.sync = Some(sync);
        guard.needs_wait = true;
    }

    /// The currently acquired back buffer.
    pub fn get_back_buffer(&self) -> Option<BackBuffer> {
        let guard = self.0.state.lock().unwrap();
        guard.current.map(|index| self.0.back_buffers[index as usize].clone())
    }

    pub fn needs_wait(&self) -> bool {
        self.0.state.lock().unwrap().needs_wait
    }

    /// Returns the acquire semaphore if no submission has waited on it yet and marks the wait as
    /// issued.
    pub fn take_wait_semaphore(&self) -> Option<Semaphore> {
        let mut guard = self.0.state.lock().unwrap();
        if guard.needs_wait {
            guard.needs_wait = false;
            guard.sync.clone()
        } else {
            None
        }
    }

    pub fn ptr_eq(&self, other: &SwapChain) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
