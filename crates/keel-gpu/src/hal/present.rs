use std::sync::Arc;

use parking_lot::Mutex;

use super::{Format, HalResult};

/// A finished back buffer handed to the presentation surface.
#[derive(Debug)]
pub struct PresentFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// Tightly packed rows of `width * format.bytes_per_texel()` bytes.
    pub pixels: &'a [u8],
}

/// Destination of presented frames.
pub trait PresentTarget: Send {
    fn present(&mut self, frame: PresentFrame<'_>) -> HalResult<()>;

    fn resize(&mut self, width: u32, height: u32);
}

#[derive(Debug, Clone, Default)]
pub struct PresentedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    presented: u64,
    size: (u32, u32),
    last: Option<PresentedFrame>,
}

/// Off-screen target that keeps the last presented frame.
///
/// Clones share state, so a caller can keep one handle for inspection and
/// give another to the device.
#[derive(Debug, Clone, Default)]
pub struct HeadlessTarget {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented_count(&self) -> u64 {
        self.state.lock().presented
    }

    pub fn size(&self) -> (u32, u32) {
        self.state.lock().size
    }

    pub fn last_frame(&self) -> Option<PresentedFrame> {
        self.state.lock().last.clone()
    }
}

impl PresentTarget for HeadlessTarget {
    fn present(&mut self, frame: PresentFrame<'_>) -> HalResult<()> {
        let mut state = self.state.lock();
        state.presented += 1;
        state.last = Some(PresentedFrame {
            width: frame.width,
            height: frame.height,
            pixels: frame.pixels.to_vec(),
        });
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.state.lock().size = (width, height);
    }
}
