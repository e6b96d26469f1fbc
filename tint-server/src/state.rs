use tint_core::ImageProcessor;

use crate::scratch::ScratchSpace;

/// Shared by every handler. Built once at startup; pipelines are injected
/// through the processor.
pub struct AppState {
    pub processor: ImageProcessor,
    pub scratch: ScratchSpace,
}

impl AppState {
    pub fn new(processor: ImageProcessor, scratch: ScratchSpace) -> Self {
        Self { processor, scratch }
    }
}
