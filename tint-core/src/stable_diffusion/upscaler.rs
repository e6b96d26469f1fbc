use std::sync::Arc;

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};
use tracing::{debug, info};

use crate::{ImageToImage, ImageToImageRequest, Upscale, UpscaleRequest};

const REFINE_STRENGTH: f64 = 0.3;
const REFINE_GUIDANCE: f64 = 9.0;

/// Upscales by resampling and then re-running a short, low-strength
/// image-to-image pass to restore detail at the new resolution. Images that
/// cannot grow within `max_side` are returned as they are.
pub struct DiffusionUpscaler {
    refiner: Arc<dyn ImageToImage>,
    factor: u32,
    max_side: u32,
}

impl DiffusionUpscaler {
    pub fn new(refiner: Arc<dyn ImageToImage>, factor: u32, max_side: u32) -> Self {
        Self {
            refiner,
            factor: factor.max(1),
            max_side: max_side.max(32),
        }
    }

    /// Output size for a `width`x`height` input: scaled by the factor, capped
    /// so the longest side stays within `max_side`, rounded down to a
    /// multiple of 32 (minimum 32).
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height).max(1) as f64;
        let scale = (self.factor as f64).min(self.max_side as f64 / longest);
        let fit = |side: u32| {
            let scaled = (side as f64 * scale).floor() as u32;
            (scaled - scaled % 32).max(32)
        };
        (fit(width), fit(height))
    }
}

impl Upscale for DiffusionUpscaler {
    fn upscale(&self, request: UpscaleRequest) -> Result<DynamicImage> {
        let (width, height) = self.target_size(request.image.width(), request.image.height());
        if width < request.image.width() || height < request.image.height() {
            info!(
                input = ?(request.image.width(), request.image.height()),
                max_side = self.max_side,
                "input already at the upscale limit, returning it unchanged"
            );
            return Ok(request.image);
        }
        debug!(width, height, "resampling before refinement");

        let image = request.image.resize_exact(width, height, FilterType::Lanczos3);
        self.refiner.transform(ImageToImageRequest {
            prompt: request.prompt,
            image,
            strength: REFINE_STRENGTH,
            guidance_scale: REFINE_GUIDANCE,
            num_inference_steps: request.num_inference_steps,
        })
    }
}
