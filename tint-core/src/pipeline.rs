//! Pipeline adapters: the single inference entry point each pretrained
//! model exposes to the dispatcher.

use std::sync::Arc;

use image::DynamicImage;

#[derive(Debug, Clone, PartialEq)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageToImageRequest {
    pub prompt: String,
    pub image: DynamicImage,
    /// How far the input is noised before denoising, in `0.0..=1.0`.
    pub strength: f64,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleRequest {
    pub prompt: String,
    pub image: DynamicImage,
    pub num_inference_steps: usize,
}

pub trait TextToImage: Send + Sync {
    fn generate(&self, request: TextToImageRequest) -> anyhow::Result<DynamicImage>;
}

pub trait ImageToImage: Send + Sync {
    fn transform(&self, request: ImageToImageRequest) -> anyhow::Result<DynamicImage>;
}

pub trait Upscale: Send + Sync {
    fn upscale(&self, request: UpscaleRequest) -> anyhow::Result<DynamicImage>;
}

/// The three adapters the dispatcher routes to, loaded once at startup.
#[derive(Clone)]
pub struct Pipelines {
    pub text_to_image: Arc<dyn TextToImage>,
    pub image_to_image: Arc<dyn ImageToImage>,
    pub upscale: Arc<dyn Upscale>,
}
