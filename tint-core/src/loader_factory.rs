use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::stable_diffusion::{
    DiffusionUpscaler, StableDiffusionLoader, StableDiffusionModel, StableDiffusionVariant,
};
use crate::{select_best_device, DeviceMap, Loader, Pipelines};

/// Supported model families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVariant),
    // Add more families as they become available
}

impl ModelVariant {
    /// Detect model variant from its hub repository name
    pub fn from_name(model_name: &str) -> Option<Self> {
        StableDiffusionVariant::from_name(model_name).map(ModelVariant::StableDiffusion)
    }
}

/// Which checkpoints back the three pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Serves text-to-image and image-to-image.
    pub model: String,
    /// Refines resampled images on the upscale path.
    pub upscale_model: String,
    pub upscale_factor: u32,
    pub upscale_max_side: u32,
}

/// Load every pipeline named by `config`. A checkpoint named more than once
/// is loaded a single time and shared.
pub async fn load_pipelines(
    config: &PipelineConfig,
    api: Api,
    device_map: DeviceMap,
) -> Result<Pipelines> {
    let device = select_best_device(device_map)?;
    let mut loaded: HashMap<String, Arc<StableDiffusionModel>> = HashMap::new();

    for model_name in [&config.model, &config.upscale_model] {
        if loaded.contains_key(model_name) {
            continue;
        }
        let variant = ModelVariant::from_name(model_name)
            .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;
        info!(model = %model_name, ?variant, "loading model");

        let model = match variant {
            ModelVariant::StableDiffusion(_) => {
                StableDiffusionLoader::load(model_name, &api, &device).await?
            }
        };
        loaded.insert(model_name.clone(), Arc::new(model));
    }

    let model = Arc::clone(&loaded[&config.model]);
    let refiner = Arc::clone(&loaded[&config.upscale_model]);

    Ok(Pipelines {
        text_to_image: model.clone(),
        image_to_image: model,
        upscale: Arc::new(DiffusionUpscaler::new(
            refiner,
            config.upscale_factor,
            config.upscale_max_side,
        )),
    })
}
