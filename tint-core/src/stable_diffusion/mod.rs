//! Stable Diffusion adapters built on candle-transformers.

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod upscaler;

pub use upscaler::DiffusionUpscaler;

use crate::{
    dtype_for, image_to_tensor, tensor_to_image, ImageToImage, ImageToImageRequest, Loader,
    TextToImage, TextToImageRequest,
};

const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVariant {
    V1_5,
    V2_1,
}

impl StableDiffusionVariant {
    /// Detects the variant from a hub repository name.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name = model_name.to_lowercase();
        if !name.contains("stable-diffusion") {
            return None;
        }
        if name.contains("v1-5") || name.contains("1.5") {
            Some(Self::V1_5)
        } else if name.contains("2-1") || name.contains("2.1") {
            Some(Self::V2_1)
        } else {
            None
        }
    }

    fn config(self) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
        }
    }
}

fn weights_file(stem: &str, fp16: bool) -> String {
    if fp16 {
        format!("{stem}.fp16.safetensors")
    } else {
        format!("{stem}.safetensors")
    }
}

/// A loaded Stable Diffusion checkpoint. Serves both text-to-image and
/// image-to-image; a fresh scheduler is built for every call so concurrent
/// requests never share sampling state.
pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let pad_token = self
            .config
            .clip
            .pad_with
            .as_deref()
            .unwrap_or("<|endoftext|>");
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            debug!(tokens = tokens.len(), max_len, "truncating prompt");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    /// Conditional embeddings, stacked after the unconditional ones when
    /// classifier-free guidance is enabled.
    fn text_embeddings(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt("")?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn denoise(
        &self,
        mut latents: Tensor,
        embeddings: &Tensor,
        scheduler: &mut dyn Scheduler,
        timesteps: &[usize],
        start: usize,
        guidance_scale: f64,
        use_guidance: bool,
    ) -> Result<Tensor> {
        for (index, &timestep) in timesteps.iter().enumerate().skip(start) {
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }
        Ok(latents)
    }

    fn decode(&self, latents: &Tensor) -> Result<DynamicImage> {
        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&images.i(0)?)
    }
}

impl TextToImage for StableDiffusionModel {
    fn generate(&self, request: TextToImageRequest) -> Result<DynamicImage> {
        let use_guidance = request.guidance_scale > 1.0;
        let embeddings = self.text_embeddings(&request.prompt, use_guidance)?;

        let mut scheduler = self.config.build_scheduler(request.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.config.height / 8, self.config.width / 8),
            &self.device,
        )?;
        let latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let latents = self.denoise(
            latents,
            &embeddings,
            scheduler.as_mut(),
            &timesteps,
            0,
            request.guidance_scale,
            use_guidance,
        )?;
        info!(steps = timesteps.len(), "generated image");
        self.decode(&latents)
    }
}

impl ImageToImage for StableDiffusionModel {
    fn transform(&self, request: ImageToImageRequest) -> Result<DynamicImage> {
        if !(0.0..=1.0).contains(&request.strength) {
            anyhow::bail!("strength must be within 0.0..=1.0, got {}", request.strength);
        }
        let use_guidance = request.guidance_scale > 1.0;
        let embeddings = self.text_embeddings(&request.prompt, use_guidance)?;

        let mut scheduler = self.config.build_scheduler(request.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let steps = timesteps.len();
        let start = steps - (steps as f64 * request.strength) as usize;

        let init = image_to_tensor(&request.image, &self.device, self.dtype)?;
        let latents = (self.vae.encode(&init)?.sample()? * VAE_SCALE)?;
        let latents = if start < steps {
            let noise = latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&latents, noise, timesteps[start])?
        } else {
            latents
        };

        let latents = self.denoise(
            latents.to_dtype(self.dtype)?,
            &embeddings,
            scheduler.as_mut(),
            &timesteps,
            start,
            request.guidance_scale,
            use_guidance,
        )?;
        info!(steps = steps - start, "transformed image");
        self.decode(&latents)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(model_id: &str, api: &Api, device: &Device) -> Result<Self::Model> {
        let variant = StableDiffusionVariant::from_name(model_id)
            .with_context(|| format!("unsupported stable diffusion model: {model_id}"))?;
        let dtype = dtype_for(device);
        let fp16 = dtype == DType::F16;
        let config = variant.config();
        info!(model = model_id, ?variant, ?dtype, "loading stable diffusion");

        // --- Tokenizer ---
        let tokenizer_file = api
            .model(variant.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let repo = api.model(model_id.to_string());

        // --- CLIP text encoder (kept in f32, embeddings are cast per call) ---
        let clip_weights = repo
            .get(&weights_file("text_encoder/model", fp16))
            .await
            .context("failed to get text encoder weights")?;
        let clip =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, device, DType::F32)
                .context("failed to load text encoder")?;

        // --- VAE ---
        let vae_weights = repo
            .get(&weights_file("vae/diffusion_pytorch_model", fp16))
            .await
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_weights, device, dtype)
            .context("failed to load VAE")?;

        // --- UNet ---
        let unet_weights = repo
            .get(&weights_file("unet/diffusion_pytorch_model", fp16))
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(unet_weights, device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load UNet")?;

        info!(model = model_id, "stable diffusion ready");
        Ok(StableDiffusionModel {
            device: device.clone(),
            dtype,
            config,
            tokenizer,
            clip,
            unet,
            vae,
        })
    }
}
