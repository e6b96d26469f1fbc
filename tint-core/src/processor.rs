//! Routes an operation to the matching pipeline adapter.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    ImageToImage, ImageToImageRequest, Pipelines, ProcessError, TextToImage, TextToImageRequest,
    ThemeTable, Upscale, UpscaleRequest,
};

pub const GENERATE_STEPS: usize = 50;
pub const MODIFY_STEPS: usize = 50;
pub const UPSCALE_STEPS: usize = 20;
pub const GUIDANCE_SCALE: f64 = 7.5;
pub const MODIFY_STRENGTH: f64 = 0.75;

const UPSCALE_PROMPT_PREFIX: &str = "high quality, detailed image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Generate,
    Upscale,
    Modify,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Generate => "generate",
            Operation::Upscale => "upscale",
            Operation::Modify => "modify",
        }
    }

    /// Whether the operation works on an uploaded source image.
    pub fn needs_image(self) -> bool {
        !matches!(self, Operation::Generate)
    }
}

impl FromStr for Operation {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_plain::from_str(s).map_err(|_| ProcessError::UnsupportedOperation(s.to_owned()))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless dispatcher over the injected pipeline adapters.
pub struct ImageProcessor {
    themes: ThemeTable,
    text_to_image: Arc<dyn TextToImage>,
    image_to_image: Arc<dyn ImageToImage>,
    upscaler: Arc<dyn Upscale>,
}

impl ImageProcessor {
    pub fn new(themes: ThemeTable, pipelines: Pipelines) -> Self {
        Self {
            themes,
            text_to_image: pipelines.text_to_image,
            image_to_image: pipelines.image_to_image,
            upscaler: pipelines.upscale,
        }
    }

    pub fn themes(&self) -> &ThemeTable {
        &self.themes
    }

    /// Builds the prompt sent to the pipeline. The upscale path ignores the
    /// caller's prompt.
    pub fn prompt_for(&self, operation: Operation, prompt: &str, theme: &str) -> String {
        let fragment = self.themes.resolve(theme);
        match operation {
            Operation::Generate | Operation::Modify => format!("{prompt}, {fragment}"),
            Operation::Upscale => format!("{UPSCALE_PROMPT_PREFIX}, {fragment}"),
        }
    }

    /// Parses `operation` and runs it. `image_path` is ignored for `generate`.
    pub fn process(
        &self,
        image_path: Option<&Path>,
        operation: &str,
        prompt: &str,
        theme: &str,
    ) -> Result<DynamicImage, ProcessError> {
        let operation: Operation = operation.parse()?;
        self.run(image_path, operation, prompt, theme)
    }

    pub fn run(
        &self,
        image_path: Option<&Path>,
        operation: Operation,
        prompt: &str,
        theme: &str,
    ) -> Result<DynamicImage, ProcessError> {
        let final_prompt = self.prompt_for(operation, prompt, theme);
        info!(%operation, theme, "running pipeline");
        debug!(prompt = %final_prompt, "composed prompt");

        let result = match operation {
            Operation::Generate => self.text_to_image.generate(TextToImageRequest {
                prompt: final_prompt,
                num_inference_steps: GENERATE_STEPS,
                guidance_scale: GUIDANCE_SCALE,
            }),
            Operation::Upscale => load_image(image_path).and_then(|image| {
                self.upscaler.upscale(UpscaleRequest {
                    prompt: final_prompt,
                    image,
                    num_inference_steps: UPSCALE_STEPS,
                })
            }),
            Operation::Modify => load_image(image_path).and_then(|image| {
                self.image_to_image.transform(ImageToImageRequest {
                    prompt: final_prompt,
                    image,
                    strength: MODIFY_STRENGTH,
                    guidance_scale: GUIDANCE_SCALE,
                    num_inference_steps: MODIFY_STEPS,
                })
            }),
        };

        result.map_err(ProcessError::processing)
    }
}

fn load_image(path: Option<&Path>) -> anyhow::Result<DynamicImage> {
    let path = path.context("an input image is required for this operation")?;
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(image)
}
