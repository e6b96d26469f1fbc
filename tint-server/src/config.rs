//! Command line arguments, each with a `TINT_*` environment fallback.

use std::path::PathBuf;

use clap::Parser;
use tint_core::{DeviceMap, PipelineConfig};

const DEFAULT_MODEL: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Themed image generation server")]
pub struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "TINT_CPU")]
    pub cpu: bool,

    /// Checkpoint serving text-to-image and image-to-image
    #[arg(long, env = "TINT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Checkpoint refining upscaled images
    #[arg(long, env = "TINT_UPSCALE_MODEL", default_value = DEFAULT_MODEL)]
    pub upscale_model: String,

    /// Resampling factor applied before refinement
    #[arg(long, env = "TINT_UPSCALE_FACTOR", default_value_t = 4)]
    pub upscale_factor: u32,

    /// Longest side an upscaled image may have
    #[arg(long, env = "TINT_UPSCALE_MAX_SIDE", default_value_t = 1024)]
    pub upscale_max_side: u32,

    /// JSON file replacing the built-in theme table
    #[arg(long, env = "TINT_THEMES")]
    pub themes: Option<PathBuf>,

    /// Directory holding per-request scratch files
    #[arg(long, env = "TINT_SCRATCH_DIR", default_value = "temp")]
    pub scratch_dir: PathBuf,

    /// Largest accepted request body, in megabytes
    #[arg(long, env = "TINT_MAX_UPLOAD_MB", default_value_t = 20)]
    pub max_upload_mb: usize,

    /// Comma separated list of allowed CORS origins (all origins when unset)
    #[arg(long, env = "TINT_CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Host address to bind the server to
    #[arg(long, env = "TINT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "TINT_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Log filter used when RUST_LOG is unset, e.g. "info" or "debug,tower_http=warn"
    #[arg(long, env = "TINT_LOG", default_value = "info")]
    pub log: String,

    /// Emit logs as newline delimited JSON
    #[arg(long, env = "TINT_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            model: self.model.clone(),
            upscale_model: self.upscale_model.clone(),
            upscale_factor: self.upscale_factor,
            upscale_max_side: self.upscale_max_side,
        }
    }

    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::from_cpu_flag(self.cpu)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
