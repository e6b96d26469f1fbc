use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use tracing::{info, warn};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let device = match device_map {
        DeviceMap::ForceCpu => Device::Cpu,
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("running on CPU, to run on GPU, build with `--features cuda`");
            Device::Cpu
        }
    };
    info!(device = ?device, "selected device");
    Ok(device)
}

/// Half precision on accelerators, full precision on the CPU.
pub fn dtype_for(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to `[-1, 1]`.
///
/// Both sides are cropped down to a multiple of 32, which the VAE and UNet
/// downsampling stages require.
pub fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let width = image.width() - image.width() % 32;
    let height = image.height() - image.height() % 32;
    if width == 0 || height == 0 {
        anyhow::bail!(
            "image is too small ({}x{}), both sides must be at least 32 pixels",
            image.width(),
            image.height()
        );
    }
    let pixels = image
        .resize_to_fill(width, height, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(pixels, (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}
