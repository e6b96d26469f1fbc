use std::future::Future;

use anyhow::Result;
use candle_core::Device;
use hf_hub::api::tokio::Api;

/// Fetches a model's weights from the hub and builds it on `device`.
pub trait Loader {
    type Model;

    fn load(
        model_id: &str,
        api: &Api,
        device: &Device,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
