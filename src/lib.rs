//! MTAtrack transformer core and its spatio-temporal tracker adapter.
//!
//! The workspace crates are re-exported here so downstream code can depend
//! on a single package.

pub use attention;
pub use layers;
pub use model;
pub use tracker;

pub use model::{Mode, Transformer, TransformerConfig, TransformerOutput};
pub use tracker::{SpatioTemporalTracker, TrackerConfig};

use anyhow::Result;
use candle_core::Device;

/// Picks the best available backend, honouring `CANDLE_FORCE_CPU`.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) if metal_preflight(&device).is_ok() => {
                log::info!("Metal device selected: {:?}", device);
                return Ok(device);
            }
            Ok(_) => log::warn!("Metal device detected but preflight failed, falling back"),
            Err(err) => log::debug!("Metal unavailable: {err}"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("Using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Runs the kernels the transformer relies on before trusting the device.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor};

    let x = Tensor::randn(0.0f32, 1.0f32, (2, 4, 16, 8), device)?;
    let scores = x.matmul(&x.transpose(2, 3)?.contiguous()?)?;
    let _ = attention::reference::exact::masked_softmax(&scores)?;
    let _ = Tensor::ones((4, 8), DType::F32, device)?.sqr()?.sum_keepdim(1)?;
    Ok(())
}
