//! Image normalisation for tracker inputs.

use candle_core::{DType, Device, Tensor};

use crate::{backbone::NestedTensor, errors::TrackerError};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts HWC `u8` crops into normalised `(1, 3, H, W)` tensors.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    mean: Tensor,
    std: Tensor,
    device: Device,
}

impl Preprocessor {
    pub fn new(device: &Device) -> Result<Self, TrackerError> {
        Ok(Self {
            mean: Tensor::new(&IMAGENET_MEAN, device)?.reshape((1, 3, 1, 1))?,
            std: Tensor::new(&IMAGENET_STD, device)?.reshape((1, 3, 1, 1))?,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Normalises an `height x width x 3` image and pairs it with its
    /// attention mask (`true` marks padding), yielding `(1, 3, H, W)` and
    /// `(1, H, W)`.
    pub fn process(
        &self,
        image: &[u8],
        height: usize,
        width: usize,
        mask: &[bool],
    ) -> Result<NestedTensor, TrackerError> {
        if image.len() != height * width * 3 {
            return Err(TrackerError::Invocation(format!(
                "image buffer holds {} bytes, expected {height}x{width}x3",
                image.len()
            )));
        }
        if mask.len() != height * width {
            return Err(TrackerError::Invocation(format!(
                "mask holds {} entries, expected {height}x{width}",
                mask.len()
            )));
        }

        let pixels = Tensor::from_slice(image, (height, width, 3), &self.device)?
            .to_dtype(DType::F32)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;
        let normalised = (pixels / 255.0)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&self.std)?;

        let mask = mask.iter().map(|&padded| u8::from(padded)).collect::<Vec<_>>();
        let mask = Tensor::from_vec(mask, (1, height, width), &self.device)?;
        NestedTensor::new(normalised.contiguous()?, mask)
    }
}
