//! Conditioning assembly
//!
//! Text embeddings are normalised to a fixed token length with a boolean
//! attention mask, image-encoder embeddings are blended per section, and
//! optional spatial masks are resampled to latent resolution.

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::config::{EmbedInterpolation, TEXT_TOKEN_LENGTH};
use crate::error::{FramePackError, Result};

/// Weight of the input image in reference (kisekaeichi) mode
pub const REFERENCE_INPUT_WEIGHT: f64 = 0.7;
/// Weight of the reference image in reference (kisekaeichi) mode
pub const REFERENCE_WEIGHT: f64 = 0.3;

/// Encoded prompt: llama hidden states `[1, L, D]` and the clip-l pooled vector
#[derive(Debug, Clone)]
pub struct PromptEmbeds {
    pub embeds: Tensor,
    pub pooled: Tensor,
}

/// Crop or zero-pad `[B, L, D]` embeddings to `length` tokens.
///
/// Returns the resized tensor and a `[B, length]` u8 mask that is 1 for real
/// tokens. Cropped inputs are fully real.
pub fn crop_or_pad_yield_mask(x: &Tensor, length: usize) -> Result<(Tensor, Tensor)> {
    let (b, l, d) = x.dims3()?;
    if l >= length {
        let cropped = x.narrow(1, 0, length)?;
        let mask = Tensor::ones((b, length), DType::U8, x.device())?;
        return Ok((cropped, mask));
    }
    let pad = Tensor::zeros((b, length - l, d), x.dtype(), x.device())?;
    let padded = Tensor::cat(&[x, &pad], 1)?;
    let mask = Tensor::cat(
        &[
            Tensor::ones((b, l), DType::U8, x.device())?,
            Tensor::zeros((b, length - l), DType::U8, x.device())?,
        ],
        1,
    )?;
    Ok((padded, mask))
}

/// Positive and negative text conditioning shared by every section
#[derive(Debug, Clone)]
pub struct TextConditioning {
    pub llama_vec: Tensor,
    pub llama_attention_mask: Tensor,
    pub clip_l_pooler: Tensor,
    pub llama_vec_n: Tensor,
    pub llama_attention_mask_n: Tensor,
    pub clip_l_pooler_n: Tensor,
}

impl TextConditioning {
    /// Move prompts to the working device/dtype and normalise them to
    /// [`TEXT_TOKEN_LENGTH`] tokens. Without real CFG the negative branch is
    /// replaced by zeros.
    pub fn prepare(
        positive: &PromptEmbeds,
        negative: Option<&PromptEmbeds>,
        real_cfg: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let llama_vec = positive.embeds.to_device(device)?.to_dtype(dtype)?;
        let clip_l_pooler = positive.pooled.to_device(device)?.to_dtype(dtype)?;

        let (llama_vec_n, clip_l_pooler_n) = match negative {
            Some(negative) if real_cfg => (
                negative.embeds.to_device(device)?.to_dtype(dtype)?,
                negative.pooled.to_device(device)?.to_dtype(dtype)?,
            ),
            _ => {
                if real_cfg {
                    warn!("cfg is enabled but no negative prompt was given, using zeros");
                }
                (llama_vec.zeros_like()?, clip_l_pooler.zeros_like()?)
            }
        };

        let (llama_vec, llama_attention_mask) = crop_or_pad_yield_mask(&llama_vec, TEXT_TOKEN_LENGTH)?;
        let (llama_vec_n, llama_attention_mask_n) =
            crop_or_pad_yield_mask(&llama_vec_n, TEXT_TOKEN_LENGTH)?;

        Ok(Self {
            llama_vec,
            llama_attention_mask,
            clip_l_pooler,
            llama_vec_n,
            llama_attention_mask_n,
            clip_l_pooler_n,
        })
    }
}

/// Start-image weight of section `index` out of `num_sections`.
///
/// `None` when interpolation is disabled; the start embedding is then scaled
/// by the strength alone.
pub fn embed_fraction(
    mode: EmbedInterpolation,
    index: usize,
    num_sections: usize,
    start_strength: f64,
    has_end_image: bool,
) -> Option<f64> {
    match mode {
        EmbedInterpolation::Disabled => None,
        // Full start weight on the first planned section, full end weight on the last
        EmbedInterpolation::Linear if num_sections <= 1 => Some(1.0),
        EmbedInterpolation::Linear => Some(1.0 - index as f64 / (num_sections - 1) as f64),
        EmbedInterpolation::WeightedAverage => {
            Some(if has_end_image { start_strength } else { 1.0 })
        }
    }
}

/// Image embedding for one section: `start * frac + end * (1 - frac)`, with
/// zeros standing in for a missing end embedding.
pub fn section_image_embeds(
    mode: EmbedInterpolation,
    index: usize,
    num_sections: usize,
    start: &Tensor,
    end: Option<&Tensor>,
    start_strength: f64,
) -> Result<Tensor> {
    match embed_fraction(mode, index, num_sections, start_strength, end.is_some()) {
        None => Ok(start.affine(start_strength, 0.0)?),
        Some(frac) => {
            let blended = start.affine(frac, 0.0)?;
            match end {
                Some(end) => Ok((blended + end.affine(1.0 - frac, 0.0)?)?),
                None => Ok(blended),
            }
        }
    }
}

/// Image embedding of the single-frame sampler in reference mode
pub fn reference_image_embeds(start: Option<&Tensor>, reference: &Tensor) -> Result<Tensor> {
    match start {
        Some(start) => {
            debug!(
                input_weight = REFERENCE_INPUT_WEIGHT,
                reference_weight = REFERENCE_WEIGHT,
                "Blending input and reference image embeddings"
            );
            Ok((start.affine(REFERENCE_INPUT_WEIGHT, 0.0)? + reference.affine(REFERENCE_WEIGHT, 0.0)?)?)
        }
        None => Ok(reference.clone()),
    }
}

/// Single-channel spatial mask in image space, held as a `[1, 1, H, W]` tensor
#[derive(Debug, Clone)]
pub struct SpatialMask {
    mask: Tensor,
}

impl SpatialMask {
    /// Row-major `height * width` values on the CPU
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if height == 0 || width == 0 || data.len() != height * width {
            return Err(FramePackError::shape("mask", &[height, width], &[data.len()]));
        }
        Ok(Self {
            mask: Tensor::from_vec(data, (1, 1, height, width), &Device::Cpu)?,
        })
    }

    /// Wrap a `[H, W]` tensor, keeping its device
    pub fn from_tensor(mask: &Tensor) -> Result<Self> {
        let (height, width) = mask.dims2()?;
        if height == 0 || width == 0 {
            return Err(FramePackError::shape("mask", &[height.max(1), width.max(1)], mask.dims()));
        }
        Ok(Self {
            mask: mask.to_dtype(DType::F32)?.reshape((1, 1, height, width))?,
        })
    }

    pub fn height(&self) -> usize {
        self.mask.dims()[2]
    }

    pub fn width(&self) -> usize {
        self.mask.dims()[3]
    }

    /// Center-crop to the target aspect ratio, then resample bilinearly with
    /// half-pixel centers. Returns `[1, 1, height, width]`.
    pub fn resize(&self, height: usize, width: usize) -> Result<Tensor> {
        let (old_h, old_w) = (self.height(), self.width());
        let old_aspect = old_w as f64 / old_h as f64;
        let new_aspect = width as f64 / height as f64;
        let (mut x0, mut y0) = (0usize, 0usize);
        if old_aspect > new_aspect {
            x0 = ((old_w as f64 - old_w as f64 * (new_aspect / old_aspect)) / 2.0).round_ties_even() as usize;
        } else if old_aspect < new_aspect {
            y0 = ((old_h as f64 - old_h as f64 * (old_aspect / new_aspect)) / 2.0).round_ties_even() as usize;
        }
        let crop_h = old_h.saturating_sub(2 * y0).max(1);
        let crop_w = old_w.saturating_sub(2 * x0).max(1);
        let cropped = self
            .mask
            .narrow(2, y0.min(old_h - crop_h), crop_h)?
            .narrow(3, x0.min(old_w - crop_w), crop_w)?
            .contiguous()?;
        Ok(cropped.upsample_bilinear2d(height, width, false)?)
    }

    /// Resize to the latent grid and multiply it into every channel and frame
    /// of a `[B, C, T, H, W]` latent
    pub fn apply(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, _, h, w) = latents.dims5()?;
        let mask = self
            .resize(h, w)?
            .unsqueeze(2)?
            .to_device(latents.device())?
            .to_dtype(latents.dtype())?;
        Ok(latents.broadcast_mul(&mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embeds(len: usize, value: f64) -> Result<Tensor> {
        Ok((Tensor::ones((1, len, 4), DType::F32, &Device::Cpu)? * value)?)
    }

    #[test]
    fn test_pad_yields_partial_mask() -> Result<()> {
        let (padded, mask) = crop_or_pad_yield_mask(&embeds(3, 1.0)?, 8)?;
        assert_eq!(padded.dims(), &[1, 8, 4]);
        assert_eq!(mask.to_vec2::<u8>()?, vec![vec![1, 1, 1, 0, 0, 0, 0, 0]]);
        assert_eq!(padded.sum_all()?.to_scalar::<f32>()?, 12.0);
        Ok(())
    }

    #[test]
    fn test_crop_yields_full_mask() -> Result<()> {
        let (cropped, mask) = crop_or_pad_yield_mask(&embeds(10, 1.0)?, 8)?;
        assert_eq!(cropped.dims(), &[1, 8, 4]);
        assert_eq!(mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?, 8.0);
        Ok(())
    }

    #[test]
    fn test_negative_is_zero_without_cfg() -> Result<()> {
        let positive = PromptEmbeds {
            embeds: embeds(5, 1.0)?,
            pooled: Tensor::ones((1, 4), DType::F32, &Device::Cpu)?,
        };
        let negative = PromptEmbeds {
            embeds: embeds(5, 2.0)?,
            pooled: Tensor::ones((1, 4), DType::F32, &Device::Cpu)?,
        };
        let text = TextConditioning::prepare(&positive, Some(&negative), false, &Device::Cpu, DType::F32)?;
        assert_eq!(text.llama_vec.dims(), &[1, TEXT_TOKEN_LENGTH, 4]);
        assert_eq!(text.llama_vec_n.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert_eq!(text.clip_l_pooler_n.sum_all()?.to_scalar::<f32>()?, 0.0);

        let text = TextConditioning::prepare(&positive, Some(&negative), true, &Device::Cpu, DType::F32)?;
        assert_eq!(text.llama_vec_n.sum_all()?.to_scalar::<f32>()?, 40.0);
        Ok(())
    }

    #[test]
    fn test_linear_fractions_walk_backwards() {
        let fracs: Vec<_> = (0..3)
            .map(|i| embed_fraction(EmbedInterpolation::Linear, i, 3, 1.0, true))
            .collect();
        assert_eq!(fracs, vec![Some(1.0), Some(0.5), Some(0.0)]);
        assert_eq!(embed_fraction(EmbedInterpolation::Linear, 0, 1, 1.0, true), Some(1.0));
    }

    #[test]
    fn test_weighted_average_needs_end_image() {
        assert_eq!(
            embed_fraction(EmbedInterpolation::WeightedAverage, 0, 3, 0.25, true),
            Some(0.25)
        );
        assert_eq!(
            embed_fraction(EmbedInterpolation::WeightedAverage, 0, 3, 0.25, false),
            Some(1.0)
        );
        assert_eq!(embed_fraction(EmbedInterpolation::Disabled, 0, 3, 0.25, true), None);
    }

    #[test]
    fn test_section_blend_values() -> Result<()> {
        let start = embeds(2, 1.0)?;
        let end = embeds(2, 3.0)?;
        let mid = section_image_embeds(EmbedInterpolation::Linear, 1, 3, &start, Some(&end), 1.0)?;
        // 0.5 * 1 + 0.5 * 3
        assert_eq!(mid.flatten_all()?.to_vec1::<f32>()?[0], 2.0);

        let disabled = section_image_embeds(EmbedInterpolation::Disabled, 0, 3, &start, Some(&end), 0.5)?;
        assert_eq!(disabled.flatten_all()?.to_vec1::<f32>()?[0], 0.5);

        // Missing end image behaves like zeros
        let faded = section_image_embeds(EmbedInterpolation::Linear, 2, 3, &start, None, 1.0)?;
        assert_eq!(faded.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_reference_blend() -> Result<()> {
        let start = embeds(2, 1.0)?;
        let reference = embeds(2, 2.0)?;
        let blended = reference_image_embeds(Some(&start), &reference)?;
        let v = blended.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((v - 1.3).abs() < 1e-6);
        let only = reference_image_embeds(None, &reference)?;
        assert_eq!(only.flatten_all()?.to_vec1::<f32>()?[0], 2.0);
        Ok(())
    }

    fn mask_values(mask: &Tensor) -> Result<Vec<f32>> {
        Ok(mask.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_mask_resize_center_crops() -> Result<()> {
        // 2x4 mask, left half 0 right half 1; center crop to square keeps columns 1..3
        let mask = SpatialMask::new(2, 4, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0])?;
        let resized = mask.resize(2, 2)?;
        assert_eq!(resized.dims(), &[1, 1, 2, 2]);
        assert_eq!(mask_values(&resized)?, vec![0.0, 1.0, 0.0, 1.0]);

        // Uniform masks stay uniform at any size
        let ones = SpatialMask::new(3, 5, vec![1.0; 15])?;
        assert!(mask_values(&ones.resize(7, 2)?)?.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_mask_downsamples_to_latent_grid() -> Result<()> {
        // 16x16 image mask whose top half is 1 lands on the top half of a 2x2 grid
        let data: Vec<f32> = (0..256).map(|i| if i < 128 { 1.0 } else { 0.0 }).collect();
        let mask = SpatialMask::new(16, 16, data)?;
        let values = mask_values(&mask.resize(2, 2)?)?;
        assert!(values[0] > 0.99 && values[1] > 0.99);
        assert!(values[2] < 0.01 && values[3] < 0.01);
        Ok(())
    }

    #[test]
    fn test_empty_mask_rejected() {
        assert!(matches!(
            SpatialMask::new(0, 0, vec![]),
            Err(FramePackError::ShapeMismatch { .. })
        ));
        assert!(SpatialMask::new(2, 2, vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_mask_apply_broadcasts() -> Result<()> {
        let latents = Tensor::ones((1, 16, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let mask = SpatialMask::new(2, 2, vec![1.0, 0.0, 0.0, 1.0])?;
        let masked = mask.apply(&latents)?;
        assert_eq!(masked.sum_all()?.to_scalar::<f32>()?, 32.0);
        Ok(())
    }
}
