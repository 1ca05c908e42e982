//! Error taxonomy of the sampler

use crate::config::ConfigError;
use crate::loader::LoaderError;

/// Errors raised by a FramePack sampling run.
///
/// Every failure aborts the whole invocation; accumulated history is dropped
/// and the device lease is released on the way out.
#[derive(Debug, thiserror::Error)]
pub enum FramePackError {
    #[error("start latent is required: the sampler cannot run without a conditioning image")]
    MissingStartLatent,

    #[error("reference image embeddings are required in reference (kisekaeichi) mode")]
    MissingReferenceEmbeds,

    #[error("end latent was given without end image embeddings")]
    MissingEndImageEmbeds,

    #[error(
        "fusing LoRA into {precision} weights is not supported, use a bf16/fp16/fp32 checkpoint or disable fusing"
    )]
    IncompatibleFusePrecision { precision: String },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("sampling interrupted")]
    Interrupted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, FramePackError>;

impl FramePackError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        FramePackError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
