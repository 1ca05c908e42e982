//! Latent scaling and result assembly

use candle_core::Tensor;
use serde::Serialize;
use tracing::debug;

use crate::config::{PIXEL_FRAMES_PER_LATENT, VAE_SCALING_FACTOR};
use crate::error::Result;

/// Scale a VAE latent into sampler space
pub fn ingest(latent: &Tensor) -> Result<Tensor> {
    Ok(latent.affine(VAE_SCALING_FACTOR, 0.0)?)
}

/// Undo [`ingest`] on the way out
pub fn finalize(latent: &Tensor) -> Result<Tensor> {
    Ok(latent.affine(1.0 / VAE_SCALING_FACTOR, 0.0)?)
}

/// Result of the loop sampler.
///
/// After decoding, dropping `start_frames` leading and `end_frames` trailing
/// pixel frames leaves one seamless loop.
#[derive(Debug, Clone)]
pub struct LoopOutput {
    pub samples: Tensor,
    pub start_frames: usize,
    pub end_frames: usize,
}

/// Pixel frames to trim from each end of a decoded loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopTrim {
    pub start_frames: usize,
    pub end_frames: usize,
}

impl LoopTrim {
    pub fn for_window(window_size: usize) -> Self {
        Self {
            start_frames: window_size * PIXEL_FRAMES_PER_LATENT - 3,
            end_frames: window_size * PIXEL_FRAMES_PER_LATENT,
        }
    }
}

/// Frames `[0, min(len, n))` along the time axis
fn head(x: &Tensor, n: usize) -> Result<Tensor> {
    let len = x.dims()[2];
    Ok(x.narrow(2, 0, n.min(len))?)
}

/// Frames `[max(0, len - n), len)` along the time axis
fn tail(x: &Tensor, n: usize) -> Result<Tensor> {
    let len = x.dims()[2];
    let n = n.min(len);
    Ok(x.narrow(2, len - n, n)?)
}

/// Stitch the loop sampler's two passes into one clip:
///
/// ```text
/// concat(connection[-window:], main[:window*total], connection, main[-window:])
/// ```
///
/// where `connection` is the connective history truncated to
/// `window * connection_sections` frames. Slices past the end of a history
/// are clamped to what exists.
pub fn assemble_loop(
    main_history: &Tensor,
    connection_history: &Tensor,
    window_size: usize,
    total_sections: usize,
    connection_sections: usize,
) -> Result<Tensor> {
    let connection = head(connection_history, window_size * connection_sections)?;
    let main = head(main_history, window_size * total_sections)?;
    let parts = [
        tail(&connection, window_size)?,
        main.clone(),
        connection.clone(),
        tail(&main, window_size)?,
    ];
    let looped = Tensor::cat(&parts, 2)?;
    debug!(
        connection_frames = connection.dims()[2],
        main_frames = main.dims()[2],
        total_frames = looped.dims()[2],
        "Assembled loop"
    );
    Ok(looped)
}

/// Drop `start_frames` leading and `end_frames` trailing frames along dim 0.
/// Zero keeps that end untouched.
pub fn split_loop_frames(images: &Tensor, start_frames: usize, end_frames: usize) -> Result<Tensor> {
    let len = images.dim(0)?;
    let start = start_frames.min(len);
    let end = len.saturating_sub(end_frames).max(start);
    Ok(images.narrow(0, start, end - start)?)
}
