//! Rolling latent history
//!
//! Sections are generated back to front, so every new chunk is prepended and
//! index 0 of the logical buffer is always the most recently generated frame.
//! The buffer is a fixed-capacity arena that fills from the tail towards the
//! head: a write cursor marks the newest frame, everything in
//! `[cursor, capacity)` is live.
//!
//! ```text
//! capacity = reserve + context
//! | free ... | newest ... oldest generated | zero context (19) |
//!            ^ cursor
//! ```

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::LATENT_CHANNELS;
use crate::error::{FramePackError, Result};
use crate::indices::{CLEAN_2X_LEN, CLEAN_4X_LEN, CLEAN_POST_LEN};

/// Zero frames a fresh buffer starts with: clean-post + clean-2x + clean-4x
pub const CONTEXT_FRAMES: usize = CLEAN_POST_LEN + CLEAN_2X_LEN + CLEAN_4X_LEN;

/// Clean history slices handed to one section
#[derive(Debug, Clone)]
pub struct HistoryContext {
    pub post: Tensor,
    pub clean_2x: Tensor,
    pub clean_4x: Tensor,
}

/// Front-prepend latent accumulator owned by one sampler invocation
#[derive(Debug)]
pub struct HistoryBuffer {
    buffer: Tensor,
    cursor: usize,
    valid: usize,
    height: usize,
    width: usize,
}

impl HistoryBuffer {
    /// Fresh buffer of [`CONTEXT_FRAMES`] zero frames with room for `reserve`
    /// generated frames in front of them.
    pub fn new(height: usize, width: usize, reserve: usize, device: &Device) -> Result<Self> {
        let capacity = reserve + CONTEXT_FRAMES;
        let buffer = Tensor::zeros((1, LATENT_CHANNELS, capacity, height, width), DType::F32, device)?;
        debug!(capacity, height, width, "Allocated history buffer");
        Ok(Self {
            buffer,
            cursor: reserve,
            valid: 0,
            height,
            width,
        })
    }

    /// Seed a buffer with already generated frames (newest first).
    ///
    /// The logical buffer is zero-padded at the tail up to `min_len` frames
    /// so the context slices always exist; only the seeded frames count as
    /// valid.
    pub fn from_frames(frames: &Tensor, min_len: usize, reserve: usize) -> Result<Self> {
        let (_, _, t, height, width) = frames.dims5()?;
        let live = t.max(min_len);
        let mut history = Self::new(
            height,
            width,
            reserve + live.saturating_sub(CONTEXT_FRAMES),
            frames.device(),
        )?;
        // Move the cursor so the live region is exactly `live` frames long
        history.cursor = history.capacity() - live;
        history.write(frames, history.cursor)?;
        history.valid = t;
        Ok(history)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.dims()[2]
    }

    /// Frames in the logical buffer, generated plus zero context
    pub fn len(&self) -> usize {
        self.capacity() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generated frames folded into the buffer so far
    pub fn valid_len(&self) -> usize {
        self.valid
    }

    /// Prepend freshly generated frames
    pub fn prepend(&mut self, frames: &Tensor) -> Result<()> {
        let (_, c, t, h, w) = frames.dims5()?;
        if c != LATENT_CHANNELS || h != self.height || w != self.width {
            return Err(FramePackError::shape(
                "generated latents",
                &[1, LATENT_CHANNELS, t, self.height, self.width],
                frames.dims(),
            ));
        }
        if t > self.cursor {
            return Err(FramePackError::shape(
                "history capacity",
                &[self.capacity() + t - self.cursor],
                &[self.capacity()],
            ));
        }
        let offset = self.cursor - t;
        self.write(frames, offset)?;
        self.cursor = offset;
        self.valid += t;
        debug!(frames = t, valid = self.valid, "Folded section into history");
        Ok(())
    }

    /// Copy `frames` into the arena in place. Only the free region in front
    /// of the cursor is written, so views returned by [`Self::front`] keep
    /// their contents.
    fn write(&mut self, frames: &Tensor, offset: usize) -> Result<()> {
        let frames = frames
            .to_dtype(DType::F32)?
            .to_device(self.buffer.device())?
            .contiguous()?;
        self.buffer.slice_set(&frames, 2, offset)?;
        Ok(())
    }

    /// The first `n` frames of the logical buffer (newest first)
    pub fn front(&self, n: usize) -> Result<Tensor> {
        if n > self.len() {
            return Err(FramePackError::shape("history window", &[n], &[self.len()]));
        }
        Ok(self.buffer.narrow(2, self.cursor, n)?)
    }

    /// Generated frames only, newest first
    pub fn real(&self) -> Result<Tensor> {
        self.front(self.valid)
    }

    /// Oldest generated frame, or the first context frame when nothing was generated yet
    pub fn oldest_valid(&self) -> Result<Tensor> {
        let index = self.valid.max(1) - 1;
        Ok(self.buffer.narrow(2, self.cursor + index, 1)?)
    }

    /// Split the front of the buffer into clean-post, clean-2x and a clean-4x
    /// slice of `clean_4x_len` frames
    pub fn context(&self, clean_4x_len: usize) -> Result<HistoryContext> {
        let head = self.front(CLEAN_POST_LEN + CLEAN_2X_LEN + clean_4x_len)?;
        Ok(HistoryContext {
            post: head.narrow(2, 0, CLEAN_POST_LEN)?,
            clean_2x: head.narrow(2, CLEAN_POST_LEN, CLEAN_2X_LEN)?,
            clean_4x: head.narrow(2, CLEAN_POST_LEN + CLEAN_2X_LEN, clean_4x_len)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(t: usize, value: f32) -> Result<Tensor> {
        Ok((Tensor::ones((1, LATENT_CHANNELS, t, 2, 3), DType::F32, &Device::Cpu)? * value as f64)?)
    }

    fn first_value(t: &Tensor) -> Result<f32> {
        Ok(t.flatten_all()?.get(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_fresh_buffer_is_zero_context() -> Result<()> {
        let history = HistoryBuffer::new(2, 3, 10, &Device::Cpu)?;
        assert_eq!(history.len(), CONTEXT_FRAMES);
        assert_eq!(history.valid_len(), 0);
        let ctx = history.context(CLEAN_4X_LEN)?;
        assert_eq!(ctx.clean_4x.dims(), &[1, LATENT_CHANNELS, 16, 2, 3]);
        assert_eq!(ctx.post.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_prepend_puts_newest_first() -> Result<()> {
        let mut history = HistoryBuffer::new(2, 3, 10, &Device::Cpu)?;
        history.prepend(&frames(4, 1.0)?)?;
        history.prepend(&frames(3, 2.0)?)?;

        assert_eq!(history.valid_len(), 7);
        assert_eq!(history.len(), 7 + CONTEXT_FRAMES);

        let real = history.real()?;
        assert_eq!(real.dims()[2], 7);
        assert_eq!(first_value(&real.narrow(2, 0, 1)?)?, 2.0);
        assert_eq!(first_value(&real.narrow(2, 6, 1)?)?, 1.0);
        assert_eq!(first_value(&history.oldest_valid()?)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_prepend_writes_in_place() -> Result<()> {
        let mut history = HistoryBuffer::new(2, 3, 10, &Device::Cpu)?;
        let arena = history.buffer.id();
        let ctx = history.context(CLEAN_4X_LEN)?;

        history.prepend(&frames(2, 1.0)?)?;
        history.prepend(&frames(3, 2.0)?)?;
        assert_eq!(history.buffer.id(), arena);

        // Context taken before the writes still reads the zero frames
        assert_eq!(ctx.post.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert_eq!(first_value(&history.context(CLEAN_4X_LEN)?.post)?, 2.0);
        Ok(())
    }

    #[test]
    fn test_overflow_is_rejected() -> Result<()> {
        let mut history = HistoryBuffer::new(2, 3, 2, &Device::Cpu)?;
        assert!(history.prepend(&frames(3, 1.0)?).is_err());
        // Nothing was written
        assert_eq!(history.valid_len(), 0);
        Ok(())
    }

    #[test]
    fn test_spatial_mismatch_is_rejected() -> Result<()> {
        let mut history = HistoryBuffer::new(4, 4, 8, &Device::Cpu)?;
        let err = history.prepend(&frames(1, 1.0)?).unwrap_err();
        assert!(matches!(err, FramePackError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_seeded_buffer_pads_short_history() -> Result<()> {
        let history = HistoryBuffer::from_frames(&frames(5, 3.0)?, 19, 9)?;
        assert_eq!(history.valid_len(), 5);
        assert_eq!(history.len(), 19);
        assert_eq!(history.capacity(), 19 + 9);

        let ctx = history.context(16)?;
        // Seeded frames fill the front, the tail is zero padding
        assert_eq!(first_value(&ctx.post)?, 3.0);
        assert_eq!(ctx.clean_4x.narrow(2, 15, 1)?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert_eq!(first_value(&history.oldest_valid()?)?, 3.0);
        Ok(())
    }

    #[test]
    fn test_seeded_buffer_keeps_long_history() -> Result<()> {
        let history = HistoryBuffer::from_frames(&frames(27, 1.0)?, 19, 9)?;
        assert_eq!(history.len(), 27);
        assert_eq!(history.real()?.dims()[2], 27);
        Ok(())
    }
}
