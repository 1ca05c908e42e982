//! Latent index partitions
//!
//! Every section lays its latents out on one contiguous index axis:
//!
//! ```text
//! | clean-pre | blank ... | active (window) | clean-post | clean-2x | clean-4x |
//! ```
//!
//! The denoiser generates the `active` positions and treats the clean ranges
//! as known conditioning. `blank` positions are skipped entirely; they only
//! push the active window away from the conditioning frame in time.

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::error::Result;

/// Length of the 2x-downsampled history range
pub const CLEAN_2X_LEN: usize = 2;
/// Length of the 4x-downsampled history range
pub const CLEAN_4X_LEN: usize = 16;
/// Length of the clean-post range
pub const CLEAN_POST_LEN: usize = 1;

/// A contiguous `[offset, offset + len)` slice of the index axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndexRange {
    pub offset: usize,
    pub len: usize,
}

impl IndexRange {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_vec(&self) -> Vec<i64> {
        (self.offset..self.end()).map(|i| i as i64).collect()
    }
}

/// Layout variants of a section's index axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// Standard section; `pre_frames` is the frame count of the start latent
    Standard { pre_frames: usize },
    /// Main pass of the loop sampler: one extra window of blank padding
    LoopMain { pre_frames: usize },
    /// Connective pass of the loop sampler with a shortened clean-4x range
    Connective { clean_4x_len: usize },
}

/// Six named ranges partitioning one section's index axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexPartition {
    pub clean_pre: IndexRange,
    pub blank: IndexRange,
    pub active: IndexRange,
    pub clean_post: IndexRange,
    pub clean_2x: IndexRange,
    pub clean_4x: IndexRange,
}

impl IndexPartition {
    /// Lay out the index axis for a section with `padding` blank windows
    pub fn build(padding: usize, window_size: usize, mode: PartitionMode) -> Self {
        let (pre, blank, clean_4x) = match mode {
            PartitionMode::Standard { pre_frames } => {
                (pre_frames, padding * window_size, CLEAN_4X_LEN)
            }
            PartitionMode::LoopMain { pre_frames } => {
                (pre_frames, padding * window_size + window_size, CLEAN_4X_LEN)
            }
            PartitionMode::Connective { clean_4x_len } => (1, padding * window_size, clean_4x_len),
        };

        let lengths = [pre, blank, window_size, CLEAN_POST_LEN, CLEAN_2X_LEN, clean_4x];
        let mut ranges = [IndexRange::default(); 6];
        let mut offset = 0;
        for (range, len) in ranges.iter_mut().zip(lengths) {
            *range = IndexRange { offset, len };
            offset += len;
        }

        Self {
            clean_pre: ranges[0],
            blank: ranges[1],
            active: ranges[2],
            clean_post: ranges[3],
            clean_2x: ranges[4],
            clean_4x: ranges[5],
        }
    }

    /// Length of the whole index axis
    pub fn total_len(&self) -> usize {
        self.clean_4x.end()
    }

    pub fn ranges(&self) -> [IndexRange; 6] {
        [
            self.clean_pre,
            self.blank,
            self.active,
            self.clean_post,
            self.clean_2x,
            self.clean_4x,
        ]
    }

    /// `concat(clean-pre, clean-post)`
    pub fn clean_latent_indices(&self) -> Vec<i64> {
        let mut indices = self.clean_pre.to_vec();
        indices.extend(self.clean_post.to_vec());
        indices
    }

    /// Index tensors for the stepping routine
    pub fn to_tensors(&self, device: &Device) -> Result<SectionIndices> {
        Ok(SectionIndices {
            latent_indices: index_tensor(self.active.to_vec(), device)?,
            clean_latent_indices: index_tensor(self.clean_latent_indices(), device)?,
            clean_latent_2x_indices: Some(index_tensor(self.clean_2x.to_vec(), device)?),
            clean_latent_4x_indices: Some(index_tensor(self.clean_4x.to_vec(), device)?),
        })
    }
}

/// Length of the clean-4x range in the loop sampler's connective pass.
///
/// The connective history is shorter than a fresh buffer, so the 4x range
/// shrinks with the total section count (main + connection).
pub fn connective_clean_4x_len(total_sections: usize) -> usize {
    match total_sections {
        0 | 1 => 6,
        2 => 15,
        _ => 16,
    }
}

/// Index tensors handed to the stepping routine, each shaped `[1, n]` (i64)
#[derive(Debug, Clone)]
pub struct SectionIndices {
    pub latent_indices: Tensor,
    pub clean_latent_indices: Tensor,
    pub clean_latent_2x_indices: Option<Tensor>,
    pub clean_latent_4x_indices: Option<Tensor>,
}

/// Index layout of the single-frame sampler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleFrameIndices {
    /// Reserved layout (padding 0); its active range still spans a full window
    pub partition: IndexPartition,
    /// The one index actually generated
    pub latent_indices: Vec<i64>,
    pub clean_latent_indices: Vec<i64>,
}

impl SingleFrameIndices {
    /// Plain mode: generate the last slot of the window, conditioned on index 0 only
    pub fn plain(window_size: usize) -> Self {
        let partition = IndexPartition::build(0, window_size, PartitionMode::Standard { pre_frames: 1 });
        Self {
            partition,
            latent_indices: vec![window_size as i64 - 1],
            clean_latent_indices: vec![0],
        }
    }

    /// Reference mode: the active slot moves to `target_index` and the
    /// reference frame sits at `history_index`
    pub fn reference(window_size: usize, target_index: usize, history_index: usize) -> Self {
        let partition = IndexPartition::build(0, window_size, PartitionMode::Standard { pre_frames: 1 });
        let mut clean_latent_indices = partition.clean_pre.to_vec();
        clean_latent_indices.push(history_index as i64);
        Self {
            partition,
            latent_indices: vec![target_index as i64],
            clean_latent_indices,
        }
    }

    /// Index tensors; the 2x/4x ranges are disabled in single-frame mode
    pub fn to_tensors(&self, device: &Device) -> Result<SectionIndices> {
        Ok(SectionIndices {
            latent_indices: index_tensor(self.latent_indices.clone(), device)?,
            clean_latent_indices: index_tensor(self.clean_latent_indices.clone(), device)?,
            clean_latent_2x_indices: None,
            clean_latent_4x_indices: None,
        })
    }
}

fn index_tensor(indices: Vec<i64>, device: &Device) -> Result<Tensor> {
    let len = indices.len();
    Ok(Tensor::from_vec(indices, (1, len), device)?)
}
