//! Section planning
//!
//! Splits a requested duration into latent sections and produces the padding
//! schedule that drives the autoregressive loop. Sections are generated
//! backwards in time: the first planned section has the largest padding and
//! the last one (padding 0) sits right after the conditioning frame.

use serde::Serialize;

use crate::config::{FRAMES_PER_SECOND, PIXEL_FRAMES_PER_LATENT};

/// One iteration of the section loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Position in the schedule
    pub index: usize,
    /// Blank latent windows between the conditioning frame and the active window
    pub padding: usize,
    pub is_first: bool,
    pub is_last: bool,
    /// Latent frames generated by this section
    pub window_size: usize,
}

impl Section {
    /// Blank latent slots before the active window
    pub fn padding_size(&self) -> usize {
        self.padding * self.window_size
    }
}

/// Number of sections needed to cover `total_seconds` of video.
///
/// `max(round(total_seconds * 30 / (window_size * 4)), 1)` with round half to even.
pub fn total_latent_sections(total_seconds: f64, window_size: usize) -> usize {
    let sections = (total_seconds * FRAMES_PER_SECOND as f64)
        / (window_size * PIXEL_FRAMES_PER_LATENT) as f64;
    let rounded = sections.round_ties_even();
    if rounded < 1.0 { 1 } else { rounded as usize }
}

/// Number of sections of the loop sampler's connective segment.
///
/// The connective count is `max(round(seconds), 1)`; it is not divided by the
/// window length the way [`total_latent_sections`] is.
pub fn connection_latent_sections(connection_seconds: f64) -> usize {
    let rounded = connection_seconds.round_ties_even();
    if rounded < 1.0 { 1 } else { rounded as usize }
}

/// Padding values for `num_sections` sections.
///
/// Descending `[n-1, ..., 0]` up to four sections. Longer runs repeat the
/// padding 2 instead of spreading further: `[3, 2, ..., 2, 1, 0]`.
pub fn padding_schedule(num_sections: usize) -> Vec<usize> {
    let num_sections = num_sections.max(1);
    if num_sections > 4 {
        let mut schedule = Vec::with_capacity(num_sections);
        schedule.push(3);
        schedule.extend(std::iter::repeat_n(2, num_sections - 3));
        schedule.extend([1, 0]);
        schedule
    } else {
        (0..num_sections).rev().collect()
    }
}

/// Expand a padding schedule into sections
pub fn plan_sections(num_sections: usize, window_size: usize) -> Vec<Section> {
    let schedule = padding_schedule(num_sections);
    let first = schedule[0];
    schedule
        .iter()
        .enumerate()
        .map(|(index, &padding)| Section {
            index,
            padding,
            is_first: padding == first,
            is_last: padding == 0,
            window_size,
        })
        .collect()
}

/// Frame range `[start, end)` of the initial samples read by a section when
/// continuing from an existing video.
///
/// The last section reads the tail; the others spread their windows over the
/// input proportionally to how far their padding is from the maximum.
pub fn init_latent_window(
    total_length: usize,
    window_size: usize,
    padding: usize,
    max_padding: usize,
    is_last: bool,
) -> (usize, usize) {
    let span = total_length.saturating_sub(window_size);
    let start = if is_last {
        span
    } else if max_padding > 0 {
        let progress = (max_padding - padding.min(max_padding)) as f64 / max_padding as f64;
        (progress * span as f64) as usize
    } else {
        0
    };
    let end = (start + window_size).min(total_length);
    (start, end)
}
