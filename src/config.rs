//! Configuration structures for FramePack sampling runs

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Scale applied to VAE latents when they enter the sampler (divided out on egress)
pub const VAE_SCALING_FACTOR: f64 = 0.476986;

/// Latent channels of the HunyuanVideo VAE
pub const LATENT_CHANNELS: usize = 16;

/// Output frame rate assumed when converting seconds to sections
pub const FRAMES_PER_SECOND: usize = 30;

/// Pixel frames covered by one latent frame
pub const PIXEL_FRAMES_PER_LATENT: usize = 4;

/// Spatial compression of the VAE (latent pixel -> image pixel)
pub const VAE_SPATIAL_COMPRESSION: usize = 8;

/// Token length the llama prompt embeddings are cropped or padded to
pub const TEXT_TOKEN_LENGTH: usize = 512;

/// Low-level solver used by the stepping routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    UnipcBh1,
    UnipcBh2,
}

impl SamplerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::UnipcBh1 => "unipc_bh1",
            SamplerKind::UnipcBh2 => "unipc_bh2",
        }
    }
}

/// How image embeddings are blended across sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedInterpolation {
    /// Start embedding scaled by `start_embed_strength`
    #[default]
    Disabled,
    /// Fixed start/end blend using `start_embed_strength`
    WeightedAverage,
    /// Start to end interpolation walking backwards through the sections
    Linear,
}

/// Sampling parameters shared by every sampler variant.
///
/// Created once per invocation and read-only afterwards. Field ranges follow
/// the limits exposed by the sampler nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Denoising steps per section
    pub steps: usize,
    /// Enable the teacache fast path inside the stepping routine
    pub use_teacache: bool,
    /// Relative L1 threshold for teacache
    pub teacache_rel_l1_thresh: f64,
    /// Real classifier-free guidance scale (1.0 disables the negative branch)
    pub cfg: f64,
    /// Distilled guidance scale embedded into the transformer
    pub guidance_scale: f64,
    /// Flow shift; 0.0 lets the stepping routine pick its own
    pub shift: f64,
    /// Seed of the run-wide noise generator
    pub seed: u64,
    /// Latent frames generated per section
    pub latent_window_size: usize,
    /// Requested video length in seconds
    pub total_second_length: f64,
    /// GPU memory (GB) kept free when moving the transformer on device
    pub gpu_memory_preservation: f64,
    pub sampler: SamplerKind,
    pub embed_interpolation: EmbedInterpolation,
    /// Start image embedding strength / weighted average constant
    pub start_embed_strength: f64,
    /// Denoise strength applied when initial samples are supplied
    pub denoise_strength: f64,
    /// Length of the connective segment of the loop sampler, in seconds
    pub connection_second_length: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            steps: 30,
            use_teacache: true,
            teacache_rel_l1_thresh: 0.15,
            cfg: 1.0,
            guidance_scale: 10.0,
            shift: 0.0,
            seed: 0,
            latent_window_size: 9,
            total_second_length: 5.0,
            gpu_memory_preservation: 6.0,
            sampler: SamplerKind::UnipcBh1,
            embed_interpolation: EmbedInterpolation::Disabled,
            start_embed_strength: 1.0,
            denoise_strength: 1.0,
            connection_second_length: 1.0,
        }
    }
}

impl RunConfig {
    /// Load a run configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::JsonParse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps == 0 {
            return Err(ConfigError::OutOfRange {
                field: "steps",
                value: 0.0,
                min: 1.0,
                max: f64::INFINITY,
            });
        }
        if !(1..=33).contains(&self.latent_window_size) {
            return Err(ConfigError::InvalidWindowSize(self.latent_window_size));
        }
        check_range("teacache_rel_l1_thresh", self.teacache_rel_l1_thresh, 0.0, 1.0)?;
        check_range("cfg", self.cfg, 0.0, 30.0)?;
        check_range("guidance_scale", self.guidance_scale, 0.0, 32.0)?;
        check_range("shift", self.shift, 0.0, 1000.0)?;
        check_range("total_second_length", self.total_second_length, 0.1, 120.0)?;
        check_range("gpu_memory_preservation", self.gpu_memory_preservation, 0.0, 128.0)?;
        check_range("start_embed_strength", self.start_embed_strength, 0.0, 1.0)?;
        check_range("denoise_strength", self.denoise_strength, 0.0, 1.0)?;
        check_range(
            "connection_second_length",
            self.connection_second_length,
            1.0,
            5.0,
        )?;
        Ok(())
    }

    /// Whether the negative prompt branch is active
    pub fn uses_real_cfg(&self) -> bool {
        (self.cfg - 1.0).abs() > 1e-9
    }

    /// Shift forwarded to the stepping routine, `None` when left at 0
    pub fn shift_override(&self) -> Option<f64> {
        if self.shift != 0.0 { Some(self.shift) } else { None }
    }

    /// Pixel frames the stepping routine decodes a window into
    pub fn pixel_frames_per_section(&self) -> usize {
        self.latent_window_size * PIXEL_FRAMES_PER_LATENT - 3
    }

    /// Teacache settings carried unchanged to every section
    pub fn teacache(&self) -> TeaCache {
        TeaCache {
            enabled: self.use_teacache,
            num_steps: self.steps,
            rel_l1_thresh: self.teacache_rel_l1_thresh,
        }
    }

    pub fn with_window_size(mut self, window: usize) -> Self {
        self.latent_window_size = window;
        self
    }

    pub fn with_total_seconds(mut self, seconds: f64) -> Self {
        self.total_second_length = seconds;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cfg(mut self, cfg: f64) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_embed_interpolation(mut self, mode: EmbedInterpolation) -> Self {
        self.embed_interpolation = mode;
        self
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Teacache initialization flags forwarded to the model before each section
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeaCache {
    pub enabled: bool,
    pub num_steps: usize,
    pub rel_l1_thresh: f64,
}

/// Extra options of the single-frame sampler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFrameConfig {
    /// Blend a reference image into the single generated frame (Kisekaeichi)
    pub use_kisekaeichi: bool,
    /// Active latent index in reference mode (0..=8, recommended 1)
    pub target_index: usize,
    /// Clean-post latent index in reference mode (0..=16, recommended 13)
    pub history_index: usize,
}

impl Default for SingleFrameConfig {
    fn default() -> Self {
        Self {
            use_kisekaeichi: false,
            target_index: 1,
            history_index: 13,
        }
    }
}

impl SingleFrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_index > 8 {
            return Err(ConfigError::OutOfRange {
                field: "target_index",
                value: self.target_index as f64,
                min: 0.0,
                max: 8.0,
            });
        }
        if self.history_index > 16 {
            return Err(ConfigError::OutOfRange {
                field: "history_index",
                value: self.history_index as f64,
                min: 0.0,
                max: 16.0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid latent window size: {0}. Must be in 1..=33")]
    InvalidWindowSize(usize),
    #[error("{field}={value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Failed to read config file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
