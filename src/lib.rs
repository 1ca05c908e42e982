//! Candle-FramePack: FramePack image-to-video sampling for Candle.
//!
//! This crate drives a HunyuanVideo-style packed transformer section by
//! section, generating video latents back to front with a rolling latent
//! history. It also provides single-frame (Kisekaeichi) and seamless loop
//! variants, plus checkpoint/LoRA loading for the transformer.

pub mod bucket;
pub mod conditioning;
pub mod config;
pub mod device;
pub mod error;
pub mod finalize;
pub mod history;
pub mod indices;
pub mod latents_bin;
pub mod loader;
pub mod planner;
pub mod rng;
pub mod sampler;
pub mod stepper;

pub use bucket::{Bucket, find_nearest_bucket};
pub use conditioning::{PromptEmbeds, SpatialMask, TextConditioning};
pub use config::{EmbedInterpolation, RunConfig, SamplerKind, SingleFrameConfig, TeaCache};
pub use device::{CpuDeviceManager, DeviceLease, DeviceManager};
pub use error::{FramePackError, Result};
pub use finalize::{LoopOutput, LoopTrim, split_loop_frames};
pub use loader::{LoraSpec, LoraStack, ModelLoadConfig, TransformerLoader};
pub use planner::{Section, plan_sections};
pub use rng::Pcg32;
pub use sampler::{FramePackSampler, SamplerInputs};
pub use stepper::{
    FramePackModel, GenerationControl, LogProgress, NoProgress, ProgressSink, SectionRequest,
    StepProgress,
};
