//! Denoising step invocation
//!
//! The transformer and its per-step solver live outside this crate. The
//! sampler reaches them through [`FramePackModel`]; each section results in
//! exactly one [`FramePackModel::sample`] call which runs the whole denoising
//! schedule for that window and reports progress once per step.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::{LATENT_CHANNELS, RunConfig, SamplerKind, TeaCache};
use crate::conditioning::TextConditioning;
use crate::error::{FramePackError, Result};
use crate::indices::SectionIndices;

/// Progress of the denoising loop inside one section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total steps of the section
    pub total: usize,
}

/// Receiver of per-step progress updates. Purely advisory.
pub trait ProgressSink {
    fn on_step(&mut self, progress: StepProgress);
}

impl<F: FnMut(StepProgress)> ProgressSink for F {
    fn on_step(&mut self, progress: StepProgress) {
        self(progress)
    }
}

/// Sink that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_step(&mut self, _progress: StepProgress) {}
}

/// Sink that logs every step at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_step(&mut self, progress: StepProgress) {
        debug!(step = progress.step + 1, total = progress.total, "Denoising step");
    }
}

/// Control handle for cancelling a run from another thread
#[derive(Debug, Clone, Default)]
pub struct GenerationControl {
    cancelled: Arc<AtomicBool>,
    current_step: Arc<AtomicUsize>,
    total_steps: Arc<AtomicUsize>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the run stops at the next step boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps.load(Ordering::SeqCst)
    }

    /// Progress of the running section (0.0 - 1.0)
    pub fn progress(&self) -> f32 {
        let total = self.total_steps();
        if total == 0 {
            return 0.0;
        }
        self.current_step() as f32 / total as f32
    }

    /// Clear all flags for a new run. Every sampler entry point calls this
    /// before acquiring the device, so a cancel only affects the run in flight.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.current_step.store(0, Ordering::SeqCst);
        self.total_steps.store(0, Ordering::SeqCst);
    }

    fn record(&self, progress: StepProgress) {
        self.current_step.store(progress.step + 1, Ordering::SeqCst);
        self.total_steps.store(progress.total, Ordering::SeqCst);
    }
}

/// Scalar sampling parameters, identical for every section of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub sampler: SamplerKind,
    pub num_inference_steps: usize,
    pub real_guidance_scale: f64,
    pub distilled_guidance_scale: f64,
    pub guidance_rescale: f64,
    /// `None` lets the stepping routine derive the shift from the resolution
    pub shift: Option<f64>,
    /// Denoise strength, only meaningful with an initial latent
    pub strength: f64,
}

impl SamplingParams {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            sampler: config.sampler,
            num_inference_steps: config.steps,
            real_guidance_scale: config.cfg,
            distilled_guidance_scale: config.guidance_scale,
            guidance_rescale: 0.0,
            shift: config.shift_override(),
            strength: config.denoise_strength,
        }
    }
}

/// Everything one call of the stepping routine needs
#[derive(Debug, Clone)]
pub struct SectionRequest<'r> {
    pub params: SamplingParams,
    /// Pixel frames the window decodes to
    pub frames: usize,
    /// Pixel width (latent width * 8)
    pub width: usize,
    /// Pixel height (latent height * 8)
    pub height: usize,
    pub text: &'r TextConditioning,
    pub image_embeddings: Option<&'r Tensor>,
    pub indices: &'r SectionIndices,
    pub clean_latents: &'r Tensor,
    pub clean_latents_2x: Option<&'r Tensor>,
    pub clean_latents_4x: Option<&'r Tensor>,
    pub initial_latent: Option<&'r Tensor>,
    /// Seeded starting noise `[1, 16, F, H, W]`, one frame per active index
    pub noise: &'r Tensor,
    pub dtype: DType,
    pub device: &'r Device,
}

/// Externally supplied transformer plus stepping routine
pub trait FramePackModel {
    /// Move the weights onto the compute device, keeping `preserved_memory_gb` free
    fn load_to_device(&mut self, preserved_memory_gb: f64) -> Result<()>;

    /// Move the weights back to the offload device
    fn offload(&mut self) -> Result<()>;

    fn initialize_teacache(&mut self, teacache: TeaCache);

    /// Run the full denoising schedule of one section.
    ///
    /// Returns the generated latents `[1, 16, F, H, W]` where `F` is the
    /// active index count. `callback` must be called once per step; an error
    /// from it aborts sampling and has to be propagated unchanged.
    fn sample(
        &mut self,
        request: &SectionRequest<'_>,
        callback: &mut dyn FnMut(StepProgress) -> Result<()>,
    ) -> Result<Tensor>;
}

/// Per-section adapter around [`FramePackModel::sample`]
pub struct StepInvoker<'c> {
    teacache: TeaCache,
    control: &'c GenerationControl,
}

impl<'c> StepInvoker<'c> {
    pub fn new(teacache: TeaCache, control: &'c GenerationControl) -> Self {
        Self { teacache, control }
    }

    /// Reset the model's teacache and run one section.
    ///
    /// Cancellation is checked before the call and after every step.
    pub fn invoke(
        &self,
        model: &mut dyn FramePackModel,
        sink: &mut dyn ProgressSink,
        request: &SectionRequest<'_>,
    ) -> Result<Tensor> {
        if self.control.is_cancelled() {
            return Err(FramePackError::Interrupted);
        }
        model.initialize_teacache(self.teacache);

        let control = self.control;
        let mut callback = |progress: StepProgress| -> Result<()> {
            control.record(progress);
            sink.on_step(progress);
            if control.is_cancelled() {
                return Err(FramePackError::Interrupted);
            }
            Ok(())
        };
        let generated = model.sample(request, &mut callback)?;

        let (_, c, t, h, w) = generated.dims5()?;
        let (_, _, _, expected_h, expected_w) = request.clean_latents.dims5()?;
        if c != LATENT_CHANNELS || h != expected_h || w != expected_w {
            return Err(FramePackError::shape(
                "stepping routine output",
                &[1, LATENT_CHANNELS, t, expected_h, expected_w],
                generated.dims(),
            ));
        }
        Ok(generated)
    }
}
