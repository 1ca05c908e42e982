//! Section loop driver
//!
//! Implements the three FramePack sampling variants on top of an external
//! [`FramePackModel`]:
//!
//! - [`FramePackSampler::sample`]: sectioned image-to-video, generated back
//!   to front with a rolling latent history
//! - [`FramePackSampler::sample_single_frame`]: one latent frame, optionally
//!   guided by a reference image (Kisekaeichi)
//! - [`FramePackSampler::sample_loop`]: a main pass plus a connective pass
//!   stitched into a seamlessly loopable clip
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_framepack::{FramePackSampler, RunConfig, SamplerInputs};
//!
//! let mut sampler = FramePackSampler::new(Box::new(model), Box::new(devices), device, DType::BF16);
//! let inputs = SamplerInputs::new(positive)
//!     .with_start_latent(start_latent)
//!     .with_image_embeds(clip_vision_state);
//! let latents = sampler.sample(&RunConfig::default(), &inputs)?;
//! ```

use std::fmt;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::conditioning::{
    PromptEmbeds, SpatialMask, TextConditioning, reference_image_embeds, section_image_embeds,
};
use crate::config::{
    LATENT_CHANNELS, RunConfig, SingleFrameConfig, VAE_SPATIAL_COMPRESSION,
};
use crate::device::{DeviceLease, DeviceManager};
use crate::error::{FramePackError, Result};
use crate::finalize::{LoopOutput, LoopTrim, assemble_loop, finalize, ingest};
use crate::history::HistoryBuffer;
use crate::indices::{
    CLEAN_2X_LEN, CLEAN_4X_LEN, CLEAN_POST_LEN, IndexPartition, PartitionMode, SectionIndices,
    SingleFrameIndices, connective_clean_4x_len,
};
use crate::planner::{
    Section, connection_latent_sections, init_latent_window, plan_sections, total_latent_sections,
};
use crate::rng::Pcg32;
use crate::stepper::{
    FramePackModel, GenerationControl, NoProgress, ProgressSink, SamplingParams, SectionRequest,
    StepInvoker,
};

// =============================================================================
// Inputs
// =============================================================================

/// Caller-supplied tensors of one sampling run.
///
/// Latents are raw VAE outputs `[1, 16, T, H, W]`; scaling into sampler space
/// happens inside the sampler. Image embeddings are the image encoder's last
/// hidden state.
#[derive(Debug, Clone)]
pub struct SamplerInputs {
    pub positive: PromptEmbeds,
    pub negative: Option<PromptEmbeds>,
    pub start_latent: Option<Tensor>,
    pub end_latent: Option<Tensor>,
    pub initial_samples: Option<Tensor>,
    pub reference_latent: Option<Tensor>,
    pub image_embeds: Option<Tensor>,
    pub end_image_embeds: Option<Tensor>,
    pub reference_image_embeds: Option<Tensor>,
    pub input_mask: Option<SpatialMask>,
    pub reference_mask: Option<SpatialMask>,
}

impl SamplerInputs {
    pub fn new(positive: PromptEmbeds) -> Self {
        Self {
            positive,
            negative: None,
            start_latent: None,
            end_latent: None,
            initial_samples: None,
            reference_latent: None,
            image_embeds: None,
            end_image_embeds: None,
            reference_image_embeds: None,
            input_mask: None,
            reference_mask: None,
        }
    }

    pub fn with_negative(mut self, negative: PromptEmbeds) -> Self {
        self.negative = Some(negative);
        self
    }

    pub fn with_start_latent(mut self, latent: Tensor) -> Self {
        self.start_latent = Some(latent);
        self
    }

    /// End image latent and its image embedding
    pub fn with_end_image(mut self, latent: Tensor, embeds: Tensor) -> Self {
        self.end_latent = Some(latent);
        self.end_image_embeds = Some(embeds);
        self
    }

    /// Existing video latents to re-denoise (video-to-video)
    pub fn with_initial_samples(mut self, samples: Tensor) -> Self {
        self.initial_samples = Some(samples);
        self
    }

    pub fn with_image_embeds(mut self, embeds: Tensor) -> Self {
        self.image_embeds = Some(embeds);
        self
    }

    /// Reference image latent and embedding for the single-frame sampler
    pub fn with_reference(mut self, latent: Tensor, embeds: Tensor) -> Self {
        self.reference_latent = Some(latent);
        self.reference_image_embeds = Some(embeds);
        self
    }

    pub fn with_masks(mut self, input: Option<SpatialMask>, reference: Option<SpatialMask>) -> Self {
        self.input_mask = input;
        self.reference_mask = reference;
        self
    }
}

/// Inputs moved to the working device, scaled and validated
struct Prepared {
    start_latent: Tensor,
    end_latent: Option<Tensor>,
    initial_samples: Option<Tensor>,
    start_embeds: Option<Tensor>,
    end_embeds: Option<Tensor>,
    text: TextConditioning,
    pre_frames: usize,
    height: usize,
    width: usize,
}

impl Prepared {
    fn new(
        config: &RunConfig,
        inputs: &SamplerInputs,
        use_end_image: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let start = inputs
            .start_latent
            .as_ref()
            .ok_or(FramePackError::MissingStartLatent)?;
        let (b, c, pre_frames, height, width) = start.dims5()?;
        if b != 1 || c != LATENT_CHANNELS || pre_frames == 0 {
            return Err(FramePackError::shape(
                "start latent",
                &[1, LATENT_CHANNELS, pre_frames.max(1), height, width],
                start.dims(),
            ));
        }
        let start_latent = load_latent(start, device)?;

        let end_latent = match (&inputs.end_latent, use_end_image) {
            (Some(end), true) => {
                if inputs.end_image_embeds.is_none() {
                    return Err(FramePackError::MissingEndImageEmbeds);
                }
                check_spatial("end latent", end, height, width)?;
                if end.dims()[2] != CLEAN_POST_LEN {
                    return Err(FramePackError::shape(
                        "end latent",
                        &[1, LATENT_CHANNELS, CLEAN_POST_LEN, height, width],
                        end.dims(),
                    ));
                }
                Some(load_latent(end, device)?)
            }
            _ => None,
        };

        let initial_samples = match &inputs.initial_samples {
            Some(samples) => {
                check_spatial("initial samples", samples, height, width)?;
                Some(load_latent(samples, device)?)
            }
            None => None,
        };

        let start_embeds = inputs
            .image_embeds
            .as_ref()
            .map(|e| e.to_device(device)?.to_dtype(dtype))
            .transpose()?;
        // End embeddings only count when an end image takes part in the run
        let end_embeds = match (&end_latent, &inputs.end_image_embeds) {
            (Some(_), Some(e)) => Some(e.to_device(device)?.to_dtype(dtype)?),
            _ => None,
        };

        let text = TextConditioning::prepare(
            &inputs.positive,
            inputs.negative.as_ref(),
            config.uses_real_cfg(),
            device,
            dtype,
        )?;

        debug!(
            shape = ?start_latent.dims(),
            has_end_image = end_latent.is_some(),
            has_initial_samples = initial_samples.is_some(),
            has_image_embeds = start_embeds.is_some(),
            "Prepared sampler inputs"
        );

        Ok(Self {
            start_latent,
            end_latent,
            initial_samples,
            start_embeds,
            end_embeds,
            text,
            pre_frames,
            height,
            width,
        })
    }

    fn section_embeds(&self, config: &RunConfig, index: usize, num_sections: usize) -> Result<Option<Tensor>> {
        self.start_embeds
            .as_ref()
            .map(|start| {
                section_image_embeds(
                    config.embed_interpolation,
                    index,
                    num_sections,
                    start,
                    self.end_embeds.as_ref(),
                    config.start_embed_strength,
                )
            })
            .transpose()
    }

    /// Slice of the initial samples read by `section`
    fn initial_window(&self, section: &Section, max_padding: usize) -> Result<Option<Tensor>> {
        let Some(samples) = &self.initial_samples else {
            return Ok(None);
        };
        let total_length = samples.dims()[2];
        let (start, end) = init_latent_window(
            total_length,
            section.window_size,
            section.padding,
            max_padding,
            section.is_last,
        );
        debug!(start, end, total_length, "Initial latent window");
        Ok(Some(samples.narrow(2, start, end - start)?))
    }

    /// Clean-post latent: the end image on the first section, history otherwise
    fn clean_post(&self, section: &Section, history_post: Tensor) -> Tensor {
        match &self.end_latent {
            Some(end) if section.is_first => end.clone(),
            _ => history_post,
        }
    }
}

fn load_latent(latent: &Tensor, device: &Device) -> Result<Tensor> {
    ingest(&latent.to_device(device)?.to_dtype(DType::F32)?)
}

fn check_spatial(what: &'static str, latent: &Tensor, height: usize, width: usize) -> Result<()> {
    let (_, c, t, h, w) = latent.dims5()?;
    if c != LATENT_CHANNELS || h != height || w != width {
        return Err(FramePackError::shape(what, &[1, LATENT_CHANNELS, t, height, width], latent.dims()));
    }
    Ok(())
}

// =============================================================================
// Section loop
// =============================================================================

/// Progress of the section loop, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Planning,
    Iterating(usize),
    Folding(usize),
    Terminated,
}

impl fmt::Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionState::Planning => write!(f, "planning"),
            SectionState::Iterating(i) => write!(f, "iterating({i})"),
            SectionState::Folding(i) => write!(f, "folding({i})"),
            SectionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-section tensors that vary between iterations
struct SectionCall<'r> {
    frames: usize,
    indices: SectionIndices,
    clean_latents: Tensor,
    clean_latents_2x: Option<Tensor>,
    clean_latents_4x: Option<Tensor>,
    image_embeddings: Option<&'r Tensor>,
    initial_latent: Option<Tensor>,
}

/// Run-wide state shared by every section of one invocation
struct RunContext<'r> {
    invoker: StepInvoker<'r>,
    params: SamplingParams,
    text: &'r TextConditioning,
    rng: Pcg32,
    width: usize,
    height: usize,
    latent_width: usize,
    latent_height: usize,
    dtype: DType,
    device: &'r Device,
}

impl<'r> RunContext<'r> {
    fn new(
        config: &RunConfig,
        prepared: &'r Prepared,
        control: &'r GenerationControl,
        device: &'r Device,
        dtype: DType,
    ) -> Self {
        Self {
            invoker: StepInvoker::new(config.teacache(), control),
            params: SamplingParams::from_config(config),
            text: &prepared.text,
            rng: Pcg32::from_seed(config.seed),
            width: prepared.width * VAE_SPATIAL_COMPRESSION,
            height: prepared.height * VAE_SPATIAL_COMPRESSION,
            latent_width: prepared.width,
            latent_height: prepared.height,
            dtype,
            device,
        }
    }

    fn step(
        &mut self,
        model: &mut dyn FramePackModel,
        sink: &mut dyn ProgressSink,
        call: &SectionCall<'_>,
    ) -> Result<Tensor> {
        debug!(
            clean_latents = ?call.clean_latents.dims(),
            latent_indices = ?call.indices.latent_indices.dims(),
            frames = call.frames,
            "Invoking stepping routine"
        );
        // One noise frame per generated index, drawn in section order
        let active = call.indices.latent_indices.dims2()?.1;
        let noise = self.rng.latent_noise(
            active,
            self.latent_height,
            self.latent_width,
            self.dtype,
            self.device,
        )?;
        let request = SectionRequest {
            params: self.params,
            frames: call.frames,
            width: self.width,
            height: self.height,
            text: self.text,
            image_embeddings: call.image_embeddings,
            indices: &call.indices,
            clean_latents: &call.clean_latents,
            clean_latents_2x: call.clean_latents_2x.as_ref(),
            clean_latents_4x: call.clean_latents_4x.as_ref(),
            initial_latent: call.initial_latent.as_ref(),
            noise: &noise,
            dtype: self.dtype,
            device: self.device,
        };
        let generated = self.invoker.invoke(model, sink, &request)?;
        Ok(generated.to_dtype(DType::F32)?)
    }
}

/// FramePack sampler driving an injected transformer.
///
/// Owns the model for its lifetime; every sampling call leases the compute
/// device for the duration of the run and releases it on all exit paths.
pub struct FramePackSampler<'a> {
    model: Box<dyn FramePackModel + 'a>,
    devices: Box<dyn DeviceManager + 'a>,
    progress: Box<dyn ProgressSink + 'a>,
    control: GenerationControl,
    device: Device,
    dtype: DType,
}

impl<'a> FramePackSampler<'a> {
    pub fn new(
        model: Box<dyn FramePackModel + 'a>,
        devices: Box<dyn DeviceManager + 'a>,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            model,
            devices,
            progress: Box::new(NoProgress),
            control: GenerationControl::new(),
            device,
            dtype,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink + 'a>) -> Self {
        self.progress = progress;
        self
    }

    /// Share a control handle with another thread. Each sampling call resets
    /// it on entry, so cancel only once the run has started.
    pub fn with_control(mut self, control: GenerationControl) -> Self {
        self.control = control;
        self
    }

    /// Handle for cancelling a run in progress
    pub fn control(&self) -> &GenerationControl {
        &self.control
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Sectioned image-to-video sampling.
    ///
    /// Returns the generated latents `[1, 16, T, H, W]` in VAE space, the
    /// start latent first.
    pub fn sample(&mut self, config: &RunConfig, inputs: &SamplerInputs) -> Result<Tensor> {
        config.validate()?;
        let Self {
            model,
            devices,
            progress,
            control,
            device,
            dtype,
        } = self;
        let device = &*device;
        control.reset();

        let prepared = Prepared::new(config, inputs, true, device, *dtype)?;
        let window = config.latent_window_size;
        let num_sections = total_latent_sections(config.total_second_length, window);
        let sections = plan_sections(num_sections, window);
        let max_padding = sections.iter().map(|s| s.padding).max().unwrap_or(0);
        info!(
            num_sections,
            window,
            paddings = ?sections.iter().map(|s| s.padding).collect::<Vec<_>>(),
            state = %SectionState::Planning,
            "Planned sections"
        );

        let mut lease = DeviceLease::acquire(model.as_mut(), devices.as_mut(), config.gpu_memory_preservation)?;
        let mut run = RunContext::new(config, &prepared, control, device, *dtype);
        let mut history = HistoryBuffer::new(
            prepared.height,
            prepared.width,
            num_sections * window + prepared.pre_frames,
            device,
        )?;

        for section in &sections {
            info!(
                section = section.index + 1,
                num_sections,
                padding = section.padding,
                is_first = section.is_first,
                is_last = section.is_last,
                state = %SectionState::Iterating(section.index),
                "Sampling section"
            );
            let image_embeds = prepared.section_embeds(config, section.index, num_sections)?;
            let partition = IndexPartition::build(
                section.padding,
                window,
                PartitionMode::Standard {
                    pre_frames: prepared.pre_frames,
                },
            );
            debug!(partition = ?partition, "Index partition");

            let context = history.context(CLEAN_4X_LEN)?;
            let post = prepared.clean_post(section, context.post);
            let call = SectionCall {
                frames: config.pixel_frames_per_section(),
                indices: partition.to_tensors(device)?,
                clean_latents: Tensor::cat(&[&prepared.start_latent, &post], 2)?,
                clean_latents_2x: Some(context.clean_2x),
                clean_latents_4x: Some(context.clean_4x),
                image_embeddings: image_embeds.as_ref(),
                initial_latent: prepared.initial_window(section, max_padding)?,
            };
            let generated = run.step(lease.model(), progress.as_mut(), &call)?;

            debug!(state = %SectionState::Folding(section.index), "Folding section");
            let generated = if section.is_last {
                Tensor::cat(&[&prepared.start_latent, &generated], 2)?
            } else {
                generated
            };
            history.prepend(&generated)?;

            if section.is_last {
                break;
            }
        }
        drop(lease);

        info!(
            frames = history.valid_len(),
            state = %SectionState::Terminated,
            "Sampling finished"
        );
        finalize(&history.real()?)
    }

    /// Generate a single latent frame.
    ///
    /// With `use_kisekaeichi` and a reference latent the frame is placed at
    /// `target_index` and conditioned on the reference at `history_index`;
    /// otherwise it is the last slot of a window conditioned on the start
    /// latent only.
    pub fn sample_single_frame(
        &mut self,
        config: &RunConfig,
        single: &SingleFrameConfig,
        inputs: &SamplerInputs,
    ) -> Result<Tensor> {
        config.validate()?;
        single.validate()?;
        let Self {
            model,
            devices,
            progress,
            control,
            device,
            dtype,
        } = self;
        let device = &*device;
        control.reset();

        let prepared = Prepared::new(config, inputs, false, device, *dtype)?;
        let window = config.latent_window_size;
        let start_frame = prepared.start_latent.narrow(2, 0, 1)?;

        let reference = match (&inputs.reference_latent, single.use_kisekaeichi) {
            (Some(reference), true) => {
                check_spatial("reference latent", reference, prepared.height, prepared.width)?;
                Some(load_latent(reference, device)?)
            }
            (None, true) => {
                warn!("Kisekaeichi requested without a reference latent, using plain single-frame mode");
                None
            }
            _ => None,
        };

        let (layout, clean_latents, image_embeds) = match reference {
            Some(reference) => {
                let reference_embeds = inputs
                    .reference_image_embeds
                    .as_ref()
                    .ok_or(FramePackError::MissingReferenceEmbeds)?
                    .to_device(device)?
                    .to_dtype(*dtype)?;
                let layout =
                    SingleFrameIndices::reference(window, single.target_index, single.history_index);

                let pre = match &inputs.input_mask {
                    Some(mask) => mask.apply(&start_frame)?,
                    None => start_frame,
                };
                let post = reference.narrow(2, 0, 1)?;
                let post = match &inputs.reference_mask {
                    Some(mask) => mask.apply(&post)?,
                    None => post,
                };
                let embeds = reference_image_embeds(prepared.start_embeds.as_ref(), &reference_embeds)?;
                info!(
                    target_index = single.target_index,
                    history_index = single.history_index,
                    "Single frame with reference image"
                );
                (layout, Tensor::cat(&[&pre, &post], 2)?, Some(embeds))
            }
            None => {
                info!(latent_index = window - 1, "Single frame");
                (
                    SingleFrameIndices::plain(window),
                    start_frame,
                    prepared.start_embeds.clone(),
                )
            }
        };
        debug!(
            latent_indices = ?layout.latent_indices,
            clean_latent_indices = ?layout.clean_latent_indices,
            "Single frame layout"
        );

        let initial_latent = prepared
            .initial_samples
            .as_ref()
            .map(|s| s.narrow(2, 0, 1))
            .transpose()?;

        let mut lease = DeviceLease::acquire(model.as_mut(), devices.as_mut(), config.gpu_memory_preservation)?;
        let mut run = RunContext::new(config, &prepared, control, device, *dtype);
        let call = SectionCall {
            frames: 1,
            indices: layout.to_tensors(device)?,
            clean_latents,
            clean_latents_2x: None,
            clean_latents_4x: None,
            image_embeddings: image_embeds.as_ref(),
            initial_latent,
        };
        let generated = run.step(lease.model(), progress.as_mut(), &call)?;
        drop(lease);

        finalize(&generated)
    }

    /// Generate a loopable clip.
    ///
    /// The main pass samples `total_second_length` with an extra window of
    /// padding and without the start latent in its output. The connective
    /// pass is seeded with the main history and fills the gap between the
    /// clip's end and its beginning. Returns the stitched latents plus the
    /// pixel frames to trim after decoding.
    pub fn sample_loop(&mut self, config: &RunConfig, inputs: &SamplerInputs) -> Result<LoopOutput> {
        config.validate()?;
        let Self {
            model,
            devices,
            progress,
            control,
            device,
            dtype,
        } = self;
        let device = &*device;
        control.reset();

        let prepared = Prepared::new(config, inputs, true, device, *dtype)?;
        let window = config.latent_window_size;
        let main_sections = total_latent_sections(config.total_second_length, window);
        let connection_sections = connection_latent_sections(config.connection_second_length);
        let total_sections = main_sections + connection_sections;
        info!(
            main_sections,
            connection_sections,
            window,
            state = %SectionState::Planning,
            "Planned loop"
        );

        let mut lease = DeviceLease::acquire(model.as_mut(), devices.as_mut(), config.gpu_memory_preservation)?;
        let mut run = RunContext::new(config, &prepared, control, device, *dtype);

        // Main pass
        let sections = plan_sections(main_sections, window);
        let max_padding = sections.iter().map(|s| s.padding).max().unwrap_or(0);
        let mut history = HistoryBuffer::new(prepared.height, prepared.width, main_sections * window, device)?;
        let mut last_embeds = None;
        for section in &sections {
            info!(
                pass = "main",
                section = section.index + 1,
                num_sections = main_sections,
                padding = section.padding,
                state = %SectionState::Iterating(section.index),
                "Sampling section"
            );
            let image_embeds = prepared.section_embeds(config, section.index, main_sections)?;
            let partition = IndexPartition::build(
                section.padding,
                window,
                PartitionMode::LoopMain {
                    pre_frames: prepared.pre_frames,
                },
            );
            debug!(partition = ?partition, "Index partition");

            let context = history.context(CLEAN_4X_LEN)?;
            let post = prepared.clean_post(section, context.post);
            let call = SectionCall {
                frames: config.pixel_frames_per_section(),
                indices: partition.to_tensors(device)?,
                clean_latents: Tensor::cat(&[&prepared.start_latent, &post], 2)?,
                clean_latents_2x: Some(context.clean_2x),
                clean_latents_4x: Some(context.clean_4x),
                image_embeddings: image_embeds.as_ref(),
                initial_latent: prepared.initial_window(section, max_padding)?,
            };
            let generated = run.step(lease.model(), progress.as_mut(), &call)?;
            debug!(state = %SectionState::Folding(section.index), "Folding section");
            history.prepend(&generated)?;
            last_embeds = image_embeds;

            if section.is_last {
                break;
            }
        }
        let main_history = history.real()?;

        // Connective pass
        let clean_4x_len = connective_clean_4x_len(total_sections);
        let context_len = CLEAN_POST_LEN + CLEAN_2X_LEN + clean_4x_len;
        if history.valid_len() < context_len {
            warn!(
                available = history.valid_len(),
                required = context_len,
                "Main history shorter than the connective context, padding with zeros"
            );
        }
        let sections = plan_sections(connection_sections, window);
        let max_padding = sections.iter().map(|s| s.padding).max().unwrap_or(0);
        let mut connection =
            HistoryBuffer::from_frames(&main_history, context_len, connection_sections * window)?;
        for section in &sections {
            info!(
                pass = "connection",
                section = section.index + 1,
                num_sections = connection_sections,
                padding = section.padding,
                state = %SectionState::Iterating(section.index),
                "Sampling section"
            );
            let partition = IndexPartition::build(
                section.padding,
                window,
                PartitionMode::Connective { clean_4x_len },
            );
            debug!(partition = ?partition, "Index partition");

            let pre = connection.oldest_valid()?;
            let context = connection.context(clean_4x_len)?;
            let post = prepared.clean_post(section, context.post);
            let call = SectionCall {
                frames: config.pixel_frames_per_section(),
                indices: partition.to_tensors(device)?,
                clean_latents: Tensor::cat(&[&pre, &post], 2)?,
                clean_latents_2x: Some(context.clean_2x),
                clean_latents_4x: Some(context.clean_4x),
                image_embeddings: last_embeds.as_ref(),
                initial_latent: prepared.initial_window(section, max_padding)?,
            };
            let generated = run.step(lease.model(), progress.as_mut(), &call)?;
            debug!(state = %SectionState::Folding(section.index), "Folding section");
            connection.prepend(&generated)?;

            if section.is_last {
                break;
            }
        }
        drop(lease);

        let looped = assemble_loop(
            &main_history,
            &connection.real()?,
            window,
            total_sections,
            connection_sections,
        )?;
        let trim = LoopTrim::for_window(window);
        info!(
            frames = looped.dims()[2],
            start_frames = trim.start_frames,
            end_frames = trim.end_frames,
            state = %SectionState::Terminated,
            "Loop sampling finished"
        );
        Ok(LoopOutput {
            samples: finalize(&looped)?,
            start_frames: trim.start_frames,
            end_frames: trim.end_frames,
        })
    }
}
