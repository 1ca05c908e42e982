//! Transformer checkpoint loading
//!
//! Loads a FramePack (HunyuanVideo packed) transformer checkpoint from
//! safetensors, with support for:
//!
//! - Single file or sharded directory checkpoints (`*.safetensors.index.json`)
//! - Per-parameter dtype plans (precision-sensitive parameters stay in the
//!   base precision when the rest is quantized)
//! - Checkpoint weight precision detection
//! - LoRA stacks, fused into the weights or returned as adapters
//! - Hub download of diffusers snapshots

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::FramePackError;

/// Parameter whose storage dtype reveals the checkpoint precision
pub const PRECISION_PROBE_KEY: &str = "single_transformer_blocks.0.attn.to_k.weight";

/// Name fragments of parameters that are never quantized
pub const PARAMS_TO_KEEP: [&str; 7] = [
    "norm",
    "bias",
    "time_in",
    "vector_in",
    "guidance_in",
    "txt_in",
    "img_in",
];

/// Default hub repository of the image-to-video transformer
pub const DEFAULT_REPO_ID: &str = "lllyasviel/FramePackI2V_HY";

const INDEX_FILES: [&str; 2] = [
    "diffusion_pytorch_model.safetensors.index.json",
    "model.safetensors.index.json",
];
const SINGLE_FILES: [&str; 2] = ["diffusion_pytorch_model.safetensors", "model.safetensors"];

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during weight loading
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON index: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing shard files: {missing:?}")]
    MissingShards { missing: Vec<String> },

    #[error("No safetensors files found in directory: {path}")]
    NoSafetensorsFound { path: String },

    #[error("Missing required tensors: {missing:?}")]
    MissingTensors { missing: Vec<String> },

    #[error("LoRA {name} contains no usable weight pairs")]
    EmptyLora { name: String },

    #[error("Unknown {kind} option: {value}")]
    UnknownOption { kind: &'static str, value: String },

    #[error("Hub download failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

type LoaderResult<T> = std::result::Result<T, LoaderError>;

// =============================================================================
// Precision Options
// =============================================================================

/// Working precision of the transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasePrecision {
    Fp32,
    #[default]
    Bf16,
    Fp16,
}

impl BasePrecision {
    pub fn dtype(&self) -> DType {
        match self {
            BasePrecision::Fp32 => DType::F32,
            BasePrecision::Bf16 => DType::BF16,
            BasePrecision::Fp16 => DType::F16,
        }
    }
}

impl std::str::FromStr for BasePrecision {
    type Err = LoaderError;

    fn from_str(s: &str) -> LoaderResult<Self> {
        match s {
            "fp32" => Ok(BasePrecision::Fp32),
            "bf16" => Ok(BasePrecision::Bf16),
            "fp16" => Ok(BasePrecision::Fp16),
            _ => Err(LoaderError::UnknownOption {
                kind: "base precision",
                value: s.to_string(),
            }),
        }
    }
}

/// Storage quantization of the transformer weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    #[default]
    Disabled,
    Fp8E4m3fn,
    /// fp8 storage with fp8 linear kernels
    Fp8E4m3fnFast,
    Fp8E5m2,
}

impl Quantization {
    /// Storage precision of quantizable parameters
    pub fn storage(&self, base: BasePrecision) -> WeightPrecision {
        match self {
            Quantization::Disabled => WeightPrecision::from_dtype(base.dtype()),
            Quantization::Fp8E4m3fn | Quantization::Fp8E4m3fnFast => WeightPrecision::F8E4M3,
            Quantization::Fp8E5m2 => WeightPrecision::F8E5M2,
        }
    }

    pub fn is_fp8(&self) -> bool {
        !matches!(self, Quantization::Disabled)
    }
}

impl std::str::FromStr for Quantization {
    type Err = LoaderError;

    fn from_str(s: &str) -> LoaderResult<Self> {
        match s {
            "disabled" => Ok(Quantization::Disabled),
            "fp8_e4m3fn" => Ok(Quantization::Fp8E4m3fn),
            "fp8_e4m3fn_fast" => Ok(Quantization::Fp8E4m3fnFast),
            "fp8_e5m2" => Ok(Quantization::Fp8E5m2),
            _ => Err(LoaderError::UnknownOption {
                kind: "quantization",
                value: s.to_string(),
            }),
        }
    }
}

/// Where the weights are materialized at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadDevice {
    #[default]
    MainDevice,
    OffloadDevice,
}

/// Precision of stored weights, including fp8 formats candle does not compute in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WeightPrecision {
    F32,
    Bf16,
    F16,
    F8E4M3,
    F8E5M2,
    Other,
}

impl WeightPrecision {
    pub fn from_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F32 => WeightPrecision::F32,
            DType::BF16 => WeightPrecision::Bf16,
            DType::F16 => WeightPrecision::F16,
            _ => WeightPrecision::Other,
        }
    }

    pub fn from_safetensors(dtype: safetensors::Dtype) -> Self {
        match dtype {
            safetensors::Dtype::F32 => WeightPrecision::F32,
            safetensors::Dtype::BF16 => WeightPrecision::Bf16,
            safetensors::Dtype::F16 => WeightPrecision::F16,
            safetensors::Dtype::F8_E4M3 => WeightPrecision::F8E4M3,
            safetensors::Dtype::F8_E5M2 => WeightPrecision::F8E5M2,
            _ => WeightPrecision::Other,
        }
    }

    /// Candle dtype for precisions candle computes in
    pub fn dtype(&self) -> Option<DType> {
        match self {
            WeightPrecision::F32 => Some(DType::F32),
            WeightPrecision::Bf16 => Some(DType::BF16),
            WeightPrecision::F16 => Some(DType::F16),
            _ => None,
        }
    }

    /// LoRA deltas can only be fused into full or half precision weights
    pub fn supports_fusing(&self) -> bool {
        self.dtype().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            WeightPrecision::F32 => "fp32",
            WeightPrecision::Bf16 => "bf16",
            WeightPrecision::F16 => "fp16",
            WeightPrecision::F8E4M3 => "fp8_e4m3fn",
            WeightPrecision::F8E5M2 => "fp8_e5m2",
            WeightPrecision::Other => "unknown",
        }
    }
}

/// Whether a parameter stays in base precision regardless of quantization
pub fn keeps_base_precision(name: &str) -> bool {
    PARAMS_TO_KEEP.iter().any(|keyword| name.contains(keyword))
}

/// Per-parameter storage precision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDtypePlan {
    pub base: BasePrecision,
    pub storage: WeightPrecision,
}

impl ParamDtypePlan {
    pub fn new(base: BasePrecision, quantization: Quantization) -> Self {
        Self {
            base,
            storage: quantization.storage(base),
        }
    }

    pub fn precision_for(&self, name: &str) -> WeightPrecision {
        if keeps_base_precision(name) || name.contains("lora") {
            WeightPrecision::from_dtype(self.base.dtype())
        } else {
            self.storage
        }
    }

    /// Dtype a parameter is materialized in.
    ///
    /// fp8 storage has no candle dtype; those parameters stay in base
    /// precision and are reported by [`LoadedTransformer::quantize_targets`].
    pub fn load_dtype(&self, name: &str) -> DType {
        self.precision_for(name).dtype().unwrap_or(self.base.dtype())
    }
}

// =============================================================================
// Safetensors Index
// =============================================================================

/// Parsed contents of a `*.safetensors.index.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetensorsIndex {
    /// Maps tensor names to their shard file names
    pub weight_map: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SafetensorsIndex {
    pub fn load(path: impl AsRef<Path>) -> LoaderResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Unique shard files, sorted
    pub fn shard_files(&self) -> Vec<String> {
        let files: HashSet<_> = self.weight_map.values().collect();
        let mut result: Vec<_> = files.into_iter().cloned().collect();
        result.sort();
        result
    }
}

/// Resolve a checkpoint path to its safetensors files.
///
/// Files are returned as is. Directories are searched for an index json, then
/// a single well-known file, then any `.safetensors` files in name order.
pub fn resolve_checkpoint_files(path: impl AsRef<Path>) -> LoaderResult<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    for index_name in INDEX_FILES {
        let index_path = path.join(index_name);
        if index_path.exists() {
            let index = SafetensorsIndex::load(&index_path)?;
            let (found, missing): (Vec<_>, Vec<_>) = index
                .shard_files()
                .into_iter()
                .partition(|shard| path.join(shard).exists());
            if !missing.is_empty() {
                return Err(LoaderError::MissingShards { missing });
            }
            return Ok(found.into_iter().map(|shard| path.join(shard)).collect());
        }
    }

    for single in SINGLE_FILES {
        let single_path = path.join(single);
        if single_path.exists() {
            return Ok(vec![single_path]);
        }
    }

    let entries = std::fs::read_dir(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    if files.is_empty() {
        return Err(LoaderError::NoSafetensorsFound {
            path: path.display().to_string(),
        });
    }
    files.sort();
    Ok(files)
}

/// Storage precision of the checkpoint, read from [`PRECISION_PROBE_KEY`]
pub fn detect_weight_precision(files: &[PathBuf]) -> LoaderResult<WeightPrecision> {
    let st = unsafe { MmapedSafetensors::multi(files)? };
    let view = st
        .get(PRECISION_PROBE_KEY)
        .map_err(|_| LoaderError::MissingTensors {
            missing: vec![PRECISION_PROBE_KEY.to_string()],
        })?;
    Ok(WeightPrecision::from_safetensors(view.dtype()))
}

// =============================================================================
// LoRA
// =============================================================================

/// One LoRA selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    pub path: PathBuf,
    pub strength: f64,
    pub name: String,
    pub fuse: bool,
}

impl LoraSpec {
    /// Select a LoRA file; the name is the file stem up to the first dot
    pub fn new(path: impl Into<PathBuf>, strength: f64) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or_default()
            .to_string();
        Self {
            path,
            strength,
            name,
            fuse: true,
        }
    }

    pub fn with_fuse(mut self, fuse: bool) -> Self {
        self.fuse = fuse;
        self
    }
}

/// Ordered list of LoRA selections, built by chaining
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoraStack {
    pub loras: Vec<LoraSpec>,
}

impl LoraStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a selection after everything chained so far
    pub fn with(mut self, lora: LoraSpec) -> Self {
        self.loras.push(lora);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.loras.is_empty()
    }

    pub fn len(&self) -> usize {
        self.loras.len()
    }
}

/// Key layout of a LoRA file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraFormat {
    /// `transformer.<module>.lora_A.weight` / `lora_B.weight`
    Diffusers,
    /// `lora_unet_<module_with_underscores>.lora_down.weight` / `lora_up.weight`
    Kohya,
}

impl LoraFormat {
    pub fn detect<'n>(names: impl IntoIterator<Item = &'n str>) -> Self {
        if names.into_iter().any(|k| k.starts_with("lora_unet_")) {
            LoraFormat::Kohya
        } else {
            LoraFormat::Diffusers
        }
    }
}

/// Low-rank pair for one linear weight
#[derive(Debug, Clone)]
pub struct LoraPair {
    /// `[rank, in_features]`
    pub down: Tensor,
    /// `[out_features, rank]`
    pub up: Tensor,
    pub alpha: Option<f64>,
}

impl LoraPair {
    pub fn rank(&self) -> usize {
        self.up.dims().get(1).copied().unwrap_or(0)
    }

    /// `strength * (alpha / rank) * up @ down` in f32
    pub fn delta(&self, strength: f64) -> candle_core::Result<Tensor> {
        let rank = self.rank().max(1) as f64;
        let scale = strength * self.alpha.unwrap_or(rank) / rank;
        let up = self.up.to_dtype(DType::F32)?;
        let down = self.down.to_dtype(DType::F32)?;
        up.matmul(&down)?.affine(scale, 0.0)
    }
}

/// Parsed LoRA keyed by the checkpoint parameter it modifies
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub name: String,
    pub strength: f64,
    pub rank: usize,
    pub pairs: HashMap<String, LoraPair>,
}

impl LoraAdapter {
    /// Parse LoRA tensors against the checkpoint's parameter names
    pub fn from_tensors(
        spec: &LoraSpec,
        tensors: HashMap<String, Tensor>,
        base_names: &HashSet<String>,
    ) -> LoaderResult<Self> {
        let format = LoraFormat::detect(tensors.keys().map(String::as_str));
        let (down_suffix, up_suffix) = match format {
            LoraFormat::Diffusers => (".lora_A.weight", ".lora_B.weight"),
            LoraFormat::Kohya => (".lora_down.weight", ".lora_up.weight"),
        };
        // Kohya flattens module paths with underscores; map them back through the checkpoint
        let kohya_targets: HashMap<String, &String> = match format {
            LoraFormat::Kohya => base_names
                .iter()
                .filter_map(|name| {
                    let module = name.strip_suffix(".weight")?;
                    Some((format!("lora_unet_{}", module.replace('.', "_")), name))
                })
                .collect(),
            LoraFormat::Diffusers => HashMap::new(),
        };

        let mut pairs = HashMap::new();
        let mut rank = None;
        for (key, down) in &tensors {
            let Some(module) = key.strip_suffix(down_suffix) else {
                continue;
            };
            let Some(up) = tensors.get(&format!("{module}{up_suffix}")) else {
                warn!(lora = %spec.name, key = %key, "LoRA down weight without a matching up weight");
                continue;
            };
            let target = match format {
                LoraFormat::Kohya => kohya_targets.get(module).map(|name| (*name).clone()),
                LoraFormat::Diffusers => {
                    let module = module
                        .strip_prefix("transformer.")
                        .or_else(|| module.strip_prefix("diffusion_model."))
                        .unwrap_or(module);
                    Some(format!("{module}.weight"))
                }
            };
            let Some(target) = target.filter(|t| base_names.contains(t)) else {
                debug!(lora = %spec.name, key = %key, "Skipping LoRA weight with no target parameter");
                continue;
            };
            let alpha = tensors
                .get(&format!("{module}.alpha"))
                .map(|a| -> candle_core::Result<f64> {
                    a.to_dtype(DType::F64)?.flatten_all()?.get(0)?.to_scalar::<f64>()
                })
                .transpose()?;
            let pair = LoraPair {
                down: down.clone(),
                up: up.clone(),
                alpha,
            };
            rank.get_or_insert(pair.rank());
            pairs.insert(target, pair);
        }

        let Some(rank) = rank else {
            return Err(LoaderError::EmptyLora {
                name: spec.name.clone(),
            });
        };
        info!(
            lora = %spec.name,
            rank,
            strength = spec.strength,
            layers = pairs.len(),
            "Parsed LoRA"
        );
        Ok(Self {
            name: spec.name.clone(),
            strength: spec.strength,
            rank,
            pairs,
        })
    }

    /// Add this adapter's deltas into `weights` in place
    pub fn fuse_into(&self, weights: &mut HashMap<String, Tensor>) -> candle_core::Result<usize> {
        let mut fused = 0;
        for (target, pair) in &self.pairs {
            let Some(weight) = weights.get_mut(target) else {
                continue;
            };
            let dtype = weight.dtype();
            let delta = pair.delta(self.strength)?.to_device(weight.device())?;
            *weight = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?;
            fused += 1;
        }
        Ok(fused)
    }
}

// =============================================================================
// Transformer Loader
// =============================================================================

/// Options of the transformer loader
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLoadConfig {
    pub base_precision: BasePrecision,
    pub quantization: Quantization,
    pub load_device: LoadDevice,
}

/// Loaded transformer weights
#[derive(Debug)]
pub struct LoadedTransformer {
    pub weights: HashMap<String, Tensor>,
    pub plan: ParamDtypePlan,
    /// Storage precision of the checkpoint on disk
    pub checkpoint_precision: WeightPrecision,
    /// LoRAs selected without fusing
    pub adapters: Vec<LoraAdapter>,
    pub device: Device,
}

impl LoadedTransformer {
    pub fn dtype(&self) -> DType {
        self.plan.base.dtype()
    }

    /// Parameters the model should store in fp8
    pub fn quantize_targets(&self) -> Vec<&str> {
        if self.plan.storage.dtype().is_some() {
            return Vec::new();
        }
        let mut names: Vec<&str> = self
            .weights
            .keys()
            .map(String::as_str)
            .filter(|name| self.plan.precision_for(name) == self.plan.storage)
            .collect();
        names.sort_unstable();
        names
    }

    /// VarBuilder over the loaded weights
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.weights.clone(), self.dtype(), &self.device)
    }
}

/// Loads transformer checkpoints according to a [`ModelLoadConfig`]
pub struct TransformerLoader {
    config: ModelLoadConfig,
    main_device: Device,
    offload_device: Device,
}

impl TransformerLoader {
    pub fn new(config: ModelLoadConfig, main_device: Device) -> Self {
        Self {
            config,
            main_device,
            offload_device: Device::Cpu,
        }
    }

    pub fn with_offload_device(mut self, device: Device) -> Self {
        self.offload_device = device;
        self
    }

    pub fn config(&self) -> &ModelLoadConfig {
        &self.config
    }

    fn load_device(&self) -> &Device {
        match self.config.load_device {
            LoadDevice::MainDevice => &self.main_device,
            LoadDevice::OffloadDevice => &self.offload_device,
        }
    }

    /// Load a checkpoint file or directory and apply `loras`.
    ///
    /// With LoRAs every parameter is loaded in base precision first; fused
    /// deltas are added and quantizable parameters are cast to the storage
    /// precision afterwards.
    pub fn load(&self, path: impl AsRef<Path>, loras: &LoraStack) -> crate::error::Result<LoadedTransformer> {
        let files = resolve_checkpoint_files(path.as_ref())?;
        let checkpoint_precision = detect_weight_precision(&files)?;
        let plan = ParamDtypePlan::new(self.config.base_precision, self.config.quantization);
        let device = self.load_device().clone();
        info!(
            files = files.len(),
            checkpoint = checkpoint_precision.name(),
            base = ?plan.base,
            storage = plan.storage.name(),
            "Loading transformer"
        );

        if loras.loras.iter().any(|l| l.fuse) && !checkpoint_precision.supports_fusing() {
            return Err(FramePackError::IncompatibleFusePrecision {
                precision: checkpoint_precision.name().to_string(),
            });
        }

        let st = unsafe { MmapedSafetensors::multi(&files).map_err(LoaderError::from)? };
        let base_dtype = plan.base.dtype();
        let mut weights = HashMap::new();
        for (name, _) in st.tensors() {
            let dtype = if loras.is_empty() {
                plan.load_dtype(&name)
            } else {
                base_dtype
            };
            let tensor = st
                .load(&name, &device)
                .and_then(|t| t.to_dtype(dtype))
                .map_err(LoaderError::from)?;
            weights.insert(name, tensor);
        }
        debug!(parameters = weights.len(), "Checkpoint tensors loaded");

        let mut adapters = Vec::new();
        if !loras.is_empty() {
            let base_names: HashSet<String> = weights.keys().cloned().collect();
            for spec in &loras.loras {
                let tensors = candle_core::safetensors::load(&spec.path, &device).map_err(LoaderError::from)?;
                let adapter = LoraAdapter::from_tensors(spec, tensors, &base_names)?;
                if spec.fuse {
                    let fused = adapter.fuse_into(&mut weights).map_err(LoaderError::from)?;
                    info!(lora = %spec.name, fused, "Fused LoRA");
                } else {
                    adapters.push(adapter);
                }
            }
            for (name, tensor) in weights.iter_mut() {
                let dtype = plan.load_dtype(name);
                if tensor.dtype() != dtype {
                    *tensor = tensor.to_dtype(dtype).map_err(LoaderError::from)?;
                }
            }
        }

        Ok(LoadedTransformer {
            weights,
            plan,
            checkpoint_precision,
            adapters,
            device,
        })
    }
}

/// Download a diffusers snapshot of the transformer from the hub.
///
/// Fetches the shard index when present and every shard it names, otherwise
/// the single weight file. Returns the local snapshot directory.
pub fn download_transformer(repo_id: &str) -> LoaderResult<PathBuf> {
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.repo(hf_hub::Repo::model(repo_id.to_string()));
    info!(repo = repo_id, "Downloading transformer snapshot");

    let config = repo.get("config.json")?;
    match repo.get(INDEX_FILES[0]) {
        Ok(index_path) => {
            let index = SafetensorsIndex::load(&index_path)?;
            for shard in index.shard_files() {
                debug!(shard = %shard, "Fetching shard");
                repo.get(&shard)?;
            }
        }
        Err(err) => {
            debug!(error = %err, "No shard index, fetching single weight file");
            repo.get(SINGLE_FILES[0])?;
        }
    }

    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| LoaderError::NoSafetensorsFound {
            path: config.display().to_string(),
        })
}
