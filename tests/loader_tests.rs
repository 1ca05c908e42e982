//! Tests for transformer checkpoint loading
//!
//! Tests cover:
//! - Checkpoint file resolution (single file, sharded index, directory scan)
//! - Weight precision detection
//! - Per-parameter dtype plans
//! - LoRA fusing (diffusers and kohya keys) and unfused adapters
//! - Rejection of fusing into fp8 checkpoints

use candle_core::{DType, Device};
use candle_framepack::error::FramePackError;
use candle_framepack::loader::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const TO_K: &str = "single_transformer_blocks.0.attn.to_k.weight";
const NORM: &str = "single_transformer_blocks.0.norm.linear.bias";

// =============================================================================
// Test Data Setup Helpers
// =============================================================================

/// Writes a safetensors file of f32 tensors
fn create_test_safetensors(path: &Path, tensors: &[(&str, Vec<f32>, Vec<usize>)]) {
    use safetensors::serialize;
    use safetensors::tensor::TensorView;

    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .map(|(name, data, shape)| {
            let bytes = bytemuck::cast_slice(data);
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap();
            (name.to_string(), view)
        })
        .collect();

    let data = serialize(views, None).unwrap();
    fs::write(path, data).unwrap();
}

/// Writes a single-tensor file with raw bytes of the given storage dtype
fn create_raw_safetensors(path: &Path, name: &str, dtype: safetensors::Dtype, shape: Vec<usize>, bytes: &[u8]) {
    use safetensors::tensor::TensorView;

    let view = TensorView::new(dtype, shape, bytes).unwrap();
    let data = safetensors::serialize(vec![(name.to_string(), view)], None).unwrap();
    fs::write(path, data).unwrap();
}

/// Minimal transformer checkpoint: one zero linear weight and one norm bias
fn create_checkpoint(dir: &Path) {
    create_test_safetensors(
        &dir.join("diffusion_pytorch_model.safetensors"),
        &[(TO_K, vec![0.0; 12], vec![4, 3]), (NORM, vec![0.5; 4], vec![4])],
    );
}

fn fp32_loader() -> TransformerLoader {
    let config = ModelLoadConfig {
        base_precision: BasePrecision::Fp32,
        ..ModelLoadConfig::default()
    };
    TransformerLoader::new(config, Device::Cpu)
}

fn values(loaded: &LoadedTransformer, name: &str) -> Vec<f32> {
    loaded.weights[name]
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

// =============================================================================
// Checkpoint Resolution Tests
// =============================================================================

#[test]
fn test_resolve_single_file_in_directory() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());

    let files = resolve_checkpoint_files(dir.path()).unwrap();
    assert_eq!(files, vec![dir.path().join("diffusion_pytorch_model.safetensors")]);

    // A file path resolves to itself
    let files = resolve_checkpoint_files(&files[0]).unwrap();
    assert_eq!(files.len(), 1);
}

#[test]
fn test_resolve_sharded_index() {
    let dir = tempdir().unwrap();
    create_test_safetensors(
        &dir.path().join("diffusion_pytorch_model-00002-of-00002.safetensors"),
        &[(NORM, vec![0.0; 4], vec![4])],
    );
    create_test_safetensors(
        &dir.path().join("diffusion_pytorch_model-00001-of-00002.safetensors"),
        &[(TO_K, vec![0.0; 12], vec![4, 3])],
    );
    let weight_map: HashMap<&str, &str> = HashMap::from([
        (TO_K, "diffusion_pytorch_model-00001-of-00002.safetensors"),
        (NORM, "diffusion_pytorch_model-00002-of-00002.safetensors"),
    ]);
    let index = serde_json::json!({ "metadata": { "total_size": 64 }, "weight_map": weight_map });
    fs::write(
        dir.path().join("diffusion_pytorch_model.safetensors.index.json"),
        serde_json::to_string_pretty(&index).unwrap(),
    )
    .unwrap();

    let files = resolve_checkpoint_files(dir.path()).unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("diffusion_pytorch_model-00001-of-00002.safetensors"));

    let loaded = fp32_loader().load(dir.path(), &LoraStack::new()).unwrap();
    assert_eq!(loaded.weights.len(), 2);
}

#[test]
fn test_resolve_missing_shard() {
    let dir = tempdir().unwrap();
    let index = serde_json::json!({ "weight_map": { TO_K: "missing.safetensors" } });
    fs::write(
        dir.path().join("model.safetensors.index.json"),
        serde_json::to_string(&index).unwrap(),
    )
    .unwrap();

    let result = resolve_checkpoint_files(dir.path());
    assert!(matches!(result, Err(LoaderError::MissingShards { missing }) if missing == vec!["missing.safetensors"]));
}

#[test]
fn test_resolve_scans_directory() {
    let dir = tempdir().unwrap();
    create_test_safetensors(&dir.path().join("b.safetensors"), &[(NORM, vec![0.0; 4], vec![4])]);
    create_test_safetensors(&dir.path().join("a.safetensors"), &[(TO_K, vec![0.0; 12], vec![4, 3])]);
    fs::write(dir.path().join("notes.txt"), "not a checkpoint").unwrap();

    let files = resolve_checkpoint_files(dir.path()).unwrap();
    assert_eq!(files, vec![dir.path().join("a.safetensors"), dir.path().join("b.safetensors")]);
}

#[test]
fn test_resolve_empty_directory() {
    let dir = tempdir().unwrap();
    let result = resolve_checkpoint_files(dir.path());
    assert!(matches!(result, Err(LoaderError::NoSafetensorsFound { .. })));
}

// =============================================================================
// Precision Tests
// =============================================================================

#[test]
fn test_detect_precision() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let files = resolve_checkpoint_files(dir.path()).unwrap();
    assert_eq!(detect_weight_precision(&files).unwrap(), WeightPrecision::F32);

    let fp8 = dir.path().join("fp8.safetensors");
    create_raw_safetensors(&fp8, TO_K, safetensors::Dtype::F8_E4M3, vec![4, 3], &[0u8; 12]);
    assert_eq!(detect_weight_precision(&[fp8]).unwrap(), WeightPrecision::F8E4M3);
}

#[test]
fn test_detect_precision_without_reference_weight() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("other.safetensors");
    create_test_safetensors(&path, &[(NORM, vec![0.0; 4], vec![4])]);

    let result = detect_weight_precision(&[path]);
    assert!(matches!(result, Err(LoaderError::MissingTensors { .. })));
}

#[test]
fn test_quantized_plan_keeps_sensitive_params() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let config = ModelLoadConfig {
        base_precision: BasePrecision::Bf16,
        quantization: Quantization::Fp8E4m3fn,
        load_device: LoadDevice::MainDevice,
    };

    let loaded = TransformerLoader::new(config, Device::Cpu)
        .load(dir.path(), &LoraStack::new())
        .unwrap();

    assert_eq!(loaded.checkpoint_precision, WeightPrecision::F32);
    assert_eq!(loaded.weights[TO_K].dtype(), DType::BF16);
    assert_eq!(loaded.weights[NORM].dtype(), DType::BF16);
    assert_eq!(loaded.quantize_targets(), vec![TO_K]);

    let vb = loaded.var_builder();
    assert_eq!(vb.get((4, 3), TO_K).unwrap().dims(), &[4, 3]);
}

#[test]
fn test_unquantized_plan_casts_everything() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let config = ModelLoadConfig {
        base_precision: BasePrecision::Fp16,
        ..ModelLoadConfig::default()
    };

    let loaded = TransformerLoader::new(config, Device::Cpu)
        .load(dir.path(), &LoraStack::new())
        .unwrap();
    assert!(loaded.weights.values().all(|t| t.dtype() == DType::F16));
    assert!(loaded.quantize_targets().is_empty());
}

// =============================================================================
// LoRA Tests
// =============================================================================

#[test]
fn test_fuse_diffusers_lora() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let lora_path = dir.path().join("style.safetensors");
    create_test_safetensors(
        &lora_path,
        &[
            ("transformer.single_transformer_blocks.0.attn.to_k.lora_A.weight", vec![1.0; 6], vec![2, 3]),
            ("transformer.single_transformer_blocks.0.attn.to_k.lora_B.weight", vec![1.0; 8], vec![4, 2]),
        ],
    );

    // up @ down = 2 everywhere, alpha defaults to the rank
    let loras = LoraStack::new().with(LoraSpec::new(&lora_path, 0.5));
    let loaded = fp32_loader().load(dir.path(), &loras).unwrap();

    assert!(values(&loaded, TO_K).iter().all(|v| (v - 1.0).abs() < 1e-6));
    assert_eq!(values(&loaded, NORM), vec![0.5; 4]);
    assert!(loaded.adapters.is_empty());
}

#[test]
fn test_fuse_kohya_lora_with_alpha() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let lora_path = dir.path().join("kohya.safetensors");
    create_test_safetensors(
        &lora_path,
        &[
            ("lora_unet_single_transformer_blocks_0_attn_to_k.lora_down.weight", vec![1.0; 6], vec![2, 3]),
            ("lora_unet_single_transformer_blocks_0_attn_to_k.lora_up.weight", vec![1.0; 8], vec![4, 2]),
            ("lora_unet_single_transformer_blocks_0_attn_to_k.alpha", vec![1.0], vec![]),
        ],
    );

    // strength 1 * alpha 1 / rank 2 * 2
    let loras = LoraStack::new().with(LoraSpec::new(&lora_path, 1.0));
    let loaded = fp32_loader().load(dir.path(), &loras).unwrap();
    assert!(values(&loaded, TO_K).iter().all(|v| (v - 1.0).abs() < 1e-6));
}

#[test]
fn test_unfused_lora_becomes_adapter() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let lora_path = dir.path().join("motion.safetensors");
    create_test_safetensors(
        &lora_path,
        &[
            ("transformer.single_transformer_blocks.0.attn.to_k.lora_A.weight", vec![1.0; 6], vec![2, 3]),
            ("transformer.single_transformer_blocks.0.attn.to_k.lora_B.weight", vec![1.0; 8], vec![4, 2]),
        ],
    );

    let loras = LoraStack::new().with(LoraSpec::new(&lora_path, 1.0).with_fuse(false));
    let loaded = fp32_loader().load(dir.path(), &loras).unwrap();

    assert_eq!(values(&loaded, TO_K), vec![0.0; 12]);
    assert_eq!(loaded.adapters.len(), 1);
    let adapter = &loaded.adapters[0];
    assert_eq!(adapter.name, "motion");
    assert_eq!(adapter.rank, 2);
    assert!(adapter.pairs.contains_key(TO_K));
}

#[test]
fn test_lora_without_matching_layers() {
    let dir = tempdir().unwrap();
    create_checkpoint(dir.path());
    let lora_path = dir.path().join("other_model.safetensors");
    create_test_safetensors(
        &lora_path,
        &[
            ("transformer.unknown.proj.lora_A.weight", vec![1.0; 6], vec![2, 3]),
            ("transformer.unknown.proj.lora_B.weight", vec![1.0; 8], vec![4, 2]),
        ],
    );

    let loras = LoraStack::new().with(LoraSpec::new(&lora_path, 1.0));
    let result = fp32_loader().load(dir.path(), &loras);
    assert!(matches!(result, Err(FramePackError::Loader(LoaderError::EmptyLora { .. }))));
}

#[test]
fn test_fuse_into_fp8_checkpoint_rejected() {
    let dir = tempdir().unwrap();
    create_raw_safetensors(
        &dir.path().join("diffusion_pytorch_model.safetensors"),
        TO_K,
        safetensors::Dtype::F8_E4M3,
        vec![4, 3],
        &[0u8; 12],
    );

    let loras = LoraStack::new().with(LoraSpec::new(dir.path().join("style.safetensors"), 1.0));
    let result = fp32_loader().load(dir.path(), &loras);
    assert!(matches!(
        result,
        Err(FramePackError::IncompatibleFusePrecision { precision }) if precision == "fp8_e4m3fn"
    ));
}
