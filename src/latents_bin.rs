//! Binary tensor files with a u64 dims header.
//!
//! Format (little-endian):
//! - ndims: u64
//! - dims: ndims * u64
//! - data: f32 * product(dims)
//!
//! Used by the CLI to pass latents and decoded frames between runs.

use candle_core::{DType, Device, Tensor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::LATENT_CHANNELS;
use crate::error::{FramePackError, Result};

pub fn read_f32_tensor(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let mut file = BufReader::new(File::open(path).map_err(candle_core::Error::from)?);
    let mut read = |buf: &mut [u8]| file.read_exact(buf).map_err(candle_core::Error::from);

    let mut u64_buf = [0u8; 8];
    read(&mut u64_buf)?;
    let ndims = u64::from_le_bytes(u64_buf) as usize;

    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        read(&mut u64_buf)?;
        dims.push(u64::from_le_bytes(u64_buf) as usize);
    }

    let numel: usize = dims.iter().product();
    let mut data_bytes = vec![0u8; numel * 4];
    read(&mut data_bytes)?;

    let data: Vec<f32> = data_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Tensor::from_vec(data, dims.as_slice(), device)?)
}

pub fn write_f32_tensor(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let mut file = BufWriter::new(File::create(path).map_err(candle_core::Error::from)?);
    let mut bytes = Vec::with_capacity(8 * (tensor.rank() + 1) + 4 * tensor.elem_count());

    bytes.extend_from_slice(&(tensor.rank() as u64).to_le_bytes());
    for d in tensor.dims() {
        bytes.extend_from_slice(&(*d as u64).to_le_bytes());
    }
    let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    file.write_all(&bytes)
        .and_then(|_| file.flush())
        .map_err(candle_core::Error::from)?;
    Ok(())
}

fn check_latents(latents: &Tensor) -> Result<()> {
    match latents.dims() {
        [_, c, _, _, _] if *c == LATENT_CHANNELS => Ok(()),
        dims => Err(FramePackError::shape(
            "latent file",
            &[1, LATENT_CHANNELS, 0, 0, 0],
            dims,
        )),
    }
}

/// Read a `[B, 16, T, H, W]` latent tensor
pub fn read_latents(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let latents = read_f32_tensor(path, device)?;
    check_latents(&latents)?;
    Ok(latents)
}

/// Write a `[B, 16, T, H, W]` latent tensor as f32
pub fn write_latents(path: impl AsRef<Path>, latents: &Tensor) -> Result<()> {
    check_latents(latents)?;
    write_f32_tensor(path, latents)
}
