//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tch::{Device, Kind, Tensor, nn};

use crate::ErrPack;
use crate::config::ModelConfig;
use crate::error::{ModelError, checkpoint_error};

//--------------------------------------------------------------------------------------------------

const META_HPARAMS: &str = "hparams";
const META_NAME: &str = "name";
const META_EPOCH: &str = "epoch";
const META_GLOBAL_STEP: &str = "global_step";
const META_BEST_METRIC: &str = "best_metric";
const META_BAD_EPOCHS: &str = "bad_epochs";

/// What a checkpoint records besides the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
	pub config: ModelConfig,
	pub name: String,
	/// Number of completed epochs.
	pub epoch: usize,
	pub global_step: u64,
	/// Best monitored loss so far, if any epoch was scored.
	pub best_metric: Option<f64>,
	/// Epochs since the last improvement of `best_metric`.
	pub bad_epochs: usize,
}

impl CheckpointMeta {
	fn to_map(&self) -> Result<HashMap<String, String>, ErrPack<ModelError>> {
		let mut map = HashMap::new();
		map.insert(META_HPARAMS.to_string(), self.config.to_toml()?);
		map.insert(META_NAME.to_string(), self.name.clone());
		map.insert(META_EPOCH.to_string(), self.epoch.to_string());
		map.insert(META_GLOBAL_STEP.to_string(), self.global_step.to_string());
		if let Some(best) = self.best_metric {
			map.insert(META_BEST_METRIC.to_string(), best.to_string());
		}
		map.insert(META_BAD_EPOCHS.to_string(), self.bad_epochs.to_string());
		Ok(map)
	}

	fn from_map(map: &HashMap<String, String>) -> Result<Self, ErrPack<ModelError>> {
		let get = |key: &str| {
			map.get(key)
				.ok_or_else(|| checkpoint_error(format!("checkpoint metadata has no `{key}`")))
		};
		let parse_num = |key: &str| -> Result<u64, ErrPack<ModelError>> {
			get(key)?.parse::<u64>().map_err(|_| {
				checkpoint_error(format!("checkpoint metadata `{key}` is not a number"))
			})
		};
		let best_metric = match map.get(META_BEST_METRIC) {
			Some(value) => Some(value.parse::<f64>().map_err(|_| {
				checkpoint_error(format!("checkpoint metadata `{META_BEST_METRIC}` is not a number"))
			})?),
			None => None,
		};
		// older checkpoints carry no early-stopping state
		let bad_epochs = if map.contains_key(META_BAD_EPOCHS) { parse_num(META_BAD_EPOCHS)? } else { 0 };
		Ok(Self {
			config: ModelConfig::from_toml(get(META_HPARAMS)?)?,
			name: get(META_NAME)?.clone(),
			epoch: parse_num(META_EPOCH)? as usize,
			global_step: parse_num(META_GLOBAL_STEP)?,
			best_metric,
			bad_epochs: bad_epochs as usize,
		})
	}
}

//--------------------------------------------------------------------------------------------------

fn to_le_bytes(t: &Tensor) -> Result<(Vec<usize>, Vec<u8>), ErrPack<ModelError>> {
	let shape = t.size().iter().map(|&d| d as usize).collect();
	let values = Vec::<f32>::try_from(
		&t.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous().flatten(0, -1),
	)?;
	let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
	Ok((shape, bytes))
}

/// Writes every variable of `vs` as f32 with `meta` in the header.
pub fn save(path: &Path, vs: &nn::VarStore, meta: &CheckpointMeta) -> Result<(), ErrPack<ModelError>> {
	let mut names: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
	names.sort_by(|a, b| a.0.cmp(&b.0));

	let mut buffers = Vec::with_capacity(names.len());
	for (name, tensor) in &names {
		let (shape, bytes) = to_le_bytes(tensor)?;
		buffers.push((name.clone(), shape, bytes));
	}
	let views = buffers
		.iter()
		.map(|(name, shape, bytes)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
		.collect::<Result<Vec<_>, ErrPack<ModelError>>>()?;

	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			std::fs::create_dir_all(parent)?;
		}
	}
	safetensors::serialize_to_file(views, &Some(meta.to_map()?), path)?;
	log::debug!("saved {} tensors to {}", names.len(), path.display());
	Ok(())
}

fn meta_from_buffer(buffer: &[u8], path: &Path) -> Result<CheckpointMeta, ErrPack<ModelError>> {
	let (_, metadata) = SafeTensors::read_metadata(buffer)?;
	let Some(map) = metadata.metadata() else {
		return Err(checkpoint_error(format!("{} has no metadata", path.display())));
	};
	CheckpointMeta::from_map(map)
}

pub fn read_meta(path: &Path) -> Result<CheckpointMeta, ErrPack<ModelError>> {
	let buffer = std::fs::read(path)?;
	meta_from_buffer(&buffer, path)
}

/// Copies the stored values into the variables of `vs`. Every variable must be
/// present with the same shape.
pub fn load(path: &Path, vs: &mut nn::VarStore) -> Result<CheckpointMeta, ErrPack<ModelError>> {
	let buffer = std::fs::read(path)?;
	let meta = meta_from_buffer(&buffer, path)?;
	let stored = SafeTensors::deserialize(&buffer)?;
	let device = vs.device();

	let mut variables = vs.variables();
	for (name, var) in &mut variables {
		let view = stored
			.tensor(name)
			.map_err(|_| checkpoint_error(format!("{} has no tensor `{name}`", path.display())))?;
		let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
		if shape != var.size() {
			return Err(checkpoint_error(format!(
				"shape mismatch for `{name}`: stored {shape:?}, model {:?}",
				var.size()
			)));
		}
		if view.dtype() != Dtype::F32 {
			return Err(checkpoint_error(format!("`{name}` is {:?}, expected F32", view.dtype())));
		}
		let values: Vec<f32> = view
			.data()
			.chunks_exact(4)
			.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
			.collect();
		let src = Tensor::from_slice(&values).view(shape.as_slice()).to_device(device);
		tch::no_grad(|| var.copy_(&src));
	}
	log::debug!("loaded {} tensors from {}", variables.len(), path.display());
	Ok(meta)
}

//--------------------------------------------------------------------------------------------------
