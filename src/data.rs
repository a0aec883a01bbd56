//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors};
use tch::{Device, Kind, Tensor};

use crate::ErrPack;
use crate::error::{ModelError, invalid_input};
use crate::rng::Rng;

//--------------------------------------------------------------------------------------------------

/// Images `[N, C, H, W]` and labels `[N]`.
#[derive(Debug)]
pub struct Batch {
	pub x: Tensor,
	pub y: Tensor,
}

impl Batch {
	pub fn len(&self) -> usize {
		self.x.size().first().copied().unwrap_or(0) as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn to_device(&self, device: Device) -> Self {
		Self { x: self.x.to_device(device), y: self.y.to_device(device) }
	}
}

//--------------------------------------------------------------------------------------------------

/// In-memory dataset kept on the CPU. Batches are moved to the model's device by
/// the trainer.
#[derive(Debug)]
pub struct TensorDataset {
	images: Tensor,
	labels: Tensor,
}

impl TensorDataset {
	pub fn new(images: Tensor, labels: Tensor) -> Result<Self, ErrPack<ModelError>> {
		let size = images.size();
		if size.len() != 4 {
			return Err(invalid_input(format!("images must be [N, C, H, W], got {size:?}")));
		}
		if labels.size() != [size[0]] {
			return Err(invalid_input(format!(
				"labels must be [{}], got {:?}",
				size[0],
				labels.size()
			)));
		}
		Ok(Self {
			images: images.to_device(Device::Cpu).to_kind(Kind::Float),
			labels: labels.to_device(Device::Cpu).to_kind(Kind::Int64),
		})
	}

	/// Reads `images` (F32, or U8 scaled to `[0, 1]`) and optional `labels` (I64 or U8)
	/// from a safetensors file.
	pub fn load(path: &Path) -> Result<Self, ErrPack<ModelError>> {
		let buffer = std::fs::read(path)?;
		let stored = SafeTensors::deserialize(&buffer)?;

		let view = stored.tensor("images").map_err(|_| {
			invalid_input(format!("{} has no `images` tensor", path.display()))
		})?;
		let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
		let images = match view.dtype() {
			Dtype::F32 => {
				let values: Vec<f32> = view
					.data()
					.chunks_exact(4)
					.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
					.collect();
				Tensor::from_slice(&values)
			},
			Dtype::U8 => Tensor::from_slice(view.data()).to_kind(Kind::Float) / 255.0,
			other => {
				return Err(invalid_input(format!("unsupported image dtype {other:?}")));
			},
		};
		let images = images.view(shape.as_slice());

		let n = shape.first().copied().unwrap_or(0);
		let labels = match stored.tensor("labels") {
			Ok(view) => match view.dtype() {
				Dtype::I64 => {
					let values: Vec<i64> = view
						.data()
						.chunks_exact(8)
						.map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
						.collect();
					Tensor::from_slice(&values)
				},
				Dtype::U8 => Tensor::from_slice(view.data()).to_kind(Kind::Int64),
				other => {
					return Err(invalid_input(format!("unsupported label dtype {other:?}")));
				},
			},
			Err(_) => Tensor::zeros([n], (Kind::Int64, Device::Cpu)),
		};

		let dataset = Self::new(images, labels)?;
		log::info!("loaded {} samples of {:?} from {}", dataset.len(), dataset.item_size(), path.display());
		Ok(dataset)
	}

	/// Blurry blobs at random positions, label = quadrant of the blob center.
	pub fn synthetic(n: usize, input_size: [i64; 3], rng: &mut Rng) -> Self {
		let [c, h, w] = input_size;
		let (cu, hu, wu) = (c as usize, h as usize, w as usize);
		let mut pixels = vec![0.0_f32; n * cu * hu * wu];
		let mut labels = Vec::with_capacity(n);
		for image in pixels.chunks_exact_mut(cu * hu * wu) {
			let cy = rng.uniform() * h as f64;
			let cx = rng.uniform() * w as f64;
			let radius = 1.0 + rng.uniform() * (h.min(w) as f64 / 4.0);
			let quadrant = i64::from(cy >= h as f64 / 2.0) * 2 + i64::from(cx >= w as f64 / 2.0);
			labels.push(quadrant);
			for (ch, plane) in image.chunks_exact_mut(hu * wu).enumerate() {
				let gain = 1.0 - 0.5 * (ch as f64 / cu as f64);
				for (p, v) in plane.iter_mut().enumerate() {
					let dy = (p / wu) as f64 + 0.5 - cy;
					let dx = (p % wu) as f64 + 0.5 - cx;
					let d2 = (dy * dy + dx * dx) / (radius * radius);
					let noise = 0.02 * rng.normal();
					*v = (gain * (-d2).exp() + noise).clamp(0.0, 1.0) as f32;
				}
			}
		}
		let images = Tensor::from_slice(&pixels).view([n as i64, c, h, w]);
		Self { images, labels: Tensor::from_slice(&labels) }
	}

	pub fn len(&self) -> usize {
		self.images.size()[0] as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// `[C, H, W]`
	pub fn item_size(&self) -> Vec<i64> {
		self.images.size()[1..].to_vec()
	}

	fn select(&self, indices: &[i64]) -> Self {
		let index = Tensor::from_slice(indices);
		Self {
			images: self.images.index_select(0, &index),
			labels: self.labels.index_select(0, &index),
		}
	}

	/// Random split into `(rest, held_out)` with `held_out` having
	/// `round(len * fraction)` items.
	pub fn split(&self, fraction: f64, rng: &mut Rng) -> (Self, Self) {
		let n = self.len();
		let held = ((n as f64) * fraction).round() as usize;
		let held = held.min(n);
		let mut order: Vec<i64> = (0..n as i64).collect();
		rng.shuffle(&mut order);
		let (held_out, rest) = order.split_at(held);
		(self.select(rest), self.select(held_out))
	}

	/// Iterates over the dataset in batches. The last batch may be smaller.
	pub fn batches(&self, batch_size: usize, shuffle: bool, rng: &mut Rng) -> BatchIter<'_> {
		let mut order: Vec<i64> = (0..self.len() as i64).collect();
		if shuffle {
			rng.shuffle(&mut order);
		}
		BatchIter { dataset: self, order, batch_size: batch_size.max(1), min_size: 1, pos: 0 }
	}

	pub fn num_batches(&self, batch_size: usize) -> usize {
		self.len().div_ceil(batch_size.max(1))
	}
}

pub struct BatchIter<'a> {
	dataset: &'a TensorDataset,
	order: Vec<i64>,
	batch_size: usize,
	min_size: usize,
	pos: usize,
}

impl BatchIter<'_> {
	/// A trailing batch smaller than `min_size` is folded into the batch before it.
	/// A dataset smaller than `min_size` still comes out as one batch.
	pub fn min_batch_size(mut self, min_size: usize) -> Self {
		self.min_size = min_size.max(1);
		self
	}
}

impl Iterator for BatchIter<'_> {
	type Item = Batch;

	fn next(&mut self) -> Option<Batch> {
		if self.pos >= self.order.len() {
			return None;
		}
		let mut end = (self.pos + self.batch_size).min(self.order.len());
		if self.order.len() - end < self.min_size {
			end = self.order.len();
		}
		let part = self.dataset.select(self.order.get(self.pos..end)?);
		self.pos = end;
		Some(Batch { x: part.images, y: part.labels })
	}
}

//--------------------------------------------------------------------------------------------------
