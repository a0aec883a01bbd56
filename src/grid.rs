//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{Array3, Array4, ArrayView4, Axis, s};
use tch::{Device, Kind, Tensor};

use crate::ErrPack;
use crate::error::{ModelError, invalid_input};

//--------------------------------------------------------------------------------------------------

/// Copies a `[N, C, H, W]` tensor to the host.
pub fn tensor_to_array4(t: &Tensor) -> Result<Array4<f32>, ErrPack<ModelError>> {
	let size = t.size();
	let &[n, c, h, w] = size.as_slice() else {
		return Err(invalid_input(format!("expected a [N, C, H, W] tensor, got {size:?}")));
	};
	let values = Vec::<f32>::try_from(
		&t.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous().flatten(0, -1),
	)?;
	Array4::from_shape_vec((n as usize, c as usize, h as usize, w as usize), values)
		.map_err(|e| ErrPack::nested(ModelError::InvalidInput, "cannot shape image batch", e))
}

/// Tiles a batch of images into one `[3, rows, cols]` image with `nrow` images per row.
///
/// Grayscale batches are repeated to three channels. With `normalize`, values are
/// min-max scaled over the whole batch to `[0, 1]`. A single image comes back
/// without the padding border.
pub fn make_grid(
	images: ArrayView4<f32>,
	nrow: usize,
	padding: usize,
	pad_value: f32,
	normalize: bool,
) -> Result<Array3<f32>, ErrPack<ModelError>> {
	let (n, c, h, w) = images.dim();
	if n == 0 {
		return Err(invalid_input("cannot make a grid of zero images"));
	}
	let mut images = match c {
		1 => ndarray::concatenate(Axis(1), &[images, images, images])
			.map_err(|e| ErrPack::nested(ModelError::InvalidInput, "cannot expand channels", e))?,
		3 => images.to_owned(),
		_ => return Err(invalid_input(format!("images must have 1 or 3 channels, got {c}"))),
	};

	if normalize {
		let lo = images.fold(f32::INFINITY, |a, &b| a.min(b));
		let hi = images.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
		let scale = (hi - lo).max(1e-5);
		images.mapv_inplace(|v| ((v - lo) / scale).clamp(0.0, 1.0));
	}

	if n == 1 {
		return Ok(images.index_axis_move(Axis(0), 0));
	}

	let xmaps = nrow.clamp(1, n);
	let ymaps = n.div_ceil(xmaps);
	let cell_h = h + padding;
	let cell_w = w + padding;
	let mut grid = Array3::from_elem((3, ymaps * cell_h + padding, xmaps * cell_w + padding), pad_value);
	for (i, image) in images.outer_iter().enumerate() {
		let y = (i / xmaps) * cell_h + padding;
		let x = (i % xmaps) * cell_w + padding;
		grid.slice_mut(s![.., y..y + h, x..x + w]).assign(&image);
	}
	Ok(grid)
}

//--------------------------------------------------------------------------------------------------
