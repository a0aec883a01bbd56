//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::nn::{self, ModuleT};
use tch::Tensor;

use crate::ErrPack;
use crate::error::ModelError;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchitectureSpec {
	/// Stride-2 convolutions with the given channel counts.
	Conv(Vec<i64>),
	/// Fully connected layers with the given widths.
	Mlp(Vec<i64>),
}

#[cold]
#[inline(never)]
fn invalid_architecture(message: String) -> ErrPack<ModelError> {
	ErrPack::new(ModelError::InvalidArchitecture, message)
}

impl std::str::FromStr for ArchitectureSpec {
	type Err = ErrPack<ModelError>;

	/// `conv-32-64-128` or `mlp-512-256`
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split('-');
		let family = parts.next().unwrap_or_default();
		let sizes = parts
			.map(|part| match part.parse::<i64>() {
				Ok(v) if v > 0 => Ok(v),
				_ => Err(invalid_architecture(format!("bad layer size `{part}` in `{s}`"))),
			})
			.collect::<Result<Vec<_>, _>>()?;
		if sizes.is_empty() {
			return Err(invalid_architecture(format!("architecture `{s}` has no layers")));
		}
		match family {
			"conv" => Ok(Self::Conv(sizes)),
			"mlp" => Ok(Self::Mlp(sizes)),
			_ => Err(invalid_architecture(format!("unknown architecture family in `{s}`"))),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// A network together with the width of its flat output.
#[derive(Debug)]
pub struct SizedNet {
	net: nn::SequentialT,
	output_size: i64,
}

impl SizedNet {
	pub fn output_size(&self) -> i64 {
		self.output_size
	}
}

impl ModuleT for SizedNet {
	fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
		self.net.forward_t(xs, train)
	}
}

/// The parts of a model that don't depend on the latent distribution.
#[derive(Debug)]
pub struct Architectures {
	/// image -> feature
	pub encoder_conv: SizedNet,
	/// feature -> image
	pub decoder_conv: SizedNet,
	/// code -> feature
	pub decoder_latent: SizedNet,
	/// Smallest batch batch norm can normalize in training mode.
	pub min_train_batch: i64,
}

impl Architectures {
	pub fn feature_size(&self) -> i64 {
		self.encoder_conv.output_size
	}
}

pub fn build_architectures(
	p: &nn::Path,
	input_size: [i64; 3],
	architecture: &str,
	code_size: i64,
) -> Result<Architectures, ErrPack<ModelError>> {
	let spec: ArchitectureSpec = architecture.parse()?;
	let (encoder_conv, decoder_conv, min_train_batch) = match &spec {
		ArchitectureSpec::Conv(channels) => {
			let (enc, dec) = build_conv(&(p / "encoder_conv"), &(p / "decoder_conv"), input_size, channels)?;
			// the last encoder batch norm sees one value per channel per item on a 1x1 map
			let last = channels.last().copied().unwrap_or(1);
			let min_train_batch = if enc.output_size == last { 2 } else { 1 };
			(enc, dec, min_train_batch)
		},
		ArchitectureSpec::Mlp(widths) => {
			let (enc, dec) = build_mlp(&(p / "encoder_conv"), &(p / "decoder_conv"), input_size, widths);
			(enc, dec, 1)
		},
	};
	let feature_size = encoder_conv.output_size;
	let decoder_latent = SizedNet {
		net: nn::seq_t()
			.add(nn::linear(p / "decoder_latent" / "fc", code_size, feature_size, Default::default()))
			.add_fn(Tensor::relu),
		output_size: feature_size,
	};
	Ok(Architectures { encoder_conv, decoder_conv, decoder_latent, min_train_batch })
}

fn build_conv(
	enc: &nn::Path,
	dec: &nn::Path,
	input_size: [i64; 3],
	channels: &[i64],
) -> Result<(SizedNet, SizedNet), ErrPack<ModelError>> {
	let [c, h, w] = input_size;
	let scale = 1_i64 << channels.len();
	if h % scale != 0 || w % scale != 0 {
		return Err(invalid_architecture(format!(
			"{} stride-2 layers need height and width divisible by {scale}, got {h}x{w}",
			channels.len()
		)));
	}
	let (fh, fw) = (h / scale, w / scale);
	let last = channels.last().copied().unwrap_or(c);

	let conv_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
	let mut encoder = nn::seq_t();
	let mut in_ch = c;
	for (i, &out_ch) in channels.iter().enumerate() {
		encoder = encoder
			.add(nn::conv2d(enc / format!("conv{i}"), in_ch, out_ch, 4, conv_cfg))
			.add(nn::batch_norm2d(enc / format!("bn{i}"), out_ch, Default::default()))
			.add_fn(Tensor::relu);
		in_ch = out_ch;
	}
	encoder = encoder.add_fn(Tensor::flat_view);

	let deconv_cfg = nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() };
	let mut decoder = nn::seq_t().add_fn(move |xs| xs.view([-1, last, fh, fw]));
	let n = channels.len();
	for i in (0..n).rev() {
		let in_ch = channels[i];
		if i == 0 {
			decoder = decoder.add(nn::conv_transpose2d(
				dec / format!("deconv{i}"),
				in_ch,
				c,
				4,
				deconv_cfg,
			));
		} else {
			let out_ch = channels[i - 1];
			decoder = decoder
				.add(nn::conv_transpose2d(dec / format!("deconv{i}"), in_ch, out_ch, 4, deconv_cfg))
				.add(nn::batch_norm2d(dec / format!("bn{i}"), out_ch, Default::default()))
				.add_fn(Tensor::relu);
		}
	}

	let feature_size = last * fh * fw;
	Ok((
		SizedNet { net: encoder, output_size: feature_size },
		SizedNet { net: decoder, output_size: c * h * w },
	))
}

fn build_mlp(
	enc: &nn::Path,
	dec: &nn::Path,
	input_size: [i64; 3],
	widths: &[i64],
) -> (SizedNet, SizedNet) {
	let [c, h, w] = input_size;
	let pixels = c * h * w;

	let mut encoder = nn::seq_t().add_fn(Tensor::flat_view);
	let mut in_dim = pixels;
	for (i, &out_dim) in widths.iter().enumerate() {
		encoder = encoder
			.add(nn::linear(enc / format!("fc{i}"), in_dim, out_dim, Default::default()))
			.add_fn(Tensor::relu);
		in_dim = out_dim;
	}
	let feature_size = in_dim;

	let mut decoder = nn::seq_t();
	for i in (1..widths.len()).rev() {
		decoder = decoder
			.add(nn::linear(dec / format!("fc{i}"), widths[i], widths[i - 1], Default::default()))
			.add_fn(Tensor::relu);
	}
	let first = widths.first().copied().unwrap_or(pixels);
	decoder = decoder
		.add(nn::linear(dec / "fc0", first, pixels, Default::default()))
		.add_fn(move |xs| xs.view([-1, c, h, w]));

	(
		SizedNet { net: encoder, output_size: feature_size },
		SizedNet { net: decoder, output_size: pixels },
	)
}

//--------------------------------------------------------------------------------------------------
