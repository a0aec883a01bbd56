//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::path::Path;

use tch::nn::{self, ModuleT};
use tch::{Device, Tensor};

use crate::ErrPack;
use crate::architectures::{Architectures, build_architectures};
use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{ModelConfig, ModelKind};
use crate::error::{ModelError, invalid_config, invalid_input};
use crate::losses;

pub mod ae;
pub mod beta_tcvae;
pub mod disc_vae;
pub mod rec_disc_vae;
pub mod vae;

pub use ae::AutoEncoder;
pub use beta_tcvae::BetaTcVae;
pub use disc_vae::DiscreteVae;
pub use rec_disc_vae::RecurrentDiscreteVae;
pub use vae::Vae;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
	Train,
	Val,
	Test,
}

impl Stage {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Train => "train",
			Self::Val => "val",
			Self::Test => "test",
		}
	}
}

impl std::fmt::Display for Stage {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Loop state a model may need while computing its latent or its loss.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StepContext {
	pub stage: Stage,
	pub global_step: u64,
	pub epoch: usize,
	/// Number of samples in the dataset being iterated.
	pub dataset_size: usize,
}

impl StepContext {
	/// Evaluation context outside of a training loop.
	pub fn inference() -> Self {
		Self { stage: Stage::Test, global_step: 0, epoch: 0, dataset_size: 0 }
	}

	pub fn is_train(&self) -> bool {
		self.stage == Stage::Train
	}
}

//--------------------------------------------------------------------------------------------------

/// Output of the latent encoder.
#[derive(Debug)]
pub enum Latent {
	Deterministic {
		z: Tensor,
	},
	Gaussian {
		mu: Tensor,
		logvar: Tensor,
		z: Tensor,
	},
	Categorical {
		/// `[batch, latent_size, categorical_dim]`
		logits: Tensor,
		/// `[batch, latent_size * categorical_dim]`
		z: Tensor,
		temperature: f64,
	},
}

impl Latent {
	/// The value fed to the decoder.
	pub fn sample(&self) -> &Tensor {
		match self {
			Self::Deterministic { z } | Self::Gaussian { z, .. } | Self::Categorical { z, .. } => z,
		}
	}

	/// Noise free representation: `z`, the posterior mean, or the class probabilities.
	pub fn code(&self) -> Tensor {
		match self {
			Self::Deterministic { z } => z.shallow_clone(),
			Self::Gaussian { mu, .. } => mu.shallow_clone(),
			Self::Categorical { logits, .. } => {
				logits.softmax(-1, tch::Kind::Float).flatten(1, -1)
			},
		}
	}
}

#[derive(Debug)]
pub struct ForwardOutput {
	pub recon: Tensor,
	pub latent: Latent,
}

//--------------------------------------------------------------------------------------------------

/// Named loss terms. `loss` and `recon_loss` are always present.
#[derive(Debug)]
pub struct LossDict {
	terms: Vec<(String, Tensor)>,
}

impl LossDict {
	pub fn new(loss: Tensor, recon_loss: Tensor) -> Self {
		Self {
			terms: vec![("loss".to_string(), loss), ("recon_loss".to_string(), recon_loss)],
		}
	}

	pub fn with(mut self, key: &str, value: Tensor) -> Self {
		self.insert(key, value);
		self
	}

	pub fn insert(&mut self, key: &str, value: Tensor) {
		if let Some(entry) = self.terms.iter_mut().find(|(k, _)| k == key) {
			entry.1 = value;
		} else {
			self.terms.push((key.to_string(), value));
		}
	}

	pub fn get(&self, key: &str) -> Option<&Tensor> {
		self.terms.iter().find(|(k, _)| k == key).map(|(_, v)| v)
	}

	/// The value to minimize.
	#[allow(clippy::indexing_slicing)]
	pub fn loss(&self) -> &Tensor {
		&self.terms[0].1
	}

	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.terms.iter().map(|(k, _)| k.as_str())
	}

	pub fn len(&self) -> usize {
		self.terms.len()
	}

	pub fn is_empty(&self) -> bool {
		self.terms.is_empty()
	}

	/// Detached scalar values keyed `{stage}_{name}`.
	pub fn to_log(&self, stage: Stage) -> Vec<(String, f64)> {
		self.terms
			.iter()
			.map(|(k, v)| (format!("{stage}_{k}"), v.detach().double_value(&[])))
			.collect()
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EmbedMode {
	/// Backbone features before the latent encoder.
	Pre,
	/// The latent code.
	Latent,
	/// Features after the latent decoder.
	Post,
}

impl std::str::FromStr for EmbedMode {
	type Err = ErrPack<ModelError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pre" => Ok(Self::Pre),
			"latent" => Ok(Self::Latent),
			"post" => Ok(Self::Post),
			_ => Err(ErrPack::new(ModelError::UnknownEmbedMode, format!("unknown embed mode `{s}`"))),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// State shared by all variants: the parameters, the hyper-parameters and the
/// backbone.
#[derive(Debug)]
pub struct ModelBase {
	pub vs: nn::VarStore,
	pub config: ModelConfig,
	pub input_size: [i64; 3],
	pub arch: Architectures,
}

impl ModelBase {
	pub fn new(
		config: &ModelConfig,
		expected: ModelKind,
		device: Device,
	) -> Result<Self, ErrPack<ModelError>> {
		if config.kind != expected {
			return Err(invalid_config(format!(
				"config is for {}, cannot build {expected}",
				config.kind
			)));
		}
		config.validate()?;
		let input_size = config.image_shape()?;
		let vs = nn::VarStore::new(device);
		let arch =
			build_architectures(&vs.root(), input_size, &config.architecture, config.code_size())?;
		Ok(Self { vs, config: config.clone(), input_size, arch })
	}

	pub fn feature_size(&self) -> i64 {
		self.arch.feature_size()
	}

	pub fn check_input(&self, x: &Tensor) -> Result<(), ErrPack<ModelError>> {
		let size = x.size();
		let [c, h, w] = self.input_size;
		match size.as_slice() {
			&[n, xc, xh, xw] if n > 0 && xc == c && xh == h && xw == w => Ok(()),
			_ => Err(invalid_input(format!("expected input [N, {c}, {h}, {w}], got {size:?}"))),
		}
	}

	/// Batch norm can't normalize a batch smaller than `arch.min_train_batch`.
	pub fn check_train_batch(&self, x: &Tensor) -> Result<(), ErrPack<ModelError>> {
		let n = x.size().first().copied().unwrap_or(0);
		if n < self.arch.min_train_batch {
			return Err(invalid_input(format!(
				"training needs at least {} items per batch with this backbone, got {n}",
				self.arch.min_train_batch
			)));
		}
		Ok(())
	}
}

/// The contract shared by every autoencoder variant. A variant supplies its latent
/// encoder and its loss; everything else follows from the backbone.
pub trait AutoEncoderModel {
	fn base(&self) -> &ModelBase;
	fn base_mut(&mut self) -> &mut ModelBase;

	/// Feature from the backbone -> latent distribution and sample.
	fn encode_latent(&self, feat: &Tensor, ctx: &StepContext) -> Latent;

	fn compute_loss(
		&self,
		inputs: &Tensor,
		out: &ForwardOutput,
		ctx: &StepContext,
	) -> Result<LossDict, ErrPack<ModelError>>;

	/// Variant hyper-parameters appended to the run name.
	fn name_extras(&self) -> String {
		String::new()
	}

	fn config(&self) -> &ModelConfig {
		&self.base().config
	}

	fn kind(&self) -> ModelKind {
		self.base().config.kind
	}

	fn var_store(&self) -> &nn::VarStore {
		&self.base().vs
	}

	fn var_store_mut(&mut self) -> &mut nn::VarStore {
		&mut self.base_mut().vs
	}

	fn device(&self) -> Device {
		self.base().vs.device()
	}

	fn encode(&self, x: &Tensor, ctx: &StepContext) -> Result<Latent, ErrPack<ModelError>> {
		self.base().check_input(x)?;
		if ctx.is_train() {
			self.base().check_train_batch(x)?;
		}
		let feat = self.base().arch.encoder_conv.forward_t(x, ctx.is_train());
		Ok(self.encode_latent(&feat, ctx))
	}

	/// Latent code -> feature.
	fn decode_latent(&self, z: &Tensor, train: bool) -> Tensor {
		self.base().arch.decoder_latent.forward_t(z, train)
	}

	/// Latent code -> image, `[N, C, H, W]`.
	fn decode(&self, z: &Tensor, train: bool) -> Tensor {
		self.base().arch.decoder_conv.forward_t(&self.decode_latent(z, train), train)
	}

	fn forward(&self, x: &Tensor, ctx: &StepContext) -> Result<ForwardOutput, ErrPack<ModelError>> {
		let latent = self.encode(x, ctx)?;
		let recon = self.decode(latent.sample(), ctx.is_train());
		Ok(ForwardOutput { recon, latent })
	}

	fn reconstruction_loss(&self, inputs: &Tensor, out: &ForwardOutput) -> Tensor {
		losses::reconstruction_loss(self.config().recon_loss, &out.recon, inputs)
	}

	/// Representation for downstream tasks.
	fn embed(&self, x: &Tensor, mode: EmbedMode) -> Result<Tensor, ErrPack<ModelError>> {
		let ctx = StepContext::inference();
		match mode {
			EmbedMode::Pre => {
				self.base().check_input(x)?;
				Ok(self.base().arch.encoder_conv.forward_t(x, false))
			},
			EmbedMode::Latent => Ok(self.encode(x, &ctx)?.code()),
			EmbedMode::Post => Ok(self.decode_latent(&self.encode(x, &ctx)?.code(), false)),
		}
	}

	fn rep_size(&self, mode: EmbedMode) -> i64 {
		match mode {
			EmbedMode::Latent => self.config().code_size(),
			EmbedMode::Pre => self.base().arch.encoder_conv.output_size(),
			EmbedMode::Post => self.base().arch.decoder_latent.output_size(),
		}
	}

	fn backbone_name(&self) -> String {
		let config = self.config();
		if config.kind.is_discrete() {
			format!("{}_z{}x{}", config.architecture, config.latent_size, config.categorical_dim)
		} else {
			format!("{}_z{}", config.architecture, config.latent_size)
		}
	}

	/// Run name derived from the hyper-parameters.
	fn name(&self) -> String {
		let config = self.config();
		format!(
			"{}_{}_{}{}_lr{}_{}_wd{}",
			config.kind.class_name(),
			self.backbone_name(),
			config.recon_loss.as_str(),
			self.name_extras(),
			config.lr,
			config.optim.as_str(),
			config.weight_decay,
		)
	}

	fn configure_optimizer(&self) -> Result<nn::Optimizer, ErrPack<ModelError>> {
		let config = self.config();
		crate::optimizer::init_optimizer(config.optim, self.var_store(), config.lr, config.weight_decay)
	}
}

//--------------------------------------------------------------------------------------------------

pub fn build_model(
	config: &ModelConfig,
	device: Device,
) -> Result<Box<dyn AutoEncoderModel>, ErrPack<ModelError>> {
	Ok(match config.kind {
		ModelKind::Ae => Box::new(AutoEncoder::new(config, device)?),
		ModelKind::Vae => Box::new(Vae::new(config, device)?),
		ModelKind::DiscreteVae => Box::new(DiscreteVae::new(config, device)?),
		ModelKind::RecurrentDiscreteVae => Box::new(RecurrentDiscreteVae::new(config, device)?),
		ModelKind::BetaTcVae => Box::new(BetaTcVae::new(config, device)?),
	})
}

/// Rebuilds a model from the hyper-parameters stored in a checkpoint and loads its
/// weights.
pub fn load_model(
	path: &Path,
	device: Device,
) -> Result<(Box<dyn AutoEncoderModel>, CheckpointMeta), ErrPack<ModelError>> {
	let meta = checkpoint::read_meta(path)?;
	let mut model = build_model(&meta.config, device)?;
	checkpoint::load(path, model.var_store_mut())?;
	Ok((model, meta))
}

//--------------------------------------------------------------------------------------------------
