//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::nn::{self, Module};
use tch::{Device, Tensor};

use crate::ErrPack;
use crate::config::{ModelConfig, ModelKind};
use crate::error::ModelError;
use crate::losses;

use super::{AutoEncoderModel, ForwardOutput, Latent, LossDict, ModelBase, StepContext};

//--------------------------------------------------------------------------------------------------

/// Linear map from the feature to the mean and log-variance of a diagonal Gaussian.
#[derive(Debug)]
pub struct GaussianHead {
	fc: nn::Linear,
	latent_size: i64,
}

impl GaussianHead {
	pub fn new(p: nn::Path, feature_size: i64, latent_size: i64) -> Self {
		let fc = nn::linear(p, feature_size, 2 * latent_size, Default::default());
		Self { fc, latent_size }
	}

	/// Samples during training, returns the mean otherwise.
	pub fn encode(&self, feat: &Tensor, ctx: &StepContext) -> Latent {
		let stats = self.fc.forward(feat);
		let mu = stats.narrow(-1, 0, self.latent_size);
		let logvar = stats.narrow(-1, self.latent_size, self.latent_size);
		let z = if ctx.is_train() {
			losses::reparameterize(&mu, &logvar)
		} else {
			mu.shallow_clone()
		};
		Latent::Gaussian { mu, logvar, z }
	}
}

#[cold]
#[inline(never)]
pub(crate) fn not_gaussian() -> ErrPack<ModelError> {
	ErrPack::new(ModelError::InvalidInput, "forward output does not hold a Gaussian latent")
}

//--------------------------------------------------------------------------------------------------

pub struct Vae {
	base: ModelBase,
	encoder_latent: GaussianHead,
}

impl Vae {
	pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ErrPack<ModelError>> {
		let base = ModelBase::new(config, ModelKind::Vae, device)?;
		let encoder_latent =
			GaussianHead::new(base.vs.root() / "encoder_latent", base.feature_size(), config.latent_size);
		Ok(Self { base, encoder_latent })
	}
}

impl AutoEncoderModel for Vae {
	fn base(&self) -> &ModelBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut ModelBase {
		&mut self.base
	}

	fn encode_latent(&self, feat: &Tensor, ctx: &StepContext) -> Latent {
		self.encoder_latent.encode(feat, ctx)
	}

	fn compute_loss(
		&self,
		inputs: &Tensor,
		out: &ForwardOutput,
		ctx: &StepContext,
	) -> Result<LossDict, ErrPack<ModelError>> {
		let Latent::Gaussian { mu, logvar, .. } = &out.latent else {
			return Err(not_gaussian());
		};
		let config = self.config();
		let recon_loss = self.reconstruction_loss(inputs, out);
		let kl_loss = losses::gaussian_kl(mu, logvar);
		let kl_weight = losses::kl_warmup_weight(ctx.global_step, config.kl_warmup_steps);
		let loss = &recon_loss + &kl_loss * (config.beta * kl_weight);
		Ok(LossDict::new(loss, recon_loss)
			.with("kl_loss", kl_loss)
			.with("kl_weight", Tensor::from(kl_weight)))
	}

	fn name_extras(&self) -> String {
		format!("_beta{}", self.config().beta)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::{EmbedMode, Stage};
	use assert_approx_eq::assert_approx_eq;
	use tch::Kind;

	fn model(beta: f64, warmup: u64) -> Vae {
		let mut config = ModelConfig::new(ModelKind::Vae, [1, 8, 8], "conv-4-8", 3);
		config.beta = beta;
		config.kl_warmup_steps = warmup;
		Vae::new(&config, Device::Cpu).unwrap()
	}

	fn ctx(stage: Stage, global_step: u64) -> StepContext {
		StepContext { stage, global_step, epoch: 0, dataset_size: 100 }
	}

	#[test]
	fn test_name_has_beta() {
		let model = model(4.0, 0);
		assert_eq!(model.name(), "VAE_conv-4-8_z3_mse_beta4_lr0.001_adam_wd0");
	}

	#[test]
	fn test_loss_combines_terms() {
		let model = model(2.0, 0);
		let x = Tensor::rand([4, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = ctx(Stage::Train, 10);
		let out = model.forward(&x, &ctx).unwrap();
		let losses = model.compute_loss(&x, &out, &ctx).unwrap();
		let loss = losses.loss().double_value(&[]);
		let recon = losses.get("recon_loss").unwrap().double_value(&[]);
		let kl = losses.get("kl_loss").unwrap().double_value(&[]);
		assert!(kl >= 0.0);
		assert_approx_eq!(loss, recon + 2.0 * kl, 1e-3);
	}

	#[test]
	fn test_kl_warmup() {
		let model = model(1.0, 100);
		let x = Tensor::rand([4, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = ctx(Stage::Train, 25);
		let out = model.forward(&x, &ctx).unwrap();
		let losses = model.compute_loss(&x, &out, &ctx).unwrap();
		assert_approx_eq!(losses.get("kl_weight").unwrap().double_value(&[]), 0.25);
	}

	#[test]
	fn test_eval_uses_the_mean() {
		let model = model(1.0, 0);
		let x = Tensor::rand([4, 1, 8, 8], (Kind::Float, Device::Cpu));
		let out = model.forward(&x, &ctx(Stage::Val, 0)).unwrap();
		let Latent::Gaussian { mu, z, .. } = &out.latent else {
			panic!("expected a Gaussian latent");
		};
		assert!(mu.allclose(z, 1e-6, 1e-6, false));

		let emb = model.embed(&x, EmbedMode::Latent).unwrap();
		assert!(emb.allclose(mu, 1e-5, 1e-5, false));
	}
}
