//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::{Device, Tensor};

use crate::ErrPack;
use crate::config::{ModelConfig, ModelKind};
use crate::error::ModelError;
use crate::losses;

use super::vae::{GaussianHead, not_gaussian};
use super::{AutoEncoderModel, ForwardOutput, Latent, LossDict, ModelBase, StepContext};

/// VAE whose KL term is split into mutual information, total correlation and
/// dimension-wise KL, each with its own weight.
pub struct BetaTcVae {
	base: ModelBase,
	encoder_latent: GaussianHead,
}

impl BetaTcVae {
	pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ErrPack<ModelError>> {
		let base = ModelBase::new(config, ModelKind::BetaTcVae, device)?;
		let encoder_latent =
			GaussianHead::new(base.vs.root() / "encoder_latent", base.feature_size(), config.latent_size);
		Ok(Self { base, encoder_latent })
	}
}

impl AutoEncoderModel for BetaTcVae {
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
		let Latent::Gaussian { mu, logvar, z } = &out.latent else {
			return Err(not_gaussian());
		};
		let config = self.config();
		let recon_loss = self.reconstruction_loss(inputs, out);

		let terms = losses::tc_decomposition(z, mu, logvar, ctx.dataset_size, config.mss);
		let kl_weight = losses::kl_warmup_weight(ctx.global_step, config.kl_warmup_steps);
		let loss = &recon_loss
			+ &terms.mi * config.tc_alpha
			+ &terms.tc * config.tc_beta
			+ &terms.dwkl * (config.tc_gamma * kl_weight);
		let kl_loss = &terms.mi + &terms.tc + &terms.dwkl;

		Ok(LossDict::new(loss, recon_loss)
			.with("kl_loss", kl_loss)
			.with("mi_loss", terms.mi)
			.with("tc_loss", terms.tc)
			.with("dwkl_loss", terms.dwkl)
			.with("kl_weight", Tensor::from(kl_weight)))
	}

	fn name_extras(&self) -> String {
		let config = self.config();
		let mss = if config.mss { "_mss" } else { "" };
		format!("_a{}_b{}_g{}{mss}", config.tc_alpha, config.tc_beta, config.tc_gamma)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::Stage;
	use assert_approx_eq::assert_approx_eq;
	use tch::Kind;

	#[test]
	fn test_name() {
		let config = ModelConfig::new(ModelKind::BetaTcVae, [1, 8, 8], "mlp-16", 4);
		let model = BetaTcVae::new(&config, Device::Cpu).unwrap();
		assert_eq!(model.name(), "BetaTCVAE_mlp-16_z4_mse_a1_b6_g1_mss_lr0.001_adam_wd0");
	}

	#[test]
	fn test_loss_weights_terms() {
		tch::manual_seed(5);
		let mut config = ModelConfig::new(ModelKind::BetaTcVae, [1, 8, 8], "mlp-16", 4);
		config.tc_alpha = 0.5;
		config.tc_beta = 3.0;
		config.tc_gamma = 2.0;
		let model = BetaTcVae::new(&config, Device::Cpu).unwrap();
		let x = Tensor::rand([8, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = StepContext { stage: Stage::Train, global_step: 0, epoch: 0, dataset_size: 64 };
		let out = model.forward(&x, &ctx).unwrap();
		let losses = model.compute_loss(&x, &out, &ctx).unwrap();

		let get = |key: &str| losses.get(key).unwrap().double_value(&[]);
		let expected =
			get("recon_loss") + 0.5 * get("mi_loss") + 3.0 * get("tc_loss") + 2.0 * get("dwkl_loss");
		assert_approx_eq!(get("loss"), expected, 1e-3);
		assert_approx_eq!(get("kl_loss"), get("mi_loss") + get("tc_loss") + get("dwkl_loss"), 1e-4);
	}

	#[test]
	fn test_single_sample_batch_falls_back_to_mws() {
		let config = ModelConfig::new(ModelKind::BetaTcVae, [1, 8, 8], "mlp-16", 4);
		let model = BetaTcVae::new(&config, Device::Cpu).unwrap();
		let x = Tensor::rand([1, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = StepContext { stage: Stage::Val, global_step: 0, epoch: 0, dataset_size: 10 };
		let out = model.forward(&x, &ctx).unwrap();
		let losses = model.compute_loss(&x, &out, &ctx).unwrap();
		assert!(losses.loss().double_value(&[]).is_finite());
	}
}
