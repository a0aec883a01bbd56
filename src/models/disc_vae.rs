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

/// Temperature for the current step.
pub(crate) fn temperature(config: &ModelConfig, ctx: &StepContext) -> f64 {
	losses::annealed_temperature(
		config.temperature,
		config.temperature_min,
		config.anneal_rate,
		ctx.global_step,
	)
}

/// Relaxed sample in training, one-hot of the argmax otherwise.
pub(crate) fn sample_categorical(
	logits: &Tensor,
	config: &ModelConfig,
	temperature: f64,
	ctx: &StepContext,
) -> Tensor {
	if ctx.is_train() {
		losses::gumbel_softmax(logits, temperature, config.hard)
	} else {
		losses::one_hot_argmax(logits)
	}
}

/// Loss shared by the categorical variants: reconstruction plus KL to the uniform prior.
pub(crate) fn categorical_loss(
	model: &dyn AutoEncoderModel,
	inputs: &Tensor,
	out: &ForwardOutput,
) -> Result<LossDict, ErrPack<ModelError>> {
	let Latent::Categorical { logits, temperature, .. } = &out.latent else {
		return Err(ErrPack::new(
			ModelError::InvalidInput,
			"forward output does not hold a categorical latent",
		));
	};
	let recon_loss = model.reconstruction_loss(inputs, out);
	let kl_loss = losses::categorical_kl_uniform(logits);
	let loss = &recon_loss + &kl_loss * model.config().beta;
	Ok(LossDict::new(loss, recon_loss)
		.with("kl_loss", kl_loss)
		.with("temperature", Tensor::from(*temperature)))
}

pub(crate) fn categorical_name_extras(config: &ModelConfig) -> String {
	let hard = if config.hard { "_hard" } else { "" };
	format!("_beta{}_t{}{hard}", config.beta, config.temperature)
}

//--------------------------------------------------------------------------------------------------

/// VAE with `latent_size` independent categorical variables.
pub struct DiscreteVae {
	base: ModelBase,
	encoder_latent: nn::Linear,
}

impl DiscreteVae {
	pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ErrPack<ModelError>> {
		let base = ModelBase::new(config, ModelKind::DiscreteVae, device)?;
		let encoder_latent = nn::linear(
			base.vs.root() / "encoder_latent",
			base.feature_size(),
			config.code_size(),
			Default::default(),
		);
		Ok(Self { base, encoder_latent })
	}
}

impl AutoEncoderModel for DiscreteVae {
	fn base(&self) -> &ModelBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut ModelBase {
		&mut self.base
	}

	fn encode_latent(&self, feat: &Tensor, ctx: &StepContext) -> Latent {
		let config = self.config();
		let logits =
			self.encoder_latent.forward(feat).view([-1, config.latent_size, config.categorical_dim]);
		let temperature = temperature(config, ctx);
		let z = sample_categorical(&logits, config, temperature, ctx).flatten(1, -1);
		Latent::Categorical { logits, z, temperature }
	}

	fn compute_loss(
		&self,
		inputs: &Tensor,
		out: &ForwardOutput,
		_ctx: &StepContext,
	) -> Result<LossDict, ErrPack<ModelError>> {
		categorical_loss(self, inputs, out)
	}

	fn name_extras(&self) -> String {
		categorical_name_extras(self.config())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::{EmbedMode, Stage};
	use assert_approx_eq::assert_approx_eq;
	use tch::Kind;

	fn config() -> ModelConfig {
		let mut config = ModelConfig::new(ModelKind::DiscreteVae, [1, 8, 8], "conv-4", 3);
		config.categorical_dim = 5;
		config
	}

	#[test]
	fn test_names() {
		let model = DiscreteVae::new(&config(), Device::Cpu).unwrap();
		assert_eq!(model.backbone_name(), "conv-4_z3x5");
		assert_eq!(model.name(), "DiscreteVAE_conv-4_z3x5_mse_beta1_t1_lr0.001_adam_wd0");
	}

	#[test]
	fn test_eval_latent_is_one_hot() {
		let model = DiscreteVae::new(&config(), Device::Cpu).unwrap();
		let x = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = StepContext { stage: Stage::Val, global_step: 0, epoch: 0, dataset_size: 2 };
		let out = model.forward(&x, &ctx).unwrap();
		let z = out.latent.sample().view([2, 3, 5]);
		let ones = z.sum_dim_intlist(&[-1_i64][..], false, Kind::Float);
		assert!(ones.allclose(&ones.ones_like(), 1e-6, 1e-6, false));
		let max = Vec::<f32>::try_from(&z.amax(&[-1_i64][..], false).flatten(0, -1)).unwrap();
		assert!(max.iter().all(|v| (*v - 1.0).abs() < 1e-6));

		assert_eq!(model.embed(&x, EmbedMode::Latent).unwrap().size(), vec![2, 15]);
	}

	#[test]
	fn test_temperature_anneals() {
		let mut config = config();
		config.anneal_rate = 0.01;
		let model = DiscreteVae::new(&config, Device::Cpu).unwrap();
		let x = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = StepContext { stage: Stage::Train, global_step: 10, epoch: 0, dataset_size: 2 };
		let out = model.forward(&x, &ctx).unwrap();
		let losses = model.compute_loss(&x, &out, &ctx).unwrap();
		assert_approx_eq!(losses.get("temperature").unwrap().double_value(&[]), (-0.1_f64).exp(), 1e-9);
		assert!(losses.get("kl_loss").unwrap().double_value(&[]) >= -1e-6);
	}

	#[test]
	fn test_hard_samples_are_one_hot_with_soft_gradients() {
		let mut config = config();
		config.hard = true;
		let model = DiscreteVae::new(&config, Device::Cpu).unwrap();
		assert!(model.name().ends_with("_t1_hard_lr0.001_adam_wd0"));
		let x = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ctx = StepContext { stage: Stage::Train, global_step: 0, epoch: 0, dataset_size: 2 };
		let out = model.forward(&x, &ctx).unwrap();

		let z = out.latent.sample().view([2, 3, 5]);
		let values = Vec::<f32>::try_from(&z.flatten(0, -1)).unwrap();
		assert!(values.iter().all(|v| v.abs() < 1e-6 || (v - 1.0).abs() < 1e-6));
		let ones = z.sum_dim_intlist(&[-1_i64][..], false, Kind::Float);
		assert!(ones.allclose(&ones.ones_like(), 1e-6, 1e-6, false));

		// the reconstruction alone must reach the logits through the one-hot sample
		model.reconstruction_loss(&x, &out).backward();
		let grad = model.encoder_latent.ws.grad();
		assert!(grad.defined());
		assert!(grad.abs().sum(Kind::Float).double_value(&[]) > 0.0);
	}
}
