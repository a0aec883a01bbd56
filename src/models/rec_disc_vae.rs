//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::nn::{self, Module, RNN};
use tch::{Device, Kind, Tensor};

use crate::ErrPack;
use crate::config::{ModelConfig, ModelKind};
use crate::error::ModelError;

use super::disc_vae::{categorical_loss, categorical_name_extras, sample_categorical, temperature};
use super::{AutoEncoderModel, ForwardOutput, Latent, LossDict, ModelBase, StepContext};

/// Discrete VAE whose categorical variables are emitted one at a time by a GRU, each
/// conditioned on the sample drawn for the previous one.
pub struct RecurrentDiscreteVae {
	base: ModelBase,
	init_state: nn::Linear,
	gru: nn::GRU,
	to_logits: nn::Linear,
}

impl RecurrentDiscreteVae {
	pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ErrPack<ModelError>> {
		let base = ModelBase::new(config, ModelKind::RecurrentDiscreteVae, device)?;
		let p = base.vs.root() / "encoder_latent";
		let hidden = config.rnn_hidden_size;
		let k = config.categorical_dim;
		let init_state = nn::linear(&p / "init_state", base.feature_size(), hidden, Default::default());
		let gru = nn::gru(&p / "gru", k, hidden, Default::default());
		let to_logits = nn::linear(&p / "to_logits", hidden, k, Default::default());
		Ok(Self { base, init_state, gru, to_logits })
	}
}

impl AutoEncoderModel for RecurrentDiscreteVae {
	fn base(&self) -> &ModelBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut ModelBase {
		&mut self.base
	}

	fn encode_latent(&self, feat: &Tensor, ctx: &StepContext) -> Latent {
		let config = self.config();
		let batch = feat.size()[0];
		let temperature = temperature(config, ctx);

		// state: [layers, batch, hidden]
		let mut state = nn::GRUState(self.init_state.forward(feat).tanh().unsqueeze(0));
		let mut prev = Tensor::zeros([batch, config.categorical_dim], (Kind::Float, feat.device()));
		let mut logits = Vec::with_capacity(config.latent_size as usize);
		let mut samples = Vec::with_capacity(config.latent_size as usize);
		for _ in 0..config.latent_size {
			state = self.gru.step(&prev, &state);
			let step_logits = self.to_logits.forward(&state.0.squeeze_dim(0));
			let sample = sample_categorical(&step_logits, config, temperature, ctx);
			prev = sample.shallow_clone();
			logits.push(step_logits);
			samples.push(sample);
		}

		Latent::Categorical {
			logits: Tensor::stack(&logits, 1),
			z: Tensor::cat(&samples, 1),
			temperature,
		}
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
		format!("{}_h{}", categorical_name_extras(self.config()), self.config().rnn_hidden_size)
	}
}
