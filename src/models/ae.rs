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

use super::{AutoEncoderModel, ForwardOutput, Latent, LossDict, ModelBase, StepContext};

/// Plain autoencoder with a deterministic latent.
#[derive(Debug)]
pub struct AutoEncoder {
	base: ModelBase,
	encoder_latent: nn::Linear,
}

impl AutoEncoder {
	pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ErrPack<ModelError>> {
		let base = ModelBase::new(config, ModelKind::Ae, device)?;
		let encoder_latent = nn::linear(
			base.vs.root() / "encoder_latent",
			base.feature_size(),
			config.latent_size,
			Default::default(),
		);
		Ok(Self { base, encoder_latent })
	}
}

impl AutoEncoderModel for AutoEncoder {
	fn base(&self) -> &ModelBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut ModelBase {
		&mut self.base
	}

	fn encode_latent(&self, feat: &Tensor, _ctx: &StepContext) -> Latent {
		Latent::Deterministic { z: self.encoder_latent.forward(feat) }
	}

	fn compute_loss(
		&self,
		inputs: &Tensor,
		out: &ForwardOutput,
		_ctx: &StepContext,
	) -> Result<LossDict, ErrPack<ModelError>> {
		let recon_loss = self.reconstruction_loss(inputs, out);
		Ok(LossDict::new(recon_loss.shallow_clone(), recon_loss))
	}
}
