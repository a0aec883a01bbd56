//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Optimizers over the trainable variables of a `VarStore`.
//
//     Adam: https://arxiv.org/abs/1412.6980
//     AdamW: https://arxiv.org/abs/1711.05101

use tch::nn::{self, OptimizerConfig};

use crate::ErrPack;
use crate::config::OptimKind;
use crate::error::ModelError;

//--------------------------------------------------------------------------------------------------

pub struct OptCoef {
	pub m_decay: f64, // beta1
	pub v_decay: f64, // beta2
	pub eps: f64,     // epsilon
	pub momentum: f64, // sgd, rmsprop
}

impl Default for OptCoef {
	fn default() -> Self {
		Self { m_decay: 0.9, v_decay: 0.999, eps: 1e-8, momentum: 0.0 }
	}
}

pub fn init_optimizer(
	kind: OptimKind,
	vs: &nn::VarStore,
	lr: f64,
	weight_decay: f64,
) -> Result<nn::Optimizer, ErrPack<ModelError>> {
	init_optimizer_with(kind, vs, lr, weight_decay, &OptCoef::default())
}

pub fn init_optimizer_with(
	kind: OptimKind,
	vs: &nn::VarStore,
	lr: f64,
	weight_decay: f64,
	coef: &OptCoef,
) -> Result<nn::Optimizer, ErrPack<ModelError>> {
	log::debug!("init_optimizer: {} lr={lr} weight_decay={weight_decay}", kind.as_str());
	let opt = match kind {
		OptimKind::Adam => nn::Adam {
			beta1: coef.m_decay,
			beta2: coef.v_decay,
			eps: coef.eps,
			wd: weight_decay,
			..Default::default()
		}
		.build(vs, lr)?,
		OptimKind::AdamW => nn::AdamW {
			beta1: coef.m_decay,
			beta2: coef.v_decay,
			eps: coef.eps,
			wd: weight_decay,
			..Default::default()
		}
		.build(vs, lr)?,
		OptimKind::Sgd => {
			nn::Sgd { momentum: coef.momentum, wd: weight_decay, ..Default::default() }
				.build(vs, lr)?
		},
		OptimKind::RmsProp => nn::RmsProp {
			eps: coef.eps,
			wd: weight_decay,
			..Default::default()
		}
		.build(vs, lr)?,
	};
	Ok(opt)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use tch::{Device, Kind, Tensor};

	#[test]
	fn test_every_optimizer_decreases_a_quadratic() {
		for kind in [OptimKind::Adam, OptimKind::AdamW, OptimKind::Sgd, OptimKind::RmsProp] {
			let vs = nn::VarStore::new(Device::Cpu);
			let w = vs.root().var("w", &[4], nn::Init::Const(3.0));
			let mut opt = init_optimizer(kind, &vs, 0.01, 0.0).unwrap();

			let loss_of = |w: &Tensor| (w * w).sum(Kind::Float);
			let before = loss_of(&w).double_value(&[]);
			for _ in 0..20 {
				opt.backward_step(&loss_of(&w));
			}
			let after = loss_of(&w).double_value(&[]);
			assert!(after < before, "{kind:?}: {after} >= {before}");
		}
	}

	#[test]
	fn test_sgd_has_no_momentum_by_default() {
		let vs = nn::VarStore::new(Device::Cpu);
		let w = vs.root().var("w", &[1], nn::Init::Const(3.0));
		let mut opt = init_optimizer(OptimKind::Sgd, &vs, 0.1, 0.0).unwrap();
		for _ in 0..2 {
			opt.backward_step(&(&w * &w).sum(Kind::Float));
		}
		// 3 -> 2.4 -> 1.92; a momentum buffer would overshoot to 1.38
		assert!((w.double_value(&[0]) - 1.92).abs() < 1e-5);
	}
}
