//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Loss terms shared by the model variants.
//
//     VAE: https://arxiv.org/abs/1312.6114
//     beta-TC-VAE: https://arxiv.org/abs/1802.04942
//     Gumbel-softmax: https://arxiv.org/abs/1611.01144

use tch::{Kind, Reduction, Tensor};

use crate::config::ReconLoss;

//--------------------------------------------------------------------------------------------------

const LN_2PI: f64 = 1.837_877_066_409_345_5;

const EPS: f64 = 1e-20;

/// Summed reconstruction error divided by the batch size.
pub fn reconstruction_loss(kind: ReconLoss, recon: &Tensor, inputs: &Tensor) -> Tensor {
	let batch = inputs.size().first().copied().unwrap_or(1).max(1);
	let total = match kind {
		ReconLoss::Mse => recon.mse_loss(inputs, Reduction::Sum),
		ReconLoss::Bce => {
			recon.binary_cross_entropy_with_logits::<Tensor>(inputs, None, None, Reduction::Sum)
		},
	};
	total / (batch as f64)
}

/// `z = mu + sigma * eps`
pub fn reparameterize(mu: &Tensor, logvar: &Tensor) -> Tensor {
	let std = (logvar * 0.5).exp();
	let eps = std.randn_like();
	mu + eps * std
}

/// KL(N(mu, sigma) || N(0, 1)), summed over latent dims, averaged over the batch.
pub fn gaussian_kl(mu: &Tensor, logvar: &Tensor) -> Tensor {
	let per_dim = logvar + 1.0 - mu * mu - logvar.exp();
	(per_dim.sum_dim_intlist(&[-1_i64][..], false, Kind::Float) * -0.5).mean(Kind::Float)
}

/// Element-wise log N(x | mu, exp(logvar)).
pub fn log_density_gaussian(x: &Tensor, mu: &Tensor, logvar: &Tensor) -> Tensor {
	let diff = x - mu;
	let inv_var = (-logvar).exp();
	((&diff * &diff) * inv_var + logvar + LN_2PI) * -0.5
}

/// Linear ramp from 0 to 1 over `warmup_steps`. No warm-up gives weight 1.
pub fn kl_warmup_weight(global_step: u64, warmup_steps: u64) -> f64 {
	if warmup_steps == 0 {
		1.0
	} else {
		(global_step as f64 / warmup_steps as f64).min(1.0)
	}
}

//--------------------------------------------------------------------------------------------------

pub struct TcTerms {
	/// Index-code mutual information.
	pub mi: Tensor,
	/// Total correlation.
	pub tc: Tensor,
	/// Dimension-wise KL.
	pub dwkl: Tensor,
}

/// Log weights of minibatch stratified sampling, `[batch, batch]`.
/// `batch_size` must be at least 2.
pub fn log_importance_weight_matrix(batch_size: i64, dataset_size: usize) -> Tensor {
	let b = batch_size as usize;
	let n = dataset_size as f64;
	let m = (batch_size - 1) as f64;
	let strat_weight = (n - m) / (n * m);

	let mut w = vec![(1.0 / m) as f32; b * b];
	for row in 0..b {
		w[row * b] = (1.0 / n) as f32;
		if b > 1 {
			w[row * b + 1] = strat_weight as f32;
		}
	}
	w[(b - 2) * b] = strat_weight as f32;

	Tensor::from_slice(&w).view([batch_size, batch_size]).log()
}

/// Splits the aggregate posterior KL into mutual information, total correlation
/// and dimension-wise KL. `z`, `mu` and `logvar` are `[batch, latent]`.
pub fn tc_decomposition(
	z: &Tensor,
	mu: &Tensor,
	logvar: &Tensor,
	dataset_size: usize,
	mss: bool,
) -> TcTerms {
	let batch = z.size()[0];
	let dataset_size = dataset_size.max(batch as usize);

	let log_q_zx = log_density_gaussian(z, mu, logvar).sum_dim_intlist(&[1_i64][..], false, Kind::Float);
	let zeros = z.zeros_like();
	let log_pz = log_density_gaussian(z, &zeros, &zeros).sum_dim_intlist(&[1_i64][..], false, Kind::Float);

	// [batch, batch, latent]: log q(z_i | x_j) for every pair
	let mat_log_qz = log_density_gaussian(&z.unsqueeze(1), &mu.unsqueeze(0), &logvar.unsqueeze(0));

	let (log_qz, log_prod_qzi) = if mss && batch >= 2 {
		let log_iw = log_importance_weight_matrix(batch, dataset_size).to_device(z.device());
		let log_qz = (mat_log_qz.sum_dim_intlist(&[2_i64][..], false, Kind::Float) + &log_iw)
			.logsumexp(&[1_i64][..], false);
		let log_prod_qzi = (mat_log_qz + log_iw.view([batch, batch, 1]))
			.logsumexp(&[1_i64][..], false)
			.sum_dim_intlist(&[1_i64][..], false, Kind::Float);
		(log_qz, log_prod_qzi)
	} else {
		let log_norm = ((batch as f64) * (dataset_size as f64)).ln();
		let log_qz = mat_log_qz
			.sum_dim_intlist(&[2_i64][..], false, Kind::Float)
			.logsumexp(&[1_i64][..], false)
			- log_norm;
		let log_prod_qzi = (mat_log_qz.logsumexp(&[1_i64][..], false) - log_norm)
			.sum_dim_intlist(&[1_i64][..], false, Kind::Float);
		(log_qz, log_prod_qzi)
	};

	TcTerms {
		mi: (log_q_zx - &log_qz).mean(Kind::Float),
		tc: (&log_qz - &log_prod_qzi).mean(Kind::Float),
		dwkl: (log_prod_qzi - log_pz).mean(Kind::Float),
	}
}

//--------------------------------------------------------------------------------------------------

/// `max(temperature_min, temperature * exp(-anneal_rate * step))`
pub fn annealed_temperature(
	temperature: f64,
	temperature_min: f64,
	anneal_rate: f64,
	global_step: u64,
) -> f64 {
	(temperature * (-anneal_rate * global_step as f64).exp()).max(temperature_min)
}

/// One-hot of the argmax over the last dim.
pub fn one_hot_argmax(logits: &Tensor) -> Tensor {
	let index = logits.argmax(-1, true);
	logits.zeros_like().scatter_value(-1, &index, 1.0)
}

/// Relaxed categorical sample over the last dim. With `hard`, the forward value is
/// one-hot and the gradient is that of the relaxed sample.
pub fn gumbel_softmax(logits: &Tensor, temperature: f64, hard: bool) -> Tensor {
	let u = logits.rand_like();
	let gumbel = -((-(u + EPS).log()) + EPS).log();
	let soft = ((logits + gumbel) / temperature).softmax(-1, Kind::Float);
	if hard {
		let hard = one_hot_argmax(&soft);
		(hard - soft.detach()) + soft
	} else {
		soft
	}
}

/// KL(q || uniform) for logits `[batch, vars, categories]`, summed over variables,
/// averaged over the batch.
pub fn categorical_kl_uniform(logits: &Tensor) -> Tensor {
	let categories = logits.size().last().copied().unwrap_or(1);
	let log_q = logits.log_softmax(-1, Kind::Float);
	let q = log_q.exp();
	let kl = q * (log_q + (categories as f64).ln());
	kl.sum_dim_intlist(&[1_i64, 2][..], false, Kind::Float).mean(Kind::Float)
}

//--------------------------------------------------------------------------------------------------
