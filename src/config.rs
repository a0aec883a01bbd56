//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ErrPack;
use crate::error::{ModelError, invalid_config};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
	#[serde(rename = "AE")]
	Ae,
	#[serde(rename = "VAE")]
	Vae,
	#[serde(rename = "DiscreteVAE")]
	DiscreteVae,
	#[serde(rename = "RecurrentDiscreteVAE")]
	RecurrentDiscreteVae,
	#[serde(rename = "BetaTCVAE")]
	BetaTcVae,
}

impl ModelKind {
	pub const ALL: [Self; 5] =
		[Self::Vae, Self::DiscreteVae, Self::RecurrentDiscreteVae, Self::BetaTcVae, Self::Ae];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Ae => "AE",
			Self::Vae => "VAE",
			Self::DiscreteVae => "DiscreteVAE",
			Self::RecurrentDiscreteVae => "RecurrentDiscreteVAE",
			Self::BetaTcVae => "BetaTCVAE",
		}
	}

	/// Class name used in run names. Differs from the registry name only for `AE`.
	pub fn class_name(self) -> &'static str {
		match self {
			Self::Ae => "AutoEncoder",
			other => other.as_str(),
		}
	}

	pub fn is_discrete(self) -> bool {
		matches!(self, Self::DiscreteVae | Self::RecurrentDiscreteVae)
	}
}

impl std::fmt::Display for ModelKind {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for ModelKind {
	type Err = ErrPack<ModelError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|kind| kind.as_str() == s).ok_or_else(|| {
			ErrPack::new(ModelError::UnknownModel, format!("unknown model kind `{s}`"))
		})
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconLoss {
	/// Gaussian decoder.
	#[default]
	Mse,
	/// Bernoulli decoder; the decoder outputs logits.
	Bce,
}

impl ReconLoss {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Mse => "mse",
			Self::Bce => "bce",
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimKind {
	#[default]
	Adam,
	AdamW,
	Sgd,
	RmsProp,
}

impl OptimKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Adam => "adam",
			Self::AdamW => "adamw",
			Self::Sgd => "sgd",
			Self::RmsProp => "rmsprop",
		}
	}
}

//--------------------------------------------------------------------------------------------------

fn default_lr() -> f64 {
	0.001
}

fn default_one() -> f64 {
	1.0
}

fn default_tc_beta() -> f64 {
	6.0
}

fn default_true() -> bool {
	true
}

fn default_categorical_dim() -> i64 {
	10
}

fn default_temperature_min() -> f64 {
	0.5
}

fn default_anneal_rate() -> f64 {
	3e-5
}

fn default_rnn_hidden_size() -> i64 {
	128
}

/// Hyper-parameters of a model. The variant specific fields are ignored by the
/// variants that don't use them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
	pub kind: ModelKind,

	/// `[channels, height, width]`
	pub input_size: Vec<i64>,
	pub architecture: String,
	pub latent_size: i64,

	#[serde(default)]
	pub recon_loss: ReconLoss,
	#[serde(default = "default_lr")]
	pub lr: f64,
	#[serde(default)]
	pub optim: OptimKind,
	#[serde(default)]
	pub weight_decay: f64,

	// VAE, DiscreteVAE, RecurrentDiscreteVAE
	#[serde(default = "default_one")]
	pub beta: f64,
	#[serde(default)]
	pub kl_warmup_steps: u64,

	// BetaTCVAE
	#[serde(default = "default_one")]
	pub tc_alpha: f64,
	#[serde(default = "default_tc_beta")]
	pub tc_beta: f64,
	#[serde(default = "default_one")]
	pub tc_gamma: f64,
	#[serde(default = "default_true")]
	pub mss: bool,

	// DiscreteVAE, RecurrentDiscreteVAE
	#[serde(default = "default_categorical_dim")]
	pub categorical_dim: i64,
	#[serde(default = "default_one")]
	pub temperature: f64,
	#[serde(default = "default_temperature_min")]
	pub temperature_min: f64,
	#[serde(default = "default_anneal_rate")]
	pub anneal_rate: f64,
	#[serde(default)]
	pub hard: bool,

	// RecurrentDiscreteVAE
	#[serde(default = "default_rnn_hidden_size")]
	pub rnn_hidden_size: i64,
}

impl ModelConfig {
	pub fn new(
		kind: ModelKind,
		input_size: [i64; 3],
		architecture: impl Into<String>,
		latent_size: i64,
	) -> Self {
		Self {
			kind,
			input_size: input_size.to_vec(),
			architecture: architecture.into(),
			latent_size,
			recon_loss: ReconLoss::default(),
			lr: default_lr(),
			optim: OptimKind::default(),
			weight_decay: 0.0,
			beta: 1.0,
			kl_warmup_steps: 0,
			tc_alpha: 1.0,
			tc_beta: default_tc_beta(),
			tc_gamma: 1.0,
			mss: true,
			categorical_dim: default_categorical_dim(),
			temperature: 1.0,
			temperature_min: default_temperature_min(),
			anneal_rate: default_anneal_rate(),
			hard: false,
			rnn_hidden_size: default_rnn_hidden_size(),
		}
	}

	/// Returns `[channels, height, width]`.
	pub fn image_shape(&self) -> Result<[i64; 3], ErrPack<ModelError>> {
		match self.input_size.as_slice() {
			&[c, h, w] if c > 0 && h > 0 && w > 0 => Ok([c, h, w]),
			_ => Err(invalid_config(format!(
				"input_size must be [channels, height, width] with positive entries, got {:?}",
				self.input_size
			))),
		}
	}

	pub fn validate(&self) -> Result<(), ErrPack<ModelError>> {
		self.image_shape()?;
		if self.latent_size <= 0 {
			return Err(invalid_config(format!(
				"latent_size must be positive, got {}",
				self.latent_size
			)));
		}
		if !(self.lr.is_finite() && self.lr > 0.0) {
			return Err(invalid_config(format!("lr must be positive, got {}", self.lr)));
		}
		if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
			return Err(invalid_config(format!(
				"weight_decay must be non-negative, got {}",
				self.weight_decay
			)));
		}
		if self.kind.is_discrete() {
			if self.categorical_dim < 2 {
				return Err(invalid_config(format!(
					"categorical_dim must be at least 2, got {}",
					self.categorical_dim
				)));
			}
			if self.kind == ModelKind::RecurrentDiscreteVae && self.rnn_hidden_size <= 0 {
				return Err(invalid_config(format!(
					"rnn_hidden_size must be positive, got {}",
					self.rnn_hidden_size
				)));
			}
			if !(self.temperature_min > 0.0 && self.temperature >= self.temperature_min) {
				return Err(invalid_config(format!(
					"need 0 < temperature_min <= temperature, got {} and {}",
					self.temperature_min, self.temperature
				)));
			}
		}
		Ok(())
	}

	/// Width of the code passed to the decoder.
	pub fn code_size(&self) -> i64 {
		if self.kind.is_discrete() {
			self.latent_size * self.categorical_dim
		} else {
			self.latent_size
		}
	}

	/// Flat view of the hyper-parameters for experiment loggers.
	pub fn hparams(&self) -> BTreeMap<String, String> {
		let mut map = BTreeMap::new();
		map.insert("kind".to_string(), self.kind.to_string());
		map.insert("input_size".to_string(), format!("{:?}", self.input_size));
		map.insert("architecture".to_string(), self.architecture.clone());
		map.insert("latent_size".to_string(), self.latent_size.to_string());
		map.insert("recon_loss".to_string(), self.recon_loss.as_str().to_string());
		map.insert("lr".to_string(), self.lr.to_string());
		map.insert("optim".to_string(), self.optim.as_str().to_string());
		map.insert("weight_decay".to_string(), self.weight_decay.to_string());
		match self.kind {
			ModelKind::Ae => {},
			ModelKind::Vae => {
				map.insert("beta".to_string(), self.beta.to_string());
				map.insert("kl_warmup_steps".to_string(), self.kl_warmup_steps.to_string());
			},
			ModelKind::BetaTcVae => {
				map.insert("tc_alpha".to_string(), self.tc_alpha.to_string());
				map.insert("tc_beta".to_string(), self.tc_beta.to_string());
				map.insert("tc_gamma".to_string(), self.tc_gamma.to_string());
				map.insert("mss".to_string(), self.mss.to_string());
				map.insert("kl_warmup_steps".to_string(), self.kl_warmup_steps.to_string());
			},
			ModelKind::DiscreteVae | ModelKind::RecurrentDiscreteVae => {
				if self.kind == ModelKind::RecurrentDiscreteVae {
					map.insert("rnn_hidden_size".to_string(), self.rnn_hidden_size.to_string());
				}
				map.insert("beta".to_string(), self.beta.to_string());
				map.insert("categorical_dim".to_string(), self.categorical_dim.to_string());
				map.insert("temperature".to_string(), self.temperature.to_string());
				map.insert("temperature_min".to_string(), self.temperature_min.to_string());
				map.insert("anneal_rate".to_string(), self.anneal_rate.to_string());
				map.insert("hard".to_string(), self.hard.to_string());
			},
		}
		map
	}

	pub fn to_toml(&self) -> Result<String, ErrPack<ModelError>> {
		Ok(toml::to_string(self)?)
	}

	pub fn from_toml(text: &str) -> Result<Self, ErrPack<ModelError>> {
		let config: Self = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
	#[default]
	Auto,
	Cpu,
	Cuda,
}

impl DeviceChoice {
	pub fn resolve(self) -> tch::Device {
		match self {
			Self::Auto => tch::Device::cuda_if_available(),
			Self::Cpu => tch::Device::Cpu,
			Self::Cuda => tch::Device::Cuda(0),
		}
	}
}

fn default_max_epochs() -> usize {
	10
}

fn default_batch_size() -> usize {
	64
}

fn default_log_every() -> u64 {
	50
}

fn default_num_sample_images() -> i64 {
	25
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
	#[serde(default = "default_max_epochs")]
	pub max_epochs: usize,
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
	#[serde(default)]
	pub device: DeviceChoice,
	#[serde(default)]
	pub seed: u64,
	#[serde(default)]
	pub checkpoint_dir: Option<PathBuf>,
	#[serde(default = "default_log_every")]
	pub log_every_n_steps: u64,
	#[serde(default)]
	pub grad_clip_norm: Option<f64>,
	#[serde(default)]
	pub early_stopping_patience: Option<usize>,
	#[serde(default = "default_num_sample_images")]
	pub num_sample_images: i64,
	#[serde(default = "default_true")]
	pub shuffle: bool,
}

impl Default for TrainerConfig {
	fn default() -> Self {
		Self {
			max_epochs: default_max_epochs(),
			batch_size: default_batch_size(),
			device: DeviceChoice::default(),
			seed: 0,
			checkpoint_dir: None,
			log_every_n_steps: default_log_every(),
			grad_clip_norm: None,
			early_stopping_patience: None,
			num_sample_images: default_num_sample_images(),
			shuffle: true,
		}
	}
}

impl TrainerConfig {
	pub fn validate(&self) -> Result<(), ErrPack<ModelError>> {
		if self.batch_size == 0 {
			return Err(invalid_config("batch_size must be positive"));
		}
		if self.log_every_n_steps == 0 {
			return Err(invalid_config("log_every_n_steps must be positive"));
		}
		if let Some(max_norm) = self.grad_clip_norm {
			if !(max_norm.is_finite() && max_norm > 0.0) {
				return Err(invalid_config(format!(
					"grad_clip_norm must be positive, got {max_norm}"
				)));
			}
		}
		Ok(())
	}
}

fn default_val_fraction() -> f64 {
	0.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
	#[serde(default)]
	pub path: Option<PathBuf>,
	#[serde(default = "default_val_fraction")]
	pub val_fraction: f64,
	#[serde(default)]
	pub test_path: Option<PathBuf>,
}

impl Default for DataConfig {
	fn default() -> Self {
		Self {
			path: None,
			val_fraction: default_val_fraction(),
			test_path: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
	pub model: ModelConfig,
	#[serde(default)]
	pub trainer: TrainerConfig,
	#[serde(default)]
	pub data: DataConfig,
}

impl ExperimentConfig {
	pub fn from_toml_str(text: &str) -> Result<Self, ErrPack<ModelError>> {
		let config: Self = toml::from_str(text)?;
		config.model.validate()?;
		config.trainer.validate()?;
		if !(0.0..1.0).contains(&config.data.val_fraction) {
			return Err(invalid_config(format!(
				"val_fraction must be in [0, 1), got {}",
				config.data.val_fraction
			)));
		}
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<Self, ErrPack<ModelError>> {
		let text = std::fs::read_to_string(path)?;
		Self::from_toml_str(&text)
	}
}

//--------------------------------------------------------------------------------------------------
