//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tch::{Tensor, nn};

use crate::ErrPack;
use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{ReconLoss, TrainerConfig};
use crate::data::{Batch, TensorDataset};
use crate::error::{ModelError, checkpoint_error, invalid_input};
use crate::grid::{make_grid, tensor_to_array4};
use crate::logger::ExperimentLogger;
use crate::models::{AutoEncoderModel, LossDict, Stage, StepContext};
use crate::rng::Rng;

pub mod metrics;

use metrics::MeanAccumulator;

//--------------------------------------------------------------------------------------------------

pub const LAST_CHECKPOINT: &str = "last.safetensors";
pub const BEST_CHECKPOINT: &str = "best.safetensors";

const GRID_PADDING: usize = 2;
const GRID_PAD_VALUE: f32 = 1.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrainerState {
	Idle,
	Fitting { epoch: usize },
	Validating { epoch: usize },
	Testing,
	Finished,
	/// Early stopping or an aborted run.
	Stopped,
}

impl TrainerState {
	pub fn is_running(self) -> bool {
		matches!(self, Self::Fitting { .. } | Self::Validating { .. } | Self::Testing)
	}
}

/// Result of one `step`.
#[derive(Debug)]
pub struct StepOutput {
	pub losses: LossDict,
	/// `{stage}_{key}` -> detached value.
	pub log: Vec<(String, f64)>,
}

#[derive(Debug, Default, Clone)]
pub struct FitSummary {
	pub epochs_run: usize,
	pub global_step: u64,
	pub best_metric: Option<f64>,
	pub stopped_early: bool,
	/// Epoch means of the last epoch.
	pub train_metrics: BTreeMap<String, f64>,
	pub val_metrics: BTreeMap<String, f64>,
	pub last_checkpoint: Option<PathBuf>,
	pub best_checkpoint: Option<PathBuf>,
}

/// Reconstructions as pixel values. A `bce` model outputs logits.
pub fn displayed_recon(model: &dyn AutoEncoderModel, recon: &Tensor) -> Tensor {
	let recon = recon.detach();
	match model.config().recon_loss {
		ReconLoss::Bce => recon.sigmoid(),
		ReconLoss::Mse => recon,
	}
}

//--------------------------------------------------------------------------------------------------

pub struct Trainer {
	config: TrainerConfig,
	logger: Option<Box<dyn ExperimentLogger>>,
	state: TrainerState,
	rng: Rng,
	global_step: u64,
	/// Completed epochs.
	epoch: usize,
	best: Option<f64>,
	bad_epochs: usize,
}

impl Trainer {
	pub fn new(
		config: TrainerConfig,
		logger: Option<Box<dyn ExperimentLogger>>,
	) -> Result<Self, ErrPack<ModelError>> {
		config.validate()?;
		tch::manual_seed(config.seed as i64);
		let rng = Rng::from_seed(config.seed);
		Ok(Self {
			config,
			logger,
			state: TrainerState::Idle,
			rng,
			global_step: 0,
			epoch: 0,
			best: None,
			bad_epochs: 0,
		})
	}

	pub fn config(&self) -> &TrainerConfig {
		&self.config
	}

	pub fn state(&self) -> TrainerState {
		self.state
	}

	pub fn global_step(&self) -> u64 {
		self.global_step
	}

	pub fn epoch(&self) -> usize {
		self.epoch
	}

	pub fn best_metric(&self) -> Option<f64> {
		self.best
	}

	pub fn logger_mut(&mut self) -> Option<&mut (dyn ExperimentLogger + 'static)> {
		self.logger.as_deref_mut()
	}

	fn log_metrics(&mut self, metrics: &[(String, f64)]) -> Result<(), ErrPack<ModelError>> {
		if let Some(logger) = &mut self.logger {
			if !metrics.is_empty() {
				logger.log_metrics(metrics, self.global_step)?;
			}
		}
		Ok(())
	}

	//----------------------------------------------------------------------------------------------

	/// Forward pass and loss for one batch. On the first batch of a train or val
	/// epoch, input and reconstruction grids go to the logger.
	pub fn step(
		&mut self,
		model: &dyn AutoEncoderModel,
		batch: &Batch,
		batch_idx: usize,
		ctx: &StepContext,
	) -> Result<StepOutput, ErrPack<ModelError>> {
		let out = model.forward(&batch.x, ctx)?;
		let losses = model.compute_loss(&batch.x, &out, ctx)?;
		let log = losses.to_log(ctx.stage);

		if batch_idx == 0 && self.logger.is_some() && ctx.stage != Stage::Test {
			self.sample_images(model, &batch.x, &out.recon, ctx)?;
		}
		Ok(StepOutput { losses, log })
	}

	fn sample_images(
		&mut self,
		model: &dyn AutoEncoderModel,
		inputs: &Tensor,
		recon: &Tensor,
		ctx: &StepContext,
	) -> Result<(), ErrPack<ModelError>> {
		let Some(logger) = self.logger.as_mut() else {
			return Ok(());
		};
		let num = self.config.num_sample_images;
		let n = num.min(inputs.size()[0]);
		if n <= 0 {
			return Ok(());
		}
		let inputs = inputs.detach().narrow(0, 0, n);
		let recon = displayed_recon(model, &recon.narrow(0, 0, n));

		let nrow = ((num as f64).sqrt().floor() as usize).max(1);
		let caption = format!("epoch_{}", ctx.epoch);
		let inputs = make_grid(tensor_to_array4(&inputs)?.view(), nrow, GRID_PADDING, GRID_PAD_VALUE, true)?;
		let recon = make_grid(tensor_to_array4(&recon)?.view(), nrow, GRID_PADDING, GRID_PAD_VALUE, true)?;
		logger.log_image(&format!("input_{}", ctx.stage), &inputs, &caption)?;
		logger.log_image(&format!("recon_{}", ctx.stage), &recon, &caption)?;
		Ok(())
	}

	//----------------------------------------------------------------------------------------------

	fn context(&self, stage: Stage, data: &TensorDataset) -> StepContext {
		StepContext {
			stage,
			global_step: self.global_step,
			epoch: self.epoch,
			dataset_size: data.len(),
		}
	}

	fn train_epoch(
		&mut self,
		model: &dyn AutoEncoderModel,
		opt: &mut nn::Optimizer,
		data: &TensorDataset,
	) -> Result<BTreeMap<String, f64>, ErrPack<ModelError>> {
		let device = model.device();
		let min_batch = model.base().arch.min_train_batch.max(1) as usize;
		let batches: Vec<Batch> = data
			.batches(self.config.batch_size, self.config.shuffle, &mut self.rng)
			.min_batch_size(min_batch)
			.collect();

		let mut acc = MeanAccumulator::new();
		for (batch_idx, batch) in batches.iter().enumerate() {
			let batch = batch.to_device(device);
			let ctx = self.context(Stage::Train, data);
			let out = self.step(model, &batch, batch_idx, &ctx)?;

			let loss = out.losses.loss();
			let value = loss.double_value(&[]);
			if !value.is_finite() {
				return Err(ErrPack::new(
					ModelError::NonFiniteLoss,
					format!("loss is {value} at step {}", self.global_step),
				));
			}
			opt.zero_grad();
			loss.backward();
			if let Some(max_norm) = self.config.grad_clip_norm {
				opt.clip_grad_norm(max_norm);
			}
			opt.step();

			if self.global_step % self.config.log_every_n_steps == 0 {
				self.log_metrics(&out.log)?;
			}
			self.global_step += 1;
			acc.add_all(&out.log, batch.len() as f64);
		}
		Ok(acc.means())
	}

	/// Runs `stage` over `data` without gradients. Val means are weighted by batch
	/// size, test means are plain per-step means.
	fn evaluate(
		&mut self,
		model: &dyn AutoEncoderModel,
		data: &TensorDataset,
		stage: Stage,
	) -> Result<BTreeMap<String, f64>, ErrPack<ModelError>> {
		let _guard = tch::no_grad_guard();
		let device = model.device();
		let batches: Vec<Batch> = data.batches(self.config.batch_size, false, &mut self.rng).collect();

		let mut acc = MeanAccumulator::new();
		for (batch_idx, batch) in batches.iter().enumerate() {
			let batch = batch.to_device(device);
			let ctx = self.context(stage, data);
			let out = self.step(model, &batch, batch_idx, &ctx)?;
			let weight = if stage == Stage::Test { 1.0 } else { batch.len() as f64 };
			acc.add_all(&out.log, weight);
		}
		Ok(acc.means())
	}

	/// Validation epoch. Logs and returns the means of every `val_*` value.
	pub fn validate(
		&mut self,
		model: &dyn AutoEncoderModel,
		data: &TensorDataset,
	) -> Result<BTreeMap<String, f64>, ErrPack<ModelError>> {
		let previous = self.state;
		if let TrainerState::Fitting { epoch } = previous {
			self.state = TrainerState::Validating { epoch };
		}
		let means = self.evaluate(model, data, Stage::Val);
		self.state = previous;
		let means = means?;

		let values: Vec<(String, f64)> = means.iter().map(|(k, v)| (k.clone(), *v)).collect();
		self.log_metrics(&values)?;
		Ok(means)
	}

	/// Test epoch. Logs the mean of every loss term, then the hyper-parameters with
	/// those metrics.
	pub fn test(
		&mut self,
		model: &dyn AutoEncoderModel,
		data: &TensorDataset,
	) -> Result<BTreeMap<String, f64>, ErrPack<ModelError>> {
		if self.state.is_running() {
			return Err(invalid_input(format!("cannot test while {:?}", self.state)));
		}
		if data.is_empty() {
			return Err(invalid_input("test set is empty"));
		}
		let previous = self.state;
		self.state = TrainerState::Testing;
		let means = self.evaluate(model, data, Stage::Test);
		self.state = previous;

		let metrics: BTreeMap<String, f64> =
			means?.into_iter().filter(|(k, _)| k.contains("loss")).collect();
		let values: Vec<(String, f64)> = metrics.iter().map(|(k, v)| (k.clone(), *v)).collect();
		self.log_metrics(&values)?;

		if let Some(logger) = &mut self.logger {
			if let Err(err) = logger.log_hparams(&model.config().hparams(), &metrics) {
				log::warn!("Failed to add hparams: {err}");
			}
		}
		Ok(metrics)
	}

	//----------------------------------------------------------------------------------------------

	/// Trains from the current epoch up to `max_epochs`, validating after every epoch
	/// when `val` is given.
	pub fn fit(
		&mut self,
		model: &mut dyn AutoEncoderModel,
		train: &TensorDataset,
		val: Option<&TensorDataset>,
	) -> Result<FitSummary, ErrPack<ModelError>> {
		if self.state.is_running() {
			return Err(invalid_input(format!("cannot fit while {:?}", self.state)));
		}
		if train.is_empty() {
			return Err(invalid_input("training set is empty"));
		}
		let result = self.fit_epochs(model, train, val);
		match &result {
			Ok(summary) if summary.stopped_early => self.state = TrainerState::Stopped,
			Ok(_) => self.state = TrainerState::Finished,
			Err(err) => {
				log::warn!("training aborted: {err}");
				self.state = TrainerState::Stopped;
			},
		}
		result
	}

	fn fit_epochs(
		&mut self,
		model: &mut dyn AutoEncoderModel,
		train: &TensorDataset,
		val: Option<&TensorDataset>,
	) -> Result<FitSummary, ErrPack<ModelError>> {
		let mut opt = model.configure_optimizer()?;
		let name = model.name();
		let checkpoint_dir = self.config.checkpoint_dir.as_ref().map(|dir| dir.join(&name));
		let val = val.filter(|v| !v.is_empty());
		log::info!(
			"fitting {name}: {} train / {} val samples, epochs {}..{}",
			train.len(),
			val.map_or(0, TensorDataset::len),
			self.epoch,
			self.config.max_epochs
		);

		let mut summary = FitSummary::default();
		for epoch in self.epoch..self.config.max_epochs {
			self.state = TrainerState::Fitting { epoch };
			let train_means = self.train_epoch(&*model, &mut opt, train)?;
			let epoch_values: Vec<(String, f64)> =
				train_means.iter().map(|(k, v)| (format!("{k}_epoch"), *v)).collect();
			self.log_metrics(&epoch_values)?;

			let val_means = match val {
				Some(val) => self.validate(&*model, val)?,
				None => BTreeMap::new(),
			};
			self.epoch = epoch + 1;

			let monitored = val_means.get("val_loss").or_else(|| train_means.get("train_loss")).copied();
			let improved = match (monitored, self.best) {
				(Some(m), Some(best)) => m < best,
				(Some(_), None) => true,
				(None, _) => false,
			};
			if improved {
				self.best = monitored;
				self.bad_epochs = 0;
			} else {
				self.bad_epochs += 1;
			}

			if let Some(dir) = &checkpoint_dir {
				let meta = CheckpointMeta {
					config: model.config().clone(),
					name: name.clone(),
					epoch: self.epoch,
					global_step: self.global_step,
					best_metric: self.best,
					bad_epochs: self.bad_epochs,
				};
				let last = dir.join(LAST_CHECKPOINT);
				checkpoint::save(&last, model.var_store(), &meta)?;
				summary.last_checkpoint = Some(last);
				if improved {
					let best = dir.join(BEST_CHECKPOINT);
					checkpoint::save(&best, model.var_store(), &meta)?;
					summary.best_checkpoint = Some(best);
				}
			}

			log::info!(
				"epoch {epoch}: train_loss={:.5} val_loss={}",
				train_means.get("train_loss").copied().unwrap_or(f64::NAN),
				val_means.get("val_loss").map_or_else(|| "-".to_string(), |v| format!("{v:.5}")),
			);
			summary.epochs_run += 1;
			summary.train_metrics = train_means;
			summary.val_metrics = val_means;

			if let Some(patience) = self.config.early_stopping_patience {
				if !improved && self.bad_epochs >= patience {
					log::info!("early stopping after {} epochs without improvement", self.bad_epochs);
					summary.stopped_early = true;
					break;
				}
			}
		}

		summary.global_step = self.global_step;
		summary.best_metric = self.best;
		Ok(summary)
	}

	/// Restores weights, epoch, global step and early-stopping state from a checkpoint
	/// of the same kind of model. Optimizer state starts fresh.
	pub fn resume(
		&mut self,
		model: &mut dyn AutoEncoderModel,
		path: &Path,
	) -> Result<CheckpointMeta, ErrPack<ModelError>> {
		if self.state.is_running() {
			return Err(invalid_input(format!("cannot resume while {:?}", self.state)));
		}
		let stored = checkpoint::read_meta(path)?;
		if stored.config.kind != model.kind() {
			return Err(checkpoint_error(format!(
				"{} holds a {} model, not {}",
				path.display(),
				stored.config.kind,
				model.kind()
			)));
		}
		let meta = checkpoint::load(path, model.var_store_mut())?;
		self.epoch = meta.epoch;
		self.global_step = meta.global_step;
		self.best = meta.best_metric;
		self.bad_epochs = meta.bad_epochs;
		log::info!(
			"resumed {} at epoch {} step {} (best {:?}, {} epochs without improvement)",
			meta.name,
			meta.epoch,
			meta.global_step,
			meta.best_metric,
			meta.bad_epochs
		);
		Ok(meta)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use tch::Device;

	use super::*;
	use crate::config::{ModelConfig, ModelKind};
	use crate::logger::MemoryLogger;
	use crate::models::build_model;

	fn trainer_config() -> TrainerConfig {
		TrainerConfig {
			max_epochs: 2,
			batch_size: 8,
			log_every_n_steps: 1,
			num_sample_images: 4,
			..TrainerConfig::default()
		}
	}

	fn data(n: usize) -> TensorDataset {
		TensorDataset::synthetic(n, [1, 8, 8], &mut Rng::from_seed(11))
	}

	fn trainer_with_memory(config: TrainerConfig) -> (Trainer, Rc<RefCell<MemoryLogger>>) {
		let memory = Rc::new(RefCell::new(MemoryLogger::new()));
		let trainer = Trainer::new(config, Some(Box::new(Rc::clone(&memory)))).unwrap();
		(trainer, memory)
	}

	#[test]
	fn test_step_logs_prefixed_keys_and_images() {
		let config = ModelConfig::new(ModelKind::Vae, [1, 8, 8], "mlp-16", 2);
		let model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) = trainer_with_memory(trainer_config());
		let data = data(6);
		let batch = data.batches(6, false, &mut Rng::from_seed(0)).next().unwrap();

		let ctx = StepContext { stage: Stage::Val, global_step: 0, epoch: 3, dataset_size: 6 };
		let out = trainer.step(&*model, &batch, 0, &ctx).unwrap();
		let keys: Vec<&str> = out.log.iter().map(|(k, _)| k.as_str()).collect();
		assert!(keys.contains(&"val_loss"));
		assert!(keys.contains(&"val_recon_loss"));
		assert!(keys.contains(&"val_kl_loss"));

		let memory = memory.borrow();
		assert_eq!(memory.images.len(), 2);
		assert_eq!(memory.images[0].key, "input_val");
		assert_eq!(memory.images[1].key, "recon_val");
		assert_eq!(memory.images[0].caption, "epoch_3");
		// four 8x8 images, two per row
		assert_eq!(memory.images[0].grid.dim(), (3, 2 * 10 + 2, 2 * 10 + 2));
	}

	#[test]
	fn test_no_images_for_test_or_later_batches() {
		let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-16", 2);
		let model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) = trainer_with_memory(trainer_config());
		let data = data(4);
		let batch = data.batches(4, false, &mut Rng::from_seed(0)).next().unwrap();

		let test_ctx = StepContext { stage: Stage::Test, global_step: 0, epoch: 0, dataset_size: 4 };
		trainer.step(&*model, &batch, 0, &test_ctx).unwrap();
		let train_ctx = StepContext { stage: Stage::Train, ..test_ctx };
		trainer.step(&*model, &batch, 1, &train_ctx).unwrap();
		assert!(memory.borrow().images.is_empty());
	}

	#[test]
	fn test_fit_then_test() {
		let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-32", 4);
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) = trainer_with_memory(trainer_config());
		let (train, val) = data(40).split(0.2, &mut Rng::from_seed(5));

		let summary = trainer.fit(&mut *model, &train, Some(&val)).unwrap();
		assert_eq!(trainer.state(), TrainerState::Finished);
		assert_eq!(summary.epochs_run, 2);
		assert_eq!(summary.global_step, 2 * 4);
		assert_eq!(trainer.epoch(), 2);
		assert!(summary.val_metrics.contains_key("val_loss"));
		assert!(summary.best_metric.is_some());

		let metrics = trainer.test(&*model, &val).unwrap();
		assert_eq!(
			metrics.keys().cloned().collect::<Vec<_>>(),
			vec!["test_loss".to_string(), "test_recon_loss".to_string()]
		);
		assert_eq!(trainer.state(), TrainerState::Finished);

		let memory = memory.borrow();
		assert_eq!(memory.values("train_loss").len(), 8);
		assert_eq!(memory.values("val_loss").len(), 2);
		assert_eq!(memory.values("train_loss_epoch").len(), 2);
		assert_eq!(memory.hparams.len(), 1);
		assert_eq!(memory.hparams[0].0["kind"], "AE");
	}

	#[test]
	fn test_failing_hparams_is_not_an_error() {
		let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-8", 2);
		let model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) = trainer_with_memory(trainer_config());
		memory.borrow_mut().fail_hparams = true;
		let metrics = trainer.test(&*model, &data(5)).unwrap();
		assert!(metrics.contains_key("test_loss"));
		assert_eq!(memory.borrow().last("test_loss"), metrics.get("test_loss").copied());
	}

	#[test]
	fn test_non_finite_loss_stops() {
		let mut config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-8", 2);
		config.lr = 1e30;
		config.optim = crate::config::OptimKind::Sgd;
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let mut trainer = Trainer::new(
			TrainerConfig { max_epochs: 50, batch_size: 4, ..TrainerConfig::default() },
			None,
		)
		.unwrap();
		let err = trainer.fit(&mut *model, &data(8), None).unwrap_err();
		assert_eq!(err.code, ModelError::NonFiniteLoss);
		assert_eq!(trainer.state(), TrainerState::Stopped);
	}

	#[test]
	fn test_early_stopping() {
		let mut config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-8", 2);
		// updates this small leave the f32 weights unchanged
		config.lr = 1e-30;
		config.optim = crate::config::OptimKind::Sgd;
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let mut trainer = Trainer::new(
			TrainerConfig {
				max_epochs: 10,
				batch_size: 4,
				early_stopping_patience: Some(2),
				..TrainerConfig::default()
			},
			None,
		)
		.unwrap();
		let data = data(8);
		let summary = trainer.fit(&mut *model, &data, Some(&data)).unwrap();
		assert!(summary.stopped_early);
		assert_eq!(summary.epochs_run, 3);
		assert_eq!(trainer.state(), TrainerState::Stopped);
	}

	#[test]
	fn test_one_item_tail_on_one_pixel_features() {
		// 8x8 through three stride-2 layers leaves a 1x1 map; 9 items in batches of 8
		// would leave one item for the last batch norm
		let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "conv-4-8-16", 2);
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let mut trainer = Trainer::new(trainer_config(), None).unwrap();
		let summary = trainer.fit(&mut *model, &data(9), None).unwrap();
		assert_eq!(summary.epochs_run, 2);
		assert_eq!(summary.global_step, 2);

		let x = Tensor::rand([1, 1, 8, 8], (tch::Kind::Float, Device::Cpu));
		let train_ctx = StepContext { stage: Stage::Train, global_step: 0, epoch: 0, dataset_size: 1 };
		let err = model.forward(&x, &train_ctx).unwrap_err();
		assert_eq!(err.code, ModelError::InvalidInput);
		assert!(model.forward(&x, &StepContext::inference()).is_ok());

		let mut trainer = Trainer::new(trainer_config(), None).unwrap();
		let err = trainer.fit(&mut *model, &data(1), None).unwrap_err();
		assert_eq!(err.code, ModelError::InvalidInput);
	}

	#[test]
	fn test_grad_clip_bounds_the_update() {
		let mut config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-8", 2);
		config.lr = 1.0;
		config.optim = crate::config::OptimKind::Sgd;
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let before: BTreeMap<String, Tensor> =
			model.var_store().variables().into_iter().map(|(k, v)| (k, v.detach().copy())).collect();

		let max_norm = 0.01;
		let mut trainer = Trainer::new(
			TrainerConfig {
				max_epochs: 1,
				batch_size: 4,
				grad_clip_norm: Some(max_norm),
				..TrainerConfig::default()
			},
			None,
		)
		.unwrap();
		trainer.fit(&mut *model, &data(4), None).unwrap();
		assert_eq!(trainer.global_step(), 1);

		// plain SGD with lr 1 moves the weights by exactly the clipped gradient
		let mut squared = 0.0;
		for (name, after) in model.var_store().variables() {
			let delta = &after.detach() - &before[&name];
			squared += delta.square().sum(tch::Kind::Double).double_value(&[]);
		}
		let moved = squared.sqrt();
		assert!(moved > 0.0);
		assert!(moved <= max_norm + 1e-5, "update norm {moved}");
	}

	#[test]
	fn test_log_cadence() {
		let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-8", 2);
		let mut model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) =
			trainer_with_memory(TrainerConfig { log_every_n_steps: 3, ..trainer_config() });
		let summary = trainer.fit(&mut *model, &data(32), None).unwrap();
		assert_eq!(summary.global_step, 8);

		let memory = memory.borrow();
		let steps: Vec<u64> =
			memory.metrics.iter().filter(|(_, key, _)| key == "train_loss").map(|(step, ..)| *step).collect();
		assert_eq!(steps, vec![0, 3, 6]);
		assert_eq!(memory.values("train_loss_epoch").len(), 2);
	}

	#[test]
	fn test_bce_recon_grid_shows_probabilities() {
		let mut config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-16", 2);
		config.recon_loss = ReconLoss::Bce;
		let model = build_model(&config, Device::Cpu).unwrap();
		let (mut trainer, memory) = trainer_with_memory(trainer_config());
		let data = data(4);
		let batch = data.batches(4, false, &mut Rng::from_seed(0)).next().unwrap();

		let ctx = StepContext { stage: Stage::Val, global_step: 0, epoch: 0, dataset_size: 4 };
		let logits = model.forward(&batch.x, &ctx).unwrap().recon;
		let shown = displayed_recon(&*model, &logits);
		assert!(shown.allclose(&logits.sigmoid(), 1e-6, 1e-6, false));

		trainer.step(&*model, &batch, 0, &ctx).unwrap();
		let expected =
			make_grid(tensor_to_array4(&shown).unwrap().view(), 2, GRID_PADDING, GRID_PAD_VALUE, true).unwrap();
		let memory = memory.borrow();
		let logged = &memory.images[1];
		assert_eq!(logged.key, "recon_val");
		assert_eq!(logged.grid.dim(), expected.dim());
		for (a, b) in logged.grid.iter().zip(expected.iter()) {
			assert!((a - b).abs() < 1e-5);
		}

		let mse = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-16", 2);
		let mse = build_model(&mse, Device::Cpu).unwrap();
		let recon = mse.forward(&batch.x, &ctx).unwrap().recon;
		assert!(displayed_recon(&*mse, &recon).equal(&recon));
	}
}
