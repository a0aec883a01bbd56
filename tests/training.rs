//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use tch::{Device, Kind, Tensor};

use vaezoo::checkpoint;
use vaezoo::config::{ExperimentConfig, ModelConfig, ModelKind, TrainerConfig};
use vaezoo::data::TensorDataset;
use vaezoo::logger::MemoryLogger;
use vaezoo::models::{EmbedMode, StepContext, build_model, load_model};
use vaezoo::rng::Rng;
use vaezoo::trainer::{BEST_CHECKPOINT, LAST_CHECKPOINT, Trainer, TrainerState};

fn scratch_dir(name: &str) -> PathBuf {
	let dir = std::env::temp_dir().join(format!("vaezoo-it-{}-{name}", std::process::id()));
	let _ = std::fs::remove_dir_all(&dir);
	dir
}

fn blobs(n: usize, seed: u64) -> TensorDataset {
	TensorDataset::synthetic(n, [1, 8, 8], &mut Rng::from_seed(seed))
}

#[test]
fn loss_decreases_for_every_kind() {
	for kind in ModelKind::ALL {
		let mut config = ModelConfig::new(kind, [1, 8, 8], "mlp-64", 4);
		config.categorical_dim = 4;
		config.rnn_hidden_size = 16;
		config.lr = 0.005;
		let mut model = build_model(&config, Device::Cpu).unwrap();

		let memory = Rc::new(RefCell::new(MemoryLogger::new()));
		let trainer_config = TrainerConfig {
			max_epochs: 15,
			batch_size: 16,
			log_every_n_steps: 1,
			..TrainerConfig::default()
		};
		let mut trainer = Trainer::new(trainer_config, Some(Box::new(Rc::clone(&memory)))).unwrap();
		let data = blobs(64, 1);
		trainer.fit(&mut *model, &data, None).unwrap();

		let epochs = memory.borrow().values("train_recon_loss_epoch");
		assert_eq!(epochs.len(), 15, "{kind}");
		let (first, last) = (epochs[0], epochs[epochs.len() - 1]);
		assert!(last < first, "{kind}: recon loss went from {first} to {last}");
	}
}

#[test]
fn checkpoints_round_trip_through_load_model() {
	let dir = scratch_dir("checkpoints");
	let config = ModelConfig::new(ModelKind::Vae, [1, 8, 8], "conv-4-8", 3);
	let mut model = build_model(&config, Device::Cpu).unwrap();
	let trainer_config = TrainerConfig {
		max_epochs: 2,
		batch_size: 8,
		checkpoint_dir: Some(dir.clone()),
		..TrainerConfig::default()
	};
	let mut trainer = Trainer::new(trainer_config, None).unwrap();
	let (train, val) = blobs(40, 2).split(0.2, &mut Rng::from_seed(3));
	let summary = trainer.fit(&mut *model, &train, Some(&val)).unwrap();

	let run_dir = dir.join(model.name());
	let last = run_dir.join(LAST_CHECKPOINT);
	assert!(last.exists());
	assert!(run_dir.join(BEST_CHECKPOINT).exists());
	assert_eq!(summary.last_checkpoint.as_deref(), Some(last.as_path()));

	let (loaded, meta) = load_model(&last, Device::Cpu).unwrap();
	assert_eq!(meta.epoch, 2);
	assert_eq!(meta.global_step, summary.global_step);
	assert_eq!(meta.name, model.name());
	assert_eq!(loaded.kind(), ModelKind::Vae);

	// evaluation is deterministic for a VAE, so both models must agree
	let x = Tensor::rand([3, 1, 8, 8], (Kind::Float, Device::Cpu));
	let a = model.embed(&x, EmbedMode::Latent).unwrap();
	let b = loaded.embed(&x, EmbedMode::Latent).unwrap();
	assert!(a.allclose(&b, 1e-6, 1e-6, false));
	let ctx = StepContext::inference();
	let ra = model.forward(&x, &ctx).unwrap().recon;
	let rb = loaded.forward(&x, &ctx).unwrap().recon;
	assert!(ra.allclose(&rb, 1e-6, 1e-6, false));

	std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn resume_continues_where_the_run_stopped() {
	let dir = scratch_dir("resume");
	let config = ModelConfig::new(ModelKind::Ae, [1, 8, 8], "mlp-16", 2);
	let data = blobs(16, 4);

	let mut model = build_model(&config, Device::Cpu).unwrap();
	let first = TrainerConfig {
		max_epochs: 1,
		batch_size: 8,
		checkpoint_dir: Some(dir.clone()),
		..TrainerConfig::default()
	};
	let mut trainer = Trainer::new(first.clone(), None).unwrap();
	trainer.fit(&mut *model, &data, None).unwrap();
	let run_dir = dir.join(model.name());
	let last = run_dir.join(LAST_CHECKPOINT);
	let best = run_dir.join(BEST_CHECKPOINT);
	let stored_best = trainer.best_metric().unwrap();

	let mut fresh = build_model(&config, Device::Cpu).unwrap();
	let mut trainer = Trainer::new(TrainerConfig { max_epochs: 3, ..first.clone() }, None).unwrap();
	let meta = trainer.resume(&mut *fresh, &last).unwrap();
	assert_eq!(meta.epoch, 1);
	assert_eq!(meta.best_metric, Some(stored_best));
	assert_eq!(trainer.global_step(), 2);
	assert_eq!(trainer.best_metric(), Some(stored_best));

	let summary = trainer.fit(&mut *fresh, &data, None).unwrap();
	assert_eq!(summary.epochs_run, 2);
	assert_eq!(summary.global_step, 6);
	assert!(summary.best_metric.unwrap() <= stored_best);
	assert_eq!(trainer.state(), TrainerState::Finished);

	// a stored best no epoch can beat, one epoch short of the patience
	let mut meta = checkpoint::read_meta(&last).unwrap();
	meta.best_metric = Some(-1.0);
	meta.bad_epochs = 1;
	checkpoint::save(&last, fresh.var_store(), &meta).unwrap();
	let best_bytes = std::fs::read(&best).unwrap();

	let patient = TrainerConfig { max_epochs: 10, early_stopping_patience: Some(2), ..first };
	let mut trainer = Trainer::new(patient, None).unwrap();
	trainer.resume(&mut *fresh, &last).unwrap();
	let summary = trainer.fit(&mut *fresh, &data, None).unwrap();
	assert_eq!(summary.epochs_run, 1);
	assert!(summary.stopped_early);
	assert_eq!(summary.best_metric, Some(-1.0));
	assert!(summary.best_checkpoint.is_none());
	assert_eq!(std::fs::read(&best).unwrap(), best_bytes);
	assert_eq!(checkpoint::read_meta(&last).unwrap().bad_epochs, 2);

	// a checkpoint of a different kind is refused
	let other = ModelConfig::new(ModelKind::Vae, [1, 8, 8], "mlp-16", 2);
	let mut other = build_model(&other, Device::Cpu).unwrap();
	assert!(trainer.resume(&mut *other, &last).is_err());

	std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_stage_logs_means_and_hparams() {
	let text = r#"
		[model]
		kind = "BetaTCVAE"
		input_size = [1, 8, 8]
		architecture = "conv-4"
		latent_size = 3

		[trainer]
		batch_size = 4
	"#;
	let experiment = ExperimentConfig::from_toml_str(text).unwrap();
	let model = build_model(&experiment.model, Device::Cpu).unwrap();
	let memory = Rc::new(RefCell::new(MemoryLogger::new()));
	let mut trainer =
		Trainer::new(experiment.trainer.clone(), Some(Box::new(Rc::clone(&memory)))).unwrap();

	let metrics = trainer.test(&*model, &blobs(10, 5)).unwrap();
	for key in ["test_loss", "test_recon_loss", "test_kl_loss", "test_mi_loss", "test_tc_loss", "test_dwkl_loss"] {
		assert!(metrics.contains_key(key), "{key}");
	}
	assert!(!metrics.contains_key("test_kl_weight"));

	let memory = memory.borrow();
	assert!(memory.images.is_empty());
	assert_eq!(memory.hparams.len(), 1);
	let (hparams, logged) = &memory.hparams[0];
	assert_eq!(hparams["kind"], "BetaTCVAE");
	assert_eq!(hparams["tc_beta"], "6");
	assert_eq!(logged, &metrics);
}
