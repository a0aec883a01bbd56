//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use vaezoo::ErrPack;
use vaezoo::config::ExperimentConfig;
use vaezoo::data::TensorDataset;
use vaezoo::error::{ModelError, invalid_config};
use vaezoo::logger::ConsoleLogger;
use vaezoo::models::{build_model, load_model};
use vaezoo::rng::Rng;
use vaezoo::trainer::Trainer;

const HELP: &str = "\
USAGE: vaezoo train [OPTIONS] <CONFIG>
       vaezoo test [OPTIONS] --checkpoint <FILE> <CONFIG>

SUBCOMMANDS:
  train     Fit the model described by an experiment TOML file
  test      Evaluate a checkpoint on the test set
OPTIONS:
  --checkpoint <FILE>    Checkpoint to test (test) or to resume from (train)
  --synthetic <N>        Use N generated images when the config has no dataset
  -v                     More logging, repeatable
  -h, --help             Print this help menu
";

enum AppArgs {
	Help,
	Train { config: PathBuf, resume: Option<PathBuf>, synthetic: Option<usize> },
	Test { config: PathBuf, checkpoint: PathBuf, synthetic: Option<usize> },
}

fn arg_error(err: pico_args::Error) -> ErrPack<ModelError> {
	ErrPack::nested(ModelError::InvalidConfig, "bad command line", err)
}

fn parse_args() -> Result<(AppArgs, usize), ErrPack<ModelError>> {
	let mut args = pico_args::Arguments::from_env();
	let mut verbosity = 0;
	while args.contains("-v") {
		verbosity += 1;
	}
	if args.contains(["-h", "--help"]) {
		return Ok((AppArgs::Help, verbosity));
	}
	let subcommand = args.subcommand().map_err(arg_error)?;
	let checkpoint: Option<PathBuf> = args.opt_value_from_str("--checkpoint").map_err(arg_error)?;
	let synthetic: Option<usize> = args.opt_value_from_str("--synthetic").map_err(arg_error)?;
	let parsed = match subcommand.as_deref() {
		Some("train") => AppArgs::Train {
			config: args.free_from_str().map_err(arg_error)?,
			resume: checkpoint,
			synthetic,
		},
		Some("test") => {
			let Some(checkpoint) = checkpoint else {
				return Err(invalid_config("test needs --checkpoint <FILE>"));
			};
			AppArgs::Test { config: args.free_from_str().map_err(arg_error)?, checkpoint, synthetic }
		},
		Some(other) => return Err(invalid_config(format!("unknown subcommand `{other}`"))),
		None => AppArgs::Help,
	};
	let rest = args.finish();
	if !rest.is_empty() {
		return Err(invalid_config(format!("unexpected arguments: {rest:?}")));
	}
	Ok((parsed, verbosity))
}

fn load_dataset(
	path: Option<&Path>,
	synthetic: Option<usize>,
	input_size: [i64; 3],
	rng: &mut Rng,
) -> Result<TensorDataset, ErrPack<ModelError>> {
	match (path, synthetic) {
		(Some(path), _) => TensorDataset::load(path),
		(None, Some(n)) => {
			log::info!("generating {n} synthetic images of {input_size:?}");
			Ok(TensorDataset::synthetic(n, input_size, rng))
		},
		(None, None) => Err(invalid_config("no dataset: set data.path or pass --synthetic <N>")),
	}
}

fn train(config: &Path, resume: Option<&Path>, synthetic: Option<usize>) -> Result<(), ErrPack<ModelError>> {
	let experiment = ExperimentConfig::load(config)?;
	let device = experiment.trainer.device.resolve();
	let input_size = experiment.model.image_shape()?;
	let mut rng = Rng::from_seed(experiment.trainer.seed);

	let data = load_dataset(experiment.data.path.as_deref(), synthetic, input_size, &mut rng)?;
	let (train_set, val_set) = data.split(experiment.data.val_fraction, &mut rng);

	let mut model = build_model(&experiment.model, device)?;
	let logger = ConsoleLogger::new(model.name());
	let mut trainer = Trainer::new(experiment.trainer.clone(), Some(Box::new(logger)))?;
	if let Some(path) = resume {
		trainer.resume(&mut *model, path)?;
	}

	let summary = trainer.fit(&mut *model, &train_set, Some(&val_set))?;
	log::info!(
		"done after {} epochs ({} steps), best monitored loss {:?}",
		summary.epochs_run,
		summary.global_step,
		summary.best_metric
	);
	if let Some(best) = &summary.best_checkpoint {
		log::info!("best checkpoint: {}", best.display());
	}

	if let Some(test_path) = &experiment.data.test_path {
		let test_set = TensorDataset::load(test_path)?;
		trainer.test(&*model, &test_set)?;
	}
	Ok(())
}

fn test(config: &Path, checkpoint: &Path, synthetic: Option<usize>) -> Result<(), ErrPack<ModelError>> {
	let experiment = ExperimentConfig::load(config)?;
	let device = experiment.trainer.device.resolve();
	let (model, meta) = load_model(checkpoint, device)?;
	log::info!("loaded {} (epoch {}, step {})", meta.name, meta.epoch, meta.global_step);

	let mut rng = Rng::from_seed(experiment.trainer.seed);
	let path = experiment.data.test_path.as_deref().or(experiment.data.path.as_deref());
	let test_set = load_dataset(path, synthetic, meta.config.image_shape()?, &mut rng)?;

	let logger = ConsoleLogger::new(model.name());
	let mut trainer = Trainer::new(experiment.trainer.clone(), Some(Box::new(logger)))?;
	let metrics = trainer.test(&*model, &test_set)?;
	for (key, value) in &metrics {
		println!("{key}\t{value:.6}");
	}
	Ok(())
}

fn main() -> ExitCode {
	let (args, verbosity) = match parse_args() {
		Ok(parsed) => parsed,
		Err(err) => {
			eprintln!("Error: {}", err.message());
			eprintln!("{HELP}");
			return ExitCode::FAILURE;
		},
	};
	if let Err(err) = stderrlog::new().module("vaezoo").verbosity(2 + verbosity).init() {
		eprintln!("cannot initialize logging: {err}");
	}

	let result = match args {
		AppArgs::Help => {
			println!("{HELP}");
			Ok(())
		},
		AppArgs::Train { config, resume, synthetic } => train(&config, resume.as_deref(), synthetic),
		AppArgs::Test { config, checkpoint, synthetic } => test(&config, &checkpoint, synthetic),
	};
	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			log::error!("{err}");
			ExitCode::FAILURE
		},
	}
}
