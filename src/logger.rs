//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::BTreeMap;

use ndarray::Array3;

use crate::ErrPack;
use crate::error::ModelError;

//--------------------------------------------------------------------------------------------------

/// Sink for metrics, sample images and hyper-parameters produced by the trainer.
pub trait ExperimentLogger {
	fn log_metrics(&mut self, metrics: &[(String, f64)], step: u64) -> Result<(), ErrPack<ModelError>>;

	/// `grid` is `[3, H, W]` with values in `[0, 1]`.
	fn log_image(&mut self, key: &str, grid: &Array3<f32>, caption: &str) -> Result<(), ErrPack<ModelError>>;

	fn log_hparams(
		&mut self,
		hparams: &BTreeMap<String, String>,
		metrics: &BTreeMap<String, f64>,
	) -> Result<(), ErrPack<ModelError>>;
}

//--------------------------------------------------------------------------------------------------

/// Writes everything through the `log` facade.
#[derive(Debug, Default)]
pub struct ConsoleLogger {
	run: String,
}

impl ConsoleLogger {
	pub fn new(run: impl Into<String>) -> Self {
		Self { run: run.into() }
	}
}

fn format_metrics<'a>(metrics: impl Iterator<Item = (&'a String, &'a f64)>) -> String {
	metrics.map(|(k, v)| format!("{k}={v:.5}")).collect::<Vec<_>>().join(" ")
}

impl ExperimentLogger for ConsoleLogger {
	fn log_metrics(&mut self, metrics: &[(String, f64)], step: u64) -> Result<(), ErrPack<ModelError>> {
		let text = format_metrics(metrics.iter().map(|(k, v)| (k, v)));
		log::info!("[{}] step {step}: {text}", self.run);
		Ok(())
	}

	fn log_image(&mut self, key: &str, grid: &Array3<f32>, caption: &str) -> Result<(), ErrPack<ModelError>> {
		let (c, h, w) = grid.dim();
		log::debug!("[{}] image {key} ({caption}): {c}x{h}x{w}", self.run);
		Ok(())
	}

	fn log_hparams(
		&mut self,
		hparams: &BTreeMap<String, String>,
		metrics: &BTreeMap<String, f64>,
	) -> Result<(), ErrPack<ModelError>> {
		let params = hparams.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ");
		log::info!("[{}] hparams: {params}", self.run);
		log::info!("[{}] results: {}", self.run, format_metrics(metrics.iter()));
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoggedImage {
	pub key: String,
	pub caption: String,
	pub grid: Array3<f32>,
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
	pub metrics: Vec<(u64, String, f64)>,
	pub images: Vec<LoggedImage>,
	pub hparams: Vec<(BTreeMap<String, String>, BTreeMap<String, f64>)>,
	/// Makes `log_hparams` fail.
	pub fail_hparams: bool,
}

impl MemoryLogger {
	pub fn new() -> Self {
		Self::default()
	}

	/// Every value logged under `key`, in order.
	pub fn values(&self, key: &str) -> Vec<f64> {
		self.metrics.iter().filter(|(_, k, _)| k == key).map(|(_, _, v)| *v).collect()
	}

	pub fn last(&self, key: &str) -> Option<f64> {
		self.metrics.iter().rev().find(|(_, k, _)| k == key).map(|(_, _, v)| *v)
	}
}

impl ExperimentLogger for MemoryLogger {
	fn log_metrics(&mut self, metrics: &[(String, f64)], step: u64) -> Result<(), ErrPack<ModelError>> {
		self.metrics.extend(metrics.iter().map(|(k, v)| (step, k.clone(), *v)));
		Ok(())
	}

	fn log_image(&mut self, key: &str, grid: &Array3<f32>, caption: &str) -> Result<(), ErrPack<ModelError>> {
		self.images.push(LoggedImage {
			key: key.to_string(),
			caption: caption.to_string(),
			grid: grid.clone(),
		});
		Ok(())
	}

	fn log_hparams(
		&mut self,
		hparams: &BTreeMap<String, String>,
		metrics: &BTreeMap<String, f64>,
	) -> Result<(), ErrPack<ModelError>> {
		if self.fail_hparams {
			return Err(ErrPack::new(ModelError::IOError, "hparams sink is unavailable"));
		}
		self.hparams.push((hparams.clone(), metrics.clone()));
		Ok(())
	}
}

/// Lets a caller keep access to a `MemoryLogger` that was handed to the trainer.
impl<T: ExperimentLogger + ?Sized> ExperimentLogger for std::rc::Rc<std::cell::RefCell<T>> {
	fn log_metrics(&mut self, metrics: &[(String, f64)], step: u64) -> Result<(), ErrPack<ModelError>> {
		self.borrow_mut().log_metrics(metrics, step)
	}

	fn log_image(&mut self, key: &str, grid: &Array3<f32>, caption: &str) -> Result<(), ErrPack<ModelError>> {
		self.borrow_mut().log_image(key, grid, caption)
	}

	fn log_hparams(
		&mut self,
		hparams: &BTreeMap<String, String>,
		metrics: &BTreeMap<String, f64>,
	) -> Result<(), ErrPack<ModelError>> {
		self.borrow_mut().log_hparams(hparams, metrics)
	}
}

//--------------------------------------------------------------------------------------------------
