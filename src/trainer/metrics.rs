//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::BTreeMap;

/// Running weighted means of named scalars.
#[derive(Debug, Default, Clone)]
pub struct MeanAccumulator {
	sums: BTreeMap<String, (f64, f64)>,
}

impl MeanAccumulator {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, key: &str, value: f64, weight: f64) {
		let entry = self.sums.entry(key.to_string()).or_insert((0.0, 0.0));
		entry.0 += value * weight;
		entry.1 += weight;
	}

	pub fn add_all(&mut self, values: &[(String, f64)], weight: f64) {
		for (key, value) in values {
			self.add(key, *value, weight);
		}
	}

	pub fn is_empty(&self) -> bool {
		self.sums.is_empty()
	}

	pub fn means(&self) -> BTreeMap<String, f64> {
		self.sums
			.iter()
			.filter(|(_, (_, w))| *w > 0.0)
			.map(|(k, (s, w))| (k.clone(), s / w))
			.collect()
	}
}
