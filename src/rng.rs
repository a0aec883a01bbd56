//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// State initialization constant ("expand 32-byte k")
const CONST: [u32; 4] = [0x_6170_7865, 0x_3320_646e, 0x_7962_2d32, 0x_6b20_6574];

const STATE_WORDS: usize = 16;

/// ChaCha based generator. Used for everything on the host side that must be
/// reproducible from `TrainerConfig::seed`: shuffling, splits, synthetic data.
pub struct Rng {
	state: [u32; STATE_WORDS],
	block: [u32; STATE_WORDS],
	used: usize,
}

impl Default for Rng {
	fn default() -> Self {
		Self::from_seed(0)
	}
}

#[allow(clippy::indexing_slicing)]
impl Rng {
	pub fn new(key: &[u32; 8], nonce: u64) -> Self {
		#[rustfmt::skip]
		let state = [
			CONST[0], CONST[1], CONST[2], CONST[3],
			key[0], key[1], key[2], key[3],
			key[4], key[5], key[6], key[7],
			0, 0, nonce as u32, (nonce >> 32) as u32,
		];
		Self { state, block: [0; STATE_WORDS], used: STATE_WORDS }
	}

	/// Expands a 64-bit seed into a key with splitmix64.
	pub fn from_seed(seed: u64) -> Self {
		let mut x = seed;
		let mut key = [0_u32; 8];
		for pair in key.chunks_exact_mut(2) {
			x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
			let mut z = x;
			z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
			z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
			z ^= z >> 31;
			pair[0] = z as u32;
			pair[1] = (z >> 32) as u32;
		}
		Self::new(&key, 0)
	}

	// generates a block of random numbers
	#[inline(never)]
	fn get_block(&mut self) -> [u32; STATE_WORDS] {
		let mut result = self.state;

		// do 7 double rounds, i.e. 14 rounds
		for _ in 0..7 {
			Self::quarter_round(0, 4, 8, 12, &mut result);
			Self::quarter_round(1, 5, 9, 13, &mut result);
			Self::quarter_round(2, 6, 10, 14, &mut result);
			Self::quarter_round(3, 7, 11, 15, &mut result);

			Self::quarter_round(0, 5, 10, 15, &mut result);
			Self::quarter_round(1, 6, 11, 12, &mut result);
			Self::quarter_round(2, 7, 8, 13, &mut result);
			Self::quarter_round(3, 4, 9, 14, &mut result);
		}

		// add original state
		for (r, s) in result.iter_mut().zip(self.state.iter()) {
			*r = r.wrapping_add(*s);
		}

		// increment counter
		let (t, c) = self.state[12].overflowing_add(1);
		self.state[12] = t;
		self.state[13] = self.state[13].wrapping_add(u32::from(c));

		result
	}

	#[inline(always)]
	fn quarter_round(a: usize, b: usize, c: usize, d: usize, state: &mut [u32; STATE_WORDS]) {
		state[a] = state[a].wrapping_add(state[b]);
		state[d] ^= state[a];
		state[d] = state[d].rotate_left(16);

		state[c] = state[c].wrapping_add(state[d]);
		state[b] ^= state[c];
		state[b] = state[b].rotate_left(12);

		state[a] = state[a].wrapping_add(state[b]);
		state[d] ^= state[a];
		state[d] = state[d].rotate_left(8);

		state[c] = state[c].wrapping_add(state[d]);
		state[b] ^= state[c];
		state[b] = state[b].rotate_left(7);
	}

	pub fn next_u32(&mut self) -> u32 {
		if self.used >= STATE_WORDS {
			self.block = self.get_block();
			self.used = 0;
		}
		let v = self.block[self.used];
		self.used += 1;
		v
	}

	pub fn next_u64(&mut self) -> u64 {
		let lo = u64::from(self.next_u32());
		let hi = u64::from(self.next_u32());
		(hi << 32) | lo
	}

	/// Uniform in `[0.0, 1.0)`.
	pub fn uniform(&mut self) -> f64 {
		// 53 random bits
		(self.next_u64() >> 11) as f64 * (1.0 / 9_007_199_254_740_992.0)
	}

	/// Uniform integer in `0..n`. `n` must not be zero.
	pub fn below(&mut self, n: usize) -> usize {
		debug_assert!(n > 0);
		let n = n as u64;
		// rejection sampling to avoid modulo bias
		let zone = u64::MAX - (u64::MAX % n);
		loop {
			let v = self.next_u64();
			if v < zone {
				return (v % n) as usize;
			}
		}
	}

	/// Fisher-Yates.
	pub fn shuffle<T>(&mut self, items: &mut [T]) {
		for i in (1..items.len()).rev() {
			let j = self.below(i + 1);
			items.swap(i, j);
		}
	}

	/// Standard normal, Box-Muller.
	pub fn normal(&mut self) -> f64 {
		let x = 1.0 - self.uniform(); // (0.0, 1.0]
		let y = self.uniform();
		let r = (-2.0 * x.ln()).sqrt();
		r * (std::f64::consts::TAU * y).cos()
	}
}
