//! Random deviate generation.
//!
//! The sampling core only ever talks to the [`RandomSource`] trait; the
//! shipped implementation, [`BlockRng`], sits on top of a seeded ChaCha8
//! stream and amortizes per-call overhead by generating uniform and
//! log-uniform deviates in blocks that grow while demand is high.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of the random deviates consumed by the sampling core.
///
/// Block operations must agree with the one-at-a-time operations in
/// distribution, not bit-for-bit.
pub trait RandomSource {
    /// Uniform deviate from `[0, 1)`.
    fn next(&mut self) -> f64;

    /// `ln(U)` with `U ∈ (0, 1]`, so the result is finite and `<= 0`.
    fn next_log(&mut self) -> f64;

    /// Exponential deviate with rate `lambda`.
    fn next_exponential(&mut self, lambda: f64) -> f64 {
        -self.next_log() / lambda
    }

    /// Uniform deviate from `[min, max)`.
    fn uniform_in(&mut self, min: f64, max: f64) -> f64 {
        self.next() * (max - min) + min
    }

    /// Geometric deviate with `P(X = k) = (1-p)^k * p` for `k >= 0`.
    fn geometric(&mut self, p: f64) -> i64;

    /// Fill `out` with uniform deviates from `[0, 1)`.
    fn generate_block(&mut self, out: &mut [f64]);

    /// Fill `out` with `ln(U)`, `U ∈ (0, 1]`.
    fn generate_log_block(&mut self, out: &mut [f64]);

    /// Fill `out` with exponential deviates with rate `lambda`.
    fn generate_exponential_block(&mut self, lambda: f64, out: &mut [f64]) {
        self.generate_log_block(out);
        for x in out.iter_mut() {
            *x = -*x / lambda;
        }
    }

    /// Fill `out` with independent normal deviates.
    fn generate_gaussian_block(&mut self, mean: f64, stdev: f64, out: &mut [f64]);
}

/// Initial (and minimum) size of the internal deviate buffers.
const MIN_BLOCK: usize = 256;

/// Block-buffered deviate source backed by ChaCha8.
///
/// Uniform and log-uniform deviates are drawn from separate buffers. A
/// buffer that keeps getting exhausted doubles in size, so callers that
/// consume millions of deviates pay almost nothing per call.
pub struct BlockRng {
    rng: ChaCha8Rng,

    uniform: Vec<f64>,
    uniform_at: usize,
    uniform_blocks: usize,

    logs: Vec<f64>,
    logs_at: usize,
    log_blocks: usize,
}

impl BlockRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            uniform: Vec::new(),
            uniform_at: 0,
            uniform_blocks: 0,
            logs: Vec::new(),
            logs_at: 0,
            log_blocks: 0,
        }
    }

    /// Re-seed and reset all buffered deviates.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.uniform.clear();
        self.uniform_at = 0;
        self.uniform_blocks = 0;
        self.logs.clear();
        self.logs_at = 0;
        self.log_blocks = 0;
    }

    /// Grow `buf` if it has been refilled at every power-of-two count.
    fn next_block_len(buf_len: usize, blocks: usize) -> usize {
        let mut len = buf_len.max(MIN_BLOCK);
        if blocks > 2 && (blocks + 1).is_power_of_two() {
            len *= 2;
        }
        len
    }

    fn refill_uniform(&mut self) {
        let len = Self::next_block_len(self.uniform.len(), self.uniform_blocks);
        self.uniform.resize(len, 0.0);
        for x in self.uniform.iter_mut() {
            *x = self.rng.random();
        }
        self.uniform_at = 0;
        self.uniform_blocks += 1;
    }

    fn refill_logs(&mut self) {
        let len = Self::next_block_len(self.logs.len(), self.log_blocks);
        self.logs.resize(len, 0.0);
        for x in self.logs.iter_mut() {
            // left-open: 1 - [0,1) lies in (0,1], keeping the log finite
            *x = (1.0 - self.rng.random::<f64>()).ln();
        }
        self.logs_at = 0;
        self.log_blocks += 1;
    }
}

impl RandomSource for BlockRng {
    #[inline]
    fn next(&mut self) -> f64 {
        if self.uniform_at >= self.uniform.len() {
            self.refill_uniform();
        }
        let x = self.uniform[self.uniform_at];
        self.uniform_at += 1;
        x
    }

    #[inline]
    fn next_log(&mut self) -> f64 {
        if self.logs_at >= self.logs.len() {
            self.refill_logs();
        }
        let x = self.logs[self.logs_at];
        self.logs_at += 1;
        x
    }

    fn geometric(&mut self, p: f64) -> i64 {
        assert!(p > 0.0 && p <= 1.0, "geometric parameter must be in (0, 1], got {p}");
        if p >= 1.0 {
            return 0;
        }
        // inverse CDF with a left-open uniform
        let u = 1.0 - self.next();
        (u.ln() / (1.0 - p).ln()) as i64
    }

    fn generate_block(&mut self, out: &mut [f64]) {
        for x in out.iter_mut() {
            *x = self.rng.random();
        }
    }

    fn generate_log_block(&mut self, out: &mut [f64]) {
        for x in out.iter_mut() {
            *x = (1.0 - self.rng.random::<f64>()).ln();
        }
    }

    fn generate_gaussian_block(&mut self, mean: f64, stdev: f64, out: &mut [f64]) {
        // Box-Muller generates pairs; an odd tail element gets its own pair.
        let mut i = 0;
        while i + 1 < out.len() {
            let (a, b) = self.next_two_gaussians(mean, stdev);
            out[i] = a;
            out[i + 1] = b;
            i += 2;
        }
        if i < out.len() {
            out[i] = self.next_two_gaussians(mean, stdev).0;
        }
    }
}

impl BlockRng {
    /// Two independent normal deviates from one Box-Muller transform.
    pub fn next_two_gaussians(&mut self, mean: f64, stdev: f64) -> (f64, f64) {
        let u = 1.0 - self.next();
        let v = self.next();
        let a = stdev * (-2.0 * u.ln()).sqrt();
        let b = 2.0 * std::f64::consts::PI * v;
        (mean + a * b.cos(), mean + a * b.sin())
    }
}
