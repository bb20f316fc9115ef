//! Batched distributed weighted reservoir sampling.
//!
//! Every PE runs one [`Reservoir`]. A batch of `(weight, payload)` pairs is
//! ingested locally: while the global threshold is still zero the reservoir
//! fills with raw exponential priorities and prunes against a local
//! threshold; afterwards skip-sampling jumps over items that cannot beat
//! the global threshold and only materializes winners. At the end of each
//! batch a distributed selection finds the global Kth smallest priority,
//! the tree is split there, and the new threshold is agreed on by an
//! all-reduce. Between two batches the union of all PEs' samples is an
//! exact weighted sample without replacement of everything ingested so far.

use std::time::Instant;

use ordered_float::OrderedFloat;

use crate::comm::{Communicator, ReduceOp};
use crate::rng::{BlockRng, RandomSource};
use crate::select::{SelectStats, Selector};
use crate::stats::OpStats;
use crate::tree::RankTree;
use crate::Priority;

/// Window width of the skip-sampling fast-forward.
const SKIP_CHUNK: usize = 32;

/// Thresholds steering the phase before the first global threshold exists.
///
/// Until the reservoir has seen `max(startup_factor*K, K+startup_slack)`
/// items it inserts everything; after that it prunes back to K and refreshes
/// a local threshold whenever the tree regrows past
/// `max(refresh_factor*K, K+refresh_slack)`. The defaults reproduce
/// `max(3K/2, K+500)` and `max(11K/10, K+250)`.
#[derive(Clone, Copy, Debug)]
pub struct ReservoirTuning {
    pub startup_factor: f64,
    pub startup_slack: usize,
    pub refresh_factor: f64,
    pub refresh_slack: usize,
}

impl Default for ReservoirTuning {
    fn default() -> Self {
        Self {
            startup_factor: 1.5,
            startup_slack: 500,
            refresh_factor: 1.1,
            refresh_slack: 250,
        }
    }
}

impl ReservoirTuning {
    fn startup_limit(&self, k: usize) -> usize {
        ((self.startup_factor * k as f64) as usize).max(k + self.startup_slack)
    }

    fn refresh_limit(&self, k: usize) -> usize {
        ((self.refresh_factor * k as f64) as usize).max(k + self.refresh_slack)
    }
}

/// One PE's share of the distributed reservoir.
///
/// `insert` is collective: every PE of the group must call it once per
/// batch, and no PE may start the next batch before all have finished the
/// current one (the threshold all-reduce is that barrier).
pub struct Reservoir<T, Sel, C, R = BlockRng> {
    reservoir: RankTree<Priority, T>,
    selector: Sel,
    rng: R,
    comm: C,
    sample_size: usize,
    threshold: f64,
    batch_id: u64,
    tuning: ReservoirTuning,
    stats: OpStats,
}

impl<T, Sel, C> Reservoir<T, Sel, C, BlockRng>
where
    T: Clone,
    Sel: Selector<RankTree<Priority, T>>,
    C: Communicator,
{
    /// Create a reservoir of `sample_size` items. The per-PE ingestion RNG
    /// is seeded with `seed + rank`; the selector carries its own seed (see
    /// its constructor for whether ranks must share it).
    pub fn new(comm: C, sample_size: usize, seed: u64, selector: Sel) -> Self {
        let rng = BlockRng::new(seed + comm.rank() as u64);
        Self::with_rng(comm, sample_size, selector, rng)
    }
}

impl<T, Sel, C, R> Reservoir<T, Sel, C, R>
where
    T: Clone,
    Sel: Selector<RankTree<Priority, T>>,
    C: Communicator,
    R: RandomSource,
{
    pub fn with_rng(comm: C, sample_size: usize, selector: Sel, rng: R) -> Self {
        assert!(sample_size > 0, "sample size must be positive");
        Self {
            reservoir: RankTree::new(),
            selector,
            rng,
            comm,
            sample_size,
            threshold: 0.0,
            batch_id: 0,
            tuning: ReservoirTuning::default(),
            stats: OpStats::new(),
        }
    }

    pub fn set_tuning(&mut self, tuning: ReservoirTuning) {
        self.tuning = tuning;
    }

    /// Process one batch of `(weight, payload)` pairs. Collective.
    pub fn insert(&mut self, batch: &[(f64, T)]) {
        let total_timer = Instant::now();
        let mut timer = Instant::now();
        let k = self.sample_size;

        let mut idx = 0;
        if self.threshold == 0.0 {
            // no global threshold yet: take everything until the tree holds
            // comfortably more than K items
            let startup_limit = self.tuning.startup_limit(k);
            while idx < batch.len() && self.reservoir.len() < startup_limit {
                let (weight, payload) = &batch[idx];
                assert!(*weight > 0.0, "item weight must be positive, got {weight}");
                let key = self.rng.next_exponential(*weight);
                self.reservoir.insert(OrderedFloat(key), payload.clone());
                idx += 1;
            }

            // then prune locally and skip-sample against the local Kth
            // priority, refreshing it whenever the tree regrows
            let refresh_limit = self.tuning.refresh_limit(k);
            let mut local_threshold = 0.0;
            while idx < batch.len() {
                if self.reservoir.len() >= refresh_limit {
                    local_threshold = self.reservoir.key_at_rank(k).unwrap().0;
                    let tree = std::mem::take(&mut self.reservoir);
                    let (keep, discard) = tree.split_at(k);
                    self.reservoir = keep;
                    drop(discard);
                }
                assert!(local_threshold > 0.0);
                idx = self.skip_insert(batch, idx, local_threshold);
            }
        } else {
            let threshold = self.threshold;
            while idx < batch.len() {
                idx = self.skip_insert(batch, idx, threshold);
            }
        }

        self.stats.record("size", self.reservoir.len() as f64);
        self.stats
            .record("insert", timer.elapsed().as_secs_f64() * 1e3);
        timer = Instant::now();

        // a batch can end before K items exist globally; then everything is
        // kept and the threshold stays open
        let global_size = self
            .comm
            .all_reduce(self.reservoir.len() as i64, ReduceOp::Sum);

        if global_size >= k as i64 {
            let num_keep = self.selector.select(&self.reservoir, k);
            self.stats
                .record("select", timer.elapsed().as_secs_f64() * 1e3);
            timer = Instant::now();

            let tree = std::mem::take(&mut self.reservoir);
            let (keep, discard) = tree.split_at(num_keep);
            self.reservoir = keep;
            drop(discard);
            self.stats
                .record("split", timer.elapsed().as_secs_f64() * 1e3);
            timer = Instant::now();

            let local_max = self.reservoir.last().map_or(0.0, |(key, _)| key.0);
            self.threshold = self.comm.all_reduce(local_max, ReduceOp::Max);
            self.stats
                .record("threshold", timer.elapsed().as_secs_f64() * 1e3);
        }

        self.stats
            .record("total", total_timer.elapsed().as_secs_f64() * 1e3);
        self.batch_id += 1;
    }

    /// Skip-sample the tail of a batch against `threshold`, starting at
    /// `idx`. Draws an exponential skip distance, walks over items whose
    /// summed weight it covers, and gives the landing item a priority from
    /// `Exp(weight)` truncated to `(0, threshold]` — precisely the
    /// distribution conditioned on beating the threshold. Returns the index
    /// after the landing item (or the batch length).
    fn skip_insert(&mut self, batch: &[(f64, T)], mut idx: usize, threshold: f64) -> usize {
        let mut skip = self.rng.next_exponential(threshold);

        // fast-forward whole windows the skip clears
        while idx + SKIP_CHUNK <= batch.len() {
            let sum: f64 = batch[idx..idx + SKIP_CHUNK].iter().map(|(w, _)| *w).sum();
            if skip < sum {
                break;
            }
            skip -= sum;
            idx += SKIP_CHUNK;
        }

        while idx < batch.len() {
            skip -= batch[idx].0;
            if skip < 0.0 {
                break;
            }
            idx += 1;
        }
        if idx >= batch.len() {
            return idx;
        }

        let (weight, payload) = &batch[idx];
        assert!(*weight > 0.0, "item weight must be positive, got {weight}");
        let min_u = (-threshold * weight).exp();
        let r = self.rng.uniform_in(min_u, 1.0);
        let key = -r.ln() / weight;
        debug_assert!(key > 0.0 && key <= threshold);
        self.reservoir.insert(OrderedFloat(key), payload.clone());
        idx + 1
    }

    /// Visit every payload retained at this PE with its priority.
    pub fn sample<F: FnMut(f64, &T)>(&self, mut visit: F) {
        for (key, payload) in self.reservoir.iter() {
            visit(key.0, payload);
        }
    }

    /// Number of items retained at this PE.
    pub fn len(&self) -> usize {
        self.reservoir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservoir.len() == 0
    }

    /// Current global priority threshold; 0 while the reservoir is filling.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn batches(&self) -> u64 {
        self.batch_id
    }

    pub fn stats(&self) -> &OpStats {
        &self.stats
    }

    pub fn select_stats(&self) -> &SelectStats {
        self.selector.stats()
    }

    /// Structural self-check of the underlying tree.
    pub fn verify(&self) {
        self.reservoir.verify();
    }
}
