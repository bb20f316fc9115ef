//! Single-pivot approximate multi-sequence selection.

use std::time::Instant;

use crate::comm::{CommValue, Communicator, ReduceOp};
use crate::rng::{BlockRng, RandomSource};

use super::helpers::{find_eq_pos, global_bounds, local_bounds};
use super::stats::SelectStats;
use super::{RankedSeq, SelectKey, Selector};

/// One geometric pivot per communication round.
///
/// Each round every PE draws a pivot index from the same geometric
/// distribution, turns it into a key from its local window (or a sentinel
/// when the index overshoots), and a min- or max-reduction picks the global
/// pivot. Rank bounds for the pivot decide whether to discard everything
/// below it, everything above it, or to finish among its duplicates.
/// Expected O(log N) rounds.
pub struct AmsSelect<C> {
    comm: C,
    rng: BlockRng,
    stats: SelectStats,
}

impl<C: Communicator> AmsSelect<C> {
    /// The seed must be **identical on every PE**: each round all PEs must
    /// draw the same pivot-index distribution in lockstep, otherwise the
    /// reductions mix incoherent candidates and the selection livelocks.
    pub fn new(comm: C, seed: u64) -> Self {
        Self {
            comm,
            rng: BlockRng::new(seed),
            stats: SelectStats::new(),
        }
    }

    fn run<S>(&mut self, seq: &S, kmin: usize, kmax: usize) -> usize
    where
        S: RankedSeq,
        S::Key: CommValue,
    {
        let total_timer = Instant::now();

        if kmin > kmax || kmax == 0 {
            return 0;
        }

        let mut global_size = self.comm.all_reduce(seq.len() as i64, ReduceOp::Sum);
        assert!(
            kmin as i64 <= global_size,
            "cannot select {kmin} to {kmax} smallest out of {global_size} items \
             ({} on this PE)",
            seq.len()
        );

        let mut kmin = kmin as i64;
        let mut kmax = kmax as i64;
        let mut min_idx = 0i64;
        let mut max_idx = seq.len() as i64;

        let result = loop {
            self.stats.next_level();
            if self.comm.rank() == 0 {
                self.stats.record_size(global_size as usize);
            }
            let round_timer = Instant::now();

            assert!(max_idx >= min_idx && kmin <= kmax && kmin <= global_size);
            let local_size = max_idx - min_idx;

            if kmin == 1 || kmax == 1 {
                // the global minimum of the window fronts is the answer
                let mut pivot = S::Key::max_sentinel();
                if local_size > 0 {
                    pivot = seq.key_at(min_idx as usize);
                }
                pivot = self.comm.all_reduce(pivot, ReduceOp::Min);

                let mut ub_pos = seq.rank_upper_bound(pivot) as i64;
                if ub_pos < min_idx {
                    ub_pos = min_idx;
                }
                self.stats.record(round_timer.elapsed().as_secs_f64() * 1e3);
                break ub_pos;
            }

            let mut pivot;
            if kmin < global_size - kmax {
                // case 1: target near the front, sample close to the minimum
                self.stats.kcase.add(0.0);
                let p = 1.0
                    - ((kmin as f64 - 1.0) / kmax as f64).powf(1.0 / (kmax - kmin + 1) as f64);
                assert!((0.0..=1.0).contains(&p), "bad pivot probability {p}");

                let pivot_idx = self.rng.geometric(p);
                if pivot_idx < local_size {
                    pivot = seq.key_at((min_idx + pivot_idx) as usize);
                } else {
                    pivot = S::Key::max_sentinel();
                    self.stats.pidx_oob += 1;
                }
                pivot = self.comm.all_reduce(pivot, ReduceOp::Min);
            } else {
                // case 2: mirror image from the back
                self.stats.kcase.add(1.0);
                let p = 1.0
                    - ((global_size - kmax) as f64 / (global_size - kmin + 1) as f64)
                        .powf(1.0 / (kmax - kmin + 1) as f64);
                assert!((0.0..=1.0).contains(&p), "bad pivot probability {p}");

                let pivot_idx = self.rng.geometric(p);
                if pivot_idx < local_size {
                    pivot = seq.key_at((max_idx - pivot_idx - 1) as usize);
                } else {
                    pivot = S::Key::min_sentinel();
                    self.stats.pidx_oob += 1;
                }
                pivot = self.comm.all_reduce(pivot, ReduceOp::Max);
            }

            let bounds = local_bounds(
                seq,
                &mut self.stats,
                &mut pivot,
                min_idx,
                max_idx,
                &self.comm,
                true,
            );
            let (global_ub, global_lb) = global_bounds(&self.comm, &bounds, global_size);
            self.stats.record(round_timer.elapsed().as_secs_f64() * 1e3);

            if global_ub < kmin {
                // discard everything up to and including the pivot
                self.stats.right();
                if global_ub == 0 {
                    self.stats.size_unchanged += 1;
                } else if global_ub * 50 <= global_size || global_ub <= 5 {
                    self.stats.tiny_change += 1;
                }
                kmin -= global_ub;
                kmax -= global_ub;
                min_idx += bounds.ub_pos;
                global_size -= global_ub;
            } else if global_lb > kmax {
                // discard everything above the pivot
                self.stats.left();
                if global_lb == global_size {
                    self.stats.size_unchanged += 1;
                } else if (global_size - global_lb) * 50 <= global_size
                    || global_size - global_lb <= 5
                {
                    self.stats.tiny_change += 1;
                }
                max_idx = min_idx + bounds.lb_pos;
                global_size = global_lb;
            } else {
                // the answer sits among the pivot's duplicates
                break find_eq_pos(
                    &self.comm,
                    global_ub,
                    global_lb,
                    &bounds,
                    min_idx,
                    kmin - global_lb,
                );
            }
        };

        self.stats
            .record_total(total_timer.elapsed().as_secs_f64() * 1e3);
        self.stats.reset_level();
        result as usize
    }
}

impl<S, C> Selector<S> for AmsSelect<C>
where
    S: RankedSeq,
    S::Key: CommValue,
    C: Communicator,
{
    fn select_range(&mut self, seq: &S, kmin: usize, kmax: usize) -> usize {
        self.run(seq, kmin, kmax)
    }

    fn stats(&self) -> &SelectStats {
        &self.stats
    }

    fn name(&self) -> String {
        "ams-select".to_string()
    }
}
