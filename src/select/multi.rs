//! Multi-pivot approximate multi-sequence selection.

use std::time::Instant;

use smallvec::SmallVec;

use crate::comm::{CommValue, Communicator, ReduceOp};
use crate::rng::{BlockRng, RandomSource};

use super::helpers::{find_eq_pos, local_bounds, Bounds};
use super::stats::SelectStats;
use super::{RankedSeq, SelectKey, Selector};

/// `D` geometric pivots per communication round.
///
/// All `D` pivots travel through a single vector reduction and their `2·D`
/// rank bounds through a single vector sum, so one round costs the same
/// number of collectives as the single-pivot selector but narrows the
/// window by the best of `D` candidates, cutting the expected round count
/// by roughly a factor of log D.
pub struct AmsSelectMulti<C, const D: usize = 16> {
    comm: C,
    rng: BlockRng,
    stats: SelectStats,
}

impl<C: Communicator, const D: usize> AmsSelectMulti<C, D> {
    /// The seed must be **different on every PE**: the `D` draws are meant
    /// to be independent across PEs and are combined by the reduction, so
    /// correlated draws waste pivot candidates.
    pub fn new(comm: C, seed: u64) -> Self {
        let mut stats = SelectStats::new();
        stats.norm_factor = D as u64;
        Self {
            comm,
            rng: BlockRng::new(seed),
            stats,
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

            // draw D pivots, reduce them in one collective
            let mut pivots: SmallVec<[S::Key; 16]> = SmallVec::new();
            if kmin < global_size - kmax {
                self.stats.kcase.add(0.0);
                let p = 1.0
                    - ((kmin as f64 - 1.0) / kmax as f64).powf(1.0 / (kmax - kmin + 1) as f64);
                assert!((0.0..=1.0).contains(&p), "bad pivot probability {p}");
                for _ in 0..D {
                    let pivot_idx = self.rng.geometric(p);
                    if pivot_idx < local_size {
                        pivots.push(seq.key_at((min_idx + pivot_idx) as usize));
                    } else {
                        pivots.push(S::Key::max_sentinel());
                        self.stats.pidx_oob += 1;
                    }
                }
                self.comm.all_reduce_vec(&mut pivots, ReduceOp::Min);
            } else {
                self.stats.kcase.add(1.0);
                let p = 1.0
                    - ((global_size - kmax) as f64 / (global_size - kmin + 1) as f64)
                        .powf(1.0 / (kmax - kmin + 1) as f64);
                assert!((0.0..=1.0).contains(&p), "bad pivot probability {p}");
                for _ in 0..D {
                    let pivot_idx = self.rng.geometric(p);
                    if pivot_idx < local_size {
                        pivots.push(seq.key_at((max_idx - pivot_idx - 1) as usize));
                    } else {
                        pivots.push(S::Key::min_sentinel());
                        self.stats.pidx_oob += 1;
                    }
                }
                self.comm.all_reduce_vec(&mut pivots, ReduceOp::Max);
            }

            // all 2*D bounds go through one sum
            let mut bounds: SmallVec<[Bounds; 16]> = SmallVec::new();
            let mut gbounds: SmallVec<[i64; 32]> = SmallVec::new();
            for pivot in pivots.iter_mut() {
                let b = local_bounds(
                    seq,
                    &mut self.stats,
                    pivot,
                    min_idx,
                    max_idx,
                    &self.comm,
                    false,
                );
                gbounds.push(b.ub_pos);
                gbounds.push(b.lb_pos);
                bounds.push(b);
            }
            self.comm.all_reduce_vec(&mut gbounds, ReduceOp::Sum);

            // a pivot whose bounds bracket the target finishes the round
            let mut best_ub: Option<(i64, usize)> = None;
            let mut best_lb: Option<(i64, usize)> = None;
            let mut finished = None;
            for i in 0..D {
                let global_ub = gbounds[2 * i];
                let global_lb = gbounds[2 * i + 1];
                if global_ub >= kmin && global_lb <= kmax {
                    if global_lb < kmin {
                        // everything equal to this pivot gets kept
                        finished = Some(min_idx + bounds[i].ub_pos);
                    } else {
                        finished = Some(find_eq_pos(
                            &self.comm,
                            global_ub,
                            global_lb,
                            &bounds[i],
                            min_idx,
                            kmin - global_lb,
                        ));
                    }
                    break;
                }
                if global_ub < kmin {
                    let diff = kmin - global_ub;
                    if best_ub.map_or(true, |(d, _)| diff < d) {
                        best_ub = Some((diff, i));
                    }
                }
                if global_lb > kmax {
                    let diff = global_lb - kmax;
                    if best_lb.map_or(true, |(d, _)| diff < d) {
                        best_lb = Some((diff, i));
                    }
                }
            }
            if let Some(rank) = finished {
                self.stats.record(round_timer.elapsed().as_secs_f64() * 1e3);
                break rank;
            }

            // narrow the window by the best discard on each side; lb_pos is
            // relative to the window before this round's shift
            let old_size = global_size;
            let old_min_idx = min_idx;
            if let Some((_, i)) = best_ub {
                let global_ub = gbounds[2 * i];
                min_idx += bounds[i].ub_pos;
                kmin -= global_ub;
                kmax -= global_ub;
                global_size -= global_ub;
            }
            if let Some((_, i)) = best_lb {
                let global_lb = gbounds[2 * i + 1];
                max_idx = old_min_idx + bounds[i].lb_pos;
                global_size -= old_size - global_lb;
            }
            assert!(global_size > 0 && global_size <= old_size);

            if global_size == old_size {
                self.stats.size_unchanged += 1;
            } else if (old_size - global_size) * 50 <= old_size || old_size - global_size <= 5 {
                self.stats.tiny_change += 1;
            }
            self.stats.record(round_timer.elapsed().as_secs_f64() * 1e3);
        };

        self.stats
            .record_total(total_timer.elapsed().as_secs_f64() * 1e3);
        self.stats.reset_level();
        result as usize
    }
}

impl<S, C, const D: usize> Selector<S> for AmsSelectMulti<C, D>
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
        format!("ams-multi-{D}")
    }
}
