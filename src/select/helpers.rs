//! Shared pieces of the selection rounds: local bound computation with
//! degenerate-pivot handling, the global bound reduction, and the
//! prefix-sum resolution of duplicate pivot keys.

use crate::comm::{CommValue, Communicator, ReduceOp};

use super::stats::SelectStats;
use super::{RankedSeq, SelectKey};

/// Positions of a pivot within the local window `[min_idx, max_idx)`:
/// `ub_pos` counts window elements `<= pivot`, `lb_pos` those `< pivot`,
/// both clamped into `[0, window size]`.
pub(super) struct Bounds {
    pub ub_pos: i64,
    pub lb_pos: i64,
}

/// Compute the window-relative bounds for `pivot`.
///
/// A sentinel pivot means every PE's geometric draw overshot its window.
/// With `resolve_globally` (single-pivot selection) the PEs then agree on a
/// replacement pivot, the global max (resp. min) of their window edges, so
/// the round still makes progress; the bounds keep pointing at the window
/// edge, which may over- or undershoot the replacement pivot's true
/// position when it has duplicates. Without it (multi-pivot selection) the
/// sentinel bounds simply make that pivot a useless candidate.
pub(super) fn local_bounds<S, C>(
    seq: &S,
    stats: &mut SelectStats,
    pivot: &mut S::Key,
    min_idx: i64,
    max_idx: i64,
    comm: &C,
    resolve_globally: bool,
) -> Bounds
where
    S: RankedSeq,
    S::Key: CommValue,
    C: Communicator,
{
    let local_size = max_idx - min_idx;

    if *pivot == S::Key::min_sentinel() {
        stats.no_pivot += 1;
        let pos = if local_size == 0 { 0 } else { local_size };
        if resolve_globally {
            if local_size > 0 {
                *pivot = seq.key_at((max_idx - 1) as usize);
            }
            *pivot = comm.all_reduce(*pivot, ReduceOp::Max);
        }
        Bounds {
            ub_pos: pos,
            lb_pos: pos,
        }
    } else if *pivot == S::Key::max_sentinel() {
        stats.no_pivot += 1;
        if resolve_globally {
            if local_size > 0 {
                *pivot = seq.key_at(min_idx as usize);
            }
            *pivot = comm.all_reduce(*pivot, ReduceOp::Min);
        }
        Bounds {
            ub_pos: 0,
            lb_pos: 0,
        }
    } else {
        let mut ub_pos = seq.rank_upper_bound(*pivot) as i64 - min_idx;
        let mut lb_pos = seq.rank_lower_bound(*pivot) as i64 - min_idx;

        if ub_pos < 0 {
            // every PE drew its pivot beyond the right window edge (case 2)
            stats.neg_split_pos += 1;
            ub_pos = 0;
            lb_pos = 0;
        } else if ub_pos > local_size {
            // every PE drew beyond the left window edge (case 1)
            stats.split_pos_oob += 1;
            ub_pos = local_size;
            lb_pos = local_size;
        }
        if lb_pos < 0 {
            stats.neg_split_pos += 1;
            lb_pos = 0;
        }

        Bounds { ub_pos, lb_pos }
    }
}

/// Sum the local bounds over all PEs: returns `(global_ub, global_lb)`,
/// the global counts of elements `<=` and `<` the pivot.
pub(super) fn global_bounds<C: Communicator>(
    comm: &C,
    bounds: &Bounds,
    global_size: i64,
) -> (i64, i64) {
    let mut pair = [bounds.lb_pos, bounds.ub_pos];
    comm.all_reduce_vec(&mut pair, ReduceOp::Sum);
    let (global_lb, global_ub) = (pair[0], pair[1]);
    assert!(0 <= global_lb && global_lb <= global_size);
    assert!(0 <= global_ub && global_ub <= global_size);
    (global_ub, global_lb)
}

/// The target rank falls among the duplicates of the pivot: between the
/// global bounds sit `global_ub - global_lb` copies, of which the first
/// `target_count` (counting from the lower bound) are still needed. An
/// inclusive prefix sum over the per-PE duplicate counts tells each PE
/// whether to contribute all, none, or a prefix of its copies. Returns the
/// local split rank.
pub(super) fn find_eq_pos<C: Communicator>(
    comm: &C,
    global_ub: i64,
    global_lb: i64,
    bounds: &Bounds,
    min_idx: i64,
    target_count: i64,
) -> i64 {
    if global_lb + 1 >= global_ub {
        // the pivot is globally unique; target_count picks the bound
        if target_count == 0 {
            return min_idx + bounds.lb_pos;
        }
        assert_eq!(target_count, 1);
        return min_idx + bounds.ub_pos;
    }

    let my_count = bounds.ub_pos - bounds.lb_pos;
    assert!(my_count >= 0);
    let prefix = comm.scan_sum(my_count);

    if prefix < target_count {
        // every local copy is needed
        min_idx + bounds.ub_pos
    } else if prefix - my_count > target_count {
        // earlier PEs already covered the target
        min_idx + bounds.lb_pos
    } else {
        let take = target_count - (prefix - my_count);
        min_idx + bounds.lb_pos + take
    }
}
