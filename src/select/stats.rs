//! Statistics collected by the distributed selectors.

use std::fmt;

use crate::stats::Aggregate;

/// Per-selector counters and aggregates: recursion depth, pivot case mix,
/// round timings per level, and the degenerate events that indicate slow
/// progress (out-of-bounds pivot draws, rounds that barely shrink the
/// problem). There is no hard round cap; `size_unchanged` / `tiny_change`
/// are how pathological inputs show up.
#[derive(Clone, Debug, Default)]
pub struct SelectStats {
    /// Wall time of whole selections, milliseconds.
    pub total: Aggregate,
    /// 1 for a right recursion, 0 for a left one.
    pub rec_right: Aggregate,
    /// Recursion depth per selection.
    pub depth: Aggregate,
    /// Which pivot case each round took (0 = left, 1 = right).
    pub kcase: Aggregate,
    /// Per-level round timings, milliseconds.
    pub level_times: Vec<Aggregate>,
    /// Per-level global problem sizes (recorded at rank 0).
    pub sizes: Vec<Aggregate>,

    /// Geometric pivot index beyond the local window.
    pub pidx_oob: u64,
    /// Rounds in which no PE produced a usable pivot.
    pub no_pivot: u64,
    /// Bound positions clamped below the window.
    pub neg_split_pos: u64,
    /// Bound positions clamped above the window.
    pub split_pos_oob: u64,
    /// Rounds that did not shrink the global problem at all.
    pub size_unchanged: u64,
    /// Rounds that shrank it by at most 2% (or five elements).
    pub tiny_change: u64,

    /// Pivots drawn per round, for normalizing the counters.
    pub norm_factor: u64,

    level: i32,
    max_level: i32,
}

impl SelectStats {
    pub fn new() -> Self {
        Self {
            norm_factor: 1,
            level: -1,
            max_level: -1,
            ..Self::default()
        }
    }

    pub fn next_level(&mut self) {
        self.level += 1;
        self.max_level = self.max_level.max(self.level);
    }

    /// Close a selection: fold the reached depth into `depth`.
    pub fn reset_level(&mut self) {
        self.depth.add((self.level + 1) as f64);
        self.level = -1;
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn record(&mut self, millis: f64) {
        let idx = self.level.max(0) as usize;
        if idx >= self.level_times.len() {
            self.level_times.resize(idx + 1, Aggregate::new());
        }
        self.level_times[idx].add(millis);
    }

    pub fn record_total(&mut self, millis: f64) {
        self.total.add(millis);
    }

    pub fn record_size(&mut self, size: usize) {
        let idx = self.level.max(0) as usize;
        if idx >= self.sizes.len() {
            self.sizes.resize(idx + 1, Aggregate::new());
        }
        self.sizes[idx].add(size as f64);
    }

    pub fn left(&mut self) {
        self.rec_right.add(0.0);
    }

    pub fn right(&mut self) {
        self.rec_right.add(1.0);
    }

    pub fn combine(&mut self, other: &SelectStats) {
        self.total.combine(&other.total);
        self.rec_right.combine(&other.rec_right);
        self.depth.combine(&other.depth);
        self.kcase.combine(&other.kcase);
        if other.level_times.len() > self.level_times.len() {
            self.level_times.resize(other.level_times.len(), Aggregate::new());
        }
        for (mine, theirs) in self.level_times.iter_mut().zip(&other.level_times) {
            mine.combine(theirs);
        }
        if other.sizes.len() > self.sizes.len() {
            self.sizes.resize(other.sizes.len(), Aggregate::new());
        }
        for (mine, theirs) in self.sizes.iter_mut().zip(&other.sizes) {
            mine.combine(theirs);
        }
        self.pidx_oob += other.pidx_oob;
        self.no_pivot += other.no_pivot;
        self.neg_split_pos += other.neg_split_pos;
        self.split_pos_oob += other.split_pos_oob;
        self.size_unchanged += other.size_unchanged;
        self.tiny_change += other.tiny_change;
        self.norm_factor = self.norm_factor.max(other.norm_factor);
        self.max_level = self.max_level.max(other.max_level);
    }
}

impl fmt::Display for SelectStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\ttotal:            {}", self.total)?;
        for (lvl, agg) in self.level_times.iter().enumerate() {
            if agg.count() > 0 {
                writeln!(f, "\tlevel {lvl}: {agg}")?;
            }
        }
        if self.rec_right.count() > 0 {
            writeln!(f, "\trecursion % right: {:.1}", self.rec_right.mean() * 100.0)?;
        }
        writeln!(f, "\trecursion depth:  {}", self.depth)?;
        writeln!(f, "\tk small/large:    {}", self.kcase)?;

        let rounds = self.kcase.count() as f64 * self.norm_factor as f64;
        let pct = |x: u64| {
            if rounds > 0.0 { x as f64 / rounds * 100.0 } else { 0.0 }
        };
        writeln!(
            f,
            "\tpivot idx oob: {} = {:.1}%, no pivot: {} = {:.1}%",
            self.pidx_oob,
            pct(self.pidx_oob),
            self.no_pivot,
            pct(self.no_pivot)
        )?;
        writeln!(
            f,
            "\tneg split pos: {} = {:.1}%, split pos oob: {} = {:.1}%",
            self.neg_split_pos,
            pct(self.neg_split_pos),
            self.split_pos_oob,
            pct(self.split_pos_oob)
        )?;
        write!(
            f,
            "\tsize unchanged: {}; <2% change: {}",
            self.size_unchanged, self.tiny_change
        )?;
        for (lvl, agg) in self.sizes.iter().enumerate() {
            if agg.count() > 0 {
                write!(f, "\n\t\tsize at lvl {lvl}: {agg}")?;
            }
        }
        Ok(())
    }
}
