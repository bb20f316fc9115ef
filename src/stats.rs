//! Running statistics for timings and sizes.
//!
//! `Aggregate` keeps count/mean/variance/min/max with Welford updates and
//! supports merging, so per-PE statistics can be combined for reporting.
//! `OpStats` is a small keyed collection of aggregates that remembers
//! insertion order for stable printing.

use std::fmt;

/// Count, mean, standard deviation and range of a stream of samples.
#[derive(Clone, Copy, Debug)]
pub struct Aggregate {
    count: usize,
    mean: f64,
    nvar: f64, // sum of squared deviations from the running mean
    min: f64,
    max: f64,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregate {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            nvar: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.nvar += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    /// Sample standard deviation.
    pub fn stdev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.nvar / (self.count - 1) as f64).sqrt()
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Merge another aggregate into this one.
    pub fn combine(&mut self, other: &Aggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / total;
        self.nvar += other.nvar + delta * delta * self.count as f64 * other.count as f64 / total;
        self.mean = mean;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count > 1 {
            write!(
                f,
                "avg={:.4} stdev={:.4} count={} range=[{:.4}..{:.4}]",
                self.mean(),
                self.stdev(),
                self.count,
                self.min,
                self.max
            )
        } else {
            write!(f, "{:.4}", self.mean())
        }
    }
}

/// Keyed aggregates, printed in the order keys were first recorded.
#[derive(Clone, Debug, Default)]
pub struct OpStats {
    entries: Vec<(String, Aggregate)>,
}

impl OpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: &str, value: f64) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, agg)) => agg.add(value),
            None => {
                let mut agg = Aggregate::new();
                agg.add(value);
                self.entries.push((key.to_string(), agg));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Aggregate> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, a)| a)
    }

    /// Batches per second, derived from the "total" timing in milliseconds.
    pub fn throughput(&self) -> f64 {
        match self.get("total") {
            Some(agg) if agg.count() > 0 => 1000.0 / agg.mean(),
            _ => 0.0,
        }
    }

    pub fn combine(&mut self, other: &OpStats) {
        for (key, agg) in &other.entries {
            match self.entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, mine)) => mine.combine(agg),
                None => self.entries.push((key.clone(), *agg)),
            }
        }
    }
}

impl fmt::Display for OpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (i, (key, agg)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "\t{key}: {:pad$}{agg}", "", pad = width - key.len())?;
        }
        Ok(())
    }
}
