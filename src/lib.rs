// Distributed Weighted Reservoir Sampling
//
// Maintains, across P communicating processing elements (PEs), a sample of
// exactly K payloads drawn without replacement with probability proportional
// to weight (exponential priorities, smaller preferred). Three pieces do the
// heavy lifting:
//
//   - `tree`:    an order-statistic B+ tree (rank queries, split, join)
//   - `select`:  distributed approximate multi-sequence selection (AMS)
//   - `sampler`: the batched driver tying ingestion, selection and the
//                global priority threshold together
//
// `comm` provides the collective-communication seam (with an in-process
// thread-backed implementation), `rng` the random deviate source.

pub mod comm;
pub mod rng;
pub mod select;
pub mod stats;
pub mod tree;

pub mod sampler;

use ordered_float::OrderedFloat;

/// Key type of the reservoir: an exponential deviate divided by the item
/// weight. Wrapped so the tree gets a total order; priorities are finite and
/// strictly positive, the infinities are reserved for selector sentinels.
pub type Priority = OrderedFloat<f64>;

pub use comm::{CommValue, Communicator, ReduceOp, ThreadComm};
pub use rng::{BlockRng, RandomSource};
pub use sampler::{Reservoir, ReservoirTuning};
pub use select::{AmsSelect, AmsSelectMulti, RankedSeq, SelectKey, Selector};
pub use stats::{Aggregate, OpStats};
pub use tree::RankTree;
