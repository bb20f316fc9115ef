//! In-process communicator for thread-per-PE groups.
//!
//! All collectives are built on one primitive: `exchange`, an all-gather
//! through a shared slot table guarded by a mutex/condvar pair. A round has
//! two phases: every member deposits its value, then every member reads the
//! whole table; the last reader resets the table for the next round. The
//! phase flag keeps a fast member from depositing into a round that slower
//! members are still reading.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

use super::{CommValue, Communicator, ReduceOp};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Deposit,
    Collect,
}

struct Round {
    phase: Phase,
    arrived: usize,
    readers_left: usize,
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

struct Shared {
    size: usize,
    round: Mutex<Round>,
    cv: Condvar,
}

/// One member's handle to a thread-backed communicator group.
///
/// Handles are cheap to clone; clones refer to the same rank. Create a
/// connected group with [`ThreadComm::group`] and move one handle into each
/// worker thread.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create `size` connected handles, one per rank.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group must have at least one member");
        let shared = Arc::new(Shared {
            size,
            round: Mutex::new(Round {
                phase: Phase::Deposit,
                arrived: 0,
                readers_left: 0,
                slots: (0..size).map(|_| None).collect(),
            }),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// All-gather: returns every member's deposit, indexed by rank.
    fn exchange<T: Clone + Send + 'static>(&self, x: T) -> Vec<T> {
        let shared = &*self.shared;
        let mut round = shared.round.lock().unwrap();

        // wait for the previous round to drain
        while round.phase != Phase::Deposit {
            round = shared.cv.wait(round).unwrap();
        }

        debug_assert!(round.slots[self.rank].is_none());
        round.slots[self.rank] = Some(Box::new(x));
        round.arrived += 1;

        if round.arrived == shared.size {
            round.phase = Phase::Collect;
            round.readers_left = shared.size;
            shared.cv.notify_all();
        } else {
            while round.phase != Phase::Collect {
                round = shared.cv.wait(round).unwrap();
            }
        }

        let out: Vec<T> = round
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .and_then(|b| b.downcast_ref::<T>())
                    .expect("collective type mismatch across ranks")
                    .clone()
            })
            .collect();

        round.readers_left -= 1;
        if round.readers_left == 0 {
            for slot in round.slots.iter_mut() {
                *slot = None;
            }
            round.arrived = 0;
            round.phase = Phase::Deposit;
            shared.cv.notify_all();
        }
        out
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_reduce<T: CommValue>(&self, x: T, op: ReduceOp) -> T {
        let all = self.exchange(x);
        let mut it = all.into_iter();
        let first = it.next().unwrap();
        it.fold(first, |acc, v| acc.combine(v, op))
    }

    fn all_reduce_vec<T: CommValue>(&self, xs: &mut [T], op: ReduceOp) {
        let all = self.exchange(xs.to_vec());
        for contribution in &all {
            assert_eq!(
                contribution.len(),
                xs.len(),
                "vector collective length mismatch across ranks"
            );
        }
        for (i, x) in xs.iter_mut().enumerate() {
            let mut acc: Option<T> = None;
            for contribution in &all {
                let v = contribution[i].clone();
                acc = Some(match acc {
                    None => v,
                    Some(a) => a.combine(v, op),
                });
            }
            *x = acc.unwrap();
        }
    }

    fn scan_sum<T: CommValue>(&self, x: T) -> T {
        let all = self.exchange(x);
        let mut it = all.into_iter().take(self.rank + 1);
        let first = it.next().unwrap();
        it.fold(first, |acc, v| acc.combine(v, ReduceOp::Sum))
    }

    fn broadcast<T: CommValue>(&self, x: T, root: usize) -> T {
        assert!(root < self.shared.size, "broadcast root {root} out of range");
        let mut all = self.exchange(x);
        all.swap_remove(root)
    }

    fn barrier(&self) {
        self.exchange(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Clone + Send + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = ThreadComm::group(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce_sum_min_max() {
        let results = run_group(4, |comm| {
            let x = (comm.rank() + 1) as i64;
            (
                comm.all_reduce(x, ReduceOp::Sum),
                comm.all_reduce(x, ReduceOp::Min),
                comm.all_reduce(x, ReduceOp::Max),
            )
        });
        for (sum, min, max) in results {
            assert_eq!(sum, 10);
            assert_eq!(min, 1);
            assert_eq!(max, 4);
        }
    }

    #[test]
    fn scan_is_inclusive_prefix_sum() {
        let results = run_group(4, |comm| (comm.rank(), comm.scan_sum((comm.rank() + 1) as i64)));
        for (rank, prefix) in results {
            let expected: i64 = (1..=rank as i64 + 1).sum();
            assert_eq!(prefix, expected);
        }
    }

    #[test]
    fn broadcast_takes_root_value() {
        let results = run_group(3, |comm| {
            let x = comm.rank() as i64 * 100;
            comm.broadcast(x, 2)
        });
        assert!(results.iter().all(|&v| v == 200));
    }

    #[test]
    fn vector_reduce_in_place() {
        let results = run_group(3, |comm| {
            let mut xs = vec![comm.rank() as i64, 10 + comm.rank() as i64];
            comm.all_reduce_vec(&mut xs, ReduceOp::Sum);
            xs
        });
        for xs in results {
            assert_eq!(xs, vec![3, 33]);
        }
    }

    #[test]
    fn many_back_to_back_rounds() {
        let results = run_group(4, |comm| {
            let mut total = 0i64;
            for round in 0..500 {
                total += comm.all_reduce(round + comm.rank() as i64, ReduceOp::Sum);
            }
            total
        });
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn single_member_group() {
        let comm = ThreadComm::group(1).pop().unwrap();
        assert_eq!(comm.all_reduce(7i64, ReduceOp::Sum), 7);
        assert_eq!(comm.scan_sum(5i64), 5);
        comm.barrier();
    }
}
