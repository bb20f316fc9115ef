// End-to-end tests of the batched distributed reservoir driver.

use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reservoir::sampler::Reservoir;
use reservoir::select::{AmsSelect, AmsSelectMulti};
use reservoir::{Communicator, ThreadComm};

fn on_pes<F, R>(p: usize, f: F) -> Vec<R>
where
    F: Fn(ThreadComm) -> R + Clone + Send + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = ThreadComm::group(p)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Per-PE state snapshot after a run.
#[derive(Clone)]
struct Snapshot {
    len: usize,
    threshold: f64,
    priorities: Vec<f64>,
}

fn snapshot<T, S, C, R>(res: &Reservoir<T, S, C, R>) -> Snapshot
where
    T: Clone,
    S: reservoir::Selector<reservoir::RankTree<reservoir::Priority, T>>,
    C: Communicator,
    R: reservoir::RandomSource,
{
    let mut priorities = Vec::new();
    res.sample(|p, _| priorities.push(p));
    Snapshot {
        len: res.len(),
        threshold: res.threshold(),
        priorities,
    }
}

#[test]
fn full_batch_flow_three_pes() {
    // 1000 unit-weight items split over three PEs, K = 16
    let snaps = on_pes(3, |comm| {
        let rank = comm.rank();
        let share = match rank {
            0 => 334usize,
            _ => 333,
        };
        let batch: Vec<(f64, u64)> = (0..share).map(|i| (1.0, (rank * 400 + i) as u64)).collect();
        let selector = AmsSelect::new(comm.clone(), 900);
        let mut res = Reservoir::new(comm, 16, 17, selector);
        res.insert(&batch);
        res.verify();
        snapshot(&res)
    });

    let total: usize = snaps.iter().map(|s| s.len).sum();
    assert_eq!(total, 16);

    let tau = snaps[0].threshold;
    assert!(tau > 0.0);
    for s in &snaps {
        assert_eq!(s.threshold, tau, "threshold must agree on every PE");
        for &p in &s.priorities {
            assert!(p <= tau, "retained priority {p} above threshold {tau}");
        }
    }
}

#[test]
fn threshold_concentrates_for_unit_weights() {
    // For 1000 unit weights the threshold is the 16th smallest of 1000
    // Exp(1) draws; its expectation is sum_{i<16} 1/(1000-i) ~ 0.01614.
    let mut taus = Vec::new();
    for seed in 0..30u64 {
        let snaps = on_pes(2, move |comm| {
            let rank = comm.rank();
            let batch: Vec<(f64, u64)> = (0..500).map(|i| (1.0, (rank * 500 + i) as u64)).collect();
            let selector = AmsSelect::new(comm.clone(), 7000 + seed);
            let mut res = Reservoir::new(comm, 16, 100 * seed + 3, selector);
            res.insert(&batch);
            res.threshold()
        });
        taus.push(snaps[0]);
    }
    let mean = taus.iter().sum::<f64>() / taus.len() as f64;
    let expected: f64 = (0..16).map(|i| 1.0 / (1000 - i) as f64).sum();
    assert!(
        (mean - expected).abs() < 0.5 * expected,
        "mean threshold {mean} far from expected {expected}"
    );
}

#[test]
fn reinserting_the_same_batch_cannot_raise_the_threshold() {
    let snaps = on_pes(2, |comm| {
        let rank = comm.rank();
        let mut rng = ChaCha8Rng::seed_from_u64(40 + rank as u64);
        let batch: Vec<(f64, u64)> = (0..100)
            .map(|i| (rng.random::<f64>() * 10.0 + 0.1, (rank * 100 + i) as u64))
            .collect();
        let selector = AmsSelect::new(comm.clone(), 55);
        let mut res = Reservoir::new(comm, 8, 56, selector);

        res.insert(&batch);
        let tau1 = res.threshold();
        res.insert(&batch);
        res.verify();
        (tau1, snapshot(&res))
    });

    let tau1 = snaps[0].0;
    let tau2 = snaps[0].1.threshold;
    assert!(tau1 > 0.0);
    assert!(tau2 > 0.0 && tau2 <= tau1, "tau2 {tau2} must not exceed tau1 {tau1}");
    assert_eq!(snaps.iter().map(|(_, s)| s.len).sum::<usize>(), 8);
    for (_, s) in &snaps {
        assert_eq!(s.threshold, tau2);
        // nothing with priority above the old threshold survives
        for &p in &s.priorities {
            assert!(p <= tau1);
        }
    }
}

#[test]
fn short_stream_keeps_everything() {
    let snaps = on_pes(2, |comm| {
        let rank = comm.rank();
        let batch: Vec<(f64, u64)> = (0..10).map(|i| (1.0, (rank * 10 + i) as u64)).collect();
        let selector = AmsSelect::new(comm.clone(), 60);
        let mut res = Reservoir::new(comm, 50, 61, selector);
        res.insert(&batch);
        res.verify();
        snapshot(&res)
    });
    assert_eq!(snaps.iter().map(|s| s.len).sum::<usize>(), 20);
    // still filling: no global threshold yet
    assert!(snaps.iter().all(|s| s.threshold == 0.0));
}

#[test]
fn threshold_never_increases_once_set() {
    let runs = on_pes(4, |comm| {
        let rank = comm.rank();
        let mut rng = ChaCha8Rng::seed_from_u64(70 + rank as u64);
        let selector = AmsSelectMulti::<_, 8>::new(comm.clone(), 71 + rank as u64);
        let mut res = Reservoir::new(comm, 32, 72, selector);

        let mut taus = Vec::new();
        let mut sizes = Vec::new();
        for _ in 0..12 {
            let batch: Vec<(f64, u64)> = (0..400)
                .map(|i| (rng.random::<f64>() * 5.0 + 0.01, i as u64))
                .collect();
            res.insert(&batch);
            res.verify();
            taus.push(res.threshold());
            sizes.push(res.len());
        }
        (taus, sizes)
    });

    let taus = &runs[0].0;
    assert!(taus[0] > 0.0);
    for w in taus.windows(2) {
        assert!(w[1] <= w[0], "threshold went up: {} -> {}", w[0], w[1]);
        assert!(w[1] > 0.0);
    }
    // thresholds agree across PEs batch by batch
    for run in &runs {
        assert_eq!(&run.0, taus);
    }
    // global cardinality is K after every batch
    for batch_idx in 0..12 {
        let total: usize = runs.iter().map(|r| r.1[batch_idx]).sum();
        assert_eq!(total, 32);
    }
}

#[test]
fn multi_selector_end_to_end_matches_cardinality() {
    let snaps = on_pes(3, |comm| {
        let rank = comm.rank();
        let mut rng = ChaCha8Rng::seed_from_u64(80 + rank as u64);
        let selector = AmsSelectMulti::<_, 16>::new(comm.clone(), 81 + rank as u64);
        let mut res = Reservoir::new(comm, 64, 82, selector);
        for _ in 0..5 {
            let batch: Vec<(f64, u64)> = (0..1000)
                .map(|i| (rng.random::<f64>() + 0.5, i as u64))
                .collect();
            res.insert(&batch);
        }
        snapshot(&res)
    });
    assert_eq!(snaps.iter().map(|s| s.len).sum::<usize>(), 64);
    let tau = snaps[0].threshold;
    for s in &snaps {
        assert!(s.priorities.iter().all(|&p| p <= tau));
    }
}

#[test]
fn heavy_items_are_sampled_preferentially() {
    // A-ExpJ inclusion bias: with K = 1, an item carrying ten times the
    // weight of the others should win far more often than any light item.
    let mut heavy_wins = 0usize;
    let trials = 300;
    for seed in 0..trials {
        let snaps = on_pes(1, move |comm| {
            let batch: Vec<(f64, u64)> = (0..20)
                .map(|i| (if i == 0 { 10.0 } else { 1.0 }, i as u64))
                .collect();
            let selector = AmsSelect::new(comm.clone(), 1);
            let mut res = Reservoir::new(comm, 1, 1000 + seed, selector);
            res.insert(&batch);
            let mut winner = None;
            res.sample(|_, &id| winner = Some(id));
            winner.unwrap()
        });
        if snaps[0] == 0 {
            heavy_wins += 1;
        }
    }
    // p(win) = 10/29 ~ 0.345; with 300 trials the count concentrates hard
    let expected = trials as f64 * 10.0 / 29.0;
    assert!(
        (heavy_wins as f64) > expected * 0.6 && (heavy_wins as f64) < expected * 1.5,
        "heavy item won {heavy_wins} of {trials}, expected about {expected:.0}"
    );
}

#[test]
fn uneven_batch_sizes_across_pes() {
    let snaps = on_pes(3, |comm| {
        let rank = comm.rank();
        let share = [2000usize, 10, 700][rank];
        let mut rng = ChaCha8Rng::seed_from_u64(90 + rank as u64);
        let batch: Vec<(f64, u64)> = (0..share)
            .map(|i| (rng.random::<f64>() * 2.0 + 0.01, i as u64))
            .collect();
        let selector = AmsSelect::new(comm.clone(), 91);
        let mut res = Reservoir::new(comm, 100, 92, selector);
        res.insert(&batch);
        res.verify();
        snapshot(&res)
    });
    assert_eq!(snaps.iter().map(|s| s.len).sum::<usize>(), 100);
}
