//! Benchmark driver for distributed weighted reservoir sampling.
//!
//! Runs P worker threads as PEs over the in-process communicator, feeds
//! each a stream of weighted items and reports per-operation timings and
//! selector statistics. Weights come from a uniform or folded-gaussian
//! generator; the gaussian mean can drift with the batch number and the
//! rank to exercise skewed inputs.

use std::thread;
use std::time::Instant;

use clap::Parser;

use reservoir::sampler::Reservoir;
use reservoir::select::{AmsSelect, AmsSelectMulti, SelectStats, Selector};
use reservoir::tree::RankTree;
use reservoir::{Aggregate, BlockRng, Communicator, OpStats, Priority, RandomSource, ThreadComm};

#[derive(Parser, Clone)]
#[command(about = "Distributed weighted reservoir sampling benchmark")]
struct Args {
    /// Number of worker threads (PEs)
    #[arg(short, long, default_value = "4")]
    pes: usize,

    /// Items per batch per PE
    #[arg(short = 'n', long, default_value = "1000")]
    batch_size: usize,

    /// Sample size K
    #[arg(short = 'k', long, default_value = "100")]
    samples: usize,

    /// Number of batches per iteration
    #[arg(short, long, default_value = "50")]
    batches: usize,

    /// Number of measured iterations
    #[arg(short, long, default_value = "1")]
    iterations: usize,

    /// Skip the warmup iteration
    #[arg(short = 'W', long)]
    no_warmup: bool,

    /// Selection algorithm: ams, amm8, amm16, amm32 or amm64
    #[arg(short = 'S', long, default_value = "ams")]
    selector: String,

    /// Input distribution: uniform or gauss
    #[arg(short = 'I', long, default_value = "uniform")]
    input: String,

    /// Mean of the gaussian input
    #[arg(short, long, default_value = "0.0")]
    mean: f64,

    /// Standard deviation of the gaussian input
    #[arg(short = 'y', long, default_value = "10.0")]
    stdev: f64,

    /// Weight of the batch number on the gaussian mean
    #[arg(short = 'w', long, default_value = "1.0")]
    batch_weight: f64,

    /// Weight of the PE rank on the gaussian mean
    #[arg(short = 'x', long, default_value = "0.0")]
    rank_weight: f64,

    /// Random seed
    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// Print per-PE statistics
    #[arg(short, long)]
    verbose: bool,
}

/// Per-PE measurement results brought back to the main thread.
struct WorkerReport {
    rank: usize,
    res_stats: OpStats,
    sel_stats: SelectStats,
    gen_stats: Aggregate,
    batch_stats: Aggregate,
    sample_len: usize,
    threshold: f64,
}

fn fill_batch(args: &Args, rng: &mut BlockRng, rank: usize, round: usize, out: &mut Vec<(f64, u64)>) {
    out.clear();
    let id_offset = (round * args.batch_size) as u64;
    if args.input == "gauss" {
        let mean = args.mean + args.batch_weight * round as f64 + args.rank_weight * rank as f64;
        let mut weights = vec![0.0; args.batch_size];
        rng.generate_gaussian_block(mean, args.stdev, &mut weights);
        for (i, w) in weights.into_iter().enumerate() {
            // fold to keep weights positive; zero would be a contract error
            out.push((w.abs().max(1e-9), id_offset + i as u64));
        }
    } else {
        let mut weights = vec![0.0; args.batch_size];
        rng.generate_block(&mut weights);
        for (i, w) in weights.into_iter().enumerate() {
            out.push((w * 100.0 + 1e-9, id_offset + i as u64));
        }
    }
}

fn run_worker<Sel>(args: Args, comm: ThreadComm, selector: Sel) -> WorkerReport
where
    Sel: Selector<RankTree<Priority, u64>>,
{
    let rank = comm.rank();
    let np = comm.size();
    let mut input_rng = BlockRng::new(args.seed + (2 * np + rank) as u64);
    let mut res = Reservoir::new(comm.clone(), args.samples, args.seed, selector);

    let mut gen_stats = Aggregate::new();
    let mut batch_stats = Aggregate::new();
    let mut batch = Vec::with_capacity(args.batch_size);

    for round in 0..args.batches {
        comm.barrier();
        let batch_timer = Instant::now();

        let gen_timer = Instant::now();
        fill_batch(&args, &mut input_rng, rank, round, &mut batch);
        gen_stats.add(gen_timer.elapsed().as_secs_f64() * 1e3);

        res.insert(&batch);

        let mut count = 0usize;
        res.sample(|_, _| count += 1);
        assert_eq!(count, res.len());

        batch_stats.add(batch_timer.elapsed().as_secs_f64() * 1e3);
    }

    WorkerReport {
        rank,
        res_stats: res.stats().clone(),
        sel_stats: res.select_stats().clone(),
        gen_stats,
        batch_stats,
        sample_len: res.len(),
        threshold: res.threshold(),
    }
}

fn run_iteration<Sel, F>(args: &Args, make_selector: F) -> Vec<WorkerReport>
where
    Sel: Selector<RankTree<Priority, u64>> + Send + 'static,
    F: Fn(ThreadComm) -> Sel,
{
    let mut handles = Vec::new();
    for comm in ThreadComm::group(args.pes) {
        let selector = make_selector(comm.clone());
        let args = args.clone();
        handles.push(thread::spawn(move || run_worker(args, comm, selector)));
    }
    let mut reports: Vec<WorkerReport> = handles
        .into_iter()
        .map(|h| h.join().expect("worker thread panicked"))
        .collect();
    reports.sort_by_key(|r| r.rank);
    reports
}

fn benchmark<Sel, F>(args: &Args, name: &str, make_selector: F)
where
    Sel: Selector<RankTree<Priority, u64>> + Send + 'static,
    F: Fn(ThreadComm) -> Sel,
{
    println!(
        "Running {} with {} PEs, batch size {}, K = {}, {} input",
        name, args.pes, args.batch_size, args.samples, args.input
    );

    let warmups = if args.no_warmup { 0 } else { 1 };
    let mut res_stats = OpStats::new();
    let mut sel_stats = SelectStats::new();
    let mut gen_stats = Aggregate::new();
    let mut batch_stats = Aggregate::new();

    for iter in 0..warmups + args.iterations {
        let timer = Instant::now();
        let reports = run_iteration(args, &make_selector);
        let measured = iter >= warmups;

        if measured {
            let total_items = args.batches * args.batch_size * args.pes;
            let total_sample: usize = reports.iter().map(|r| r.sample_len).sum();
            assert_eq!(
                total_sample,
                args.samples.min(total_items),
                "global sample size drifted"
            );

            for report in &reports {
                if args.verbose {
                    println!("PE {} reservoir stats:", report.rank);
                    println!("{}", report.res_stats);
                    println!("PE {} selection stats:", report.rank);
                    println!("{}", report.sel_stats);
                    println!("PE {} threshold: {:.6}", report.rank, report.threshold);
                }
                res_stats.combine(&report.res_stats);
                sel_stats.combine(&report.sel_stats);
                gen_stats.combine(&report.gen_stats);
                batch_stats.combine(&report.batch_stats);
            }
        }
        println!(
            "[{}] iteration {} took {:.1} ms",
            if measured { "run" } else { "warmup" },
            iter,
            timer.elapsed().as_secs_f64() * 1e3
        );
    }

    let throughput = res_stats.throughput();
    println!(
        "RESULT selector={} np={} batchsize={} samplesize={} batches={} \
         tpp={:.0} tpt={:.0} seed={}",
        name,
        args.pes,
        args.batch_size,
        args.samples,
        args.batches,
        throughput * args.batch_size as f64,
        throughput * (args.batch_size * args.pes) as f64,
        args.seed
    );
    println!("Reservoir stats:");
    println!("{res_stats}");
    println!("Selection stats ({name}):");
    println!("{sel_stats}");
    println!("Input generation: {gen_stats}");
    println!("Batch wall time:  {batch_stats}");
}

fn main() {
    let args = Args::parse();
    assert!(args.pes > 0, "need at least one PE");

    let seed = args.seed;
    let np = args.pes as u64;
    match args.selector.as_str() {
        // single-pivot selection wants one shared pivot stream
        "ams" => benchmark(&args, "ams-select", |c| AmsSelect::new(c, seed + np)),
        // the multi-pivot variants want independent streams per rank
        "amm8" => benchmark(&args, "ams-multi-8", |c| {
            AmsSelectMulti::<_, 8>::new(c.clone(), seed + np + c.rank() as u64)
        }),
        "amm16" => benchmark(&args, "ams-multi-16", |c| {
            AmsSelectMulti::<_, 16>::new(c.clone(), seed + np + c.rank() as u64)
        }),
        "amm32" => benchmark(&args, "ams-multi-32", |c| {
            AmsSelectMulti::<_, 32>::new(c.clone(), seed + np + c.rank() as u64)
        }),
        "amm64" => benchmark(&args, "ams-multi-64", |c| {
            AmsSelectMulti::<_, 64>::new(c.clone(), seed + np + c.rank() as u64)
        }),
        other => {
            eprintln!("unknown selector {other}; use ams, amm8, amm16, amm32 or amm64");
            std::process::exit(1);
        }
    }
}
