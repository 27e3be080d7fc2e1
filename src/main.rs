//! CLI for comparing grouped parallel execution with sequential execution.

use clap::Parser;
use group_exec_bench::{
    Executor, GroupedExecutorConfig, GroupedParallelExecutor, SequentialExecutor, Workload,
    WorkloadConfig,
};
use group_executor::{ExecutorConfig, GroupStrategy, GrouperConfig};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "group-exec-bench", about = "Grouped parallel execution benchmark")]
struct Args {
    /// Transactions per block.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Deployed counter contracts.
    #[arg(long, default_value_t = 1000)]
    contracts: usize,

    /// Worker threads for the grouped executor.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Share of contracts that declare their writes as reads.
    #[arg(long, default_value_t = 0.0)]
    misdeclared: f64,

    /// Rebalance groups down to the thread count.
    #[arg(long)]
    rebalance: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    println!("=== Grouped Parallel Execution Benchmark ===\n");
    println!(
        "Configuration: {} contracts, {} transactions per block, {} threads\n",
        args.contracts, args.transactions, args.threads
    );

    let configs = [
        ("No conflicts", 0.0),
        ("25% conflicts", 0.25),
        ("50% conflicts", 0.5),
        ("75% conflicts", 0.75),
        ("Full conflicts", 1.0),
    ];

    for &(name, conflict_factor) in &configs {
        let workload = Workload::generate(WorkloadConfig {
            num_contracts: args.contracts,
            num_transactions: args.transactions,
            conflict_factor,
            misdeclared_factor: args.misdeclared,
            seed: args.seed,
            ..Default::default()
        });

        let grouper = GrouperConfig {
            strategy: if args.rebalance {
                GroupStrategy::LimitedMaxAddMins
            } else {
                GroupStrategy::Naive
            },
            target_group_count: args.threads,
            ..Default::default()
        };
        let grouped = GroupedParallelExecutor::new(
            workload.registry.clone(),
            GroupedExecutorConfig {
                executor: ExecutorConfig {
                    num_threads: args.threads,
                },
                grouper,
                ..Default::default()
            },
        );

        println!("--- {name} ---");
        let expected = run(&SequentialExecutor::new(), &workload);
        let state = run(&grouped, &workload);
        if state != expected {
            println!("!! grouped state differs from sequential state");
        }
        println!();
    }
}

fn run(executor: &dyn Executor, workload: &Workload) -> group_executor::BlockStateSet {
    let start = Instant::now();
    let (state, result) = executor.execute(workload.create_state(), workload);
    let elapsed = start.elapsed();

    let tps = workload.transactions.len() as f64 / elapsed.as_secs_f64();
    println!(
        "{:18} | {:5} successful | {:4} groups | {:4} conflicting | {:8.2} ms | {:8.0} tx/s",
        executor.name(),
        result.successful,
        result.groups,
        result.conflicting,
        elapsed.as_secs_f64() * 1000.0,
        tps
    );
    state
}
