//! HyperChain devnet node binary.
//!
//! Runs a full validator set in-process, wired through the router
//! transport, and periodically logs coordinator and WAL statistics. An
//! optional synthetic transfer load can be driven against the leader to
//! watch batches flow without a separate workload process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use chain_node::{parse_members, Cluster, ClusterBuilder, TxCommand};
use chain_raft::advisors::{Advisors, MacVerifier};
use chain_raft::analyzer::Strategy;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "chain-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Devnet(DevnetArgs),
}

/// CLI options for running an in-process devnet.
#[derive(Parser, Debug)]
struct DevnetArgs {
    /// Comma-separated validator set like `1:1000,2:2000,3:500` (id:stake).
    #[arg(long, env = "CHAIN_MEMBERS", default_value = "1:1000,2:2000,3:500")]
    members: String,

    /// Root directory for per-node durable logs. Omit for in-memory logs.
    #[arg(long, env = "CHAIN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Heartbeat interval (milliseconds).
    #[arg(long, env = "CHAIN_HEARTBEAT_MS", default_value_t = 50)]
    heartbeat_ms: u64,

    /// Election timeout lower bound (milliseconds).
    #[arg(long, env = "CHAIN_ELECTION_MIN_MS", default_value_t = 150)]
    election_min_ms: u64,

    /// Election timeout upper bound (milliseconds).
    #[arg(long, env = "CHAIN_ELECTION_MAX_MS", default_value_t = 300)]
    election_max_ms: u64,

    /// End-to-end propose timeout (milliseconds).
    #[arg(long, env = "CHAIN_PROPOSE_TIMEOUT_MS", default_value_t = 2000)]
    propose_timeout_ms: u64,

    /// Conflict-analysis strategy. A cluster-wide invariant: every node of a
    /// deployment runs the same strategy.
    #[arg(long, env = "CHAIN_ANALYZER", default_value = "union-find")]
    analyzer: AnalyzerArg,

    /// Bitmap size for the hash-bitmap analyzer.
    #[arg(long, env = "CHAIN_ANALYZER_HASH_BITS", default_value_t = 1024)]
    analyzer_hash_bits: u32,

    /// Executor worker pool size.
    #[arg(long, env = "CHAIN_EXECUTOR_WORKERS", default_value_t = 4)]
    executor_workers: usize,

    /// Max transactions pulled per proposal cycle.
    #[arg(long, env = "CHAIN_BATCH_MAX_TXS", default_value_t = 512)]
    batch_max_txs: usize,

    /// Max batch payload bytes per proposal cycle.
    #[arg(long, env = "CHAIN_BATCH_MAX_BYTES", default_value_t = 1_048_576)]
    batch_max_bytes: usize,

    /// Mempool capacity (oldest entries evicted beyond this).
    #[arg(long, env = "CHAIN_MEMPOOL_CAPACITY", default_value_t = 65_536)]
    mempool_capacity: usize,

    /// Follower lag (entries) beyond which catch-up ships a snapshot.
    #[arg(long, env = "CHAIN_SNAPSHOT_LAG", default_value_t = 256)]
    snapshot_lag: u64,

    /// Number of seeded accounts (`acct_0`..) funded at genesis.
    #[arg(long, env = "CHAIN_SEED_ACCOUNTS", default_value_t = 8)]
    seed_accounts: usize,

    /// Genesis balance per seeded account.
    #[arg(long, env = "CHAIN_SEED_BALANCE", default_value_t = 1_000_000)]
    seed_balance: u64,

    /// Synthetic transfers per second driven against the leader (0 disables).
    #[arg(long, env = "CHAIN_DEMO_TPS", default_value_t = 0)]
    demo_tps: u64,

    /// How often to log coordinator/WAL statistics.
    #[arg(long, env = "CHAIN_STATS_INTERVAL", default_value = "5s")]
    stats_interval: humantime::Duration,
}

/// Conflict-analysis strategy options.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum AnalyzerArg {
    UnionFind,
    HashBitmap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Devnet(args) => devnet(args).await,
    }
}

/// Run the devnet until interrupted.
async fn devnet(args: DevnetArgs) -> anyhow::Result<()> {
    let members = parse_members(&args.members)?;
    anyhow::ensure!(args.election_min_ms < args.election_max_ms, "empty election range");

    let strategy = match args.analyzer {
        AnalyzerArg::UnionFind => Strategy::UnionFind,
        AnalyzerArg::HashBitmap => Strategy::HashBitmap {
            bits: args.analyzer_hash_bits,
        },
    };

    let mac = Arc::new(MacVerifier::new(*blake3::hash(b"chain-devnet-mac-key").as_bytes()));
    let mut advisors = Advisors::default();
    advisors.verifier = mac.clone();

    let balances: Vec<(String, u64)> = (0..args.seed_accounts)
        .map(|i| (format!("acct_{i}"), args.seed_balance))
        .collect();

    let mut builder = ClusterBuilder::new(members.clone())
        .balances(balances)
        .advisors(advisors)
        .tune(move |cfg| {
            cfg.heartbeat_interval = Duration::from_millis(args.heartbeat_ms);
            cfg.election_timeout_min = Duration::from_millis(args.election_min_ms);
            cfg.election_timeout_max = Duration::from_millis(args.election_max_ms);
            cfg.propose_timeout = Duration::from_millis(args.propose_timeout_ms);
            cfg.proposal_batch_max_txs = args.batch_max_txs;
            cfg.proposal_batch_max_bytes = args.batch_max_bytes;
            cfg.mempool_capacity = args.mempool_capacity;
            cfg.snapshot_lag_threshold = args.snapshot_lag;
            cfg.analyzer = strategy;
            cfg.executor_workers = args.executor_workers;
        });
    if let Some(dir) = &args.data_dir {
        builder = builder.durable(dir.clone());
    }
    let cluster = Arc::new(builder.build().await.context("build devnet cluster")?);
    tracing::info!(
        nodes = members.len(),
        durable = args.data_dir.is_some(),
        "devnet running"
    );

    if args.demo_tps > 0 && args.seed_accounts >= 2 {
        let cluster = cluster.clone();
        let accounts = args.seed_accounts;
        let tps = args.demo_tps;
        tokio::spawn(async move { demo_traffic(cluster, mac, accounts, tps).await });
    }

    let mut ticker = tokio::time::interval(args.stats_interval.into());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick resolves immediately
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&cluster).await,
            res = tokio::signal::ctrl_c() => {
                res.context("install ctrl-c handler")?;
                break;
            }
        }
    }

    tracing::info!("shutting down devnet");
    cluster.shutdown();
    Ok(())
}

/// Drive a steady round-robin transfer load against the current leader.
async fn demo_traffic(cluster: Arc<Cluster>, mac: Arc<MacVerifier>, accounts: usize, tps: u64) {
    let mut nonces = vec![0u64; accounts];
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let per_tick = (tps / 10).max(1) as usize;
    let mut sender = 0usize;
    loop {
        ticker.tick().await;
        let Ok(leader) = cluster.wait_for_leader(Duration::from_secs(1)).await else {
            continue;
        };
        for _ in 0..per_tick {
            let from = sender % accounts;
            let to = (from + 1) % accounts;
            sender += 1;
            nonces[from] += 1;
            let cmd = TxCommand::Transfer {
                from: format!("acct_{from}"),
                to: format!("acct_{to}"),
                amount: 1,
                nonce: nonces[from],
            };
            let mut tx = match cmd.into_transaction() {
                Ok(tx) => tx,
                Err(err) => {
                    tracing::warn!(error = %err, "demo transfer encode failed");
                    continue;
                }
            };
            mac.sign(&mut tx);
            if let Err(err) = leader.mempool().submit(tx) {
                tracing::debug!(error = %err, "demo transfer not admitted");
                // Keep nonces in sync with what the ledger will see.
                nonces[from] -= 1;
            }
        }
    }
}

async fn log_stats(cluster: &Cluster) {
    for node in cluster.nodes() {
        let s = node.coordinator.debug_stats().await;
        tracing::info!(
            node = node.coordinator.node_id(),
            role = ?s.role,
            term = s.term,
            commit = s.commit_index,
            applied = s.last_applied,
            mempool = s.mempool_len,
            committed = s.entries_committed,
            batches = s.batches_applied,
            txns = s.txns_applied,
            rejected = s.txns_rejected,
            elections = s.elections_started,
            "coordinator stats"
        );
        if let Some(wal) = &node.wal {
            let w = wal.stats_snapshot();
            if w.batch_count > 0 || w.fsync_count > 0 {
                tracing::info!(
                    node = node.coordinator.node_id(),
                    batches = w.batch_count,
                    items = w.batch_items,
                    max_items = w.batch_max_items,
                    bytes = w.batch_total_bytes,
                    fsyncs = w.fsync_count,
                    fsync_avg_us = w.fsync_total_us / w.fsync_count.max(1),
                    fsync_max_us = w.fsync_max_us,
                    "wal stats"
                );
            }
        }
    }
}
