//! Workload generator for exercising HyperChain consensus throughput.
//!
//! This binary runs a full validator cluster in-process, drives signed
//! transfer transactions at it from concurrent clients, and reports commit
//! throughput and latency percentiles. Each client owns one funded sender
//! account so its nonce sequence stays strictly increasing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tracing_subscriber::EnvFilter;

use chain_node::{parse_members, Cluster, ClusterBuilder, TxCommand};
use chain_raft::advisors::{Advisors, MacVerifier};
use chain_raft::mempool::MempoolError;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "chain-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated validator set like `1:1000,2:1000,3:1000` (id:stake).
    #[arg(long, default_value = "1:1000,2:1000,3:1000")]
    members: String,

    /// Number of concurrent clients, each owning one sender account.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Number of receiver accounts transfers are spread across.
    #[arg(long, default_value_t = 64)]
    accounts: usize,

    /// Genesis balance per sender account.
    #[arg(long, default_value_t = 1_000_000)]
    initial_balance: u64,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-transaction commit timeout.
    #[arg(long, default_value = "5s")]
    tx_timeout: humantime::Duration,

    /// When true, a commit timeout aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Run with durable per-node logs under this directory instead of
    /// in-memory logs.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write a JSON throughput/latency report to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Metadata embedded in the report for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ReportMeta {
    members: String,
    clients: usize,
    accounts: usize,
    duration_ms: u64,
    seed: u64,
    durable: bool,
}

/// Latency summary in microseconds.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
struct LatencySummary {
    mean_us: u64,
    p50_us: u64,
    p95_us: u64,
    p99_us: u64,
    max_us: u64,
}

/// Full workload report.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    committed: u64,
    tx_per_sec: f64,
    latency: LatencySummary,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and report committed throughput/latency.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.accounts > 0, "--accounts must be > 0");
    let members = parse_members(&args.members)?;
    let duration: Duration = args.duration.into();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let mac = Arc::new(MacVerifier::new(*blake3_key(seed).as_bytes()));
    let mut advisors = Advisors::default();
    advisors.verifier = mac.clone();

    // Senders are funded at genesis; receivers start empty.
    let mut balances: Vec<(String, u64)> = (0..args.clients)
        .map(|c| (sender_name(c), args.initial_balance))
        .collect();
    balances.extend((0..args.accounts).map(|a| (receiver_name(a), 0)));

    let mut builder = ClusterBuilder::new(members)
        .balances(balances)
        .advisors(advisors);
    if let Some(dir) = &args.data_dir {
        builder = builder.durable(dir.clone());
    }
    let cluster = Arc::new(builder.build().await.context("build cluster")?);
    cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .context("initial leader election")?;

    let start = time::Instant::now();
    let deadline = start + duration;

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let cluster = cluster.clone();
        let mac = mac.clone();
        let accounts = args.accounts;
        let tx_timeout: Duration = args.tx_timeout.into();
        let fail_fast = args.fail_fast;
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(
                client_id, cluster, mac, accounts, seed, deadline, tx_timeout, fail_fast,
            )
            .await
        }));
    }

    let mut latencies_us = Vec::new();
    for task in tasks {
        let mut client_latencies = task.await.context("client task panicked")??;
        latencies_us.append(&mut client_latencies);
    }
    let elapsed = start.elapsed();

    let committed = latencies_us.len() as u64;
    let tx_per_sec = committed as f64 / elapsed.as_secs_f64();
    let latency = summarize(&mut latencies_us);
    tracing::info!(
        committed,
        tx_per_sec = format!("{tx_per_sec:.1}"),
        p50_us = latency.p50_us,
        p99_us = latency.p99_us,
        max_us = latency.max_us,
        "workload complete"
    );

    let report = Report {
        meta: ReportMeta {
            members: args.members.clone(),
            clients: args.clients,
            accounts: args.accounts,
            duration_ms: duration.as_millis() as u64,
            seed,
            durable: args.data_dir.is_some(),
        },
        committed,
        tx_per_sec,
        latency,
    };
    if let Some(out) = &args.out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).context("create report dir")?;
        }
        std::fs::write(out, serde_json::to_vec_pretty(&report)?).context("write report")?;
        tracing::info!(path = %out.display(), "wrote report");
    }

    cluster.shutdown();
    Ok(())
}

/// Issue sequential transfers from one sender account until the deadline,
/// returning per-transaction commit latencies.
async fn run_client(
    client_id: usize,
    cluster: Arc<Cluster>,
    mac: Arc<MacVerifier>,
    accounts: usize,
    seed: u64,
    deadline: time::Instant,
    tx_timeout: Duration,
    fail_fast: bool,
) -> anyhow::Result<Vec<u64>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let from = sender_name(client_id);
    let mut nonce = 0u64;
    let mut latencies = Vec::new();

    while time::Instant::now() < deadline {
        nonce += 1;
        let to = receiver_name(rng.gen_range(0..accounts));
        let mut tx = TxCommand::Transfer {
            from: from.clone(),
            to,
            amount: 1,
            nonce,
        }
        .into_transaction()?;
        mac.sign(&mut tx);
        let id = tx.id;

        let submitted_at = time::Instant::now();
        let tx_deadline = submitted_at + tx_timeout;
        let mut target = None;
        loop {
            // (Re-)submit to the current leader; the content-addressed id
            // makes a resubmission after a leader change idempotent.
            if target.is_none() {
                let leader = cluster
                    .wait_for_leader(tx_deadline.saturating_duration_since(time::Instant::now()))
                    .await
                    .context("no leader while submitting")?;
                match leader.mempool().submit(tx.clone()) {
                    Ok(()) | Err(MempoolError::Duplicate(_)) => {
                        target = Some(leader.node_id());
                    }
                    Err(err) => anyhow::bail!("submit failed: {err}"),
                }
            }
            let Some(node) = target else { continue };

            if !cluster
                .node(node)
                .context("submitted node disappeared")?
                .coordinator
                .mempool()
                .contains(&id)
            {
                latencies.push(submitted_at.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);
                break;
            }
            if time::Instant::now() >= tx_deadline {
                if fail_fast {
                    anyhow::bail!("client {client_id}: transfer {id:?} did not commit in time");
                }
                tracing::warn!(client = client_id, txn = ?id, "commit timeout; stopping client");
                return Ok(latencies);
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    Ok(latencies)
}

fn sender_name(client: usize) -> String {
    format!("client_{client}")
}

fn receiver_name(account: usize) -> String {
    format!("acct_{account}")
}

/// Derive the shared MAC key for this run.
fn blake3_key(seed: u64) -> blake3::Hash {
    blake3::hash(format!("chain-workload-{seed}").as_bytes())
}

/// Sort latencies and summarize common percentiles.
fn summarize(latencies_us: &mut [u64]) -> LatencySummary {
    if latencies_us.is_empty() {
        return LatencySummary::default();
    }
    latencies_us.sort_unstable();
    let pct = |p: f64| {
        let idx = ((latencies_us.len() as f64 - 1.0) * p).round() as usize;
        latencies_us[idx]
    };
    let total: u64 = latencies_us.iter().sum();
    LatencySummary {
        mean_us: total / latencies_us.len() as u64,
        p50_us: pct(0.50),
        p95_us: pct(0.95),
        p99_us: pct(0.99),
        max_us: *latencies_us.last().expect("non-empty latencies"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_percentiles_are_ordered() {
        let mut latencies: Vec<u64> = (1..=100).collect();
        let summary = summarize(&mut latencies);
        assert_eq!(summary.p50_us, 50);
        assert_eq!(summary.max_us, 100);
        assert!(summary.p50_us <= summary.p95_us);
        assert!(summary.p95_us <= summary.p99_us);
        assert!(summary.p99_us <= summary.max_us);
    }

    #[test]
    fn empty_latency_set_summarizes_to_zero() {
        let mut latencies = Vec::new();
        let summary = summarize(&mut latencies);
        assert_eq!(summary.mean_us, 0);
        assert_eq!(summary.max_us, 0);
    }
}
