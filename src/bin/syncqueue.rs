//! syncqueue CLI: exercise a sync queue against a synthetic notification
//! source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use syncqueue::config::Config;
use syncqueue::model::{Notification, Object, ObjectKey, Tombstone};
use syncqueue::telemetry::{TelemetryConfig, init_telemetry};
use syncqueue::{SyncQueue, SyncQueueBuilder};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "syncqueue", about = "Work queue for level-triggered controllers")]
struct Cli {
    /// TOML config file (defaults to SYNCQUEUE_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a sync queue with synthetic notifications and report what happened
    Soak {
        /// Distinct objects notifications are drawn from
        #[arg(long, default_value_t = 100)]
        objects: usize,
        /// Namespaces the objects are spread across
        #[arg(long, default_value_t = 4)]
        namespaces: usize,
        /// Notifications to emit
        #[arg(long, default_value_t = 1000)]
        events: usize,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Every n-th object fails its first syncs (0 disables failures)
        #[arg(long, default_value_t = 7)]
        fail_every: usize,
        /// Failing syncs before such an object recovers
        #[arg(long, default_value_t = 2)]
        flaky_attempts: u32,
        /// Simulated sync latency
        #[arg(long, default_value_t = 2)]
        sync_ms: u64,
        /// Pause between notifications
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
        /// Time allowed for retries to settle after the last notification
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

/// A synthetic namespaced resource.
#[derive(Debug, Clone)]
struct Resource {
    namespace: String,
    name: String,
}

impl Object for Resource {
    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct Stats {
    syncs: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    drops: AtomicU64,
    keys: Mutex<HashMap<ObjectKey, KeyStats>>,
}

#[derive(Default)]
struct KeyStats {
    attempts: u32,
    /// Failures since the key last succeeded or was dropped.
    streak: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Soak {
            objects,
            namespaces,
            events,
            workers,
            fail_every,
            flaky_attempts,
            sync_ms,
            interval_ms,
            settle_ms,
        } => {
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "syncqueue".to_string(),
                log_level: config.log_level.clone(),
            })?;
            let workers = workers.unwrap_or(config.workers);
            cmd_soak(
                &config,
                SoakPlan {
                    objects: objects.max(1),
                    namespaces: namespaces.max(1),
                    events,
                    workers,
                    fail_every,
                    flaky_attempts,
                    sync: Duration::from_millis(sync_ms),
                    interval: Duration::from_millis(interval_ms),
                    settle: Duration::from_millis(settle_ms),
                },
            )
            .await
        }
    }
}

struct SoakPlan {
    objects: usize,
    namespaces: usize,
    events: usize,
    workers: usize,
    fail_every: usize,
    flaky_attempts: u32,
    sync: Duration,
    interval: Duration,
    settle: Duration,
}

async fn cmd_soak(config: &Config, plan: SoakPlan) -> anyhow::Result<()> {
    let resources: Vec<Resource> = (0..plan.objects)
        .map(|i| Resource {
            namespace: format!("ns-{}", i % plan.namespaces),
            name: format!("object-{i}"),
        })
        .collect();

    let stats = Arc::new(Stats::default());
    let handler_stats = Arc::clone(&stats);
    let (fail_every, flaky_attempts, sync) = (plan.fail_every, plan.flaky_attempts, plan.sync);
    let max_retries = config.max_retries;

    let queue: SyncQueue<Notification<Resource>> = SyncQueueBuilder::new(
        "soak",
        syncqueue::controller::default_key_fn(),
        move |key: ObjectKey| {
            let stats = Arc::clone(&handler_stats);
            async move {
                tokio::time::sleep(sync).await;
                stats.syncs.fetch_add(1, Ordering::Relaxed);

                let mut keys = stats.keys.lock().unwrap_or_else(|e| e.into_inner());
                let entry = keys.entry(key.clone()).or_default();
                entry.attempts += 1;
                let attempt = entry.attempts;

                if !(is_flaky(&key, fail_every) && attempt <= flaky_attempts) {
                    entry.streak = 0;
                    return Ok(());
                }

                // Mirror the worker's retry decision for the report.
                stats.failures.fetch_add(1, Ordering::Relaxed);
                if entry.streak < max_retries {
                    entry.streak += 1;
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                } else {
                    entry.streak = 0;
                    stats.drops.fetch_add(1, Ordering::Relaxed);
                }
                anyhow::bail!("simulated failure for {key} (attempt {attempt})")
            }
        },
    )
    .rate_limiter(config.rate_limiter())
    .max_retries(max_retries)
    .build();

    let stop = CancellationToken::new();
    queue.run(plan.workers, stop.clone());

    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c.cancel();
    });

    let started = Instant::now();
    for n in 0..plan.events {
        if stop.is_cancelled() {
            break;
        }
        // Deterministic scatter over the object set, with bursts of repeats.
        let resource = &resources[(n * 7919 / 3) % resources.len()];
        match n % 10 {
            9 => queue.enqueue_after(&resource.clone().into(), Duration::from_millis(50)),
            8 => queue.enqueue(&Notification::Deleted(Tombstone {
                key: format!("{}/{}", resource.namespace, resource.name),
                last_state: Some(resource.clone()),
            })),
            _ => queue.enqueue(&resource.clone().into()),
        }
        if !plan.interval.is_zero() {
            tokio::time::sleep(plan.interval).await;
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(plan.settle) => {}
        _ = stop.cancelled() => {}
    }
    stop.cancel();
    queue.shut_down().await;

    let flaky = resources
        .iter()
        .filter_map(|r| syncqueue::model::meta_namespace_key(r).ok())
        .filter(|key| is_flaky(key, plan.fail_every))
        .count();

    println!("Events:      {}", plan.events);
    println!("Objects:     {} ({} flaky)", plan.objects, flaky);
    println!("Workers:     {}", plan.workers);
    println!("Syncs:       {}", stats.syncs.load(Ordering::Relaxed));
    println!("Failures:    {}", stats.failures.load(Ordering::Relaxed));
    println!("Retries:     {}", stats.retries.load(Ordering::Relaxed));
    println!("Dropped:     {}", stats.drops.load(Ordering::Relaxed));
    println!("Max retries: {}", queue.max_retries());
    println!("Elapsed:     {:?}", started.elapsed());

    Ok(())
}

fn is_flaky(key: &ObjectKey, fail_every: usize) -> bool {
    if fail_every == 0 {
        return false;
    }
    key.name
        .strip_prefix("object-")
        .and_then(|i| i.parse::<usize>().ok())
        .is_some_and(|i| i % fail_every == 0)
}
