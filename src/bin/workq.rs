//! workq CLI: drive work lists from the command line.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::{info, warn};
use workq::WorkList;
use workq::config::{Config, WorkListConfig};
use workq::handler::{batch_handler_fn, handler_fn, wasted_fn};
use workq::manager::Registry;
use workq::model::{HandlerError, Mode, Requeue, WorkItem};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "In-memory work lists with pooled workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a synthetic load through one work list and print its stats
    Run {
        /// Number of items to enqueue
        #[arg(long, default_value_t = 1000)]
        items: usize,
        /// Concurrent workers
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Queue mode: fifo or lifo
        #[arg(long, default_value = "fifo")]
        mode: Mode,
        /// Retries per item
        #[arg(long, default_value_t = 3)]
        retries: u32,
        /// Fail every K-th handler attempt (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
        /// Use bulk workers with this batch size
        #[arg(long)]
        batch: Option<usize>,
        /// Idle wait in milliseconds
        #[arg(long, default_value_t = 10)]
        sleep_ms: u64,
        /// Queue capacity (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        capacity: usize,
        /// Put retried items at the front of the queue
        #[arg(long)]
        requeue_next: bool,
    },
    /// Start every work list from WORKQ_CONFIG and run until Ctrl-C.
    /// Lists with `bulk = true` log whole batches, the rest log each item
    Serve,
    /// Print the work lists configured in WORKQ_CONFIG
    Config,
}

/// Name of the work list built by `workq run`.
const RUN_WORKLIST: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let worklists: Vec<String> = match &cli.command {
        Command::Run { .. } => vec![RUN_WORKLIST.to_string()],
        _ => config
            .load_worklists()
            .map(|lists| lists.into_iter().map(|l| l.name).collect())
            .unwrap_or_default(),
    };
    let _guard = init_telemetry(
        TelemetryConfig::new("workq")
            .with_endpoint(config.otel_endpoint.clone())
            .with_worklists(worklists)
            .with_default_filter(&config.log_level),
    )?;

    match cli.command {
        Command::Run {
            items,
            workers,
            mode,
            retries,
            fail_every,
            batch,
            sleep_ms,
            capacity,
            requeue_next,
        } => {
            let list_config = WorkListConfig::new(RUN_WORKLIST)
                .max_workers(workers)
                .max_retries(retries)
                .max_batch_size(batch.unwrap_or(1))
                .sleep_time(Duration::from_millis(sleep_ms))
                .mode(mode)
                .capacity(capacity)
                .requeue(if requeue_next {
                    Requeue::Next
                } else {
                    Requeue::Back
                });
            cmd_run(list_config, items, fail_every, batch.is_some()).await
        }
        Command::Serve => cmd_serve(&config).await,
        Command::Config => cmd_config(&config),
    }
}

/// Fails every `every`-th call across all workers.
fn should_fail(counter: &AtomicU64, every: u64) -> bool {
    let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
    every > 0 && n % every == 0
}

async fn cmd_run(
    config: WorkListConfig,
    items: usize,
    fail_every: u64,
    bulk: bool,
) -> anyhow::Result<()> {
    let attempts = Arc::new(AtomicU64::new(0));
    let builder = WorkList::<Value>::builder(config.clone()).wasted_retries_handler(wasted_fn(
        |id, payload: Value| async move {
            warn!(%id, %payload, "dead-lettered");
            Ok::<_, HandlerError>(())
        },
    ));

    let builder = if bulk {
        let attempts = Arc::clone(&attempts);
        builder.batch_handler(batch_handler_fn(move |batch: Vec<WorkItem<Value>>| {
            let fail = should_fail(&attempts, fail_every);
            async move {
                if fail {
                    return Err(HandlerError::new(format!(
                        "synthetic failure for batch of {}",
                        batch.len()
                    )));
                }
                Ok(())
            }
        }))
    } else {
        let attempts = Arc::clone(&attempts);
        builder.handler(handler_fn(move |id, _payload: Value| {
            let fail = should_fail(&attempts, fail_every);
            async move {
                if fail {
                    return Err(HandlerError::new(format!("synthetic failure for {id}")));
                }
                Ok(())
            }
        }))
    };

    let list = builder.build()?;
    list.start()?;

    let mut rejected = 0usize;
    for seq in 0..items {
        let id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = list.add_work(id, json!({ "seq": seq })) {
            rejected += 1;
            warn!(seq, error = %e, "item rejected");
        }
    }
    let accepted = (items - rejected) as u64;

    // Every accepted item ends up either succeeded or wasted.
    loop {
        let stats = list.stats();
        if list.size() == 0 && stats.succeeded + stats.wasted >= accepted {
            break;
        }
        tokio::time::sleep(config.sleep_time.max(Duration::from_millis(1))).await;
    }
    list.shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "worklist": list.name(),
            "mode": config.mode,
            "accepted": accepted,
            "rejected": rejected,
            "stats": list.stats(),
        }))?
    );
    Ok(())
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let lists = config.load_worklists()?;
    if lists.is_empty() {
        anyhow::bail!("no work lists configured (set WORKQ_CONFIG)");
    }

    let mut registry = Registry::new();
    for list_config in lists {
        let name = list_config.name.clone();
        let builder = WorkList::<Value>::builder(list_config.clone());
        let builder = if list_config.bulk {
            builder.batch_handler(batch_handler_fn(move |batch: Vec<WorkItem<Value>>| {
                let name = name.clone();
                let ids: Vec<String> = batch.into_iter().map(|item| item.id).collect();
                async move {
                    info!(worklist = %name, ?ids, "handled batch");
                    Ok::<_, HandlerError>(())
                }
            }))
        } else {
            builder.handler(handler_fn(move |id, payload: Value| {
                let name = name.clone();
                async move {
                    info!(worklist = %name, %id, %payload, "handled");
                    Ok::<_, HandlerError>(())
                }
            }))
        };
        registry.register(Arc::new(builder.build()?))?;
    }

    registry.start_all()?;
    info!(worklists = ?registry.names(), "serving");

    tokio::signal::ctrl_c().await?;
    registry.stop_all()?;
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    let lists = config.load_worklists()?;
    if lists.is_empty() {
        println!("No work lists configured.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<5}  {:>7}  {:>7}  {:>5}  {:>8}  {:>8}",
        "NAME", "MODE", "WORKERS", "RETRIES", "BATCH", "SLEEP_MS", "CAPACITY"
    );
    println!("{}", "-".repeat(74));
    for list in &lists {
        let batch = if list.bulk {
            list.max_batch_size.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<20}  {:<5}  {:>7}  {:>7}  {:>5}  {:>8}  {:>8}",
            list.name,
            list.mode,
            list.max_workers,
            list.max_retries,
            batch,
            list.sleep_time.as_millis(),
            list.capacity
        );
    }
    println!("\n{} work list(s)", lists.len());
    Ok(())
}
