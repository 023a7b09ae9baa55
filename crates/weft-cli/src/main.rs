//! weft demo: one work queue, one scheduled queue and one delayed queue on the in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;
use weft_core::app::Firing;
use weft_core::domain::DelayedTask;
use weft_core::{
    Backend, DelayedConfig, DelayedHandler, DelayedQueue, ExecutionContext, Handler, QueueConfig,
    Schedule, ScheduledQueue, WorkQueue, WorkerGroup,
};

#[derive(Parser)]
#[command(name = "weft", about = "Run the weft queues against an in-memory backend")]
struct Cli {
    /// Worker loops on the greetings queue
    #[arg(long, env = "WEFT_DEMO_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Greetings to enqueue at startup
    #[arg(long, default_value_t = 10)]
    tasks: usize,

    /// Handler calls that fail before the greeter starts succeeding
    #[arg(long, default_value_t = 2)]
    fail_first: u32,

    /// Heartbeat schedule as JSON, e.g. '{"interval":"hourly","time":{"minute":0}}'
    #[arg(long, default_value = r#"{"interval":"hourly","time":{"minute":0}}"#)]
    schedule: String,

    /// Seconds until the delayed reminder fires
    #[arg(long, default_value_t = 5)]
    remind_in: i64,

    /// Exit once the greetings queue is empty instead of waiting for Ctrl-C
    #[arg(long)]
    exit_when_drained: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

struct Greeter {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<Greet> for Greeter {
    type Output = String;

    async fn handle(&self, greet: Greet, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            anyhow::bail!("intentional failure (left={left})");
        }
        info!(attempt = ctx.attempt(), "hello, {}", greet.name);
        Ok(format!("greeted {}", greet.name))
    }
}

struct Heartbeat;

#[async_trait]
impl Handler<Firing> for Heartbeat {
    type Output = ();

    async fn handle(&self, firing: Firing, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        info!(scheduled = firing.scheduled, due_at = ?firing.due_at, "heartbeat");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Reminder {
    text: String,
}

struct Reminders;

#[async_trait]
impl DelayedHandler<Reminder> for Reminders {
    async fn handle(&self, reminder: Reminder, task: &DelayedTask) -> anyhow::Result<()> {
        info!(fire_at = %task.fire_at, "reminder: {}", reminder.text);
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = QueueConfig::from_env().context("loading queue configuration")?;
    let schedule: Schedule = serde_json::from_str(&cli.schedule).context("parsing --schedule")?;
    let backend = Backend::in_memory();

    let greetings: WorkQueue<Greet> = WorkQueue::new("greetings", backend.clone(), config.clone())?;
    let heartbeat = ScheduledQueue::new("heartbeat", backend.clone(), schedule, config)?;
    let reminders: DelayedQueue<Reminder> =
        DelayedQueue::new("reminders", backend.clone(), DelayedConfig::default())?;

    let mut workers = WorkerGroup::new();
    workers.extend(greetings.add_workers(
        Arc::new(Greeter {
            remaining_failures: AtomicU32::new(cli.fail_first),
        }),
        cli.workers,
    ));
    workers.extend(heartbeat.start(Arc::new(Heartbeat), 1).await?);
    workers.push(reminders.start(Arc::new(Reminders)));

    for i in 0..cli.tasks {
        greetings
            .enqueue(&Greet {
                name: format!("visitor-{i}"),
            })
            .await?;
    }
    heartbeat.fire_now().await?;
    let fire_at = backend.clock.now() + chrono::Duration::seconds(cli.remind_in);
    reminders
        .enqueue(
            &Reminder {
                text: "stretch your legs".to_string(),
            },
            fire_at,
        )
        .await?;
    info!(
        next_heartbeat = %heartbeat.next_occurrence(),
        workers = workers.len(),
        "queues running, Ctrl-C to stop"
    );

    if cli.exit_when_drained {
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            res = drained(&greetings) => res?,
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    workers.shutdown_and_join().await;

    let counts = greetings.counts().await?;
    info!(
        pending = counts.pending,
        executing = counts.executing,
        failing = counts.failing,
        failed = counts.failed,
        "greetings left"
    );
    Ok(())
}

async fn drained(queue: &WorkQueue<Greet>) -> anyhow::Result<()> {
    loop {
        let counts = queue.counts().await?;
        if counts.pending + counts.executing + counts.failing == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
