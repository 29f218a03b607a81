//! loopbridge-demo: drives a foreign event loop through loopbridge.
//!
//! Arms a one-shot timer and a heartbeat on the loop thread, runs a delayed
//! task on the host runtime that hops back onto the loop, and quits once
//! both the timer and the task are done.
//!
//! Runs on the headless runtime unless built with `--features native`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use loopbridge::{App, AppContext, BridgeConfig, ForeignRuntime, OneShot, Timer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loopbridge-demo", about = "Timers and tasks on a foreign event loop")]
struct Args {
    /// Bridge config file (TOML)
    #[arg(long, env = "LOOPBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Delay of the one-shot timer, in milliseconds
    #[arg(long, default_value_t = 3000)]
    timer_ms: u64,

    /// How long the host task sleeps before calling back into the loop
    #[arg(long, default_value_t = 5000)]
    task_delay_ms: u64,

    /// Heartbeat interval; 0 disables it
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

struct Demo {
    timer_after: Duration,
    task_delay: Duration,
    heartbeat: Duration,
}

impl App for Demo {
    async fn setup(self, cx: AppContext) -> Result<()> {
        let fired = OneShot::new();
        let signal = fired.clone();
        let timer = Timer::new(cx.executor());
        timer.run_once(self.timer_after, move || {
            tracing::info!("one-shot timer fired");
            signal.send(());
        })?;

        let heartbeat = Timer::new(cx.executor());
        if !self.heartbeat.is_zero() {
            let beats = Arc::new(AtomicU64::new(0));
            heartbeat.run_repeating(self.heartbeat, move || {
                let beat = beats.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(beat, "heartbeat");
            })?;
        }

        let executor = cx.executor().clone();
        let delay = self.task_delay;
        let task = cx.host().spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!("host task woke up, calling into the loop");
            executor.run(greet).value().await
        });

        fired.value().await?;
        let greeting = task.await??;
        tracing::info!(%greeting, "host task finished");

        heartbeat.stop();
        cx.stop();
        Ok(())
    }
}

fn greet() -> String {
    format!(
        "hello from {}",
        std::thread::current().name().unwrap_or("the event loop thread")
    )
}

fn init_logging(json: bool) -> Result<()> {
    let json = json || std::env::var("LOOPBRIDGE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("loopbridge=info".parse()?)
        .add_directive("loopbridge_demo=info".parse()?);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[cfg(feature = "native")]
fn foreign_runtime() -> Arc<dyn ForeignRuntime> {
    Arc::new(loopbridge::NativeRuntime::new())
}

#[cfg(not(feature = "native"))]
fn foreign_runtime() -> Arc<dyn ForeignRuntime> {
    Arc::new(loopbridge::HeadlessRuntime::new())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json)?;

    let config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    tracing::info!(?config, "starting demo");

    let demo = Demo {
        timer_after: Duration::from_millis(args.timer_ms),
        task_delay: Duration::from_millis(args.task_delay_ms),
        heartbeat: Duration::from_millis(args.heartbeat_ms),
    };
    loopbridge::run_app(demo, foreign_runtime(), config)?;

    tracing::info!("demo finished");
    Ok(())
}
