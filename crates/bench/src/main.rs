//! Synthetic drain harness for the artifact write-dispatch engine.
//!
//! `run` drains a seeded workload through a semaphore token scheduler and
//! writes a JSON report; `plan` prints the lane split and first-step budgets
//! for the same workload without writing anything.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Instant,
};

use anyhow::Context;
use artifact_core::ArtifactWriteConfig;
use benchmark::{BenchReport, EventLog, TokenScheduler, TokenSchedulerConfig, WorkloadSpec};
use clap::{Args, Parser, Subcommand};
use dispatch::{
  DrainEvent, LaneMap, PieceMetadataSink, PieceRegistry, QueuedWrite, WriteDispatcher, WriteScheduler,
  budget::resolve_dispatch_lane_budgets,
  planner::LanePlanner,
  sizing::{effective_write_concurrency, host_parallelism, resolve_write_concurrency},
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "artifact-write-bench")]
#[command(about = "Synthetic drain harness for the artifact write-dispatch engine")]
#[command(version)]
struct Cli {
  /// Enable verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Args, Clone)]
struct WorkloadArgs {
  /// Number of artifact writes to generate
  #[arg(short = 'n', long, default_value = "200")]
  writes: usize,

  /// Workload seed
  #[arg(long, default_value = "7")]
  seed: u64,

  /// Cap on bytes actually written per artifact
  #[arg(long, default_value = "4194304")]
  max_bytes: u64,

  /// Upper bound of simulated per-write latency in milliseconds
  #[arg(long, default_value = "40")]
  max_delay_ms: u64,

  /// Mark every Nth write eager (0 disables)
  #[arg(long, default_value = "0")]
  eager_every: usize,

  /// TOML config for the dispatcher
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Explicit write concurrency override
  #[arg(long)]
  write_concurrency: Option<i64>,
}

impl WorkloadArgs {
  fn spec(&self) -> WorkloadSpec {
    WorkloadSpec {
      writes: self.writes,
      seed: self.seed,
      max_bytes: self.max_bytes,
      max_delay_ms: self.max_delay_ms,
      eager_every: self.eager_every,
    }
  }

  fn dispatcher_config(&self) -> anyhow::Result<ArtifactWriteConfig> {
    let mut config = match &self.config {
      Some(path) => ArtifactWriteConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
      None => ArtifactWriteConfig::default(),
    };
    if self.write_concurrency.is_some() {
      config.write_concurrency = self.write_concurrency;
    }
    config.validate()?;
    Ok(config)
  }
}

#[derive(Subcommand)]
enum Commands {
  /// Drain a synthetic workload and write a JSON report
  Run {
    #[command(flatten)]
    workload: WorkloadArgs,

    /// Report path
    #[arg(short, long, default_value = "./benchmark-results/artifact-writes.json")]
    output: PathBuf,

    /// Directory for written artifacts (defaults to a temp dir)
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// IO tokens in the scheduler pool
    #[arg(long, default_value = "8")]
    io_tokens: u32,

    /// Memory tokens in the scheduler pool
    #[arg(long, default_value = "8")]
    mem_tokens: u32,

    /// Run writes inline without a token scheduler
    #[arg(long)]
    no_scheduler: bool,

    /// Do not publish host memory signals to the controller
    #[arg(long)]
    no_memory_signals: bool,
  },

  /// Print the lane split and first-step budgets for a workload
  Plan {
    #[command(flatten)]
    workload: WorkloadArgs,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
  let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
  tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

  match cli.command {
    Commands::Run {
      workload,
      output,
      artifacts_dir,
      io_tokens,
      mem_tokens,
      no_scheduler,
      no_memory_signals,
    } => {
      let scheduler = (!no_scheduler).then(|| TokenSchedulerConfig {
        io_tokens,
        mem_tokens,
        memory_signals: !no_memory_signals,
      });
      run_drain(workload, output, artifacts_dir, scheduler).await
    }
    Commands::Plan { workload } => plan_workload(workload),
  }
}

fn progress_bar(total: usize) -> ProgressBar {
  let pb = ProgressBar::new(total as u64);
  match ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
    Ok(style) => pb.set_style(style.progress_chars("#>-")),
    Err(e) => warn!("Invalid progress template: {}", e),
  }
  pb
}

/// Drive the progress bar from drain events and collect them for the report.
async fn consume_events(mut rx: mpsc::UnboundedReceiver<DrainEvent>, pb: ProgressBar) -> EventLog {
  let mut log = EventLog::default();
  while let Some(event) = rx.recv().await {
    if let DrainEvent::Progress { completed, label, .. } = &event {
      pb.set_position(*completed as u64);
      pb.set_message(label.clone());
    }
    log.record(&event);
  }
  pb.finish_with_message("done");
  log
}

async fn run_drain(
  args: WorkloadArgs,
  output: PathBuf,
  artifacts_dir: Option<PathBuf>,
  scheduler: Option<TokenSchedulerConfig>,
) -> anyhow::Result<()> {
  let config = args.dispatcher_config()?;
  let spec = args.spec();

  let temp_dir = match artifacts_dir {
    Some(_) => None,
    None => Some(tempfile::tempdir()?),
  };
  let out_dir: PathBuf = match (&artifacts_dir, &temp_dir) {
    (Some(dir), _) => dir.clone(),
    (None, Some(temp)) => temp.path().to_path_buf(),
    (None, None) => anyhow::bail!("no artifact directory"),
  };
  tokio::fs::create_dir_all(&out_dir).await?;
  info!("Writing artifacts under: {}", out_dir.display());

  let registry = Arc::new(PieceRegistry::new());
  let (tx, rx) = mpsc::unbounded_channel();
  let mut dispatcher = WriteDispatcher::new(config)?
    .with_out_dir(&out_dir)
    .with_metadata_sink(registry.clone() as Arc<dyn PieceMetadataSink>)
    .with_events(tx);
  if let Some(scheduler) = scheduler {
    info!(
      io_tokens = scheduler.io_tokens,
      mem_tokens = scheduler.mem_tokens,
      "Using token scheduler"
    );
    dispatcher = dispatcher.with_scheduler(Arc::new(TokenScheduler::new(scheduler)) as Arc<dyn WriteScheduler>);
  }

  let requests = spec.requests(&out_dir);
  let consumer = tokio::spawn(consume_events(rx, progress_bar(requests.len())));

  let started = Instant::now();
  let mut queue = dispatcher.queue();
  for request in requests {
    registry.register(request.label.clone());
    queue.enqueue(request);
  }
  let outcome = dispatcher.dispatch_queue(queue).await;
  let elapsed_ms = started.elapsed().as_millis() as u64;

  let telemetry = dispatcher.telemetry();
  let fs_strategy = dispatcher.strategy().mode_name();
  drop(dispatcher);
  let events = consumer.await.unwrap_or_default();

  let summary = outcome?;
  let report = BenchReport::build(
    spec,
    summary,
    &telemetry,
    &registry.entries(),
    events,
    elapsed_ms,
    fs_strategy,
    host_parallelism(),
  );
  report.save(&output).await?;
  print_summary(&report, &output);
  Ok(())
}

fn print_summary(report: &BenchReport, output: &Path) {
  println!(
    "\n{} writes in {}ms ({:.1} writes/s, {:.1} MiB/s) at concurrency {}",
    report.dispatch.total_writes,
    report.totals.elapsed_ms,
    report.totals.writes_per_sec,
    report.totals.bytes_per_sec / (1024.0 * 1024.0),
    report.dispatch.write_concurrency
  );
  if !report.events.adaptive_changes.is_empty() {
    println!(
      "{} adaptive changes (lowest ceiling {})",
      report.events.adaptive_changes.len(),
      report.events.min_concurrency().unwrap_or(report.dispatch.write_concurrency)
    );
  }
  if !report.events.stall_alerts.is_empty() {
    println!("{} stall alerts", report.events.stall_alerts.len());
  }
  for (class, count) in &report.latency_classes.classes {
    println!("  {:<16} {}", class, count);
  }
  println!("Report: {}", output.display());
}

fn plan_workload(args: WorkloadArgs) -> anyhow::Result<()> {
  let config = args.dispatcher_config()?;
  let planner = LanePlanner::from_config(&config.lanes)?;
  let scratch = PathBuf::from(".");
  let writes: Vec<QueuedWrite> = args
    .spec()
    .requests(&scratch)
    .into_iter()
    .map(QueuedWrite::new)
    .collect();
  let total_writes = writes.len();

  let host = host_parallelism();
  let cap = resolve_write_concurrency(config.write_concurrency_override()?, total_writes, host);
  let write_concurrency = effective_write_concurrency(total_writes, cap.cap);
  let lanes = planner.split_lanes(writes);
  let queued = lanes.map(|_, queue| queue.len());
  let budgets = resolve_dispatch_lane_budgets(
    &queued,
    &LaneMap::default(),
    write_concurrency,
    &config.work_class_overrides(),
    host,
  );
  let heads = lanes.map(|_, queue| queue.iter().take(5).map(|write| write.label.clone()).collect::<Vec<_>>());

  let plan = serde_json::json!({
    "totalWrites": total_writes,
    "hostConcurrency": host,
    "writeConcurrency": write_concurrency,
    "overridden": cap.overridden,
    "queued": queued,
    "budgets": budgets,
    "laneHeads": heads,
  });
  println!("{}", serde_json::to_string_pretty(&plan)?);
  Ok(())
}
