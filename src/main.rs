use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cascade_config::PipelineDef;
use cascade_data::{EventId, Principal};
use cascade_engine::{JobSummary, PipelineRunner, ScheduleBuilder};

mod demo;

use demo::DemoModuleDef;

/// Cascade - a pipeline scheduler for event-processing jobs
#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory for output files (default: ~/.cascade)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a job file through the pipeline
  Run {
    /// Path to the job file (JSON)
    job_file: PathBuf,

    /// Number of runs to generate
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// Subruns per run
    #[arg(long, default_value_t = 2)]
    subruns: u32,

    /// Events per subrun
    #[arg(long, default_value_t = 10)]
    events: u64,
  },

  /// Parse and validate a job file without running it
  Validate {
    /// Path to the job file (JSON)
    job_file: PathBuf,
  },
}

/// A pipeline definition plus the demo modules its labels resolve to.
#[derive(serde::Deserialize)]
struct JobFile {
  #[serde(flatten)]
  pipeline: PipelineDef,
  #[serde(default)]
  modules: HashMap<String, DemoModuleDef>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".cascade")
  });

  match cli.command {
    Some(Commands::Run {
      job_file,
      runs,
      subruns,
      events,
    }) => {
      run_job(job_file, data_dir, runs, subruns, events)?;
    }
    Some(Commands::Validate { job_file }) => {
      validate_job(job_file)?;
    }
    None => {
      println!("cascade - use --help to see available commands");
    }
  }

  Ok(())
}

fn load_job(job_file: &PathBuf) -> Result<JobFile> {
  let content = std::fs::read_to_string(job_file)
    .with_context(|| format!("failed to read job file: {}", job_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse job file: {}", job_file.display()))
}

fn validate_job(job_file: PathBuf) -> Result<()> {
  let job = load_job(&job_file)?;
  eprintln!("Loaded pipeline: {}", job.pipeline.name);
  eprintln!("  streams: {}", job.pipeline.streams);
  for path in &job.pipeline.trigger_paths {
    let labels: Vec<_> = path.modules.iter().map(|m| m.label.as_str()).collect();
    eprintln!("  trigger path {}: [{}]", path.name, labels.join(", "));
  }
  if let Some(end) = &job.pipeline.end_path {
    let labels: Vec<_> = end.modules.iter().map(|m| m.label.as_str()).collect();
    eprintln!("  end path {}: [{}]", end.name, labels.join(", "));
  }

  for label in job.pipeline.referenced_labels() {
    if !job.modules.contains_key(label) {
      anyhow::bail!("label '{}' has no module definition", label);
    }
  }
  eprintln!("Job file is valid");
  Ok(())
}

fn run_job(
  job_file: PathBuf,
  data_dir: PathBuf,
  runs: u32,
  subruns: u32,
  events: u64,
) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_job_async(job_file, data_dir, runs, subruns, events).await })
}

async fn run_job_async(
  job_file: PathBuf,
  data_dir: PathBuf,
  runs: u32,
  subruns: u32,
  events: u64,
) -> Result<()> {
  let job = load_job(&job_file)?;
  eprintln!("Loaded pipeline: {}", job.pipeline.name);

  std::fs::create_dir_all(&data_dir)
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let modules = demo::build_modules(&job.modules, &data_dir);
  let schedules = ScheduleBuilder::new(job.pipeline, modules)
    .build()
    .context("failed to build schedules")?;
  eprintln!("Built {} schedule(s)", schedules.len());

  let runner = PipelineRunner::new(schedules);
  let sender = runner.sender();
  let cancel = CancellationToken::new();

  // Ctrl-C stops the job between events.
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel();
      }
    });
  }

  // Synthetic event source: a deterministic "energy" per event so the
  // threshold filter has something to cut on.
  let feeder = tokio::spawn(async move {
    for run in 1..=runs {
      for subrun in 1..=subruns {
        for event in 1..=events {
          let id = EventId::new(run, subrun, event);
          let energy = ((id.event * 37 + u64::from(id.subrun) * 11) % 100) as f64;
          let mut products = HashMap::new();
          products.insert("raw".to_string(), serde_json::json!({ "energy": energy }));
          let principal = Arc::new(Principal::with_products(id, products));
          if sender.send(principal).await.is_err() {
            return;
          }
        }
      }
    }
    // Dropping the sender ends the job.
  });

  let summary = runner
    .start(cancel)
    .await
    .context("pipeline execution failed")?;
  feeder.await.context("event source failed")?;

  print_summary(&summary);
  Ok(())
}

fn print_summary(summary: &JobSummary) {
  println!(
    "Job {} finished: {} events, {} passed",
    summary.job_id, summary.events, summary.passed
  );
  if summary.paths.is_empty() {
    return;
  }
  println!(
    "{:<20} {:>8} {:>8} {:>8} {:>8}",
    "path", "run", "passed", "failed", "except"
  );
  for path in &summary.paths {
    println!(
      "{:<20} {:>8} {:>8} {:>8} {:>8}",
      path.name, path.run, path.passed, path.failed, path.excepted
    );
  }
}
