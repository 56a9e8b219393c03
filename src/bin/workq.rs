//! workq CLI: run workers and inspect the job table.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use workq::config::{Config, Settings};
use workq::engine::{Queue, WorkerPool};
use workq::exec::ExecHandler;
use workq::model::{JobId, NewJob, Status};
use workq::store::{self, Store};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Durable job queue with leased claims")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool executing command jobs
    Serve {
        /// Number of concurrent workers (overrides settings)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Create or upgrade the job table
    Migrate,
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue a new job
    Enqueue {
        /// JSON payload
        payload: String,
        /// Attempt budget
        #[arg(long, default_value_t = workq::model::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
        /// Lease time limit in seconds
        #[arg(long, default_value_t = workq::model::DEFAULT_TIME_LIMIT_SECONDS)]
        time_limit: u32,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one job
    Show {
        /// Job ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let settings = Settings::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { concurrency } => cmd_serve(config, settings, concurrency).await,
        Command::Migrate => {
            let store = store::connect(config.database_url.expose_secret()).await?;
            store.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Job { action } => {
            let store = store::connect(config.database_url.expose_secret()).await?;
            store.migrate().await?;
            let queue = Queue::new(store, settings.queue);

            match action {
                JobAction::Enqueue {
                    payload,
                    max_attempts,
                    time_limit,
                } => cmd_job_enqueue(&queue, payload, max_attempts, time_limit).await,
                JobAction::List { status, limit } => cmd_job_list(&queue, status, limit).await,
                JobAction::Show { id } => cmd_job_show(&queue, id).await,
            }
        }
    }
}

async fn cmd_serve(
    config: Config,
    mut settings: Settings,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if let Some(n) = concurrency {
        settings.worker.concurrency = n;
    }

    let store: Arc<dyn Store> = store::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    store.health_check().await?;

    let queue = Queue::new(store, settings.queue);
    let pool = WorkerPool::new(queue, ExecHandler::new(settings.exec), settings.worker);

    let ctrl = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, draining in-flight jobs");
        ctrl.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_job_enqueue(
    queue: &Queue,
    payload: String,
    max_attempts: u32,
    time_limit: u32,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let job = NewJob::new(payload)
        .max_attempts(max_attempts)
        .time_limit_seconds(time_limit);

    let id = queue.enqueue(job).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_job_list(queue: &Queue, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let status: Option<Status> = status.map(|s| s.parse()).transpose()?;
    let jobs = queue.list_jobs(status, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<9}  {:<20}  ERROR",
        "ID", "STATUS", "ATTEMPTS", "DEADLINE"
    );
    println!("{}", "-".repeat(80));

    for job in &jobs {
        let error = job.error.as_deref().unwrap_or("-");
        let error_display: String = error.chars().take(30).collect();
        println!(
            "{:<8}  {:<12}  {:<9}  {:<20}  {}",
            job.id,
            job.status,
            format!("{}/{}", job.attempts_used(), job.max_attempts),
            job.deadline.format("%Y-%m-%d %H:%M:%S"),
            error_display
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(queue: &Queue, id: String) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let job = queue.get(id).await?;

    println!("ID:         {}", job.id);
    println!("Status:     {}", job.status);
    println!(
        "Attempts:   {} used, {} remaining of {}",
        job.attempts_used(),
        job.attempts_remaining,
        job.max_attempts
    );
    println!("Time Limit: {}s", job.time_limit_seconds);
    println!("Deadline:   {}", job.deadline);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    if let Some(ref error) = job.error {
        println!("Error:      {error}");
    }

    Ok(())
}
