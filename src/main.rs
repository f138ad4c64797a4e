use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forgebatch::model::{JobDefinition, PhaseConfig};
use forgebatch::{JobManager, JobStatus};
use tracing::info;

#[derive(Parser)]
#[command(name = "forgebatch")]
#[command(version, about = "Batch pipeline execution engine")]
struct Cli {
    /// Path to the SQLite database file (defaults to ./forgebatch.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to an optional engine config TOML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job from a JSON definition file
    Create {
        /// Path to a JSON file matching `JobDefinition`
        definition: PathBuf,
    },
    /// Start a PENDING job
    Start { job_id: String },
    /// Show a job's current status
    Status { job_id: String },
    /// List jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// Print the completed output for every item in a job
    Results { job_id: String },
    /// Print per-phase cost/token analytics for a job
    Analytics { job_id: String },
    /// Resume a PAUSED or FAILED job from its last checkpoint
    Resume { job_id: String },
    /// Request a cooperative pause
    Pause { job_id: String },
    /// Request cooperative cancellation
    Cancel { job_id: String },
    /// Delete a job and its items
    Delete { job_id: String },
    /// Clear checkpoints on terminal jobs older than N days
    CleanupCheckpoints {
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(cli.log_level.as_str()).init();

    let db_path = cli.db.clone().unwrap_or_else(|| PathBuf::from("forgebatch.db"));
    let repository = forgebatch::Repository::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let config = forgebatch::config::EngineConfig::load(cli.config.as_deref())
        .context("failed to load engine config")?;
    let processor = std::sync::Arc::new(DemoProcessor);
    let manager = JobManager::new(repository, processor, config);

    match &cli.command {
        Commands::Create { definition } => {
            let raw = std::fs::read_to_string(definition)
                .with_context(|| format!("failed to read {}", definition.display()))?;
            let def: JobDefinition =
                serde_json::from_str(&raw).context("failed to parse job definition")?;
            let id = uuid::Uuid::new_v4().to_string();
            let job = manager.create(&id, def).await?;
            info!(job_id = %job.id, "job submitted");
            println!("{}", job.id);
        }
        Commands::Start { job_id } => {
            manager.start(job_id).await?;
            println!("started");
        }
        Commands::Status { job_id } => {
            let status = manager.status(job_id).await?;
            println!(
                "{}\t{}\t{:.1}% ({}/{} complete, {} failed)\tcost={}",
                status.job_id,
                status.status.as_str(),
                status.percent_complete,
                status.completed_items,
                status.total_items,
                status.failed_items,
                status.accounting.cost
            );
            if let Some(remaining_ms) = status.estimated_time_remaining_ms {
                println!("  estimated time remaining: {remaining_ms}ms");
            }
            if let Some(phase) = &status.current_phase {
                println!("  current phase: {phase}");
            }
            if let Some(err) = &status.error {
                println!("  last error: {err}");
            }
        }
        Commands::List { status, limit, offset } => {
            let status = status
                .as_deref()
                .map(JobStatus::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let page = manager
                .list(forgebatch::JobFilter { group_id: None, user_id: None, status, limit: *limit, offset: *offset })
                .await?;
            for job in &page.jobs {
                print_job(job);
            }
            if page.has_more {
                println!("... more results available");
            }
        }
        Commands::Results { job_id } => {
            let items = manager.results(job_id).await?;
            for item in items {
                println!(
                    "{}\t{}\t{}",
                    item.item_index,
                    item.status.as_str(),
                    item.output.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Analytics { job_id } => {
            let analytics = manager.analytics(job_id).await?;
            println!(
                "success_rate={:.2} cost=total:{} per_item:{} tokens=total:{} per_item:{:.1} avg_ms={:.1}",
                analytics.overall.success_rate,
                analytics.cost.total,
                analytics.cost.per_item,
                analytics.tokens.total,
                analytics.tokens.per_item,
                analytics.performance.avg_processing_time_ms
            );
            for phase in &analytics.phases {
                println!(
                    "  {}: processed={} failed={} cost={} tokens={} avg_ms={:.1}",
                    phase.phase,
                    phase.items_processed,
                    phase.items_failed,
                    phase.cost,
                    phase.tokens,
                    phase.avg_processing_time_ms
                );
            }
        }
        Commands::Resume { job_id } => {
            manager.resume(job_id).await?;
            println!("resumed");
        }
        Commands::Pause { job_id } => {
            manager.pause(job_id).await?;
            println!("paused");
        }
        Commands::Cancel { job_id } => {
            manager.cancel(job_id).await?;
            println!("cancelled");
        }
        Commands::Delete { job_id } => {
            manager.delete(job_id).await?;
            println!("deleted");
        }
        Commands::CleanupCheckpoints { older_than_days } => {
            let affected = manager.cleanup_checkpoints(*older_than_days, None).await?;
            println!("cleared checkpoints on {affected} jobs");
        }
    }

    Ok(())
}

fn print_job(job: &forgebatch::Job) {
    println!(
        "{}\t{}\t{}/{} complete\t{} failed\tcost={}",
        job.id,
        job.status.as_str(),
        job.completed_items,
        job.total_items,
        job.failed_items,
        job.accounting.cost
    );
}

/// A Processor that uppercases its input, standing in for a real
/// model-backed transformation. Wired here so the CLI is runnable
/// out of the box; production use supplies its own `Processor`.
struct DemoProcessor;

#[async_trait::async_trait]
impl forgebatch::Processor for DemoProcessor {
    async fn process(
        &self,
        input: &str,
        _phase: &PhaseConfig,
        _cancel: &forgebatch::CancelSignal,
    ) -> Result<forgebatch::ProcessedOutput, forgebatch::ProcessingError> {
        Ok(forgebatch::ProcessedOutput {
            output: input.to_uppercase(),
            cost: rust_decimal::Decimal::new(1, 3),
            tokens: input.len() as u64,
        })
    }
}
