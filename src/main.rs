use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use chrono::Utc;
use slurm_lite::config::{ClusterFile, WorkloadFile};
use slurm_lite::controller::{ClusterView, Controller, JobStatusView, SchedulerCore};
use slurm_lite::persistence::FileStateStore;
use slurm_lite::scheduler::JobState;
use slurm_lite::shutdown::install_shutdown_handler;
use slurm_lite::worker::{HeartbeatAgent, LocalExecutor};

#[derive(Parser, Debug)]
#[command(name = "slurm-lite")]
#[command(version)]
#[command(about = "A cluster job scheduler with partitions, best-fit placement and backfill")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a controller with local node agents and execute a workload
    Run(RunArgs),

    /// Validate a cluster file and print its partitions
    Check {
        /// Cluster description (TOML)
        cluster: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cluster description (TOML)
    #[arg(long, short = 'c')]
    cluster: PathBuf,

    /// Jobs to submit at startup (TOML)
    #[arg(long, short = 'j')]
    jobs: Option<PathBuf>,

    /// State file. Overrides `state_file` in the cluster file.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Directory for job output files
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print a progress line whenever the cluster view changes
    #[arg(long)]
    follow: bool,

    /// Keep running after every job has finished, until SIGINT/SIGTERM
    #[arg(long)]
    stay: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput<'a> {
    jobs: &'a [JobStatusView],
    pending: usize,
    running: usize,
    completed: usize,
    failed: usize,
}

#[derive(Serialize)]
struct PartitionOutput {
    name: String,
    default: bool,
    nodes: Vec<String>,
    cpus: u32,
    memory_mb: u64,
    max_time_secs: Option<u64>,
    max_nodes: Option<u32>,
    priority_weight: i64,
}

// =============================================================================
// Run
// =============================================================================

async fn run_cluster(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = ClusterFile::load(&args.cluster)?;
    let mut config = file.controller.clone();
    if let Some(state) = args.state {
        config.state_file = Some(state);
    }
    let catalog = file.build_catalog(Utc::now())?;

    let (controller, handle) = match config.state_file.clone() {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using state file");
            Controller::recover(config.clone(), catalog, Arc::new(FileStateStore::new(path)))?
        }
        None => Controller::new(SchedulerCore::new(config.clone(), catalog)),
    };

    let mut executor = LocalExecutor::new(handle.clone());
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        executor = executor.with_output_dir(dir);
    }
    let controller = controller.with_executor(Arc::new(executor));

    let shutdown = install_shutdown_handler();
    let controller_task = tokio::spawn(controller.run(shutdown.clone()));

    let beat_ms = (config.heartbeat_timeout_ms / 3).max(1);
    for node in &handle.view().nodes {
        let agent = HeartbeatAgent::new(node.name.clone(), beat_ms);
        tokio::spawn(agent.run(handle.clone(), shutdown.clone()));
    }

    if let Some(path) = &args.jobs {
        let workload = WorkloadFile::load(path)?;
        for entry in &workload.jobs {
            let (who, spec) = entry.to_spec();
            match handle.submit(spec, who).await {
                Ok(job_id) => tracing::info!(job_id = %job_id, "Submitted"),
                Err(e) => eprintln!("Submission rejected: {}", e),
            }
        }
    }

    let mut views = WatchStream::new(handle.subscribe());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = views.next() => {
                let Some(view) = next else { break };
                if args.follow {
                    print_progress(&view);
                }
                if !args.stay && view.all_terminal() {
                    break;
                }
            }
        }
    }

    let final_view = handle.view();
    shutdown.cancel();
    controller_task.await??;

    match args.output {
        OutputFormat::Json => {
            let output = RunOutput {
                jobs: &final_view.jobs,
                pending: final_view.count(JobState::Pending),
                running: final_view.count(JobState::Running),
                completed: final_view.count(JobState::Completed),
                failed: final_view.count(JobState::Failed),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_jobs(&final_view),
    }
    Ok(())
}

fn print_progress(view: &ClusterView) {
    eprintln!(
        "[{}] pending={} running={} completed={} failed={} node_fail={} cancelled={}",
        view.generated_at.format("%H:%M:%S"),
        view.count(JobState::Pending),
        view.count(JobState::Running),
        view.count(JobState::Completed),
        view.count(JobState::Failed),
        view.count(JobState::NodeFail),
        view.count(JobState::Cancelled),
    );
}

fn print_jobs(view: &ClusterView) {
    if view.jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<7} {:<14} {:<10} {:<10} {:<11} {:<26} NODES",
        "JOBID", "NAME", "USER", "PARTITION", "STATE", "REASON"
    );
    println!("{}", "-".repeat(90));
    for job in &view.jobs {
        let name = job.name.as_deref().unwrap_or("-");
        let name = if name.chars().count() > 14 {
            format!("{}...", name.chars().take(11).collect::<String>())
        } else {
            name.to_string()
        };
        let nodes = if job.nodes.is_empty() {
            "-".to_string()
        } else {
            job.nodes.iter().cloned().collect::<Vec<_>>().join(",")
        };
        println!(
            "{:<7} {:<14} {:<10} {:<10} {:<11} {:<26} {}",
            job.job_id,
            name,
            job.user,
            job.partition,
            job.state.to_string(),
            job.reason.to_string(),
            nodes
        );
    }
}

// =============================================================================
// Check
// =============================================================================

fn check_cluster(path: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let file = ClusterFile::load(&path)?;
    let catalog = file.build_catalog(Utc::now())?;
    let partitions: Vec<PartitionOutput> = catalog
        .partitions()
        .map(|p| {
            let (cpus, memory_mb) = p
                .nodes
                .iter()
                .filter_map(|n| catalog.node(n))
                .fold((0u32, 0u64), |(c, m), n| {
                    (c.saturating_add(n.total.cpus), m.saturating_add(n.total.memory_mb))
                });
            PartitionOutput {
                name: p.name.clone(),
                default: p.is_default,
                nodes: p.nodes.clone(),
                cpus,
                memory_mb,
                max_time_secs: p.limits.max_time.map(|d| d.as_secs()),
                max_nodes: p.limits.max_nodes_per_job,
                priority_weight: p.limits.priority_weight,
            }
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&partitions)?),
        OutputFormat::Table => {
            println!(
                "{:<12} {:<8} {:<6} {:<8} {:<10} {:<10} NODES",
                "PARTITION", "DEFAULT", "CPUS", "MEM(MB)", "MAXTIME(s)", "MAXNODES"
            );
            println!("{}", "-".repeat(72));
            for p in &partitions {
                println!(
                    "{:<12} {:<8} {:<6} {:<8} {:<10} {:<10} {}",
                    p.name,
                    if p.default { "yes" } else { "" },
                    p.cpus,
                    p.memory_mb,
                    p.max_time_secs.map_or("-".to_string(), |s| s.to_string()),
                    p.max_nodes.map_or("-".to_string(), |n| n.to_string()),
                    p.nodes.join(",")
                );
            }
            println!();
            println!(
                "{} nodes, {} partitions",
                catalog.nodes().count(),
                partitions.len()
            );
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run_args) => run_cluster(run_args).await?,
        Commands::Check { cluster, output } => check_cluster(cluster, output)?,
    }

    Ok(())
}
