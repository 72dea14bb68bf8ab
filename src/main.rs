use anyhow::Result;
use clap::Parser;
use infomine::cli::{Args, Commands, ConfigDiscovery, demo};
use infomine::monitor::ResourceMonitor;
use infomine::orchestrator::{Orchestrator, OrchestratorConfig};
use infomine::task::TaskStatus;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Status { samples } => {
            let (config, _) = ConfigDiscovery::load(args.config.as_deref())?;
            run_status(config, samples).await
        }
        Commands::Demo { tasks, fail_rate } => {
            let (config, _) = ConfigDiscovery::load(args.config.as_deref())?;
            run_demo(config, tasks, fail_rate).await
        }
        Commands::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
        Commands::InitConfig { path, force } => init_config(&path, force),
    }
}

async fn run_status(config: OrchestratorConfig, samples: usize) -> Result<()> {
    let monitor = ResourceMonitor::new(config.monitor.clone())?
        .with_worker_bounds(config.pool.min_workers, config.pool.max_workers);
    let interval = config.monitor.sampling_interval();

    println!("Sampling host resources ({} samples, {:?} apart)", samples, interval);
    for i in 0..samples.max(1) {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let snapshot = monitor.sample_now().await?;
        println!(
            "  [{}] cpu {:5.1}%  mem {:5.1}%  disk {}  net ↑{} ↓{}",
            snapshot.timestamp.format("%H:%M:%S"),
            snapshot.cpu_percent,
            snapshot.memory_percent,
            format_percent(snapshot.disk_percent),
            format_rate(snapshot.network_sent_rate),
            format_rate(snapshot.network_recv_rate),
        );
    }

    for breach in monitor.current_breaches().await {
        println!(
            "  ⚠ {} at {:.1}% exceeds threshold {:.1}%",
            breach.kind, breach.value, breach.threshold
        );
    }

    let current = config.pool.min_workers;
    println!(
        "Recommended workers: {} (from {}, bounds {}..={})",
        monitor.optimal_concurrency(current).await,
        current,
        config.pool.min_workers,
        config.pool.max_workers
    );
    Ok(())
}

async fn run_demo(config: OrchestratorConfig, tasks: usize, fail_rate: f64) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    orchestrator.start().await?;
    info!("Running demo pipeline with {} crawl tasks", tasks);

    let outcome = report_demo(&orchestrator, tasks, fail_rate).await;
    orchestrator.shutdown().await;
    outcome
}

async fn report_demo(orchestrator: &Orchestrator, tasks: usize, fail_rate: f64) -> Result<()> {
    let (pipeline, report) = demo::run(orchestrator, tasks, fail_rate).await?;

    println!("Pipeline settled:");
    for id in pipeline.all() {
        let task = orchestrator.get_task(id).await?;
        let marker = match task.status {
            TaskStatus::Completed => "✓",
            TaskStatus::Failed | TaskStatus::Cancelled => "✗",
            _ => "…",
        };
        let blocked = if report.blocked.contains(&id) {
            " (blocked)"
        } else {
            ""
        };
        println!(
            "  {} {:<12} {:<10} attempts {}{}",
            marker, task.name, task.status, task.attempts, blocked
        );
    }

    println!("Recent executions:");
    for execution in orchestrator.recent_history(10).await {
        let millis = execution
            .duration()
            .map(|d| d.num_milliseconds().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} attempt {} {:?} ({} ms)",
            execution.task_name, execution.attempt_number, execution.status, millis
        );
    }

    let status = orchestrator.status().await;
    println!(
        "Workers: {} (active {}), healthy: {}",
        status.pool.state.current_size, status.pool.state.active_count, status.is_healthy
    );
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    ConfigDiscovery::write_default_config(path, force)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn format_percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:5.1}%", v))
        .unwrap_or_else(|| "  n/a".to_string())
}

fn format_rate(value: Option<f64>) -> String {
    match value {
        Some(bytes) if bytes >= 1_048_576.0 => format!("{:.1} MiB/s", bytes / 1_048_576.0),
        Some(bytes) if bytes >= 1024.0 => format!("{:.1} KiB/s", bytes / 1024.0),
        Some(bytes) => format!("{:.0} B/s", bytes),
        None => "n/a".to_string(),
    }
}
