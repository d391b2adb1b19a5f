//! voxup - supervisor CLI for the voice-agent stack
//!
//! Launches the media and webhook servers, fronts them with public tunnels,
//! and keeps everything alive. One lifecycle verb per invocation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxup_cli::launcher::Launcher;
use voxup_cli::probe::{probe_http, probe_record, HealthVerdict, Liveness};
use voxup_cli::supervisor::Supervisor;
use voxup_cli::{systemd, unit_log_path};
use voxup_core::{SupervisorConfig, UnitKind, UnitStatus, UnitStore};

/// Supervisor for the voice-agent service stack
#[derive(Parser, Debug)]
#[command(name = "voxup")]
#[command(about = "Supervise voice-agent services and their public tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ~/.voxup/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the systemd user service (refuses to run as root)
    Install,
    /// Bring all units up and run the supervisor loop until signalled
    Start,
    /// Stop all recorded units (services first, then tunnels)
    Stop,
    /// Stop everything, then start again
    Restart,
    /// Show unit states, including the escalated health check
    Status,
    /// Print recent log lines for one unit, or all units
    Logs {
        /// Unit name (all units when omitted)
        unit: Option<String>,
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
    /// Check that each configured service port accepts connections
    Test,
    /// Copy config, unit records, and logs into a timestamped backup
    Backup,
    /// Stop everything and remove the systemd user service
    Uninstall,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SupervisorConfig::default_path);
    let config = SupervisorConfig::load(&config_path)?;

    match cli.command {
        Commands::Install => handle_install(&config, &config_path),
        Commands::Start => handle_start(config).await,
        Commands::Stop => handle_stop(&config).await,
        Commands::Restart => {
            handle_stop(&config).await?;
            handle_start(config).await
        }
        Commands::Status => handle_status(&config).await,
        Commands::Logs { unit, lines } => handle_logs(&config, unit, lines),
        Commands::Test => handle_test(&config).await,
        Commands::Backup => handle_backup(&config, &config_path),
        Commands::Uninstall => handle_uninstall(&config).await,
    }
}

fn handle_install(config: &SupervisorConfig, config_path: &PathBuf) -> Result<()> {
    if systemd::is_root() {
        anyhow::bail!("install must run as a regular user, not as root");
    }

    config
        .validate(true)
        .context("configuration is not valid")?;

    // First install: materialize the defaults so there is a file to edit
    if !config_path.exists() {
        config.save(config_path)?;
        println!("Wrote default configuration: {}", config_path.display());
    }

    let binary = std::env::current_exe().context("Failed to get current executable path")?;
    systemd::install(&binary)
}

async fn handle_start(config: SupervisorConfig) -> Result<()> {
    config
        .validate(true)
        .context("configuration is not valid")?;

    let mut supervisor = Supervisor::new(config)?;
    supervisor.start_all().await?;
    supervisor.run().await?;
    Ok(())
}

async fn handle_stop(config: &SupervisorConfig) -> Result<()> {
    let store = UnitStore::open(&config.data_dir)?;
    let launcher = Launcher::new(config, &store);

    // Services first, then the tunnels they depend on
    for spec in &config.services {
        let outcome = launcher.stop_unit(&spec.name).await?;
        println!("{}: {:?}", spec.name, outcome);
    }
    for spec in &config.tunnels {
        let outcome = launcher.stop_unit(&spec.name).await?;
        println!("{}: {:?}", spec.name, outcome);
    }

    println!("✅ All units stopped");
    Ok(())
}

async fn handle_status(config: &SupervisorConfig) -> Result<()> {
    let store = UnitStore::open(&config.data_dir)?;

    println!(
        "{:<20} {:<8} {:<10} {:<8} {:<12} PUBLIC URL",
        "UNIT", "KIND", "STATUS", "PID", "HEALTH"
    );

    for unit in config.units() {
        let record = store.load(&unit.name)?;
        let kind = if unit.kind.is_tunnel() {
            "tunnel"
        } else {
            "service"
        };

        let (status, pid, url) = match &record {
            Some(record) => {
                // The record is authoritative for in-flight transitions
                // (`starting`); a record claiming liveness is cross-checked
                // against the process table so `status` never overstates.
                let effective = match record.status {
                    UnitStatus::Running | UnitStatus::Degraded
                        if probe_record(record) == Liveness::Dead =>
                    {
                        UnitStatus::Failed
                    }
                    status => status,
                };
                (
                    effective,
                    record.pid.map(|p| p.to_string()).unwrap_or_default(),
                    record.public_url.clone().unwrap_or_default(),
                )
            }
            None => (UnitStatus::Stopped, String::new(), String::new()),
        };

        let health = match &unit.kind {
            UnitKind::Service {
                health_port: Some(port),
                ..
            } if status == UnitStatus::Running || status == UnitStatus::Degraded => {
                match probe_http(&format!("http://127.0.0.1:{}/health", port)).await {
                    HealthVerdict::Healthy { status } => status,
                    HealthVerdict::Unhealthy { .. } => "unhealthy".to_string(),
                }
            }
            _ => "-".to_string(),
        };

        println!(
            "{:<20} {:<8} {:<10} {:<8} {:<12} {}",
            unit.name, kind, status, pid, health, url
        );
    }

    Ok(())
}

fn handle_logs(config: &SupervisorConfig, unit: Option<String>, lines: usize) -> Result<()> {
    let names: Vec<String> = match unit {
        Some(name) => vec![name],
        None => config.units().into_iter().map(|u| u.name).collect(),
    };

    for name in names {
        let path = unit_log_path(&config.data_dir, &name);
        println!("=== {} ===", name);
        if !path.exists() {
            println!("No logs available");
            continue;
        }
        let contents = std::fs::read_to_string(&path)
            .context(format!("Failed to read log file: {:?}", path))?;
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        for line in &all[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}

async fn handle_test(config: &SupervisorConfig) -> Result<()> {
    let mut failures = Vec::new();

    for spec in &config.services {
        let addr: SocketAddr = format!("127.0.0.1:{}", spec.port)
            .parse()
            .context("invalid port")?;
        let connect = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect(addr),
        )
        .await;

        match connect {
            Ok(Ok(_)) => println!("✅ {} (port {}) accepts connections", spec.name, spec.port),
            Ok(Err(e)) => {
                println!("❌ {} (port {}): {}", spec.name, spec.port, e);
                failures.push(spec.name.clone());
            }
            Err(_) => {
                println!("❌ {} (port {}): connection timed out", spec.name, spec.port);
                failures.push(spec.name.clone());
            }
        }
    }

    if !failures.is_empty() {
        anyhow::bail!("{} unit(s) failed the port check", failures.len());
    }
    Ok(())
}

fn handle_backup(config: &SupervisorConfig, config_path: &PathBuf) -> Result<()> {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let dest = voxup_cli::backups_dir(&config.data_dir).join(format!("backup-{}", stamp));
    std::fs::create_dir_all(&dest).context("Failed to create backup directory")?;

    if config_path.exists() {
        std::fs::copy(config_path, dest.join("config.json"))
            .context("Failed to back up configuration")?;
    }
    copy_dir_if_present(&config.data_dir.join("units"), &dest.join("units"))?;
    copy_dir_if_present(&voxup_cli::logs_dir(&config.data_dir), &dest.join("logs"))?;

    println!("✅ Backup written: {}", dest.display());
    Ok(())
}

fn copy_dir_if_present(src: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if entry.path().is_file() {
            std::fs::copy(entry.path(), dest.join(entry.file_name()))
                .context(format!("Failed to copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}

async fn handle_uninstall(config: &SupervisorConfig) -> Result<()> {
    if let Err(e) = handle_stop(config).await {
        warn!(error = %e, "stopping units during uninstall failed");
    }
    systemd::uninstall()?;
    info!("uninstalled; configuration and state left in {}", config.data_dir.display());
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
