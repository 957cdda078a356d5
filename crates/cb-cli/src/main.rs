use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use cb_core::models::{AuthContext, Environment, Role};
use cb_core::services::config_loader::{self, CONFIG_FILENAME};
use cb_core::services::deploy::DeployRequest;
use cb_core::services::dispatch::{
    ListRequest, Operation, Platform, RollbackRequest, SlotTarget,
};
use cb_core::services::query::spawn_grace_sweeper;

#[derive(Parser)]
#[command(name = "cb", about = "Blue-green deployments for self-hosted containers")]
struct Cli {
    /// Platform configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILENAME)]
    config: PathBuf,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[arg(long, global = true, env = "CB_TEAM", default_value = "default")]
    team: String,

    #[arg(long, global = true, value_enum, env = "CB_ROLE", default_value = "admin")]
    role: RoleArg,

    #[arg(long, global = true, env = "CB_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Viewer => Role::Viewer,
            RoleArg::Member => Role::Member,
            RoleArg::Admin => Role::Admin,
            RoleArg::Owner => Role::Owner,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start a version in the inactive slot and wait for it to become healthy.
    Deploy {
        project: String,
        environment: Environment,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Switch traffic to the deployed slot.
    Promote {
        project: String,
        environment: Environment,
    },
    /// Switch traffic back to the slot in its grace window.
    Rollback {
        project: String,
        environment: Environment,
        #[arg(long)]
        reason: Option<String>,
    },
    Status {
        project: String,
        environment: Environment,
    },
    List {
        #[arg(long)]
        environment: Option<Environment>,
    },
    /// Reclaim expired grace slots once.
    Sweep,
    /// Run the periodic grace sweeper until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let _guard = setup_logging(cli.log_file.as_deref());

    let config = config_loader::load(&cli.config)?;
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs.max(1));
    let platform = Platform::from_config(config)?;

    let auth = AuthContext {
        team: cli.team,
        role: cli.role.into(),
        actor: cli
            .actor
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "cli".to_string()),
        allowed_projects: Default::default(),
    };

    let operation = match cli.command {
        Command::Serve => return serve(&platform, sweep_interval).await,
        Command::Deploy {
            project,
            environment,
            version,
            image,
        } => Operation::Deploy(DeployRequest {
            project_name: project,
            environment,
            version,
            image,
        }),
        Command::Promote {
            project,
            environment,
        } => Operation::Promote(SlotTarget {
            project_name: project,
            environment,
        }),
        Command::Rollback {
            project,
            environment,
            reason,
        } => Operation::Rollback(RollbackRequest {
            project_name: project,
            environment,
            reason,
        }),
        Command::Status {
            project,
            environment,
        } => Operation::Status(SlotTarget {
            project_name: project,
            environment,
        }),
        Command::List { environment } => Operation::List(ListRequest { environment }),
        Command::Sweep => Operation::SweepExpiredGrace,
    };

    let outcome = platform.execute(&auth, operation).await;
    platform.shutdown().await;
    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(code = e.code(), "{e}");
            Err(e.into())
        }
    }
}

async fn serve(platform: &Platform, interval: Duration) -> color_eyre::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_grace_sweeper(platform.query(), interval, shutdown_rx);
    tracing::info!(interval_secs = interval.as_secs(), "grace sweeper running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    sweeper.await?;
    platform.shutdown().await;
    Ok(())
}

/// Logs go to stderr unless a file is given, in which case a non-blocking writer is used.
/// The returned guard must be held for the life of the program.
fn setup_logging(log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "cb.log".into());
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            None
        }
    }
}
