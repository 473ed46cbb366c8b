//! Coordinator binary

use clap::{Parser, Subcommand};
use memkv::{Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memkv-coord")]
#[command(about = "memkv cluster-membership coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator
    Serve {
        /// Config file (CLI flags take priority)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for the membership gRPC API
        #[arg(long, default_value = "0.0.0.0:5100")]
        bind: String,

        /// Bind address for the admin HTTP API
        #[arg(long, default_value = "0.0.0.0:5180")]
        admin: String,

        /// Durable-log directory
        #[arg(long, default_value = "./coord-log")]
        log: PathBuf,

        /// Replication group size
        #[arg(long, default_value = "3")]
        replicas: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            admin,
            log,
            replicas,
        } => {
            let mut coord_config = match config {
                Some(path) => CoordinatorConfig::from_file(path)?,
                None => CoordinatorConfig::default(),
            };
            coord_config.bind_addr = bind.parse()?;
            coord_config.admin_addr = admin.parse()?;
            coord_config.log_path = log;
            coord_config.replication_factor = replicas;
            coord_config.validate()?;

            Coordinator::new(coord_config).serve().await?;
        }
    }

    Ok(())
}
