use clap::{Parser, Subcommand};
use loadtest_engine::SetupMode;
use pgstress::commands::{self, Maintenance};
use pgstress::{OutputFormat, PluginOpts, RunOpts};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgstress")]
#[command(about = "A load testing tool for PostgreSQL with pluggable workloads")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload for a fixed duration and report the results
    Run {
        #[command(flatten)]
        opts: RunOpts,

        /// Create the workload's schema before the run (idempotent)
        #[arg(long, conflicts_with = "rebuild")]
        setup: bool,

        /// Drop and recreate the workload's schema before the run
        #[arg(long)]
        rebuild: bool,

        /// Report format
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Create the workload's schema and seed data
    Setup {
        #[command(flatten)]
        opts: RunOpts,

        /// Drop existing objects first
        #[arg(long)]
        rebuild: bool,
    },

    /// Reset the workload's schema
    Cleanup {
        #[command(flatten)]
        opts: RunOpts,
    },

    /// List builtin and plugin workloads
    List {
        #[command(flatten)]
        plugins: PluginOpts,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Logs go to stderr so JSON reports on stdout stay parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            opts,
            setup,
            rebuild,
            format,
        } => {
            let mode = if rebuild {
                SetupMode::Rebuild
            } else if setup {
                SetupMode::Setup
            } else {
                SetupMode::Skip
            };
            commands::run(&opts, mode, format).await?;
        }
        Commands::Setup { opts, rebuild } => {
            let action = if rebuild {
                Maintenance::Rebuild
            } else {
                Maintenance::Setup
            };
            commands::maintain(&opts, action).await?;
        }
        Commands::Cleanup { opts } => {
            commands::maintain(&opts, Maintenance::Cleanup).await?;
        }
        Commands::List { plugins, format } => {
            commands::list(&plugins, format)?;
        }
    }

    Ok(())
}
