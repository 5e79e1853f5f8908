use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "stackgrid",
    about = "stackgrid: detect services in a workspace and orchestrate their lifecycle",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List service candidates per folder with their confidence.
    Scan {
        /// Workspace root (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Build the service graph and show its startup order.
    Graph {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run a topology detection and record it in the state store.
    Detect {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Directory holding the state database.
        #[arg(long, default_value = ".stackgrid")]
        data_dir: PathBuf,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Dry-run a full rollout of the detected graph.
    Plan {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Simulate a failed build for the named service (repeatable).
        #[arg(long = "fail-build")]
        fail_build: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Write a starter stackgrid.toml.
    Init {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("stackgrid=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Scan { path, format } => commands::scan::scan(&path, format),
        Commands::Graph { path, format } => commands::graph::graph(&path, format),
        Commands::Detect { path, data_dir, format } => commands::detect::detect(&path, &data_dir, format),
        Commands::Plan { path, fail_build, format } => commands::plan::plan(&path, &fail_build, format).await,
        Commands::Init { path } => commands::init(&path),
    }
}
