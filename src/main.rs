use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "runclaim")]
#[command(
    version,
    about = "Claim production runs from the shared run store and advance them through pipeline stages"
)]
pub struct Cli {
    /// Maximum runs to claim per pass [default: 20]
    #[arg(long)]
    pub limit: Option<usize>,

    /// Identity written into claimed_by [default: runclaim-worker]
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Wall-clock limit for each stage command, in seconds [default: 900]
    #[arg(long)]
    pub timeout_sec: Option<u64>,

    /// Claims older than this many minutes are released [default: 30]
    #[arg(long)]
    pub stale_minutes: Option<i64>,

    /// Path to runclaim.toml (defaults to ./runclaim.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Keep polling until Ctrl-C instead of running a single pass
    #[arg(long)]
    pub watch: bool,

    /// Seconds between passes in watch mode [default: 60]
    #[arg(long, requires = "watch")]
    pub interval_sec: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is normal; the required variables are checked later.
    let _ = dotenvy::dotenv();
    init_tracing(cli.log_format);

    cmd::cmd_worker(&cli).await
}
