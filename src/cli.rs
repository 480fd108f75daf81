use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "throwaway-db")]
#[command(about = "Start a disposable database and tear it down on exit")]
pub struct Cli {
    /// Options file (YAML). Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Database type
    #[arg(long)]
    pub db: Option<String>,

    /// Path to the database executable (defaults to the database type on PATH)
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Directory under which the working directory is created
    #[arg(long)]
    pub temp_root: Option<PathBuf>,

    /// How long to wait for each readiness message, e.g. "30s" or "2m"
    #[arg(long, value_name = "DURATION")]
    pub startup_timeout: Option<String>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}
