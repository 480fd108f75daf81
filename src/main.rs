mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use throwaway_db::config::{parse_duration_string, Options};
use throwaway_db::{Error as DbError, ThrowawayDb};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(db_error) = e.downcast_ref::<DbError>() {
            eprintln!("Error: {}", db_error);
            if let Some(suggestion) = db_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let options = load_options(&cli)?;
    let db = ThrowawayDb::new(options)?;

    let info = match db.start().ready().await {
        Ok(info) => info,
        Err(e) => {
            db.stop().await?;
            return Err(e.into());
        }
    };

    println!("id:           {}", info.id);
    println!("driver port:  {}:{}", info.host, info.driver_port);
    println!("cluster port: {}", info.cluster_port);
    println!("work dir:     {}", info.work_dir.display());
    println!("pid:          {}", info.pid);
    println!();
    println!("Press Ctrl-C to stop.");

    wait_for_shutdown_signal()
        .await
        .context("Failed to listen for shutdown signals")?;

    tracing::info!("Shutting down");
    db.stop().await?;
    Ok(())
}

fn load_options(cli: &Cli) -> anyhow::Result<Options> {
    let mut options = match &cli.config {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };

    if let Some(db) = &cli.db {
        options = options.with_db(db.clone());
    }
    if let Some(binary) = &cli.binary {
        options = options.with_binary(binary.clone());
    }
    if let Some(root) = &cli.temp_root {
        options = options.with_temp_root(root.clone());
    }
    if let Some(timeout) = &cli.startup_timeout {
        let timeout = parse_duration_string(timeout)
            .with_context(|| format!("Invalid --startup-timeout '{}'", timeout))?;
        options = options.with_sentinel_timeout(timeout);
    }

    Ok(options)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
