//! scriptpool - call functions in a pool of interpreter workers.
//!
//! Loads a script directory, starts the pool, issues the requested calls and
//! prints each JSON result on its own line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scriptpool::{Pool, PoolConfig, ScriptBundle};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "scriptpool")]
#[command(about = "Call functions in a supervised pool of interpreter workers")]
struct Args {
    /// Interpreter executable
    #[arg(long)]
    executable: PathBuf,

    /// Directory holding the scripts to materialize
    #[arg(long)]
    scripts: PathBuf,

    /// Entry script, relative to the scripts directory
    #[arg(long)]
    entry: PathBuf,

    /// Number of worker processes
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Per-call timeout in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: f64,

    /// Add the bundled Python adapter to the scripts
    #[arg(long)]
    python_adapter: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a function and print its result
    Call {
        /// Function name
        function: String,

        /// JSON argument
        #[arg(default_value = "null")]
        argument: String,

        /// Number of times to issue the call (spread across workers)
        #[arg(short, long, default_value = "1")]
        repeat: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries results
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut bundle = ScriptBundle::from_dir(&args.scripts)
        .with_context(|| format!("loading scripts from {}", args.scripts.display()))?;
    if args.python_adapter {
        bundle = bundle.with_python_adapter()?;
    }

    let timeout = std::time::Duration::try_from_secs_f64(args.timeout_secs)
        .context("invalid --timeout-secs")?;
    let config = PoolConfig::new(&args.executable, &args.entry, args.workers)
        .with_call_timeout(timeout);

    let pool = Pool::create(&bundle, config).await?;
    info!(
        "Pool of {} workers ready in {}",
        pool.len(),
        pool.workspace_dir().display()
    );

    let outcome = run(&pool, args.command).await;
    pool.close().await;
    outcome
}

async fn run(pool: &Pool, command: Command) -> Result<()> {
    match command {
        Command::Call {
            function,
            argument,
            repeat,
        } => {
            let argument: Value =
                serde_json::from_str(&argument).context("argument is not valid JSON")?;

            let calls = (0..repeat).map(|_| pool.call::<Value, _>(&function, &argument));
            for result in futures::future::join_all(calls).await {
                println!("{}", result?);
            }
        }
    }
    Ok(())
}
