//! Script Sandbox - Entry Point
//!
//! Developer CLI that runs a script through a runtime pool and prints each
//! result as JSON on stdout.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use script_sandbox::{Document, PoolConfig, SandboxConfig, SandboxPool};

/// Script Sandbox - Run untrusted JavaScript in pooled, restricted interpreters.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Script file to run, or `-` to read from stdin
    script: PathBuf,

    /// JSON document snapshot to bind as `document`
    #[arg(long, value_name = "FILE")]
    dom: Option<PathBuf>,

    /// Number of runtimes in the pool
    #[arg(long, default_value = "1")]
    pool_size: usize,

    /// Execution timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Interpreter heap ceiling in megabytes (0 disables the limit)
    #[arg(long, default_value = "50")]
    memory_mb: usize,

    /// Leave `console` undefined
    #[arg(long, default_value = "false")]
    no_console: bool,

    /// Install the inert `fetch` stub
    #[arg(long, default_value = "false")]
    allow_fetch: bool,

    /// Number of times to run the script
    #[arg(long, default_value = "1")]
    repeat: usize,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the results, logs go to stderr
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Script Sandbox v{}", env!("CARGO_PKG_VERSION"));

    let script = read_script(&args.script)?;
    let document = match &args.dom {
        Some(path) => Some(Arc::new(Document::from_path(path)?)),
        None => None,
    };

    let config = SandboxConfig::new()
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_memory_limit_mb(args.memory_mb)
        .with_console(!args.no_console)
        .with_network(args.allow_fetch);
    let pool: SandboxPool = SandboxPool::new(config, PoolConfig::new().with_size(args.pool_size))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running scripts");
            on_interrupt.cancel();
        }
    });

    let mut failures = 0usize;
    for run in 1..=args.repeat.max(1) {
        let result = pool.execute(&cancel, &script, document.clone()).await?;
        debug!(run, success = result.success(), "Execution finished");
        if !result.success() {
            failures += 1;
        }

        let json = serde_json::to_string_pretty(&result).into_diagnostic()?;
        println!("{json}");

        if cancel.is_cancelled() {
            break;
        }
    }

    pool.close().await;

    if failures > 0 {
        return Err(miette::miette!("{failures} execution(s) reported an error"));
    }
    Ok(())
}

fn read_script(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .into_diagnostic()
            .wrap_err("Failed to read script from stdin")?;
        return Ok(script);
    }
    std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read script {}", path.display()))
}
