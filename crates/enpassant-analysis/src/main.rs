//! `enpassant-analysisd`: daemon wrapping the analysis service in a
//! JSON-lines TCP front end.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use enpassant_analysis::{server, AnalysisService, EngineConfig, ServiceConfig};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "enpassant-analysisd", about = "Engine analysis orchestration daemon")]
struct Args {
    /// TOML config file; CLI flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine executable (required unless --config provides one).
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Extra engine argument (repeatable).
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:9386")]
    listen: String,

    /// Engine slots.
    #[arg(long)]
    slots: Option<usize>,

    /// Wait queue capacity.
    #[arg(long)]
    queue: Option<usize>,

    /// Resubmit a crashed session once to a restarted engine.
    #[arg(long)]
    retry_once: bool,
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    let mut cfg = match (&args.config, &args.engine) {
        (Some(path), _) => ServiceConfig::load(path)?,
        (None, Some(engine)) => ServiceConfig::new(EngineConfig::new(engine)),
        (None, None) => bail!("either --config or --engine is required"),
    };
    if let Some(engine) = &args.engine {
        cfg.engine.path = engine.clone();
    }
    if !args.engine_args.is_empty() {
        cfg.engine.args = args.engine_args.clone();
    }
    if let Some(slots) = args.slots {
        cfg.pool.slots = slots;
    }
    if let Some(queue) = args.queue {
        cfg.pool.queue_capacity = queue;
    }
    if args.retry_once {
        cfg.pool.retry_once = true;
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = build_config(&args)?;

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;

    let service = Arc::new(AnalysisService::new(cfg)?);
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Release);
        })
        .context("failed to install signal handler")?;
    }

    server::run(listener, service, shutdown)?;
    // Dropping the last Arc reference joins the pool and quits engines.
    Ok(())
}
