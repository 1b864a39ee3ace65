use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use retransmon::{RetransmonEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
#[command(about = "Counts TCP retransmissions with eBPF and exports them as metrics")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Optional YAML/TOML config file; RETRANSMON_* env vars override it
    #[clap(short, long, env = "RETRANSMON_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;

    telemetry::init_metrics()?;

    // build.rs compiles retransmon-ebpf and drops the object at $OUT_DIR/retransmon
    let engine = RetransmonEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/retransmon")),
    )?;

    let result = engine.run().await;
    telemetry::shutdown_metrics();
    result
}
