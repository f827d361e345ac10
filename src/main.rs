use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fastproc::config::Config;
use fastproc::gateway::Gateway;
use fastproc::orchestrator::Orchestrator;
use fastproc::remote::SshShell;
use fastproc::server;
use fastproc::store::ArtifactStore;

/// fastproc: run submitted code on one process or across an MPI cluster.
#[derive(Parser, Debug)]
#[command(name = "fastproc", version)]
#[command(about = "Job submission and remote execution orchestrator", long_about = None)]
struct Cli {
    /// YAML configuration file (environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config and FASTPROC_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    if let Err(err) = real_main() {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }

    if cli.print_config {
        print!(
            "{}",
            serde_yaml::to_string(&cfg).context("failed to render configuration")?
        );
        return Ok(());
    }

    let gateway = Gateway::from_config(&cfg.gateway)?;
    let shell = SshShell::from_config(&cfg.ssh);
    let orchestrator = Orchestrator::new(
        &cfg,
        ArtifactStore::new(),
        Arc::new(gateway),
        Arc::new(shell),
    );

    tracing::info!(
        strategy = ?cfg.cluster.strategy,
        nodes = cfg.cluster.nodes.len(),
        ranks = cfg.ranks,
        "orchestrator ready"
    );
    server::run_server(&cfg.bind, Arc::new(orchestrator))
}
