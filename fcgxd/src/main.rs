use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fcgx_core::config::load_config;
use fcgx_core::observability::init_logging;
use fcgxd::bridge::Bridge;
use fcgxd::server::{self, FrontEnd};
use fcgxd::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fcgxd", about = "HTTP to FastCGI bridge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Overrides the config file's `listen` field when provided.
        #[arg(short, long)]
        listen: Option<String>,
    },
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, listen } => run(config, listen).await,
        Command::Check { config } => {
            let cfg = load_config(&config)?;
            println!(
                "config ok: listen={} worker={}",
                cfg.listen,
                cfg.worker.script.display()
            );
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf, listen: Option<String>) -> Result<()> {
    let mut cfg = load_config(&config_path)?;
    if let Some(listen) = listen {
        cfg.listen = listen;
        cfg.validate()?;
    }
    init_logging(&cfg.log_level);

    let supervisor = Arc::new(Supervisor::new(cfg.worker.clone()));
    let bridge = Arc::new(Bridge::new(supervisor.clone(), cfg.env_filter));
    let front = Arc::new(FrontEnd::new(bridge, &cfg));
    let listener = std::net::TcpListener::bind(&cfg.listen)
        .with_context(|| format!("failed to bind listen={}", cfg.listen))?;

    info!(
        listen = %cfg.listen,
        document_root = %cfg.document_root.display(),
        worker = %cfg.worker.script.display(),
        "fcgxd started"
    );
    let result = server::serve(listener, front, shutdown_signal()).await;
    if supervisor.shutdown().await {
        info!("FastCGI worker stopped");
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
}
